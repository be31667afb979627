// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Anthropic (Claude) provider implementation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use llm_flow_core::{CompletionRequest, CompletionResponse, LLMProvider, ProviderError, Tool, ToolCall};

pub struct AnthropicProvider {
    client: Client,
    api_key: String,
    base_url: String,
    api_version: String,
}

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    content: Vec<ContentBlock>,
    model: String,
    stop_reason: Option<String>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: serde_json::Value },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorResponse {
    error: AnthropicError,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

impl AnthropicProvider {
    fn convert_reqwest_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(Duration::from_secs(0))
        } else if err.is_status() {
            match err.status() {
                Some(status) if status == 401 || status == 403 => ProviderError::AuthError(err.to_string()),
                Some(status) if status == 429 => ProviderError::RateLimitExceeded(err.to_string()),
                _ => ProviderError::HttpError(err.to_string()),
            }
        } else {
            ProviderError::HttpError(err.to_string())
        }
    }

    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, "https://api.anthropic.com/v1".to_string(), "2023-06-01".to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String, api_version: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build Anthropic HTTP client");

        Self { client, api_key, base_url, api_version }
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::InvalidRequest("ANTHROPIC_API_KEY environment variable not set".into()))?;
        Ok(Self::new(api_key))
    }

    /// Splits the request's messages into an optional system prompt (the
    /// last `system`-role message wins) and the conversational turns, since
    /// Anthropic's wire format carries `system` out-of-band.
    fn to_anthropic_request(&self, request: &CompletionRequest) -> MessagesRequest {
        let mut system = None;
        let mut messages = Vec::new();
        for message in &request.messages {
            if message.role == "system" {
                system = Some(message.content.clone());
            } else {
                messages.push(WireMessage {
                    role: if message.role == "tool" { "user".to_string() } else { message.role.clone() },
                    content: message.content.clone(),
                });
            }
        }

        let tools = request
            .tools
            .iter()
            .map(|t: &Tool| AnthropicTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.parameters.clone(),
            })
            .collect();

        MessagesRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            system,
            temperature: Some(request.temperature),
            tools,
        }
    }

    fn parse_error(&self, status: StatusCode, body: &str) -> ProviderError {
        if let Ok(error_response) = serde_json::from_str::<AnthropicErrorResponse>(body) {
            let error = error_response.error;
            if status == StatusCode::TOO_MANY_REQUESTS || error.error_type == "rate_limit_error" {
                return ProviderError::RateLimitExceeded(error.message);
            }
            if status == StatusCode::UNAUTHORIZED
                || status == StatusCode::FORBIDDEN
                || error.error_type == "authentication_error"
                || error.error_type == "permission_error"
            {
                return ProviderError::AuthError(error.message);
            }
            if error.error_type == "invalid_request_error" {
                return ProviderError::InvalidRequest(error.message);
            }
            return ProviderError::ProviderSpecific(format!("[{}] {}: {}", status.as_u16(), error.error_type, error.message));
        }
        ProviderError::HttpError(format!("[{}] {}", status.as_u16(), body))
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError> {
        let anthropic_request = self.to_anthropic_request(&request);

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.api_version)
            .header("Content-Type", "application/json")
            .json(&anthropic_request)
            .send()
            .await
            .map_err(Self::convert_reqwest_error)?;

        let status = response.status();
        let body = response.text().await.unwrap_or_else(|_| "failed to read response body".to_string());

        if !status.is_success() {
            return Err(self.parse_error(status, &body));
        }

        let parsed: MessagesResponse = serde_json::from_str(&body)?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for block in parsed.content {
            match block {
                ContentBlock::Text { text: t } => text.push_str(&t),
                ContentBlock::ToolUse { id, name, input } => {
                    tool_calls.push(ToolCall { id, name, arguments: input });
                }
                ContentBlock::Unknown => {}
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(
            "usage".to_string(),
            serde_json::json!({
                "input_tokens": parsed.usage.input_tokens,
                "output_tokens": parsed.usage.output_tokens,
                "total_tokens": parsed.usage.input_tokens + parsed.usage.output_tokens,
            }),
        );
        if let Some(stop_reason) = &parsed.stop_reason {
            metadata.insert("stop_reason".to_string(), serde_json::json!(stop_reason));
        }
        metadata.insert("id".to_string(), serde_json::json!(parsed.id));
        metadata.insert("model".to_string(), serde_json::json!(parsed.model));

        Ok(CompletionResponse { content: text, tool_calls, metadata })
    }

    fn name(&self) -> &str {
        "anthropic"
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let probe = CompletionRequest {
            model: "claude-3-haiku-20240307".to_string(),
            messages: vec![llm_flow_core::Message::user("ping")],
            temperature: 0.0,
            max_tokens: 5,
            tools: vec![],
            extra: HashMap::new(),
        };
        self.complete(probe).await?;
        Ok(())
    }
}
