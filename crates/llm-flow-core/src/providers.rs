// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! The two narrow interfaces through which out-of-scope collaborators (LLM
//! HTTP clients, MCP tool servers) are injected into the engine: an
//! `LLMProvider` async trait and a `ServerManager` tool trait. Both are
//! accepted as `Arc<dyn Trait>` at `WorkflowExecutor` construction time.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One message in a completion request's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: "tool".into(),
            content: content.into(),
        }
    }
}

/// A tool made available to a step through its `servers`/`skills`
/// resolution, surfaced via [`ServerManager::get_available_tools`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub server: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// A tool-call requested by the model inside a completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(flatten)]
    pub metadata: HashMap<String, serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    HttpError(String),
    #[error("authentication error: {0}")]
    AuthError(String),
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("provider-specific error: {0}")]
    ProviderSpecific(String),
    #[error("serialization error: {0}")]
    SerializationError(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("unknown provider error: {0}")]
    Unknown(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::SerializationError(err.to_string())
    }
}

/// An LLM backend. Implementations carry their own HTTP client and
/// authentication; the engine only ever calls `complete`.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn complete(
        &self,
        request: CompletionRequest,
    ) -> std::result::Result<CompletionResponse, ProviderError>;

    fn name(&self) -> &str;

    async fn health_check(&self) -> std::result::Result<(), ProviderError> {
        Ok(())
    }
}

/// A running MCP-style tool server, abstracted to the shape the Step
/// Executor needs: enumerate tools, invoke one by name, look up a server by
/// name for `skills`-based filtering.
#[async_trait]
pub trait ServerManager: Send + Sync {
    async fn get_available_tools(&self) -> Vec<Tool>;

    async fn execute_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> std::result::Result<String, ProviderError>;

    fn get_server(&self, name: &str) -> Option<String>;
}

/// Minimal mock implementations for exercising the engine without a real
/// network call, grounded in the teacher's `mockito`/`tokio-test`
/// dev-dependency pairing.
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Echoes the last user message back, optionally uppercased. Useful for
    /// S1/S6-style scenario tests where the expected output is a
    /// deterministic function of the input.
    pub struct EchoProvider {
        name: String,
        uppercase: bool,
    }

    impl EchoProvider {
        pub fn new(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                uppercase: false,
            }
        }

        pub fn uppercasing(name: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                uppercase: true,
            }
        }
    }

    #[async_trait]
    impl LLMProvider for EchoProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            let content = request
                .messages
                .iter()
                .rev()
                .find(|m| m.role == "user")
                .map(|m| m.content.clone())
                .unwrap_or_default();
            let content = if self.uppercase {
                content.to_uppercase()
            } else {
                content
            };
            Ok(CompletionResponse {
                content,
                tool_calls: vec![],
                metadata: HashMap::new(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Returns a fixed response, used to script consensus votes.
    pub struct ScriptedProvider {
        name: String,
        response: String,
    }

    impl ScriptedProvider {
        pub fn new(name: impl Into<String>, response: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                response: response.into(),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            Ok(CompletionResponse {
                content: self.response.clone(),
                tool_calls: vec![],
                metadata: HashMap::new(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Always fails, used to exercise the provider fallback chain.
    pub struct FailingProvider {
        name: String,
    }

    impl FailingProvider {
        pub fn new(name: impl Into<String>) -> Self {
            Self { name: name.into() }
        }
    }

    #[async_trait]
    impl LLMProvider for FailingProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            Err(ProviderError::Unknown(format!("{} always fails", self.name)))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Fails its first `fail_times` calls, then succeeds. Used to exercise
    /// per-item retry semantics in the Loop Executor.
    pub struct FlakyProvider {
        name: String,
        fail_times: usize,
        calls: AtomicUsize,
        response: String,
    }

    impl FlakyProvider {
        pub fn new(name: impl Into<String>, fail_times: usize, response: impl Into<String>) -> Self {
            Self {
                name: name.into(),
                fail_times,
                calls: AtomicUsize::new(0),
                response: response.into(),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for FlakyProvider {
        async fn complete(
            &self,
            _request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                return Err(ProviderError::Unknown("flaky provider still warming up".into()));
            }
            Ok(CompletionResponse {
                content: self.response.clone(),
                tool_calls: vec![],
                metadata: HashMap::new(),
            })
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// A server manager with no tools, for steps that never use `servers`.
    pub struct NullServerManager;

    #[async_trait]
    impl ServerManager for NullServerManager {
        async fn get_available_tools(&self) -> Vec<Tool> {
            vec![]
        }

        async fn execute_tool(
            &self,
            tool_name: &str,
            _arguments: serde_json::Value,
        ) -> std::result::Result<String, ProviderError> {
            Err(ProviderError::InvalidRequest(format!(
                "no tool named '{tool_name}' is registered"
            )))
        }

        fn get_server(&self, _name: &str) -> Option<String> {
            None
        }
    }

    /// Records every prompt it receives, in order, for assertions on
    /// provider-attempt ordering (S3).
    pub struct RecordingProvider {
        name: String,
        inner: Box<dyn LLMProvider>,
        pub log: Mutex<Vec<String>>,
    }

    impl RecordingProvider {
        pub fn wrap(name: impl Into<String>, inner: Box<dyn LLMProvider>) -> Self {
            Self {
                name: name.into(),
                inner,
                log: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LLMProvider for RecordingProvider {
        async fn complete(
            &self,
            request: CompletionRequest,
        ) -> std::result::Result<CompletionResponse, ProviderError> {
            self.log.lock().unwrap().push(self.name.clone());
            self.inner.complete(request).await
        }

        fn name(&self) -> &str {
            &self.name
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn req(prompt: &str) -> CompletionRequest {
        CompletionRequest {
            model: "m".into(),
            messages: vec![Message::user(prompt)],
            temperature: 0.0,
            max_tokens: 100,
            tools: vec![],
            extra: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn echo_provider_echoes_last_user_message() {
        let provider = EchoProvider::new("echo");
        let response = provider.complete(req("hello")).await.unwrap();
        assert_eq!(response.content, "hello");
    }

    #[tokio::test]
    async fn failing_provider_always_errors() {
        let provider = FailingProvider::new("f");
        assert!(provider.complete(req("x")).await.is_err());
    }

    #[tokio::test]
    async fn flaky_provider_succeeds_after_threshold() {
        let provider = FlakyProvider::new("flaky", 2, "ok");
        assert!(provider.complete(req("x")).await.is_err());
        assert!(provider.complete(req("x")).await.is_err());
        assert_eq!(provider.complete(req("x")).await.unwrap().content, "ok");
    }

    #[tokio::test]
    async fn null_server_manager_has_no_tools() {
        let mgr = NullServerManager;
        assert!(mgr.get_available_tools().await.is_empty());
        assert!(mgr.execute_tool("x", serde_json::Value::Null).await.is_err());
    }
}
