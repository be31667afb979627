// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Step Executor: walks a provider fallback chain and runs the agentic
//! tool-call loop for a single step (or a single consensus execution
//! entry, which calls in here with a single-entry chain).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{OrchestratorError, Result};
use crate::interpolate::Interpolator;
use crate::providers::{CompletionRequest, LLMProvider, Message, ServerManager, Tool};
use crate::resolver::ResolvedSettings;

/// Substrings whose presence in an otherwise-successful completion
/// suggests the model reported failure in prose rather than a hard error.
/// Advisory only — see `scan_output_for_failures` on `Step`.
const FAILURE_MARKERS: &[&str] = &["error:", "traceback", "failed to", "exception:"];

#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub output: String,
    pub provider: String,
    pub model: String,
    pub duration: Duration,
    /// Advisory success flag: `false` only when `scan_output_for_failures`
    /// is enabled and the output matched a failure marker. A hard error
    /// from every provider in the chain is reported as `Err`, not here.
    pub success: bool,
}

const MAX_AGENTIC_ITERATIONS: u32 = 10;

/// Runs one step (or consensus entry) to completion, trying each
/// (provider, model) pair in `settings.providers` in order. Returns the
/// first success; if every provider fails, returns the last cause wrapped
/// in [`OrchestratorError::ProviderChainExhausted`].
pub async fn execute_step(
    step_name: &str,
    prompt_template: &str,
    interpolator: &Interpolator,
    settings: &ResolvedSettings,
    providers: &HashMap<String, Arc<dyn LLMProvider>>,
    server_manager: &Arc<dyn ServerManager>,
    scan_output_for_failures: bool,
) -> Result<StepOutcome> {
    let (prompt, missing) = interpolator.interpolate(prompt_template);
    if !missing.is_empty() {
        return Err(OrchestratorError::Step {
            step: step_name.to_string(),
            message: format!("unresolved reference(s) at execution time: {}", missing.join(", ")),
        });
    }

    let tools = if !settings.servers.is_empty() {
        let mut tools = server_manager.get_available_tools().await;
        if !settings.skills.is_empty() {
            tools.retain(|t| settings.skills.contains(&t.name) || settings.skills.contains(&t.server));
        }
        tools
    } else {
        Vec::new()
    };

    let mut last_error: Option<OrchestratorError> = None;

    for entry in &settings.providers {
        let Some(client) = providers.get(&entry.provider) else {
            last_error = Some(OrchestratorError::Provider {
                provider: entry.provider.clone(),
                model: entry.model.clone(),
                cause: "no provider registered under this name".to_string(),
            });
            continue;
        };

        let start = Instant::now();
        let budget = Duration::from_secs(settings.timeout_seconds);

        match run_agentic_loop(client.as_ref(), &entry.model, &prompt, &tools, settings, server_manager, budget).await
        {
            Ok(output) => {
                let success = !scan_output_for_failures || !looks_like_failure(&output);
                return Ok(StepOutcome {
                    output,
                    provider: entry.provider.clone(),
                    model: entry.model.clone(),
                    duration: start.elapsed(),
                    success,
                });
            }
            Err(cause) => {
                last_error = Some(OrchestratorError::Provider {
                    provider: entry.provider.clone(),
                    model: entry.model.clone(),
                    cause: cause.to_string(),
                });
                continue;
            }
        }
    }

    let last_error = last_error.unwrap_or_else(|| {
        OrchestratorError::other("provider chain exhausted with no providers to try")
    });
    let (provider, cause) = match &last_error {
        OrchestratorError::Provider { provider, cause, .. } => (provider.clone(), cause.clone()),
        other => ("<none>".to_string(), other.to_string()),
    };
    Err(OrchestratorError::ProviderChainExhausted {
        step: step_name.to_string(),
        provider,
        cause,
    })
}

/// One provider attempt: builds messages, invokes `complete`, and drives
/// the tool-call loop until the model stops requesting tools, the
/// iteration cap is hit, or the time budget runs out.
async fn run_agentic_loop(
    client: &dyn LLMProvider,
    model: &str,
    prompt: &str,
    tools: &[Tool],
    settings: &ResolvedSettings,
    server_manager: &Arc<dyn ServerManager>,
    budget: Duration,
) -> std::result::Result<String, String> {
    let deadline = Instant::now() + budget;
    let mut messages = Vec::new();
    messages.push(Message::user(prompt.to_string()));

    let mut last_content = String::new();

    for _ in 0..MAX_AGENTIC_ITERATIONS {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(format!("{last_content} [truncated due to timeout]"));
        }

        let request = CompletionRequest {
            model: model.to_string(),
            messages: messages.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
            tools: tools.to_vec(),
            extra: HashMap::new(),
        };

        let response = match tokio::time::timeout(remaining, client.complete(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => return Err(err.to_string()),
            Err(_) => return Ok(format!("{last_content} [truncated due to timeout]")),
        };

        last_content = response.content.clone();

        if response.tool_calls.is_empty() {
            return Ok(response.content);
        }

        messages.push(Message::assistant(response.content.clone()));
        for call in &response.tool_calls {
            let result = server_manager
                .execute_tool(&call.name, call.arguments.clone())
                .await;
            let content = match result {
                Ok(output) => output,
                Err(err) => format!("tool '{}' failed: {err}", call.name),
            };
            messages.push(Message::tool(content));
        }
    }

    Ok(format!("{last_content} [truncated: agentic loop exceeded {MAX_AGENTIC_ITERATIONS} iterations]"))
}

fn looks_like_failure(output: &str) -> bool {
    let lower = output.to_lowercase();
    FAILURE_MARKERS.iter().any(|marker| lower.contains(marker))
}
