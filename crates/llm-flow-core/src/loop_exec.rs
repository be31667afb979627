// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loop Executor: `until` and `iterate` loop modes.
//!
//! Both modes invoke a child workflow through an injected closure rather
//! than calling the orchestrator directly — `orchestrator.rs` supplies the
//! closure so this module stays free of the recursive sub-orchestrator
//! wiring and is independently testable.

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::{OrchestratorError, Result};
use crate::interpolate::Interpolator;
use crate::workflow::{FailurePolicy, LoopConfig};

pub type ChildInvoker<'a> = dyn FnMut(HashMap<String, String>) -> BoxFuture<'static, Result<String>> + Send + 'a;
pub type ConditionEvaluator<'a> = dyn FnMut(String) -> BoxFuture<'static, Result<String>> + Send + 'a;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Completed,
    ConditionMet,
    MaxIterations,
    Failure,
    SuccessRateNotMet,
    NoItems,
}

#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub output: String,
    pub iterations: u32,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_indices: Vec<usize>,
    pub accumulated: Option<String>,
    pub exit_reason: ExitReason,
}

/// Parses an interpolated `items` string as, in order: a JSON array, JSONL
/// (one JSON value per non-blank line), or line-delimited plain text.
pub fn parse_items(text: &str) -> Vec<serde_json::Value> {
    if let Ok(serde_json::Value::Array(arr)) = serde_json::from_str(text) {
        return arr;
    }

    let mut jsonl = Vec::new();
    let mut all_parsed = true;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line) {
            Ok(value) => jsonl.push(value),
            Err(_) => {
                all_parsed = false;
                break;
            }
        }
    }
    if all_parsed && !jsonl.is_empty() {
        return jsonl;
    }

    text.lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::Value::String(l.to_string()))
        .collect()
}

/// Extracts a log-friendly identifier: the `id`, `control_id`, or `name`
/// field if the item is an object carrying one, else `ITEM-NNN`.
pub fn item_id(item: &serde_json::Value, index: usize) -> String {
    if let serde_json::Value::Object(map) = item {
        for key in ["id", "control_id", "name"] {
            if let Some(value) = map.get(key) {
                return match value.as_str() {
                    Some(s) => s.to_string(),
                    None => value.to_string(),
                };
            }
        }
    }
    format!("ITEM-{:03}", index + 1)
}

/// Runs `iterate` mode: one child-workflow invocation per parsed item,
/// with per-item retry and an overall `min_success_rate` gate.
pub async fn execute_iterate(
    loop_name: &str,
    config: &LoopConfig,
    interpolator: &mut Interpolator,
    invoke_child: &mut ChildInvoker<'_>,
) -> Result<LoopOutcome> {
    let items_template = config.items.as_ref().ok_or_else(|| {
        OrchestratorError::Loop {
            loop_name: loop_name.to_string(),
            message: "iterate-mode loop has no `items` template".to_string(),
        }
    })?;
    let (items_text, missing) = interpolator.interpolate(items_template);
    if !missing.is_empty() {
        return Err(OrchestratorError::Loop {
            loop_name: loop_name.to_string(),
            message: format!("unresolved reference(s) in `items`: {}", missing.join(", ")),
        });
    }

    let mut items = parse_items(&items_text);
    if items.is_empty() {
        return Ok(LoopOutcome {
            output: String::new(),
            iterations: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            failed_indices: vec![],
            accumulated: None,
            exit_reason: ExitReason::NoItems,
        });
    }
    if items.len() as u32 > config.max_iterations {
        items.truncate(config.max_iterations as usize);
    }

    let mut succeeded = 0usize;
    let mut failed = 0usize;
    let mut failed_indices = Vec::new();
    let mut accumulated = Vec::new();
    let mut last_output = String::new();

    for (index, item) in items.iter().enumerate() {
        let item_json = serde_json::to_string(item)?;
        interpolator.set_iterate_vars(&item_json, index);
        interpolator.set_loop_vars(index as u32, &last_output, &accumulated);

        let mut with = HashMap::new();
        for (key, value) in &config.with {
            let (text, _) = interpolator.interpolate(value);
            with.insert(key.clone(), text);
        }
        with.insert("input".to_string(), item_json.clone());

        let mut attempt = 0u32;
        let outcome = loop {
            let result = invoke_child(with.clone()).await;
            if result.is_ok() || attempt >= config.max_retries {
                break result;
            }
            attempt += 1;
            if config.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
        };

        match outcome {
            Ok(output) => {
                succeeded += 1;
                last_output = output.clone();
                accumulated.push(output);
            }
            Err(err) => {
                failed += 1;
                failed_indices.push(index);
                if matches!(config.on_failure, FailurePolicy::Halt) {
                    return Err(OrchestratorError::Loop {
                        loop_name: loop_name.to_string(),
                        message: format!("item {} failed: {err}", item_id(item, index)),
                    });
                }
            }
        }
    }

    let total = succeeded + failed;
    let exit_reason = match config.min_success_rate {
        Some(rate) if total > 0 && (succeeded as f64 / total as f64) >= rate => ExitReason::Completed,
        Some(_) => ExitReason::SuccessRateNotMet,
        None => ExitReason::Completed,
    };

    if matches!(exit_reason, ExitReason::SuccessRateNotMet) {
        return Err(OrchestratorError::Loop {
            loop_name: loop_name.to_string(),
            message: format!(
                "success rate not met: {succeeded}/{total} succeeded, required {:.2}",
                config.min_success_rate.unwrap_or_default()
            ),
        });
    }

    Ok(LoopOutcome {
        output: last_output,
        iterations: items.len() as u32,
        succeeded,
        failed,
        skipped: 0,
        failed_indices,
        accumulated: if accumulated.is_empty() {
            None
        } else {
            Some(accumulated.join("\n---\n"))
        },
        exit_reason,
    })
}

/// Runs `until` mode: repeatedly invokes the child workflow and asks
/// `evaluate` (an LLM call at temperature 0 against the child workflow's
/// default provider, wired up by the caller) whether `config.until` is
/// satisfied by the latest output.
pub async fn execute_until(
    loop_name: &str,
    config: &LoopConfig,
    interpolator: &mut Interpolator,
    invoke_child: &mut ChildInvoker<'_>,
    evaluate: &mut ConditionEvaluator<'_>,
) -> Result<LoopOutcome> {
    let predicate = config.until.as_ref().ok_or_else(|| OrchestratorError::Loop {
        loop_name: loop_name.to_string(),
        message: "until-mode loop has no `until` predicate".to_string(),
    })?;

    let mut history: Vec<String> = Vec::new();
    let mut last_output = String::new();
    let mut iteration = 0u32;

    while iteration < config.max_iterations {
        interpolator.set_loop_vars(iteration, &last_output, &history);

        let mut with = HashMap::new();
        for (key, value) in &config.with {
            let (text, _) = interpolator.interpolate(value);
            with.insert(key.clone(), text);
        }

        let mut retry_attempt = 0u32;
        let result = loop {
            let attempt = invoke_child(with.clone()).await;
            if attempt.is_ok() || !matches!(config.on_failure, FailurePolicy::Retry) || retry_attempt >= config.max_retries {
                break attempt;
            }
            retry_attempt += 1;
            if config.retry_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }
        };
        let output = match result {
            Ok(output) => output,
            Err(err) => match config.on_failure {
                FailurePolicy::Halt => {
                    return Err(OrchestratorError::Loop {
                        loop_name: loop_name.to_string(),
                        message: format!("iteration {iteration} failed: {err}"),
                    });
                }
                // `max_retries` re-runs of the same iteration are exhausted
                // (or the policy is `continue`); count this iteration and
                // move on so `max_iterations` still bounds the loop.
                FailurePolicy::Continue | FailurePolicy::Retry => {
                    iteration += 1;
                    continue;
                }
            },
        };

        last_output = output.clone();
        history.push(output);
        iteration += 1;

        let truncated: String = last_output.chars().take(4000).collect();
        let eval_prompt = format!(
            "Evaluate if this condition is satisfied. Answer only YES or NO.\nCondition: {predicate}\n\nOutput to evaluate:\n{truncated}\n\nAnswer (YES or NO):"
        );
        let answer = evaluate(eval_prompt).await?;

        if answer.to_uppercase().trim().contains("YES") {
            return Ok(LoopOutcome {
                output: last_output,
                iterations: iteration,
                succeeded: iteration as usize,
                failed: 0,
                skipped: 0,
                failed_indices: vec![],
                accumulated: config.accumulate.as_ref().map(|_| history.join("\n---\n")),
                exit_reason: ExitReason::ConditionMet,
            });
        }
    }

    Ok(LoopOutcome {
        output: last_output,
        iterations: iteration,
        succeeded: iteration as usize,
        failed: 0,
        skipped: 0,
        failed_indices: vec![],
        accumulated: config.accumulate.as_ref().map(|_| history.join("\n---\n")),
        exit_reason: ExitReason::MaxIterations,
    })
}
