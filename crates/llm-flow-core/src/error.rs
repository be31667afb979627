// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Behavioural error taxonomy for the workflow engine.
//!
//! Kinds map directly onto the propagation rules: validation and dependency
//! errors abort before any step runs, provider errors are caught inside the
//! fallback chain, and cancellation is never a retry candidate.

use std::time::Duration;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// A single cycle participant pair, used to report the first discovered cycle.
#[derive(Debug, Clone)]
pub struct CycleEdge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("validation failed for step '{step}' field '{field}': {message}{}", remediation.as_ref().map(|r| format!(" (hint: {r})")).unwrap_or_default())]
    Validation {
        step: String,
        field: String,
        message: String,
        remediation: Option<String>,
    },

    #[error("dependency error: {0}")]
    Dependency(String),

    #[error("cycle detected in dependency graph: {} -> {}", edge.from, edge.to)]
    Cycle { edge: CycleEdge },

    #[error("provider '{provider}' model '{model}' failed: {cause}")]
    Provider {
        provider: String,
        model: String,
        cause: String,
    },

    #[error("all providers exhausted for step '{step}': last error from '{provider}': {cause}")]
    ProviderChainExhausted {
        step: String,
        provider: String,
        cause: String,
    },

    #[error("timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("tool '{tool}' failed: {cause}")]
    Tool { tool: String, cause: String },

    #[error("consensus failure for step '{step}': {message}")]
    Consensus { step: String, message: String },

    #[error("loop '{loop_name}' failed: {message}")]
    Loop { loop_name: String, message: String },

    #[error("step '{step}' failed: {message}")]
    Step { step: String, message: String },

    #[error("execution cancelled")]
    Cancellation,

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("deadlock: no progress possible, {remaining} step(s) remain unscheduled")]
    Deadlock { remaining: usize },

    #[error("YAML parse error: {0}")]
    Parse(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

impl OrchestratorError {
    pub fn validation(
        step: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Validation {
            step: step.into(),
            field: field.into(),
            message: message.into(),
            remediation: None,
        }
    }

    pub fn validation_with_hint(
        step: impl Into<String>,
        field: impl Into<String>,
        message: impl Into<String>,
        remediation: impl Into<String>,
    ) -> Self {
        Self::Validation {
            step: step.into(),
            field: field.into(),
            message: message.into(),
            remediation: Some(remediation.into()),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Whether this error kind is ever a candidate for the provider fallback
    /// chain or a loop/step retry. Validation, dependency, and cancellation
    /// errors never are.
    pub fn is_retriable(&self) -> bool {
        !matches!(
            self,
            OrchestratorError::Validation { .. }
                | OrchestratorError::Dependency(_)
                | OrchestratorError::Cycle { .. }
                | OrchestratorError::Cancellation
        )
    }
}

impl From<serde_yaml::Error> for OrchestratorError {
    fn from(err: serde_yaml::Error) -> Self {
        OrchestratorError::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Serialization(err.to_string())
    }
}
