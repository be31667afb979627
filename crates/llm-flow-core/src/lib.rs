// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Core workflow orchestration engine for declarative, multi-provider LLM
//! pipelines: YAML loading and validation, dependency resolution, bounded
//! concurrency, provider fallback, consensus voting, and loop execution.

pub mod consensus;
pub mod dag;
pub mod error;
pub mod interpolate;
pub mod loader;
pub mod loop_exec;
pub mod orchestrator;
pub mod pool;
pub mod providers;
pub mod resolver;
pub mod step_executor;
pub mod workflow;

pub use consensus::{execute_consensus, Confidence, ConsensusOutcome};
pub use dag::DependencyResolver;
pub use error::{OrchestratorError, Result};
pub use interpolate::Interpolator;
pub use loader::load_workflow;
pub use loop_exec::{execute_iterate, execute_until, ExitReason, LoopOutcome};
pub use orchestrator::{OrchestratorReport, StepTiming, WorkflowExecutor};
pub use pool::{TaskOutcome, WorkerPool};
pub use providers::{
    CompletionRequest, CompletionResponse, LLMProvider, Message, ProviderError, ServerManager, Tool, ToolCall,
};
pub use resolver::{resolve_step, PoolSettings, ResolvedSettings};
pub use step_executor::{execute_step, StepOutcome};
pub use workflow::{
    ConsensusConfig, ConsensusRequirement, ExecutionSettings, FailurePolicy, Loop, LoopConfig, LoopMode, Step,
    StepMode, TemplateConfig, Workflow, WorkerErrorPolicy,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
