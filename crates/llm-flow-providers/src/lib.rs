// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! LLM provider integrations for llm-flow.

pub mod anthropic;
pub mod openai;

pub use anthropic::AnthropicProvider;
pub use openai::OpenAIProvider;
pub use llm_flow_core::{CompletionRequest, CompletionResponse, LLMProvider, Message, ProviderError, Tool, ToolCall};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
