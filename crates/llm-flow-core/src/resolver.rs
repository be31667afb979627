// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Property Resolver: three-level execution-setting inheritance.
//!
//! Priority for a step is (1) the step's own value, (2) the workflow's
//! execution defaults, (3) a hard-coded fallback. Consensus execution
//! entries extend this to a fourth level underneath their own: entry → step
//! → execution defaults → hard-coded fallback.

use crate::error::{OrchestratorError, Result};
use crate::workflow::{
    ConsensusExecutionEntry, ConsensusOverrides, ExecutionSettings, ProviderEntry, Step,
    WorkerErrorPolicy,
};

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 4096;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_LOGGING: &str = "info";
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Fully resolved settings for one step execution (or one consensus entry).
#[derive(Debug, Clone)]
pub struct ResolvedSettings {
    pub providers: Vec<ProviderEntry>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_seconds: u64,
    pub logging: String,
    pub servers: Vec<String>,
    pub skills: Vec<String>,
}

fn pick<T: Clone>(levels: &[&Option<T>]) -> Option<T> {
    levels.iter().find_map(|v| v.as_ref().cloned())
}

/// Resolves the provider fallback chain: step `providers:` list wins over
/// step single `provider`+`model`, which wins over the execution defaults'
/// list, which wins over the execution defaults' single provider.
fn resolve_provider_chain(
    step_providers: &Option<Vec<ProviderEntry>>,
    step_provider: &Option<String>,
    step_model: &Option<String>,
    default_providers: &Option<Vec<ProviderEntry>>,
    default_provider: &Option<String>,
    default_model: &Option<String>,
) -> Result<Vec<ProviderEntry>> {
    if let Some(list) = step_providers {
        if !list.is_empty() {
            return Ok(list.clone());
        }
    }
    if let (Some(p), Some(m)) = (step_provider, step_model) {
        return Ok(vec![ProviderEntry {
            provider: p.clone(),
            model: m.clone(),
        }]);
    }
    if let Some(list) = default_providers {
        if !list.is_empty() {
            return Ok(list.clone());
        }
    }
    if let (Some(p), Some(m)) = (default_provider, default_model) {
        return Ok(vec![ProviderEntry {
            provider: p.clone(),
            model: m.clone(),
        }]);
    }
    Err(OrchestratorError::other(
        "no provider resolvable: none of step.providers, step.provider+model, execution.providers, execution.provider+model is set",
    ))
}

/// Resolves just the provider chain from execution defaults alone, with no
/// step-level override. Used where there is no step to resolve against —
/// e.g. the Loop Executor's `until`-condition evaluation, which always
/// runs against the child workflow's own defaults.
pub fn resolve_default_provider_chain(defaults: &ExecutionSettings) -> Result<Vec<ProviderEntry>> {
    resolve_provider_chain(
        &None,
        &None,
        &None,
        &defaults.providers,
        &defaults.provider,
        &defaults.model,
    )
}

/// Resolves settings for a plain `run` step (or as the step-level fallback
/// when resolving a consensus entry).
pub fn resolve_step(step: &Step, defaults: &ExecutionSettings) -> Result<ResolvedSettings> {
    let providers = resolve_provider_chain(
        &step.settings.providers,
        &step.settings.provider,
        &step.settings.model,
        &defaults.providers,
        &defaults.provider,
        &defaults.model,
    )?;

    Ok(ResolvedSettings {
        providers,
        temperature: pick(&[&step.settings.temperature, &defaults.temperature])
            .unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: pick(&[&step.settings.max_tokens, &defaults.max_tokens])
            .unwrap_or(DEFAULT_MAX_TOKENS),
        timeout_seconds: pick(&[&step.settings.timeout_seconds, &defaults.timeout_seconds])
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        logging: pick(&[&step.settings.logging, &defaults.logging])
            .unwrap_or_else(|| DEFAULT_LOGGING.to_string()),
        servers: pick(&[&step.settings.servers, &defaults.servers]).unwrap_or_default(),
        skills: pick(&[&step.settings.skills, &defaults.skills]).unwrap_or_default(),
    })
}

/// Resolves settings for a single consensus execution entry: entry → step →
/// execution defaults → hard-coded fallback. The entry's own
/// `provider`/`model` are always used as-is (no fallback chain — the
/// Consensus Executor invokes the Step Executor with a single-entry list).
pub fn resolve_consensus_entry(
    entry: &ConsensusExecutionEntry,
    step: &Step,
    defaults: &ExecutionSettings,
) -> ResolvedSettings {
    let ConsensusOverrides {
        temperature,
        max_tokens,
        timeout_seconds,
        logging,
        servers,
        skills,
    } = &entry.overrides;

    ResolvedSettings {
        providers: vec![ProviderEntry {
            provider: entry.provider.clone(),
            model: entry.model.clone(),
        }],
        temperature: pick(&[temperature, &step.settings.temperature, &defaults.temperature])
            .unwrap_or(DEFAULT_TEMPERATURE),
        max_tokens: pick(&[max_tokens, &step.settings.max_tokens, &defaults.max_tokens])
            .unwrap_or(DEFAULT_MAX_TOKENS),
        timeout_seconds: pick(&[
            timeout_seconds,
            &step.settings.timeout_seconds,
            &defaults.timeout_seconds,
        ])
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        logging: pick(&[logging, &step.settings.logging, &defaults.logging])
            .unwrap_or_else(|| DEFAULT_LOGGING.to_string()),
        servers: pick(&[servers, &step.settings.servers, &defaults.servers]).unwrap_or_default(),
        skills: pick(&[skills, &step.settings.skills, &defaults.skills]).unwrap_or_default(),
    }
}

/// Pool-wide settings: whether the workflow runs in parallel mode, the
/// worker cap, and the error policy. These live only at the execution
/// defaults level — there is no per-step override for pool shape.
pub struct PoolSettings {
    pub parallel: bool,
    pub max_workers: usize,
    pub on_error: WorkerErrorPolicy,
}

pub fn resolve_pool_settings(defaults: &ExecutionSettings) -> PoolSettings {
    PoolSettings {
        parallel: defaults.parallel.unwrap_or(false),
        max_workers: defaults.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
        on_error: defaults.on_error.unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FailurePolicy;
    use std::collections::HashMap;

    fn base_step() -> Step {
        Step {
            name: "s".into(),
            needs: vec![],
            condition: None,
            run: Some("x".into()),
            consensus: None,
            template: None,
            loop_: None,
            embeddings: None,
            rag: None,
            settings: ExecutionSettings::default(),
            scan_output_for_failures: false,
            on_failure: None,
        }
    }

    #[test]
    fn falls_back_to_hardcoded_defaults() {
        let mut defaults = ExecutionSettings::default();
        defaults.provider = Some("openai".into());
        defaults.model = Some("gpt-4".into());
        let step = base_step();

        let resolved = resolve_step(&step, &defaults).unwrap();
        assert_eq!(resolved.temperature, DEFAULT_TEMPERATURE);
        assert_eq!(resolved.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(resolved.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
        assert_eq!(resolved.logging, "info");
        assert_eq!(resolved.providers[0].provider, "openai");
    }

    #[test]
    fn step_value_wins_over_default() {
        let mut defaults = ExecutionSettings::default();
        defaults.provider = Some("openai".into());
        defaults.model = Some("gpt-4".into());
        defaults.temperature = Some(0.2);

        let mut step = base_step();
        step.settings.temperature = Some(0.9);

        let resolved = resolve_step(&step, &defaults).unwrap();
        assert_eq!(resolved.temperature, 0.9);
    }

    #[test]
    fn step_providers_list_wins_over_single_provider() {
        let mut defaults = ExecutionSettings::default();
        defaults.provider = Some("openai".into());
        defaults.model = Some("gpt-4".into());

        let mut step = base_step();
        step.settings.provider = Some("anthropic".into());
        step.settings.model = Some("claude".into());
        step.settings.providers = Some(vec![
            ProviderEntry { provider: "a".into(), model: "m1".into() },
            ProviderEntry { provider: "b".into(), model: "m2".into() },
        ]);

        let resolved = resolve_step(&step, &defaults).unwrap();
        assert_eq!(resolved.providers.len(), 2);
        assert_eq!(resolved.providers[0].provider, "a");
    }

    #[test]
    fn errors_when_no_provider_resolvable() {
        let defaults = ExecutionSettings::default();
        let step = base_step();
        assert!(resolve_step(&step, &defaults).is_err());
    }

    #[test]
    fn consensus_entry_extends_to_three_levels() {
        let mut defaults = ExecutionSettings::default();
        defaults.temperature = Some(0.1);
        defaults.max_tokens = Some(100);

        let mut step = base_step();
        step.settings.temperature = Some(0.5);

        let entry = ConsensusExecutionEntry {
            provider: "openai".into(),
            model: "gpt-4".into(),
            overrides: ConsensusOverrides {
                temperature: None,
                max_tokens: Some(999),
                timeout_seconds: None,
                logging: None,
                servers: None,
                skills: None,
            },
        };

        let resolved = resolve_consensus_entry(&entry, &step, &defaults);
        // temperature: entry unset -> step's 0.5
        assert_eq!(resolved.temperature, 0.5);
        // max_tokens: entry's own 999 wins
        assert_eq!(resolved.max_tokens, 999);
        // timeout: nothing set anywhere -> hardcoded default
        assert_eq!(resolved.timeout_seconds, DEFAULT_TIMEOUT_SECONDS);
    }

    #[test]
    fn pool_settings_default_to_sequential() {
        let defaults = ExecutionSettings::default();
        let pool = resolve_pool_settings(&defaults);
        assert!(!pool.parallel);
        assert_eq!(pool.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(pool.on_error, WorkerErrorPolicy::CancelAll);
    }

    #[test]
    fn step_failure_policy_defaults_to_halt() {
        let step = base_step();
        assert_eq!(step.failure_policy(), FailurePolicy::Halt);
        let _ = HashMap::<String, String>::new();
    }
}
