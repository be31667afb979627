// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Consensus Executor: fan out N parallel independent requests, tally
//! votes under a requirement predicate, report agreement and confidence.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::error::{OrchestratorError, Result};
use crate::interpolate::Interpolator;
use crate::providers::{LLMProvider, ServerManager};
use crate::resolver::resolve_consensus_entry;
use crate::step_executor::execute_step;
use crate::workflow::{ConsensusConfig, ConsensusRequirement, ExecutionSettings, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confidence {
    High,
    Good,
    Medium,
    Low,
}

impl Confidence {
    pub fn from_agreement(agreement: f64) -> Self {
        if agreement >= 1.0 {
            Confidence::High
        } else if agreement >= 0.75 {
            Confidence::Good
        } else if agreement >= 0.60 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConsensusOutcome {
    /// The raw (un-normalised) winning output.
    pub output: String,
    pub agreement: f64,
    pub confidence: Confidence,
    /// Raw per-provider output, successes only.
    pub votes: HashMap<String, String>,
    /// Whether the requirement predicate held, AND (for steps named
    /// `*validate*`) the winning output normalises to `SUCCESS`.
    pub success: bool,
}

/// Strips markdown emphasis (`*`, `` ` ``), trims, uppercases, and
/// collapses to `SUCCESS`/`FAIL` when either token is present; otherwise
/// collapses internal whitespace runs. Idempotent by construction: the
/// output of one pass contains none of the characters the next pass would
/// strip and is already upper-cased/whitespace-collapsed.
pub fn normalize(text: &str) -> String {
    let stripped: String = text.chars().filter(|c| !matches!(c, '*' | '`')).collect();
    let upper = stripped.trim().to_uppercase();

    if upper.contains("SUCCESS") {
        return "SUCCESS".to_string();
    }
    if upper.contains("FAIL") {
        return "FAIL".to_string();
    }

    upper.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Runs the consensus fan-out for a step's `consensus` block and tallies
/// the result. `prompt_template` is the already-declared `consensus.prompt`
/// text; it is interpolated once per execution entry (each entry may carry
/// different `{{...}}`-visible context only through built-ins, since all
/// entries share the same calling step).
pub async fn execute_consensus(
    step_name: &str,
    step: &Step,
    config: &ConsensusConfig,
    defaults: &ExecutionSettings,
    interpolator: &Interpolator,
    providers: &HashMap<String, Arc<dyn LLMProvider>>,
    server_manager: &Arc<dyn ServerManager>,
) -> Result<ConsensusOutcome> {
    let futures = config.executions.iter().map(|entry| {
        let resolved = resolve_consensus_entry(entry, step, defaults);
        let provider_name = entry.provider.clone();
        let prompt = config.prompt.clone();
        let interpolator = interpolator.clone();
        let providers = providers.clone();
        let server_manager = server_manager.clone();
        let step_name = step_name.to_string();

        async move {
            let result = execute_step(
                &step_name,
                &prompt,
                &interpolator,
                &resolved,
                &providers,
                &server_manager,
                false,
            )
            .await;
            (provider_name, result)
        }
    });

    let results: Vec<(String, Result<crate::step_executor::StepOutcome>)> = join_all(futures).await;
    let total = results.len();

    let mut votes: HashMap<String, String> = HashMap::new();
    let mut order: Vec<(String, String)> = Vec::new(); // (provider, raw output), in completion order
    for (provider, outcome) in &results {
        if let Ok(outcome) = outcome {
            votes.insert(provider.clone(), outcome.output.clone());
            order.push((provider.clone(), outcome.output.clone()));
        }
    }
    let succeeded = order.len();

    if succeeded < 2 {
        return Err(OrchestratorError::Consensus {
            step: step_name.to_string(),
            message: format!(
                "insufficient successful providers for consensus: only {succeeded}/{total} succeeded (need at least 2)"
            ),
        });
    }

    let mut tally: Vec<(String, usize, String)> = Vec::new(); // (normalised, count, first raw output)
    for (_, raw) in &order {
        let key = normalize(raw);
        if let Some(entry) = tally.iter_mut().find(|(k, _, _)| *k == key) {
            entry.1 += 1;
        } else {
            tally.push((key, 1, raw.clone()));
        }
    }

    let (winning_key, winning_count, winning_raw) = tally
        .into_iter()
        .max_by_key(|(_, count, _)| *count)
        .expect("at least one normalised vote exists when succeeded >= 2");

    let agreement = winning_count as f64 / succeeded as f64;
    let confidence = Confidence::from_agreement(agreement);

    let requirement_met = match config.requirement {
        ConsensusRequirement::Unanimous => agreement >= 1.0,
        ConsensusRequirement::TwoThirds => agreement >= 2.0 / 3.0,
        ConsensusRequirement::Majority => agreement > 0.5,
    };

    let name_requires_success = step_name.to_lowercase().contains("validate");
    let success = requirement_met && (!name_requires_success || winning_key == "SUCCESS");

    Ok(ConsensusOutcome {
        output: winning_raw,
        agreement,
        confidence,
        votes,
        success,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::testing::{NullServerManager, ScriptedProvider};
    use crate::workflow::{ConsensusExecutionEntry, ConsensusOverrides};

    fn entry(provider: &str, model: &str) -> ConsensusExecutionEntry {
        ConsensusExecutionEntry {
            provider: provider.to_string(),
            model: model.to_string(),
            overrides: ConsensusOverrides::default(),
        }
    }

    fn base_step(name: &str) -> Step {
        Step {
            name: name.to_string(),
            needs: vec![],
            condition: None,
            run: None,
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

    fn providers_map(entries: &[(&str, &str)]) -> HashMap<String, Arc<dyn LLMProvider>> {
        let mut map: HashMap<String, Arc<dyn LLMProvider>> = HashMap::new();
        for (name, response) in entries {
            map.insert((*name).to_string(), Arc::new(ScriptedProvider::new(*name, *response)));
        }
        map
    }

    #[test]
    fn normalize_collapses_success_variants() {
        assert_eq!(normalize("**SUCCESS**"), "SUCCESS");
        assert_eq!(normalize("  success  "), "SUCCESS");
        assert_eq!(normalize("`Success!`"), "SUCCESS");
    }

    #[test]
    fn normalize_is_idempotent() {
        for input in ["**SUCCESS**", "hello   world", "FAIL: nope", "plain"] {
            let once = normalize(input);
            let twice = normalize(&once);
            assert_eq!(once, twice);
        }
    }

    #[tokio::test]
    async fn majority_requirement_with_two_thirds_agreement() {
        let config = ConsensusConfig {
            prompt: "vote".into(),
            executions: vec![entry("p1", "m1"), entry("p2", "m2"), entry("p3", "m3")],
            requirement: ConsensusRequirement::Majority,
        };
        let providers = providers_map(&[("p1", "YES"), ("p2", "YES"), ("p3", "NO")]);
        let mgr: Arc<dyn ServerManager> = Arc::new(NullServerManager);
        let step = base_step("vote_step");
        let defaults = ExecutionSettings::default();
        let interpolator = Interpolator::new();

        let outcome = execute_consensus(
            "vote_step",
            &step,
            &config,
            &defaults,
            &interpolator,
            &providers,
            &mgr,
        )
        .await
        .unwrap();

        assert!((outcome.agreement - (2.0 / 3.0)).abs() < 0.01);
        assert_eq!(outcome.confidence, Confidence::Medium);
        assert_eq!(outcome.output, "YES");
        assert!(outcome.success);
    }

    #[tokio::test]
    async fn fails_fast_with_fewer_than_two_successes() {
        let config = ConsensusConfig {
            prompt: "vote".into(),
            executions: vec![
                entry("p1", "m1"),
                entry("p2", "m2"),
                entry("p3", "m3"),
                entry("p4", "m4"),
            ],
            requirement: ConsensusRequirement::Majority,
        };
        // Only p4 is registered; p1-p3 resolve to "unregistered provider" errors.
        let providers = providers_map(&[("p4", "YES")]);
        let mgr: Arc<dyn ServerManager> = Arc::new(NullServerManager);
        let step = base_step("vote_step");
        let defaults = ExecutionSettings::default();
        let interpolator = Interpolator::new();

        let err = execute_consensus(
            "vote_step",
            &step,
            &config,
            &defaults,
            &interpolator,
            &providers,
            &mgr,
        )
        .await
        .unwrap_err();

        match err {
            OrchestratorError::Consensus { message, .. } => {
                assert!(message.contains("only 1/4 succeeded"));
            }
            other => panic!("expected Consensus error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unanimous_requires_full_agreement() {
        let config = ConsensusConfig {
            prompt: "vote".into(),
            executions: vec![entry("p1", "m1"), entry("p2", "m2")],
            requirement: ConsensusRequirement::Unanimous,
        };
        let providers = providers_map(&[("p1", "YES"), ("p2", "NO")]);
        let mgr: Arc<dyn ServerManager> = Arc::new(NullServerManager);
        let step = base_step("vote_step");
        let defaults = ExecutionSettings::default();
        let interpolator = Interpolator::new();

        let outcome = execute_consensus(
            "vote_step",
            &step,
            &config,
            &defaults,
            &interpolator,
            &providers,
            &mgr,
        )
        .await
        .unwrap();

        assert!(!outcome.success);
    }

    #[tokio::test]
    async fn validate_named_step_requires_success_token() {
        let config = ConsensusConfig {
            prompt: "vote".into(),
            executions: vec![entry("p1", "m1"), entry("p2", "m2")],
            requirement: ConsensusRequirement::Unanimous,
        };
        let providers = providers_map(&[("p1", "YES"), ("p2", "YES")]);
        let mgr: Arc<dyn ServerManager> = Arc::new(NullServerManager);
        let step = base_step("validate_output");
        let defaults = ExecutionSettings::default();
        let interpolator = Interpolator::new();

        let outcome = execute_consensus(
            "validate_output",
            &step,
            &config,
            &defaults,
            &interpolator,
            &providers,
            &mgr,
        )
        .await
        .unwrap();

        // Requirement held (unanimous YES) but the step is named `validate_*`
        // and the winning output isn't SUCCESS, so it's reported failed.
        assert!(!outcome.success);
    }
}
