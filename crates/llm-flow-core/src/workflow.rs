// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Workflow definition types.
//!
//! A [`Workflow`] is immutable once parsed: the loader produces it, the
//! orchestrator consumes it, nothing mutates it in between. Every execution
//! setting (provider chain, temperature, timeout, ...) is `Option` at every
//! level so the three-level inheritance in `resolver.rs` can tell "unset"
//! apart from "explicitly set to the default value".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{OrchestratorError, Result};

/// A complete, validated workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub execution: ExecutionSettings,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub loops: Vec<Loop>,
}

/// One (provider, model) pair in a fallback chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderEntry {
    pub provider: String,
    pub model: String,
}

/// Settings shared by workflow-level execution defaults and per-step
/// overrides. Every field is optional; absence means "inherit".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<ProviderEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_error: Option<WorkerErrorPolicy>,
}

impl ExecutionSettings {
    pub const ALLOWED_KEYS: &'static [&'static str] = &[
        "provider",
        "model",
        "providers",
        "temperature",
        "max_tokens",
        "timeout_seconds",
        "logging",
        "servers",
        "skills",
        "parallel",
        "max_workers",
        "on_error",
    ];
}

/// Settings a single consensus execution entry may override. A subset of
/// [`ExecutionSettings`]: an entry names its own provider/model explicitly,
/// so it never carries a `providers` fallback list, and it never controls
/// pool-wide concerns like `parallel`/`max_workers`/`on_error`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsensusOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skills: Option<Vec<String>>,
}

impl ConsensusOverrides {
    pub const ALLOWED_KEYS: &'static [&'static str] = &[
        "temperature",
        "max_tokens",
        "timeout_seconds",
        "logging",
        "servers",
        "skills",
    ];
}

/// Pool-wide error policy: how the worker pool reacts to a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorPolicy {
    #[default]
    CancelAll,
    CompleteRunning,
    Continue,
}

/// Per-step/loop failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    Halt,
    Continue,
    Retry,
}

/// A single workflow step: exactly one of `run` / `consensus` / `template` /
/// `loop` / `embeddings` / `rag` must be populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(rename = "if", skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consensus: Option<ConsensusConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<TemplateConfig>,
    #[serde(rename = "loop", skip_serializing_if = "Option::is_none")]
    pub loop_: Option<LoopConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings: Option<EmbeddingsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rag: Option<RagConfig>,

    #[serde(flatten)]
    pub settings: ExecutionSettings,

    /// Opt-in for the advisory failure-string heuristic (§4.7 / REDESIGN
    /// FLAGS). Off by default: false positives on legitimate output
    /// discussing errors are expected.
    #[serde(default)]
    pub scan_output_for_failures: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<FailurePolicy>,
}

pub const STEP_ALLOWED_KEYS: &[&str] = &[
    "name",
    "needs",
    "if",
    "run",
    "consensus",
    "template",
    "loop",
    "embeddings",
    "rag",
    "scan_output_for_failures",
    "on_failure",
];

/// The mode a step executes in, borrowed from its optional fields.
pub enum StepMode<'a> {
    Run(&'a str),
    Consensus(&'a ConsensusConfig),
    Template(&'a TemplateConfig),
    Loop(&'a LoopConfig),
    Embeddings(&'a EmbeddingsConfig),
    Rag(&'a RagConfig),
}

impl Step {
    /// Determines the step's single execution mode. Returns a
    /// `ValidationError` if zero or more than one mode field is populated.
    pub fn mode(&self) -> Result<StepMode<'_>> {
        let mut present: Vec<StepMode<'_>> = Vec::new();
        if let Some(r) = &self.run {
            present.push(StepMode::Run(r));
        }
        if let Some(c) = &self.consensus {
            present.push(StepMode::Consensus(c));
        }
        if let Some(t) = &self.template {
            present.push(StepMode::Template(t));
        }
        if let Some(l) = &self.loop_ {
            present.push(StepMode::Loop(l));
        }
        if let Some(e) = &self.embeddings {
            present.push(StepMode::Embeddings(e));
        }
        if let Some(r) = &self.rag {
            present.push(StepMode::Rag(r));
        }

        match present.len() {
            0 => Err(OrchestratorError::validation(
                &self.name,
                "mode",
                "step declares no execution mode (expected one of run/consensus/template/loop/embeddings/rag)",
            )),
            1 => Ok(present.into_iter().next().unwrap()),
            n => Err(OrchestratorError::validation(
                &self.name,
                "mode",
                format!("step declares {n} execution modes; exactly one is required"),
            )),
        }
    }

    /// The effective failure policy for this step (step override, else
    /// `halt`). `retry` is recognised as a valid value but not yet
    /// implemented: the orchestrator logs a warning and halts immediately,
    /// with no re-run of the step — see `orchestrator.rs`.
    pub fn failure_policy(&self) -> FailurePolicy {
        self.on_failure.unwrap_or_default()
    }
}

/// Vote requirement for a consensus step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusRequirement {
    #[serde(rename = "unanimous")]
    Unanimous,
    #[serde(rename = "2/3")]
    TwoThirds,
    #[serde(rename = "majority")]
    Majority,
}

/// A single independent provider entry in a consensus fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusExecutionEntry {
    pub provider: String,
    pub model: String,
    #[serde(flatten)]
    pub overrides: ConsensusOverrides,
}

/// `consensus:` step configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    pub prompt: String,
    pub executions: Vec<ConsensusExecutionEntry>,
    pub requirement: ConsensusRequirement,
}

pub const CONSENSUS_ALLOWED_KEYS: &[&str] = &["prompt", "executions", "requirement"];
pub const CONSENSUS_EXECUTION_ALLOWED_KEYS: &[&str] = &[
    "provider",
    "model",
    "temperature",
    "max_tokens",
    "timeout_seconds",
    "logging",
    "servers",
    "skills",
];

/// `template:` step configuration: invoke a sub-workflow by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub workflow: String,
    #[serde(default)]
    pub with: HashMap<String, String>,
}

pub const TEMPLATE_ALLOWED_KEYS: &[&str] = &["workflow", "with"];

/// Loop execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    Until,
    Iterate,
}

/// Shared shape for both a top-level named [`Loop`] and a step's inline
/// `loop:` mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    pub workflow: String,
    pub mode: LoopMode,
    #[serde(default)]
    pub with: HashMap<String, String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// `until` mode only: the LLM-evaluated predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<String>,

    /// `iterate` mode only: template yielding a JSON array, JSONL, or
    /// line-delimited text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_success_rate: Option<f64>,

    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accumulate: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

pub const LOOP_CONFIG_ALLOWED_KEYS: &[&str] = &[
    "workflow",
    "mode",
    "with",
    "max_iterations",
    "until",
    "items",
    "min_success_rate",
    "on_failure",
    "accumulate",
    "max_retries",
    "retry_delay_ms",
];

fn default_max_iterations() -> u32 {
    10
}

fn default_max_retries() -> u32 {
    0
}

fn default_retry_delay_ms() -> u64 {
    0
}

/// A top-level, named loop. Loops are not gated by `needs`: the orchestrator
/// treats every declared loop as immediately ready (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Loop {
    pub name: String,
    #[serde(flatten)]
    pub config: LoopConfig,
}

pub const LOOP_ALLOWED_KEYS: &[&str] = LOOP_CONFIG_ALLOWED_KEYS;

/// `embeddings:` step configuration. Delegated entirely to an external
/// collaborator; the engine only validates shape and threads the result
/// through like any other step output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingsConfig {
    pub input: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// `rag:` step configuration. Same delegation model as `embeddings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub query: String,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Workflow {
    /// Structural validation only: name/version non-empty, unique names
    /// across steps and loops, exactly one mode per step, consensus shape,
    /// and that every `needs` entry resolves. Cycle detection lives in
    /// `dag.rs`; variable-reference validation lives in `loader.rs`.
    pub fn validate_structure(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "<workflow>",
                "name",
                "workflow name must not be empty",
            ));
        }
        if self.version.trim().is_empty() {
            return Err(OrchestratorError::validation(
                "<workflow>",
                "version",
                "workflow version must not be empty",
            ));
        }
        if self.steps.is_empty() {
            return Err(OrchestratorError::validation(
                "<workflow>",
                "steps",
                "workflow must declare at least one step",
            ));
        }

        let mut step_names = std::collections::HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(OrchestratorError::validation(
                    &step.name,
                    "name",
                    format!("duplicate step name '{}'", step.name),
                ));
            }
        }

        let mut loop_names = std::collections::HashSet::new();
        for l in &self.loops {
            if !loop_names.insert(l.name.as_str()) {
                return Err(OrchestratorError::validation(
                    &l.name,
                    "name",
                    format!("duplicate loop name '{}'", l.name),
                ));
            }
            if step_names.contains(l.name.as_str()) {
                return Err(OrchestratorError::validation(
                    &l.name,
                    "name",
                    format!("loop name '{}' collides with a step name", l.name),
                ));
            }
        }

        let known: std::collections::HashSet<&str> =
            step_names.iter().copied().chain(loop_names.iter().copied()).collect();

        for step in &self.steps {
            for dep in &step.needs {
                if !known.contains(dep.as_str()) {
                    return Err(OrchestratorError::validation(
                        &step.name,
                        "needs",
                        format!("unknown dependency '{dep}'"),
                    ));
                }
            }

            // Exactly-one-mode check.
            step.mode()?;

            if let Some(consensus) = &step.consensus {
                if consensus.executions.len() < 2 {
                    return Err(OrchestratorError::validation(
                        &step.name,
                        "consensus.executions",
                        "consensus requires at least 2 execution entries",
                    ));
                }
            }

            if let Some(loop_cfg) = &step.loop_ {
                validate_loop_config(&step.name, loop_cfg)?;
            }
        }

        for l in &self.loops {
            validate_loop_config(&l.name, &l.config)?;
        }

        Ok(())
    }

    pub fn get_step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn get_loop(&self, name: &str) -> Option<&Loop> {
        self.loops.iter().find(|l| l.name == name)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(OrchestratorError::from)
    }
}

fn validate_loop_config(owner: &str, cfg: &LoopConfig) -> Result<()> {
    match cfg.mode {
        LoopMode::Until => {
            if cfg.until.is_none() {
                return Err(OrchestratorError::validation(
                    owner,
                    "loop.until",
                    "until-mode loop requires an `until` predicate",
                ));
            }
        }
        LoopMode::Iterate => {
            if cfg.items.is_none() {
                return Err(OrchestratorError::validation(
                    owner,
                    "loop.items",
                    "iterate-mode loop requires an `items` template",
                ));
            }
            if let Some(rate) = cfg.min_success_rate {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(OrchestratorError::validation(
                        owner,
                        "loop.min_success_rate",
                        "min_success_rate must be between 0.0 and 1.0",
                    ));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_step(name: &str, needs: &[&str], prompt: &str) -> Step {
        Step {
            name: name.to_string(),
            needs: needs.iter().map(|s| s.to_string()).collect(),
            condition: None,
            run: Some(prompt.to_string()),
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
    fn rejects_empty_workflow() {
        let wf = Workflow {
            name: "test".into(),
            version: "1.0".into(),
            env: HashMap::new(),
            execution: ExecutionSettings::default(),
            steps: vec![],
            loops: vec![],
        };
        assert!(wf.validate_structure().is_err());
    }

    #[test]
    fn accepts_linear_chain() {
        let wf = Workflow {
            name: "test".into(),
            version: "1.0".into(),
            env: HashMap::new(),
            execution: ExecutionSettings::default(),
            steps: vec![
                run_step("a", &[], "x"),
                run_step("b", &["a"], "have {{a}}"),
            ],
            loops: vec![],
        };
        assert!(wf.validate_structure().is_ok());
    }

    #[test]
    fn rejects_duplicate_step_names() {
        let wf = Workflow {
            name: "test".into(),
            version: "1.0".into(),
            env: HashMap::new(),
            execution: ExecutionSettings::default(),
            steps: vec![run_step("a", &[], "x"), run_step("a", &[], "y")],
            loops: vec![],
        };
        assert!(wf.validate_structure().is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let wf = Workflow {
            name: "test".into(),
            version: "1.0".into(),
            env: HashMap::new(),
            execution: ExecutionSettings::default(),
            steps: vec![run_step("a", &["missing"], "x")],
            loops: vec![],
        };
        assert!(wf.validate_structure().is_err());
    }

    #[test]
    fn rejects_ambiguous_mode() {
        let mut step = run_step("a", &[], "x");
        step.template = Some(TemplateConfig {
            workflow: "child".into(),
            with: HashMap::new(),
        });
        let wf = Workflow {
            name: "test".into(),
            version: "1.0".into(),
            env: HashMap::new(),
            execution: ExecutionSettings::default(),
            steps: vec![step],
            loops: vec![],
        };
        assert!(wf.validate_structure().is_err());
    }

    #[test]
    fn parses_yaml_workflow() {
        let yaml = r#"
name: test-workflow
version: "1.0"
steps:
  - name: step1
    run: "Hello {{input}}"
"#;
        let wf = Workflow::from_yaml(yaml).unwrap();
        assert_eq!(wf.name, "test-workflow");
        assert_eq!(wf.steps.len(), 1);
        assert!(matches!(wf.steps[0].mode().unwrap(), StepMode::Run(_)));
    }

    #[test]
    fn consensus_requires_two_executions() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: vote
    consensus:
      prompt: "p"
      requirement: majority
      executions:
        - provider: a
          model: m1
"#;
        let wf = Workflow::from_yaml(yaml).unwrap();
        assert!(wf.validate_structure().is_err());
    }
}
