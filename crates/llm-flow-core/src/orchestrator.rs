// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Orchestrator: drives sequential or event-driven parallel execution,
//! routes each step to the right execution mode, and maintains the result
//! store and Gantt-style execution report.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::consensus::{execute_consensus, ConsensusOutcome};
use crate::dag::DependencyResolver;
use crate::error::{OrchestratorError, Result};
use crate::interpolate::Interpolator;
use crate::loop_exec::{execute_iterate, execute_until, ChildInvoker, ConditionEvaluator, LoopOutcome};
use crate::pool::{TaskOutcome, WorkerPool};
use crate::providers::{LLMProvider, ServerManager};
use crate::resolver::{resolve_default_provider_chain, resolve_pool_settings, resolve_step, PoolSettings, ResolvedSettings};
use crate::step_executor::execute_step;
use crate::workflow::{FailurePolicy, Loop, LoopConfig, LoopMode, Step, StepMode, TemplateConfig, WorkerErrorPolicy, Workflow};

const MAX_SEQUENTIAL_PASSES: usize = 100;

#[derive(Debug, Clone)]
pub struct StepTiming {
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A Gantt-style record of one execution: per-step results, the observed
/// timeline, and a sequential-vs-parallel speedup estimate.
#[derive(Debug, Clone)]
pub struct OrchestratorReport {
    pub final_output: String,
    pub step_results: HashMap<String, String>,
    pub consensus_results: HashMap<String, ConsensusOutcome>,
    pub timeline: Vec<StepTiming>,
    pub sequential_estimate_ms: u64,
    pub parallel_wall_ms: u64,
    pub speedup_ratio: f64,
}

impl OrchestratorReport {
    fn finalize(
        final_output: String,
        step_results: HashMap<String, String>,
        consensus_results: HashMap<String, ConsensusOutcome>,
        timeline: Vec<StepTiming>,
        wall_clock: Duration,
    ) -> Self {
        let sequential_estimate_ms: u64 = timeline
            .iter()
            .map(|t| (t.end - t.start).num_milliseconds().max(0) as u64)
            .sum();
        let parallel_wall_ms = wall_clock.as_millis() as u64;
        let speedup_ratio = if parallel_wall_ms == 0 {
            1.0
        } else {
            sequential_estimate_ms as f64 / parallel_wall_ms as f64
        };

        Self {
            final_output,
            step_results,
            consensus_results,
            timeline,
            sequential_estimate_ms,
            parallel_wall_ms,
            speedup_ratio,
        }
    }
}

/// Executes one workflow, recursively instantiating sub-orchestrators for
/// `template` steps and loop bodies. Cheap to clone: every field is an
/// `Arc` or owned data sized to one workflow.
#[derive(Clone)]
pub struct WorkflowExecutor {
    workflow: Arc<Workflow>,
    workflows: Arc<HashMap<String, Workflow>>,
    providers: Arc<HashMap<String, Arc<dyn LLMProvider>>>,
    server_manager: Arc<dyn ServerManager>,
}

impl WorkflowExecutor {
    pub fn new(
        workflow: Workflow,
        providers: HashMap<String, Arc<dyn LLMProvider>>,
        server_manager: Arc<dyn ServerManager>,
    ) -> Self {
        Self {
            workflow: Arc::new(workflow),
            workflows: Arc::new(HashMap::new()),
            providers: Arc::new(providers),
            server_manager,
        }
    }

    /// Registers named sub-workflows resolvable from `template:` steps and
    /// `loop:` bodies (both inline and top-level).
    pub fn with_sub_workflows(mut self, workflows: HashMap<String, Workflow>) -> Self {
        self.workflows = Arc::new(workflows);
        self
    }

    pub async fn execute(&self, input: &str) -> Result<OrchestratorReport> {
        self.workflow.validate_structure()?;
        let pool_settings = resolve_pool_settings(&self.workflow.execution);

        if pool_settings.parallel {
            self.execute_parallel(input, &pool_settings).await
        } else {
            self.execute_sequential(input).await
        }
    }

    // ---- sequential mode ---------------------------------------------

    async fn execute_sequential(&self, input: &str) -> Result<OrchestratorReport> {
        let wall_start = Instant::now();
        let mut interpolator = Interpolator::with_input(input);
        interpolator.set_env(&self.workflow.env);

        let mut completed: HashSet<String> = HashSet::new();
        let mut remaining: Vec<&Step> = self.workflow.steps.iter().collect();
        let mut remaining_loops: Vec<&Loop> = self.workflow.loops.iter().collect();
        let mut results: HashMap<String, String> = HashMap::new();
        let mut consensus_results: HashMap<String, ConsensusOutcome> = HashMap::new();
        let mut timeline = Vec::new();

        let mut passes = 0usize;
        while !remaining.is_empty() || !remaining_loops.is_empty() {
            passes += 1;
            if passes > MAX_SEQUENTIAL_PASSES {
                return Err(OrchestratorError::Deadlock {
                    remaining: remaining.len() + remaining_loops.len(),
                });
            }

            let ready_idx = remaining.iter().position(|s| s.needs.iter().all(|d| completed.contains(d)));

            if let Some(idx) = ready_idx {
                let step = remaining.remove(idx);
                let start = Utc::now();
                let outcome = self
                    .execute_step_dispatch(step, &mut interpolator, &mut consensus_results)
                    .await;
                let end = Utc::now();
                timeline.push(StepTiming {
                    name: step.name.clone(),
                    start,
                    end,
                });

                self.apply_step_outcome(step, outcome, &mut results, &mut interpolator, &mut completed)?;
            } else if !remaining_loops.is_empty() {
                let l = remaining_loops.remove(0);
                let start = Utc::now();
                let outcome = self.run_loop(&l.name, &l.config, &mut interpolator).await;
                let end = Utc::now();
                timeline.push(StepTiming {
                    name: l.name.clone(),
                    start,
                    end,
                });

                match outcome {
                    Ok(loop_outcome) => {
                        self.finalize_loop_interpolation(&mut interpolator, &l.name, &l.config, &loop_outcome);
                        results.insert(l.name.clone(), loop_outcome.output.clone());
                        completed.insert(l.name.clone());
                    }
                    Err(err) => {
                        if matches!(l.config.on_failure, FailurePolicy::Halt) {
                            return Err(err);
                        }
                        results.insert(l.name.clone(), String::new());
                        completed.insert(l.name.clone());
                    }
                }
            } else {
                return Err(OrchestratorError::Deadlock {
                    remaining: remaining.len() + remaining_loops.len(),
                });
            }
        }

        let final_output = self.final_output(&results);
        Ok(OrchestratorReport::finalize(
            final_output,
            results,
            consensus_results,
            timeline,
            wall_start.elapsed(),
        ))
    }

    fn apply_step_outcome(
        &self,
        step: &Step,
        outcome: Result<Option<String>>,
        results: &mut HashMap<String, String>,
        interpolator: &mut Interpolator,
        completed: &mut HashSet<String>,
    ) -> Result<()> {
        match outcome {
            Ok(Some(output)) => {
                results.insert(step.name.clone(), output.clone());
                interpolator.set(step.name.clone(), output);
                completed.insert(step.name.clone());
                Ok(())
            }
            Ok(None) => {
                // Skipped by its `if` guard — no output is recorded, but
                // dependents may still proceed.
                completed.insert(step.name.clone());
                Ok(())
            }
            Err(err) => match step.failure_policy() {
                FailurePolicy::Halt => Err(err),
                FailurePolicy::Continue => {
                    results.insert(step.name.clone(), String::new());
                    interpolator.set(step.name.clone(), "");
                    completed.insert(step.name.clone());
                    Ok(())
                }
                FailurePolicy::Retry => {
                    warn!(step = %step.name, "on_failure: retry is recognised but not yet implemented; falling back to halt");
                    Err(err)
                }
            },
        }
    }

    fn final_output(&self, results: &HashMap<String, String>) -> String {
        self.workflow
            .steps
            .last()
            .and_then(|s| results.get(&s.name).cloned())
            .unwrap_or_default()
    }

    // ---- parallel mode -------------------------------------------------

    async fn execute_parallel(&self, input: &str, pool_settings: &PoolSettings) -> Result<OrchestratorReport> {
        let wall_start = Instant::now();
        let interpolator = Arc::new(RwLock::new(Interpolator::with_input(input)));
        interpolator.write().await.set_env(&self.workflow.env);

        let dag = DependencyResolver::build(&self.workflow.steps, &self.workflow.loops)?;
        dag.validate_no_cycles()?;

        let pool = WorkerPool::new(pool_settings.max_workers, pool_settings.on_error);
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskOutcome<DispatchResult>>();

        let mut completed: HashSet<String> = HashSet::new();
        let mut submitted: HashSet<String> = HashSet::new();
        let mut results: HashMap<String, String> = HashMap::new();
        let mut consensus_results: HashMap<String, ConsensusOutcome> = HashMap::new();
        let mut timeline = Vec::new();
        let mut halted: Option<OrchestratorError> = None;
        // Set once the pool's error policy says to stop dispatching new
        // work (`cancel_all` / `complete_running`) or once a halting step
        // failure is seen. `submitted` then stops growing, so the loop
        // bound below (`completed.len() < submitted.len()`) still
        // terminates once every already-submitted task reports back.
        let mut stop_accepting = false;

        for name in &dag.loop_names {
            let l = self.workflow.get_loop(name).expect("loop_names lists a real loop").clone();
            submitted.insert(name.clone());
            self.submit_loop(l, interpolator.clone(), &pool, tx.clone());
        }
        for name in dag.ready(&completed) {
            let step = self.workflow.get_step(&name).expect("ready() lists a real step").clone();
            submitted.insert(name);
            self.submit_step(step, interpolator.clone(), &pool, tx.clone());
        }

        while completed.len() < submitted.len() {
            let Some(task) = rx.recv().await else {
                break;
            };

            let end = Utc::now();
            let start = match &task.output {
                Ok(d) => d.start,
                Err(_) => end,
            };
            timeline.push(StepTiming {
                name: task.name.clone(),
                start,
                end,
            });

            match task.output {
                Ok(dispatch) => {
                    completed.insert(task.name.clone());
                    if let Some(output) = dispatch.output {
                        results.insert(task.name.clone(), output.clone());
                        interpolator.write().await.set(task.name.clone(), output);
                    }
                    for (key, value) in dispatch.extra_vars {
                        interpolator.write().await.set(key, value);
                    }
                    if let Some(consensus) = dispatch.consensus {
                        consensus_results.insert(task.name.clone(), consensus);
                    }
                }
                Err(err) => {
                    completed.insert(task.name.clone());

                    if !matches!(pool_settings.on_error, WorkerErrorPolicy::Continue) {
                        stop_accepting = true;
                    }

                    let step_halt = self
                        .workflow
                        .get_step(&task.name)
                        .map(|s| matches!(s.failure_policy(), FailurePolicy::Halt))
                        .or_else(|| {
                            self.workflow
                                .get_loop(&task.name)
                                .map(|l| matches!(l.config.on_failure, FailurePolicy::Halt))
                        })
                        .unwrap_or(true);

                    if step_halt {
                        if halted.is_none() {
                            pool.cancel();
                        }
                        stop_accepting = true;
                        halted.get_or_insert(err);
                    } else if halted.is_none() {
                        results.insert(task.name.clone(), String::new());
                    }
                }
            }

            if !stop_accepting {
                for name in dag.ready(&completed) {
                    if submitted.insert(name.clone()) {
                        let step = self.workflow.get_step(&name).expect("ready() lists a real step").clone();
                        self.submit_step(step, interpolator.clone(), &pool, tx.clone());
                    }
                }
            }
        }

        if let Some(err) = halted {
            return Err(err);
        }

        let final_output = self.final_output(&results);
        Ok(OrchestratorReport::finalize(
            final_output,
            results,
            consensus_results,
            timeline,
            wall_start.elapsed(),
        ))
    }

    fn submit_step(
        &self,
        step: Step,
        interpolator: Arc<RwLock<Interpolator>>,
        pool: &WorkerPool,
        tx: mpsc::UnboundedSender<TaskOutcome<DispatchResult>>,
    ) {
        let this = self.clone();
        pool.submit(
            step.name.clone(),
            async move {
                let start = Utc::now();
                let mut scratch = interpolator.read().await.clone();
                let mut consensus_results = HashMap::new();
                let output = this.execute_step_dispatch(&step, &mut scratch, &mut consensus_results).await?;
                let extra_vars = if let Some(cfg) = &step.loop_ {
                    cfg.accumulate
                        .as_ref()
                        .and_then(|name| scratch.get(name).map(|v| vec![(name.clone(), v.to_string())]))
                        .unwrap_or_default()
                } else {
                    Vec::new()
                };
                Ok(DispatchResult {
                    start,
                    output,
                    consensus: consensus_results.remove(&step.name),
                    extra_vars,
                })
            },
            tx,
        );
    }

    fn submit_loop(
        &self,
        l: Loop,
        interpolator: Arc<RwLock<Interpolator>>,
        pool: &WorkerPool,
        tx: mpsc::UnboundedSender<TaskOutcome<DispatchResult>>,
    ) {
        let this = self.clone();
        pool.submit(
            l.name.clone(),
            async move {
                let start = Utc::now();
                let mut scratch = interpolator.read().await.clone();
                let outcome = this.run_loop(&l.name, &l.config, &mut scratch).await?;
                this.finalize_loop_interpolation(&mut scratch, &l.name, &l.config, &outcome);
                let extra_vars = l
                    .config
                    .accumulate
                    .as_ref()
                    .and_then(|name| scratch.get(name).map(|v| vec![(name.clone(), v.to_string())]))
                    .unwrap_or_default();
                Ok(DispatchResult {
                    start,
                    output: Some(outcome.output),
                    consensus: None,
                    extra_vars,
                })
            },
            tx,
        );
    }

    // ---- step dispatch --------------------------------------------------

    async fn execute_step_dispatch(
        &self,
        step: &Step,
        interpolator: &mut Interpolator,
        consensus_results: &mut HashMap<String, ConsensusOutcome>,
    ) -> Result<Option<String>> {
        if let Some(condition) = &step.condition {
            let (text, _missing) = interpolator.interpolate(condition);
            let trimmed = text.trim();
            if trimmed.is_empty() || trimmed == "false" || trimmed == "0" {
                debug!(step = %step.name, "skipped: `if` guard did not pass");
                return Ok(None);
            }
        }

        match step.mode()? {
            StepMode::Run(text) => {
                let resolved = resolve_step(step, &self.workflow.execution)?;
                let outcome = execute_step(
                    &step.name,
                    text,
                    interpolator,
                    &resolved,
                    &self.providers,
                    &self.server_manager,
                    step.scan_output_for_failures,
                )
                .await?;
                info!(step = %step.name, provider = %outcome.provider, model = %outcome.model, "step completed");
                if !outcome.success {
                    return Err(OrchestratorError::Step {
                        step: step.name.clone(),
                        message: format!(
                            "output from {}/{} matched a failure marker (scan_output_for_failures)",
                            outcome.provider, outcome.model
                        ),
                    });
                }
                Ok(Some(outcome.output))
            }
            StepMode::Consensus(cfg) => {
                let outcome = execute_consensus(
                    &step.name,
                    step,
                    cfg,
                    &self.workflow.execution,
                    interpolator,
                    &self.providers,
                    &self.server_manager,
                )
                .await?;
                let output = outcome.output.clone();
                let success = outcome.success;
                consensus_results.insert(step.name.clone(), outcome);
                if !success {
                    return Err(OrchestratorError::Consensus {
                        step: step.name.clone(),
                        message: "consensus requirement not met".to_string(),
                    });
                }
                Ok(Some(output))
            }
            StepMode::Template(cfg) => Ok(Some(self.execute_template(cfg, interpolator).await?)),
            StepMode::Loop(cfg) => {
                let outcome = self.run_loop(&step.name, cfg, interpolator).await?;
                self.finalize_loop_interpolation(interpolator, &step.name, cfg, &outcome);
                Ok(Some(outcome.output))
            }
            StepMode::Embeddings(cfg) => {
                let (text, _) = interpolator.interpolate(&cfg.input);
                Ok(Some(text))
            }
            StepMode::Rag(cfg) => {
                let (text, _) = interpolator.interpolate(&cfg.query);
                Ok(Some(text))
            }
        }
    }

    async fn execute_template(&self, cfg: &TemplateConfig, parent: &Interpolator) -> Result<String> {
        let child_workflow = self
            .workflows
            .get(&cfg.workflow)
            .ok_or_else(|| OrchestratorError::other(format!("unknown sub-workflow '{}'", cfg.workflow)))?
            .clone();

        let mut with = HashMap::new();
        for (key, value) in &cfg.with {
            let (text, _) = parent.interpolate(value);
            with.insert(key.clone(), text);
        }
        let input = with.get("input").cloned().unwrap_or_default();

        let child = WorkflowExecutor {
            workflow: Arc::new(child_workflow),
            workflows: self.workflows.clone(),
            providers: self.providers.clone(),
            server_manager: self.server_manager.clone(),
        };
        let report = child.execute(&input).await?;
        Ok(report.final_output)
    }

    fn finalize_loop_interpolation(&self, interpolator: &mut Interpolator, name: &str, cfg: &LoopConfig, outcome: &LoopOutcome) {
        interpolator.set(name, outcome.output.clone());
        if let (Some(acc_name), Some(joined)) = (&cfg.accumulate, &outcome.accumulated) {
            interpolator.set(acc_name.clone(), joined.clone());
        }
    }

    async fn run_loop(&self, name: &str, cfg: &LoopConfig, interpolator: &mut Interpolator) -> Result<LoopOutcome> {
        let workflows = self.workflows.clone();
        let providers = self.providers.clone();
        let server_manager = self.server_manager.clone();
        let target = cfg.workflow.clone();

        let mut invoke: Box<ChildInvoker> = {
            let workflows = workflows.clone();
            let providers = providers.clone();
            let server_manager = server_manager.clone();
            let target = target.clone();
            Box::new(move |with: HashMap<String, String>| {
                let workflows = workflows.clone();
                let providers = providers.clone();
                let server_manager = server_manager.clone();
                let target = target.clone();
                Box::pin(async move {
                    let child_workflow = workflows
                        .get(&target)
                        .ok_or_else(|| OrchestratorError::other(format!("unknown sub-workflow '{target}'")))?
                        .clone();
                    let input = with.get("input").cloned().unwrap_or_default();
                    let executor = WorkflowExecutor {
                        workflow: Arc::new(child_workflow),
                        workflows,
                        providers,
                        server_manager,
                    };
                    let report = executor.execute(&input).await?;
                    Ok(report.final_output)
                })
            })
        };

        match cfg.mode {
            LoopMode::Iterate => execute_iterate(name, cfg, interpolator, invoke.as_mut()).await,
            LoopMode::Until => {
                let mut evaluate: Box<ConditionEvaluator> = {
                    let workflows = workflows.clone();
                    let providers = providers.clone();
                    let server_manager = server_manager.clone();
                    let target = target.clone();
                    Box::new(move |prompt: String| {
                        let workflows = workflows.clone();
                        let providers = providers.clone();
                        let server_manager = server_manager.clone();
                        let target = target.clone();
                        Box::pin(async move {
                            let child_workflow = workflows.get(&target).ok_or_else(|| {
                                OrchestratorError::other(format!("unknown sub-workflow '{target}'"))
                            })?;
                            let chain = resolve_default_provider_chain(&child_workflow.execution)?;
                            let resolved = ResolvedSettings {
                                providers: chain,
                                temperature: 0.0,
                                max_tokens: child_workflow.execution.max_tokens.unwrap_or(4096),
                                timeout_seconds: child_workflow.execution.timeout_seconds.unwrap_or(30),
                                logging: child_workflow
                                    .execution
                                    .logging
                                    .clone()
                                    .unwrap_or_else(|| "info".to_string()),
                                servers: vec![],
                                skills: vec![],
                            };
                            let scratch = Interpolator::new();
                            let outcome = execute_step(
                                "__loop_until_eval__",
                                &prompt,
                                &scratch,
                                &resolved,
                                &providers,
                                &server_manager,
                                false,
                            )
                            .await?;
                            Ok(outcome.output)
                        })
                    })
                };
                execute_until(name, cfg, interpolator, invoke.as_mut(), evaluate.as_mut()).await
            }
        }
    }
}

/// Internal payload carried over the worker-pool completion channel for
/// one step/loop task.
struct DispatchResult {
    start: DateTime<Utc>,
    output: Option<String>,
    consensus: Option<ConsensusOutcome>,
    /// Interpolator variables beyond the task's own `{{name}}` slot that
    /// need to reach the shared table — currently just a loop's
    /// `accumulate` binding.
    extra_vars: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load_workflow;
    use crate::providers::testing::{EchoProvider, NullServerManager};

    fn providers_with_echo() -> HashMap<String, Arc<dyn LLMProvider>> {
        let mut map: HashMap<String, Arc<dyn LLMProvider>> = HashMap::new();
        map.insert("mock".into(), Arc::new(EchoProvider::new("mock")));
        map
    }

    #[tokio::test]
    async fn linear_chain_interpolates_across_steps() {
        let yaml = r#"
name: chain
version: "1.0"
execution:
  provider: mock
  model: m1
steps:
  - name: a
    run: "x"
  - name: b
    needs: [a]
    run: "have {{a}}"
  - name: c
    needs: [b]
    run: "have {{b}}"
"#;
        let workflow = load_workflow(yaml).unwrap();
        let executor = WorkflowExecutor::new(workflow, providers_with_echo(), Arc::new(NullServerManager));
        let report = executor.execute("ignored").await.unwrap();
        assert_eq!(report.final_output, "have have x");
        assert_eq!(report.step_results.len(), 3);
    }

    #[tokio::test]
    async fn if_guard_skips_step() {
        let yaml = r#"
name: guarded
version: "1.0"
execution:
  provider: mock
  model: m1
steps:
  - name: a
    run: "0"
  - name: b
    needs: [a]
    if: "{{a}}"
    run: "should not run"
"#;
        let workflow = load_workflow(yaml).unwrap();
        let executor = WorkflowExecutor::new(workflow, providers_with_echo(), Arc::new(NullServerManager));
        let report = executor.execute("x").await.unwrap();
        assert!(!report.step_results.contains_key("b"));
    }

    #[tokio::test]
    async fn continue_policy_records_empty_output_on_failure() {
        let yaml = r#"
name: tolerant
version: "1.0"
execution:
  provider: missing
  model: m1
steps:
  - name: a
    on_failure: continue
    run: "x"
  - name: b
    needs: [a]
    run: "after {{a}}"
"#;
        let workflow = load_workflow(yaml).unwrap();
        // No providers registered at all, so step `a` always fails.
        let executor = WorkflowExecutor::new(workflow, HashMap::new(), Arc::new(NullServerManager));
        let report = executor.execute("x").await.unwrap();
        assert_eq!(report.step_results.get("a").unwrap(), "");
        assert_eq!(report.step_results.get("b").unwrap(), "after ");
    }

    #[tokio::test]
    async fn halting_failure_propagates() {
        let yaml = r#"
name: strict
version: "1.0"
execution:
  provider: missing
  model: m1
steps:
  - name: a
    run: "x"
"#;
        let workflow = load_workflow(yaml).unwrap();
        let executor = WorkflowExecutor::new(workflow, HashMap::new(), Arc::new(NullServerManager));
        assert!(executor.execute("x").await.is_err());
    }

    #[tokio::test]
    async fn diamond_runs_in_parallel_mode_and_interpolates_dependents() {
        let yaml = r#"
name: diamond
version: "1.0"
execution:
  provider: mock
  model: m1
  parallel: true
  max_workers: 2
steps:
  - name: a
    run: "x"
  - name: b
    needs: [a]
    run: "have {{a}}"
  - name: c
    needs: [a]
    run: "also {{a}}"
  - name: d
    needs: [b, c]
    run: "done with {{b}} and {{c}}"
"#;
        let workflow = load_workflow(yaml).unwrap();
        let executor = WorkflowExecutor::new(workflow, providers_with_echo(), Arc::new(NullServerManager));
        let report = executor.execute("ignored").await.unwrap();
        assert_eq!(report.step_results.len(), 4);
        assert_eq!(report.final_output, "done with have x and also x");
    }

    #[tokio::test]
    async fn cycle_is_rejected_before_any_step_runs() {
        let yaml = r#"
name: cyclic
version: "1.0"
execution:
  provider: mock
  model: m1
  parallel: true
steps:
  - name: a
    needs: [b]
    run: "x"
  - name: b
    needs: [a]
    run: "y"
"#;
        // `needs` on both sides resolve (each to a known step), so structural
        // validation passes and the cycle is only caught once the DAG is built.
        let workflow = Workflow::from_yaml(yaml).unwrap();
        let executor = WorkflowExecutor::new(workflow, providers_with_echo(), Arc::new(NullServerManager));
        let err = executor.execute("x").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Cycle { .. }));
    }
}
