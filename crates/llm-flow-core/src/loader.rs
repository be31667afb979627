// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! Loader/Validator: turns raw YAML text into a validated [`Workflow`].
//!
//! Two passes run before a workflow is handed to the orchestrator. The
//! first is a manual unknown-key scan against a `serde_yaml::Value` map,
//! since `#[serde(flatten)]` and `#[serde(deny_unknown_fields)]` can't be
//! combined on the same struct. The second is the Variable Validator: every
//! `{{base}}` reference in a text field must resolve to a built-in
//! namespace or to a step/loop that the referencing step actually `needs`.

use std::collections::HashSet;

use serde_yaml::Value;

use crate::error::{OrchestratorError, Result};
use crate::interpolate::{Interpolator, BUILTIN_BASES};
use crate::workflow::{
    ExecutionSettings, Step, StepMode, Workflow, CONSENSUS_ALLOWED_KEYS,
    CONSENSUS_EXECUTION_ALLOWED_KEYS, LOOP_ALLOWED_KEYS, STEP_ALLOWED_KEYS, TEMPLATE_ALLOWED_KEYS,
};

/// Parses and fully validates a workflow document: unknown-key rejection,
/// structural validation (`Workflow::validate_structure`), and variable
/// reference validation. Does not check the DAG for cycles — that's
/// `dag.rs`'s job, run by the orchestrator before execution starts.
pub fn load_workflow(yaml: &str) -> Result<Workflow> {
    let raw: Value = serde_yaml::from_str(yaml)?;
    reject_unknown_keys(&raw)?;

    let workflow = Workflow::from_yaml(yaml)?;
    workflow.validate_structure()?;
    validate_variable_references(&workflow)?;

    Ok(workflow)
}

fn as_mapping(value: &Value) -> Option<&serde_yaml::Mapping> {
    value.as_mapping()
}

fn check_keys(owner: &str, field: &str, value: &Value, allowed: &[&str]) -> Result<()> {
    let Some(map) = as_mapping(value) else {
        return Ok(());
    };
    for key in map.keys() {
        let Some(key) = key.as_str() else { continue };
        if !allowed.contains(&key) {
            return Err(OrchestratorError::validation_with_hint(
                owner,
                field,
                format!("unknown key '{key}'"),
                format!("allowed keys: {}", allowed.join(", ")),
            ));
        }
    }
    Ok(())
}

fn reject_unknown_keys(raw: &Value) -> Result<()> {
    const WORKFLOW_ALLOWED_KEYS: &[&str] = &["name", "version", "env", "execution", "steps", "loops"];

    check_keys("<workflow>", "<root>", raw, WORKFLOW_ALLOWED_KEYS)?;

    if let Some(map) = as_mapping(raw) {
        if let Some(execution) = map.get("execution") {
            check_keys("<workflow>", "execution", execution, ExecutionSettings::ALLOWED_KEYS)?;
        }

        if let Some(Value::Sequence(steps)) = map.get("steps") {
            let mut step_allowed: Vec<&str> = STEP_ALLOWED_KEYS.to_vec();
            step_allowed.extend_from_slice(ExecutionSettings::ALLOWED_KEYS);

            for step in steps {
                let name = step_name(step);
                check_keys(&name, "<step>", step, &step_allowed)?;

                if let Some(step_map) = as_mapping(step) {
                    if let Some(consensus) = step_map.get("consensus") {
                        check_keys(&name, "consensus", consensus, CONSENSUS_ALLOWED_KEYS)?;
                        if let Some(Value::Sequence(executions)) =
                            as_mapping(consensus).and_then(|m| m.get("executions"))
                        {
                            for (i, entry) in executions.iter().enumerate() {
                                check_keys(
                                    &name,
                                    &format!("consensus.executions[{i}]"),
                                    entry,
                                    CONSENSUS_EXECUTION_ALLOWED_KEYS,
                                )?;
                            }
                        }
                    }
                    if let Some(template) = step_map.get("template") {
                        check_keys(&name, "template", template, TEMPLATE_ALLOWED_KEYS)?;
                    }
                    if let Some(loop_cfg) = step_map.get("loop") {
                        check_keys(&name, "loop", loop_cfg, LOOP_ALLOWED_KEYS)?;
                    }
                }
            }
        }

        if let Some(Value::Sequence(loops)) = map.get("loops") {
            let mut loop_allowed: Vec<&str> = vec!["name"];
            loop_allowed.extend_from_slice(LOOP_ALLOWED_KEYS);

            for l in loops {
                let name = step_name(l);
                check_keys(&name, "<loop>", l, &loop_allowed)?;
            }
        }
    }

    Ok(())
}

fn step_name(value: &Value) -> String {
    as_mapping(value)
        .and_then(|m| m.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("<unnamed>")
        .to_string()
}

/// Verifies every `{{base}}` reference in a step's text fields resolves to
/// a built-in namespace or a declared dependency, per the rules in
/// `interpolate.rs`.
fn validate_variable_references(workflow: &Workflow) -> Result<()> {
    for step in &workflow.steps {
        let needs: HashSet<&str> = step.needs.iter().map(|s| s.as_str()).collect();

        match step.mode()? {
            StepMode::Run(text) => {
                check_references(step, "run", text, &needs, true)?;
            }
            StepMode::Consensus(cfg) => {
                check_references(step, "consensus.prompt", &cfg.prompt, &needs, true)?;
            }
            StepMode::Template(cfg) => {
                for (key, text) in &cfg.with {
                    check_references(step, &format!("template.with[{key}]"), text, &needs, false)?;
                }
            }
            StepMode::Loop(cfg) => {
                for (key, text) in &cfg.with {
                    check_references(step, &format!("loop.with[{key}]"), text, &needs, false)?;
                }
                if let Some(items) = &cfg.items {
                    check_references_no_input(step, "loop.items", items, &needs)?;
                }
            }
            StepMode::Embeddings(cfg) => {
                check_references(step, "embeddings.input", &cfg.input, &needs, false)?;
            }
            StepMode::Rag(cfg) => {
                check_references_no_input(step, "rag.query", &cfg.query, &needs)?;
            }
        }
    }

    for l in &workflow.loops {
        for (key, text) in &l.config.with {
            check_references_top_level_loop(&l.name, &format!("with[{key}]"), text)?;
        }
        if let Some(items) = &l.config.items {
            check_references_no_input_top_level(&l.name, "items", items)?;
        }
    }

    Ok(())
}

/// `allow_dotted_non_builtin`: only `run` and `consensus.prompt` may
/// reference `{{step.field}}`-shaped names on a non-built-in base; every
/// other text field may only use built-ins or a bare step/loop name.
fn check_references(
    step: &Step,
    field: &str,
    text: &str,
    needs: &HashSet<&str>,
    allow_dotted_non_builtin: bool,
) -> Result<()> {
    for reference in Interpolator::extract_references(text) {
        let base = reference.split('.').next().unwrap_or(&reference);
        let dotted = reference.contains('.');

        if BUILTIN_BASES.contains(&base) {
            continue;
        }

        if dotted && !allow_dotted_non_builtin {
            return Err(OrchestratorError::validation_with_hint(
                &step.name,
                field,
                format!("dotted reference '{{{{{reference}}}}}' on non-built-in base is only allowed in `run`/`consensus.prompt`"),
                format!("reference the whole value with '{{{{{base}}}}}' instead"),
            ));
        }

        if !needs.contains(base) {
            return Err(OrchestratorError::validation_with_hint(
                &step.name,
                field,
                format!("reference '{{{{{base}}}}}' is not a built-in and is not in this step's `needs`"),
                format!("add '{base}' to `needs` for step '{}'", step.name),
            ));
        }
    }
    Ok(())
}

/// Like [`check_references`], but additionally rejects `{{input.*}}` /
/// `{{input}}` entirely — used for `rag.query` and `loop.items`, which must
/// be computable before any per-call input substitution is meaningful.
fn check_references_no_input(
    step: &Step,
    field: &str,
    text: &str,
    needs: &HashSet<&str>,
) -> Result<()> {
    for reference in Interpolator::extract_references(text) {
        let base = reference.split('.').next().unwrap_or(&reference);
        if base == "input" {
            return Err(OrchestratorError::validation_with_hint(
                &step.name,
                field,
                format!("'{{{{{reference}}}}}' is not allowed in {field}"),
                "compute the value in a prior step and reference that step instead",
            ));
        }
    }
    check_references(step, field, text, needs, false)
}

fn check_references_top_level_loop(loop_name: &str, field: &str, text: &str) -> Result<()> {
    for reference in Interpolator::extract_references(text) {
        let base = reference.split('.').next().unwrap_or(&reference);
        if !BUILTIN_BASES.contains(&base) {
            return Err(OrchestratorError::validation_with_hint(
                loop_name,
                field,
                format!("reference '{{{{{base}}}}}' is not a built-in; top-level loops are not gated by `needs` and cannot reference other steps"),
                "only built-in namespaces (input, env, loop, item, index, iteration, consensus) are resolvable here",
            ));
        }
    }
    Ok(())
}

fn check_references_no_input_top_level(loop_name: &str, field: &str, text: &str) -> Result<()> {
    for reference in Interpolator::extract_references(text) {
        let base = reference.split('.').next().unwrap_or(&reference);
        if base == "input" {
            return Err(OrchestratorError::validation_with_hint(
                loop_name,
                field,
                format!("'{{{{{reference}}}}}' is not allowed in {field}"),
                "compute the value elsewhere and reference that instead",
            ));
        }
    }
    check_references_top_level_loop(loop_name, field, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_workflow() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "hello {{input}}"
  - name: b
    needs: [a]
    run: "use {{a}}"
"#;
        assert!(load_workflow(yaml).is_ok());
    }

    #[test]
    fn rejects_unknown_top_level_key() {
        let yaml = r#"
name: test
version: "1.0"
bogus: true
steps:
  - name: a
    run: "x"
"#;
        let err = load_workflow(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }

    #[test]
    fn rejects_unknown_step_key() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "x"
    bogus_field: 1
"#;
        assert!(load_workflow(yaml).is_err());
    }

    #[test]
    fn rejects_reference_not_in_needs() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "x"
  - name: b
    run: "use {{a}}"
"#;
        let err = load_workflow(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }

    #[test]
    fn allows_builtin_references_without_needs() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "hello {{input}} from {{env.FOO}}"
"#;
        assert!(load_workflow(yaml).is_ok());
    }

    #[test]
    fn rejects_input_reference_in_loop_items() {
        let yaml = r#"
name: test
version: "1.0"
loops:
  - name: l1
    workflow: child
    mode: iterate
    items: "{{input}}"
"#;
        let err = load_workflow(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }

    #[test]
    fn rejects_dotted_non_builtin_outside_run() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "x"
  - name: b
    needs: [a]
    template:
      workflow: child
      with:
        greeting: "{{a.field}}"
"#;
        let err = load_workflow(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }

    #[test]
    fn allows_dotted_builtin_in_run() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "iteration {{loop.iteration}}"
"#;
        assert!(load_workflow(yaml).is_ok());
    }

    #[test]
    fn top_level_loop_cannot_reference_steps() {
        let yaml = r#"
name: test
version: "1.0"
steps:
  - name: a
    run: "x"
loops:
  - name: l1
    workflow: child
    mode: until
    until: "done with {{a}}"
"#;
        let err = load_workflow(yaml).unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation { .. }));
    }
}
