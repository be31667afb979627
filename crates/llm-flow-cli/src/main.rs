// Copyright (c) 2025 LLM Flow Contributors
// SPDX-License-Identifier: Apache-2.0

//! llm-flow CLI.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use llm_flow_core::{
    load_workflow, providers::testing::NullServerManager, resolve_pool_settings, resolve_step, DependencyResolver,
    LLMProvider, ServerManager, Workflow, WorkflowExecutor,
};
use llm_flow_providers::{AnthropicProvider, OpenAIProvider};

#[derive(Parser)]
#[command(name = "llm-flow")]
#[command(version, about = "Declarative workflow orchestrator for multi-provider LLM pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug-level) logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a workflow definition: structure, unknown keys, and variable references
    Validate {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: String,
    },

    /// Run a workflow to completion against the registered providers
    Run {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: String,

        /// Input string, or a path to a file containing it
        #[arg(short, long)]
        input: Option<String>,
    },

    /// Print the resolved execution plan without running anything
    Explain {
        /// Path to the workflow YAML file
        #[arg(value_name = "FILE")]
        file: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("llm_flow={log_level}").into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Validate { file } => validate_workflow(&file),
        Commands::Run { file, input } => run_workflow(&file, input.as_deref()).await,
        Commands::Explain { file } => explain_workflow(&file),
    };

    if let Err(err) = result {
        error!("{err}");
        eprintln!("{} {err}", "Error:".red().bold());
        std::process::exit(1);
    }
}

fn read_workflow(file_path: &str) -> Result<Workflow> {
    let content = fs::read_to_string(file_path).with_context(|| format!("failed to read workflow file: {file_path}"))?;
    load_workflow(&content).with_context(|| format!("workflow validation failed for: {file_path}"))
}

fn validate_workflow(file_path: &str) -> Result<()> {
    info!("validating workflow: {file_path}");
    println!("{} {file_path}", "Validating workflow:".cyan().bold());

    let workflow = read_workflow(file_path)?;
    let dag = DependencyResolver::build(&workflow.steps, &workflow.loops)
        .with_context(|| "failed to build dependency graph")?;
    dag.validate_no_cycles().with_context(|| "dependency cycle detected")?;

    println!("{}", "\u{2713} Workflow is valid".green().bold());
    println!("  Name: {}", workflow.name);
    println!("  Version: {}", workflow.version);
    println!("  Steps: {}", workflow.steps.len());
    println!("  Loops: {}", workflow.loops.len());

    Ok(())
}

fn explain_workflow(file_path: &str) -> Result<()> {
    let workflow = read_workflow(file_path)?;
    let dag = DependencyResolver::build(&workflow.steps, &workflow.loops)
        .with_context(|| "failed to build dependency graph")?;
    let order = dag.execution_order().with_context(|| "failed to compute an execution order")?;
    let pool = resolve_pool_settings(&workflow.execution);

    println!("{}", "Execution plan".cyan().bold());
    println!(
        "  mode: {}",
        if pool.parallel { format!("parallel (max_workers={})", pool.max_workers) } else { "sequential".to_string() }
    );
    println!("  order: {}", order.join(" -> "));
    println!();

    for step in &workflow.steps {
        match resolve_step(step, &workflow.execution) {
            Ok(resolved) => {
                let chain: Vec<String> =
                    resolved.providers.iter().map(|p| format!("{}/{}", p.provider, p.model)).collect();
                println!(
                    "  {} needs=[{}] providers=[{}] temperature={} on_failure={:?}",
                    step.name.bold(),
                    step.needs.join(", "),
                    chain.join(" -> "),
                    resolved.temperature,
                    step.failure_policy(),
                );
            }
            Err(err) => {
                println!("  {} {err}", step.name.bold().red());
            }
        }
    }

    Ok(())
}

async fn run_workflow(file_path: &str, input: Option<&str>) -> Result<()> {
    info!("running workflow: {file_path}");
    println!("{} {file_path}", "Running workflow:".cyan().bold());

    let workflow = read_workflow(file_path)?;
    let input = resolve_input(input)?;

    let mut providers: HashMap<String, Arc<dyn LLMProvider>> = HashMap::new();
    if let Ok(openai) = OpenAIProvider::from_env() {
        info!("registered openai provider");
        providers.insert("openai".to_string(), Arc::new(openai));
    }
    if let Ok(anthropic) = AnthropicProvider::from_env() {
        info!("registered anthropic provider");
        providers.insert("anthropic".to_string(), Arc::new(anthropic));
    }
    if providers.is_empty() {
        anyhow::bail!("no LLM providers available; set OPENAI_API_KEY or ANTHROPIC_API_KEY");
    }

    let server_manager: Arc<dyn ServerManager> = Arc::new(NullServerManager);
    let executor = WorkflowExecutor::new(workflow, providers, server_manager);

    println!("{}", "Executing workflow...".cyan());
    let report = executor.execute(&input).await.with_context(|| "workflow execution failed")?;

    println!("{}", "\u{2713} Workflow completed successfully".green().bold());
    println!("  wall clock: {}ms (sequential estimate: {}ms, speedup: {:.2}x)", report.parallel_wall_ms, report.sequential_estimate_ms, report.speedup_ratio);
    println!("\n{}", "Final output:".cyan().bold());
    println!("{}", report.final_output);

    Ok(())
}

fn resolve_input(input: Option<&str>) -> Result<String> {
    match input {
        None => Ok(String::new()),
        Some(value) if Path::new(value).exists() => {
            fs::read_to_string(value).with_context(|| format!("failed to read input file: {value}"))
        }
        Some(value) => Ok(value.to_string()),
    }
}
