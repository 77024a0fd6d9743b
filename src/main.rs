//! Agentflow CLI - compile, validate, and run agent workflow specs

use agentflow::engine::approval::ApprovalHandler;
use agentflow::{
    compile_dir, compile_file, validate_dir, validate_file, AutoApprovalHandler, CompileOptions,
    CompiledSpec, HttpLlmExecutor, McpClient, MockLlmExecutor, WorkflowEngine,
};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "agentflow")]
#[command(about = "Compiler and execution engine for declarative AI-agent workflows")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a spec file or project directory to IR
    Compile {
        /// Path to a .af file or a directory of .af files
        path: String,

        /// Variable values as name=value (value parsed as JSON when possible)
        #[arg(long = "var")]
        vars: Vec<String>,

        /// Print the compiled IR as JSON
        #[arg(long)]
        json: bool,

        /// Include resolved credential values in the JSON output
        #[arg(long)]
        expose_secrets: bool,

        /// Skip resolving env:VAR credentials against the environment
        #[arg(long)]
        no_resolve_credentials: bool,
    },

    /// Validate a spec without generating IR
    Validate {
        /// Path to a .af file or a directory of .af files
        path: String,

        #[arg(long = "var")]
        vars: Vec<String>,

        /// Warn about unset environment variables
        #[arg(long)]
        check_env: bool,
    },

    /// Compile a spec and run one of its workflows
    Run {
        /// Workflow name
        workflow: String,

        /// Path to a .af file or a directory of .af files
        path: String,

        /// Input data as inline JSON
        #[arg(short, long)]
        input: Option<String>,

        /// Input data from a JSON file
        #[arg(long)]
        input_file: Option<String>,

        #[arg(long = "var")]
        vars: Vec<String>,

        /// Write the run result to a JSON file
        #[arg(short, long)]
        output: Option<String>,

        /// Write the execution trace to a JSON file
        #[arg(long)]
        trace: Option<String>,

        /// Auto-approve every approval gate instead of prompting
        #[arg(long)]
        approve: bool,

        /// Auto-reject every approval gate instead of prompting
        #[arg(long)]
        reject: bool,

        /// Use the mock LLM executor (no API calls)
        #[arg(long)]
        mock: bool,
    },
}

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Compile {
            path,
            vars,
            json,
            expose_secrets,
            no_resolve_credentials,
        } => compile_command(&path, &vars, json, expose_secrets, !no_resolve_credentials),
        Commands::Validate {
            path,
            vars,
            check_env,
        } => validate_command(&path, &vars, check_env),
        Commands::Run {
            workflow,
            path,
            input,
            input_file,
            vars,
            output,
            trace,
            approve,
            reject,
            mock,
        } => {
            run_command(
                &workflow, &path, input, input_file, &vars, output, trace, approve, reject, mock,
            )
            .await
        }
    };

    if let Err(error) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), error);
        std::process::exit(1);
    }
}

/// Parse --var name=value pairs; values parse as JSON when they can
fn parse_vars(vars: &[String]) -> Result<CompileOptions> {
    let mut options = CompileOptions::default();
    for pair in vars {
        let (name, raw) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid --var '{}': expected name=value", pair))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        options.variables.insert(name.to_string(), value);
    }
    Ok(options)
}

fn compile_project(path: &str, options: &CompileOptions) -> Result<CompiledSpec> {
    let path_ref = Path::new(path);
    let compiled = if path_ref.is_dir() {
        compile_dir(path_ref, options)?
    } else {
        compile_file(path_ref, options)?
    };
    Ok(compiled)
}

fn compile_command(
    path: &str,
    vars: &[String],
    json: bool,
    expose_secrets: bool,
    resolve_credentials: bool,
) -> Result<()> {
    let mut options = parse_vars(vars)?;
    options.check_env = false;
    options.resolve_credentials = resolve_credentials;

    let compiled = compile_project(path, &options)?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&compiled.to_json(expose_secrets))?
        );
    } else {
        println!(
            "{} Compiled project '{}' (spec version {})",
            "✓".green(),
            compiled.project_name.cyan().bold(),
            compiled.version
        );
        println!("  Providers:    {}", compiled.providers.len());
        println!("  Servers:      {}", compiled.servers.len());
        println!("  Capabilities: {}", compiled.capabilities.len());
        println!("  Policies:     {}", compiled.policies.len());
        println!("  Schemas:      {}", compiled.schemas.len());
        println!("  Agents:       {}", compiled.agents.len());
        println!("  Workflows:    {}", compiled.workflows.len());
    }

    Ok(())
}

fn validate_command(path: &str, vars: &[String], check_env: bool) -> Result<()> {
    let mut options = parse_vars(vars)?;
    options.check_env = check_env;
    options.resolve_credentials = false;

    let path_ref = Path::new(path);
    let result = if path_ref.is_dir() {
        validate_dir(path_ref, &options)?
    } else {
        validate_file(path_ref, &options)?
    };

    for warning in &result.warnings {
        println!("{} {}", "warning:".yellow().bold(), warning);
    }
    for error in &result.errors {
        println!("{} {}", "error:".red().bold(), error);
    }

    if result.is_valid() {
        println!("{} '{}' is valid", "✓".green(), path);
        Ok(())
    } else {
        Err(anyhow!(
            "{} validation error(s) in '{}'",
            result.errors.len(),
            path
        ))
    }
}

/// Prompts on the console for each approval gate
struct ConsoleApprovalHandler;

#[async_trait]
impl ApprovalHandler for ConsoleApprovalHandler {
    async fn request(&self, step_id: &str, payload: &Value) -> Result<bool> {
        println!(
            "{} step '{}' requests approval:",
            "?".yellow().bold(),
            step_id.bold()
        );
        println!("{}", serde_json::to_string_pretty(payload)?);
        print!("Approve? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;

        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await??;

        Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_command(
    workflow: &str,
    path: &str,
    input: Option<String>,
    input_file: Option<String>,
    vars: &[String],
    output: Option<String>,
    trace: Option<String>,
    approve: bool,
    reject: bool,
    mock: bool,
) -> Result<()> {
    let options = parse_vars(vars)?;
    let compiled = Arc::new(compile_project(path, &options)?);

    if !compiled.workflows.contains_key(workflow) {
        let known: Vec<&str> = compiled.workflows.keys().map(String::as_str).collect();
        return Err(anyhow!(
            "Workflow '{}' not found (available: {})",
            workflow,
            known.join(", ")
        ));
    }

    // Inline JSON beats the input file; both must be JSON objects
    let input_data = match (input, input_file) {
        (Some(raw), _) => parse_input_json(&raw)?,
        (None, Some(file)) => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read input file '{}'", file))?;
            parse_input_json(&raw)?
        }
        (None, None) => Map::new(),
    };

    let llm: Arc<dyn agentflow::LlmExecutor> = if mock {
        Arc::new(MockLlmExecutor::new())
    } else {
        Arc::new(HttpLlmExecutor::from_spec(&compiled))
    };
    let tools = Arc::new(McpClient::from_spec(&compiled));
    let approvals: Arc<dyn ApprovalHandler> = if approve {
        Arc::new(AutoApprovalHandler::new(true))
    } else if reject {
        Arc::new(AutoApprovalHandler::new(false))
    } else {
        Arc::new(ConsoleApprovalHandler)
    };

    let tools_dyn: Arc<dyn agentflow::engine::CapabilityInvoker> = Arc::clone(&tools) as Arc<_>;
    let engine = WorkflowEngine::new(Arc::clone(&compiled), llm, tools_dyn, approvals);

    println!(
        "{} Running workflow '{}'",
        "→".cyan(),
        workflow.cyan().bold()
    );

    let run = engine.run(workflow, input_data).await;
    tools.close_all().await;
    let run = run?;

    println!("{}", "Output:".cyan().bold());
    println!("{}", serde_json::to_string_pretty(&run.output)?);

    if let Some(output_path) = output {
        let document = serde_json::json!({
            "output": run.output,
            "state": run.state,
            "trace": run.trace,
        });
        std::fs::write(&output_path, serde_json::to_string_pretty(&document)?)
            .with_context(|| format!("Failed to write output file '{}'", output_path))?;
        println!("{} Result written to {}", "✓".green(), output_path);
    }

    if let Some(trace_path) = trace {
        std::fs::write(&trace_path, serde_json::to_string_pretty(&run.trace)?)
            .with_context(|| format!("Failed to write trace file '{}'", trace_path))?;
        println!("{} Trace written to {}", "✓".green(), trace_path);
    }

    Ok(())
}

fn parse_input_json(raw: &str) -> Result<Map<String, Value>> {
    let value: Value =
        serde_json::from_str(raw).map_err(|e| anyhow!("Error parsing input JSON: {}", e))?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(anyhow!(
            "Input must be a JSON object, got {}",
            match other {
                Value::Array(_) => "an array",
                Value::String(_) => "a string",
                Value::Number(_) => "a number",
                Value::Bool(_) => "a boolean",
                _ => "null",
            }
        )),
    }
}
