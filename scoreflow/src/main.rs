//! Scoreflow CLI
//!
//! Runs the export, score and notify pipeline against the local backends.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use scoreflow::backends::{local_coordinator, LayeredParameterStore};
use scoreflow::config::PipelineConfig;
use scoreflow::context::{bucket_namespace, output_location, RunContext, RunParameters};
use scoreflow::errors::ErrorKind;
use scoreflow::events::LoggingEventSink;
use scoreflow::observability::init_tracing;
use scoreflow::ports::require_parameter;
use scoreflow::utils::parse_run_date;

/// Exit code for a failed run.
const EXIT_FAILED: u8 = 1;
/// Exit code for a run cut off by its deadline.
const EXIT_TIMEOUT: u8 = 124;
/// Exit code for configuration and invocation errors.
const EXIT_USAGE: u8 = 2;

#[derive(Parser)]
#[command(name = "scoreflow")]
#[command(about = "Export, score and notify one batch run", long_about = None)]
struct Cli {
    /// Path to configuration file; built-in defaults when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once (default if no command specified)
    Run(RunArgs),

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "scoreflow.yaml")]
        output: PathBuf,
    },

    /// Print the output location a run id maps to
    OutputLocation {
        /// Run identifier
        #[arg(long)]
        run_id: String,

        /// Scored namespace; resolved from configuration when omitted
        #[arg(long)]
        namespace: Option<String>,
    },
}

#[derive(clap::Args, Default)]
struct RunArgs {
    /// Notification recipient override
    #[arg(long)]
    recipient: Option<String>,

    /// Reuse an existing run id instead of generating one
    #[arg(long)]
    run_id: Option<String>,

    /// Run date as YYYY-MM-DD; today in `run_date_timezone` when omitted
    #[arg(long)]
    run_date: Option<String>,

    /// Override the overall deadline in seconds
    #[arg(long)]
    deadline_secs: Option<f64>,

    /// Print the run report as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        None => run_command(cli.config.as_deref(), RunArgs::default()).await,
        Some(Commands::Run(args)) => run_command(cli.config.as_deref(), args).await,
        Some(Commands::Validate) => {
            validate_command(cli.config.as_deref()).map(|()| ExitCode::SUCCESS)
        }
        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(&output).map(|()| ExitCode::SUCCESS)
        }
        Some(Commands::OutputLocation { run_id, namespace }) => {
            output_location_command(cli.config.as_deref(), &run_id, namespace)
                .await
                .map(|()| ExitCode::SUCCESS)
        }
    };

    result.unwrap_or_else(|err| {
        eprintln!("error: {err:#}");
        ExitCode::from(EXIT_USAGE)
    })
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let config = match path {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PipelineConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn run_command(config_path: Option<&Path>, args: RunArgs) -> Result<ExitCode> {
    let mut config = load_config(config_path)?;
    if let Some(deadline) = args.deadline_secs {
        config.deadline_seconds = deadline;
        config.validate()?;
    }
    init_tracing(&config.logging);

    let mut params = RunParameters::new();
    if let Some(recipient) = args.recipient {
        params = params.with_recipient(recipient);
    }
    if let Some(run_id) = args.run_id {
        params = params.with_run_id(run_id);
    }
    if let Some(date) = args.run_date {
        let date = parse_run_date(&date).with_context(|| format!("invalid run date '{date}'"))?;
        params = params.with_run_date(date);
    }

    let coordinator = local_coordinator(&config, Arc::new(LoggingEventSink::default()))?;
    let ctx = coordinator.run(params).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&ctx.to_report())?);
    } else {
        print_summary(&ctx);
    }
    Ok(exit_code(&ctx))
}

fn print_summary(ctx: &RunContext) {
    println!("run:    {}", ctx.display_id());
    println!("status: {}", ctx.status());
    if let Some(input) = ctx.input_location() {
        println!("input:  {input}");
    }
    if let Some(output) = ctx.output_location() {
        println!("output: {output}");
    }
    if let Some(failure) = ctx.failure() {
        println!("cause:  {failure}");
    }
    if let Some(err) = ctx.notify_error() {
        println!("notify: {err}");
    }
}

fn exit_status(ctx: &RunContext) -> u8 {
    if ctx.status().is_success() {
        return 0;
    }
    match ctx.failure() {
        Some(failure) if failure.kind == ErrorKind::Timeout => EXIT_TIMEOUT,
        _ => EXIT_FAILED,
    }
}

fn exit_code(ctx: &RunContext) -> ExitCode {
    ExitCode::from(exit_status(ctx))
}

fn validate_command(config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path)?;
    println!("Configuration is valid");
    println!("  deadline:  {}s", config.deadline_seconds);
    println!("  raw:       {}", config.namespaces.raw);
    println!("  scored:    {}", config.namespaces.scored);
    println!("  image:     {}", config.compute.image);
    println!("  required:  {}", config.parameters.required_keys().join(", "));
    Ok(())
}

fn generate_config_command(output: &Path) -> Result<()> {
    PipelineConfig::default().write_to_file(output)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

async fn output_location_command(
    config_path: Option<&Path>,
    run_id: &str,
    namespace: Option<String>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let namespace = match namespace.or_else(|| config.namespaces.scored_location.clone()) {
        Some(namespace) => namespace,
        None => {
            let store = LayeredParameterStore::new(config.local.parameters.clone());
            let bucket = require_parameter(&store, &config.parameters.data_bucket).await?;
            bucket_namespace(&bucket, &config.namespaces.scored)
        }
    };
    println!("{}", output_location(&namespace, run_id)?);
    Ok(())
}
