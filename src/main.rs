use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};

use tripwatch::config::SmokeConfig;
use tripwatch::orchestrator::Orchestrator;

#[derive(Parser)]
#[command(
    name = "tripwatch",
    about = "Scheduled smoke tests for trip-planner deployments",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (defaults to $TRIPWATCH_CONFIG, then /etc/tripwatch/tripwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "TRIPWATCH_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon and run every configured suite on its schedule
    Serve,

    /// Check the configuration and exit
    Validate,

    /// Run one configured suite now and print its result
    Run {
        /// Deployment key
        #[arg(long)]
        deployment: String,

        /// Suite identifier
        #[arg(long)]
        suite: String,

        /// JSON output for machine parsing
        #[arg(long)]
        json: bool,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },

    /// List the built-in test suites
    Suites,
}

fn init_tracing(format: LogFormat, default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let load = || -> Result<SmokeConfig> {
        let config = tripwatch::load_config(cli.config.as_deref())?;
        init_tracing(cli.log_format, &config.logging.level);
        Ok(config)
    };

    match cli.command {
        Commands::Serve => {
            let config = load()?;
            tracing::info!(config = ?cli.config, "Starting Tripwatch daemon");
            tripwatch::serve(config, cli.config.as_deref()).await?;
        }
        Commands::Validate => {
            let orchestrator = Orchestrator::new(load()?, tripwatch::suites::builtin_registry());
            let report = orchestrator.validate();
            for e in &report.errors {
                println!("error: {}", e);
            }
            for w in &report.schedule_warnings {
                println!("warning: {}", w);
            }
            if !report.is_usable() {
                bail!("configuration has {} error(s)", report.errors.len());
            }
            let status = orchestrator.status();
            println!(
                "configuration OK: {} deployment(s), {} suite(s), {} enabled",
                status.configured_deployments,
                status.configured_test_suites,
                status.enabled_test_suites
            );
        }
        Commands::Run {
            deployment,
            suite,
            json,
        } => {
            let orchestrator = Orchestrator::new(load()?, tripwatch::suites::builtin_registry());
            let result = orchestrator.run_now(&deployment, &suite).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\n=== {} on {} ===", result.suite_name, result.deployment_name);
                println!("Result:   {}", if result.success { "PASS" } else { "FAIL" });
                println!(
                    "Tests:    {} run, {} passed, {} failed, {} skipped",
                    result.tests_run, result.success_count, result.failure_count, result.skipped_count
                );
                println!("Duration: {} ms", result.duration_ms);
                if let Some(err) = &result.execution_error {
                    println!("Error:    {}", err);
                }
                for msg in &result.failure_messages {
                    println!(" - {}", msg);
                }
                println!();
            }
            if !result.success {
                bail!("suite {} failed on {}", suite, deployment);
            }
        }
        Commands::DryRun { hours } => {
            let orchestrator = Orchestrator::new(load()?, tripwatch::suites::builtin_registry());
            let preview = orchestrator.preview(hours);
            if preview.is_empty() {
                println!("No runs scheduled in next {} hours.", hours);
            } else {
                println!("Upcoming runs (next {} hours):", hours);
                for run in preview {
                    println!("{} : {} ({})", run.at, run.task_id, run.trigger);
                }
            }
        }
        Commands::Suites => {
            let registry = tripwatch::suites::builtin_registry();
            for identifier in registry.identifiers() {
                println!("{}", identifier);
            }
        }
    }

    Ok(())
}
