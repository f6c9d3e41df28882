use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use gauntlet::config::PipelineConfig;
use gauntlet::errors::PipelineError;
use gauntlet::pipeline::Conductor;
use gauntlet::report::render_markdown;
use gauntlet::state::store;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Exit codes: 0 = good-enough, 1 = finished but not good-enough,
/// 2 = fatal pipeline error.
const EXIT_GOOD: i32 = 0;
const EXIT_NOT_GOOD_ENOUGH: i32 = 1;
const EXIT_FATAL: i32 = 2;

#[derive(Parser)]
#[command(name = "gauntlet")]
#[command(version, about = "Multi-phase verification pipeline for generated microservice stacks")]
struct Cli {
    /// Path to the pipeline config file.
    #[arg(short, long, default_value = "gauntlet.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (resumes a usable checkpoint when present).
    Run,
    /// Resume strictly from the last checkpoint.
    Resume,
    /// Render the audit report from the last checkpoint.
    Report {
        /// Write the report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let exit_code = match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{} {err:#}", style("error:").red().bold());
            EXIT_FATAL
        }
    };
    std::process::exit(exit_code);
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    // Worker env vars (DATABASE_PATH and friends) may arrive via .env.
    let _ = dotenvy::dotenv();

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;
    init_tracing(&config, cli.verbose)?;

    match cli.command {
        Commands::Run => {
            let conductor = Conductor::start(config)?;
            drive(conductor).await
        }
        Commands::Resume => match Conductor::resume(config) {
            Ok(conductor) => drive(conductor).await,
            Err(err @ PipelineError::ResumeUnavailable { .. }) => {
                eprintln!("{} {err}", style("error:").red().bold());
                Ok(EXIT_FATAL)
            }
            Err(err) => Err(err.into()),
        },
        Commands::Report { output } => {
            let path = config.state_path();
            let Some(state) = store::load(&path) else {
                eprintln!(
                    "{} no usable state at {}",
                    style("error:").red().bold(),
                    path.display()
                );
                return Ok(EXIT_FATAL);
            };
            let report = render_markdown(&state, None);
            match output {
                Some(out) => std::fs::write(&out, report)
                    .with_context(|| format!("writing report to {}", out.display()))?,
                None => print!("{report}"),
            }
            Ok(EXIT_GOOD)
        }
    }
}

async fn drive(mut conductor: Conductor) -> Result<i32> {
    let outcome = conductor.run().await?;
    let state = conductor.state();

    println!();
    println!(
        "{} {} | aggregate {:.1} | cost ${:.2}",
        style("Pipeline finished:").bold(),
        state.traffic_light,
        state.aggregate_score,
        state.total_cost
    );
    if !outcome.good_enough.verdict {
        for reason in &outcome.good_enough.failed_reasons {
            println!("  {} {reason}", style("✗").red());
        }
    }

    if outcome.fatal {
        Ok(EXIT_FATAL)
    } else if outcome.good_enough.verdict {
        Ok(EXIT_GOOD)
    } else {
        Ok(EXIT_NOT_GOOD_ENOUGH)
    }
}

fn init_tracing(config: &PipelineConfig, verbose: bool) -> Result<()> {
    let default_filter = if verbose { "gauntlet=debug" } else { "gauntlet=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));

    std::fs::create_dir_all(&config.paths.output_dir).context("creating output dir")?;
    let appender =
        tracing_appender::rolling::daily(config.paths.output_dir.join("logs"), "gauntlet.log");

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(appender),
        )
        .init();
    Ok(())
}
