//! CLI entry point for harvester.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use harvester_core::{
    HaltReason, PipelineConfig, PipelineState, PipelineSupervisor, default_config_path,
};
use tracing::{debug, info};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    match run(&args).await {
        Ok(reason) if reason.is_some_and(HaltReason::is_failure) => ExitCode::FAILURE,
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: &Args) -> Result<Option<HaltReason>> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    if !path.exists() {
        anyhow::bail!(
            "config file not found at {}; create it or pass --config <PATH>",
            path.display()
        );
    }
    let mut config = PipelineConfig::load(&path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    args.apply(&mut config);

    info!(config = %path.display(), sources = config.sources.len(), "harvester starting");

    let supervisor = PipelineSupervisor::new(config)?;
    spawn_interrupt_handler(supervisor.state());

    let summary = supervisor.run().await?;
    Ok(summary.halt_reason)
}

fn spawn_interrupt_handler(state: std::sync::Arc<PipelineState>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping after in-flight transfers");
            state.halt(HaltReason::Interrupted);
        }
    });
}
