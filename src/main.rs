//! Mock Engine - CLI Entry Point
//!
//! Runs a YAML scenario through the engine and reports its checks.

use anyhow::Result;
use clap::Parser;
use mock_engine::{EngineConfig, Scenario, ScenarioRunner};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "mock-engine",
    about = "Call recording, stubbing and verification engine - scenario runner",
    version
)]
struct Args {
    /// Path to the scenario file
    #[arg(short, long, default_value = "scenario.yaml")]
    scenario: PathBuf,

    /// Path to the engine configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Print default engine configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and scenario, then exit
    #[arg(long)]
    validate: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&EngineConfig::default())?);
        return Ok(());
    }

    let config = match &args.config {
        Some(path) => {
            info!(path = ?path, "Loading configuration");
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };

    if !args.scenario.exists() {
        anyhow::bail!("Scenario file not found: {:?}", args.scenario);
    }
    info!(path = ?args.scenario, "Loading scenario");
    let scenario = Scenario::from_file(&args.scenario)?;

    if args.validate {
        println!(
            "Scenario is valid ({} mocks, {} stubs, {} calls, {} verifications)",
            scenario.mocks.len(),
            scenario.stubs.len(),
            scenario.calls.len(),
            scenario.verify.len()
        );
        return Ok(());
    }

    let report = ScenarioRunner::new(config).run(&scenario)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for check in &report.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            println!("{} {}", status, check.description);
            if let Some(message) = &check.message {
                for line in message.lines() {
                    println!("    {}", line);
                }
            }
        }
        for (slot, values) in &report.captures {
            println!("captured {}: [{}]", slot, values.join(", "));
        }
    }

    let failures = report.failures().count();
    if failures > 0 {
        anyhow::bail!("{} of {} check(s) failed", failures, report.checks.len());
    }
    println!("{}: all {} check(s) passed", report.name, report.checks.len());
    Ok(())
}
