//! Cellrig - run a supervised process group from a manifest
//!
//! `cellrig up` starts every member of the manifest, keeps the group up
//! until Ctrl-C or a member fault, then interrupts it and prints each
//! member's exit code. `cellrig check` only validates the manifest.

mod manifest;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use cellrig_core::Signal;
use cellrig_process::{Group, GroupReport, GroupStyle};

use manifest::Manifest;

/// Extra time allowed for members to exit after the teardown grace
const REPORT_SLACK: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "cellrig")]
#[command(about = "Supervise a group of processes described by a JSON manifest")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the group and keep it up until Ctrl-C or a member fault
    Up {
        /// Path to the manifest
        manifest: PathBuf,
    },
    /// Validate a manifest without starting anything
    Check {
        /// Path to the manifest
        manifest: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Check { manifest } => check(&manifest),
        Command::Up { manifest } => {
            let report = up(&manifest).await?;
            print_report(&report);
            if report.fault.is_some() {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

fn load(path: &Path) -> anyhow::Result<Manifest> {
    let mut manifest = Manifest::load(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    manifest.config = manifest
        .config
        .with_env_from(|key| std::env::var(key).ok())
        .context("Invalid CELLRIG_* override")?;
    Ok(manifest)
}

fn check(path: &Path) -> anyhow::Result<()> {
    let manifest = load(path)?;
    let specs = manifest.member_specs()?;
    println!(
        "{}: {} members, {:?} start",
        path.display(),
        specs.len(),
        GroupStyle::from(manifest.style)
    );
    for spec in &specs {
        println!("  {:<16} {:?} {:?}", spec.name, spec.readiness, spec.exit_policy);
    }
    Ok(())
}

async fn up(path: &Path) -> anyhow::Result<GroupReport> {
    let manifest = load(path)?;
    let config = manifest.config.clone();
    let specs = manifest.member_specs()?;

    info!("Starting {} members from {}", specs.len(), path.display());
    let group = match GroupStyle::from(manifest.style) {
        GroupStyle::Staged => Group::start_staged(&config, specs).await,
        GroupStyle::Parallel => Group::start_parallel(&config, specs).await,
    }
    .context("Group failed to start")?;

    info!("═══════════════════════════════════════════════════════════");
    for member in group.members() {
        info!("  {} running (pid {:?})", member.name(), member.session().pid());
    }
    info!("  Press Ctrl-C to stop");
    info!("═══════════════════════════════════════════════════════════");

    let mut faults = group.subscribe_faults();
    let fault = tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            None
        }
        fault = faults.wait_for(Option::is_some) => fault.ok().and_then(|fault| (*fault).clone()),
    };
    match fault {
        Some(fault) => error!(member = %fault.name, code = fault.code, "Member faulted, stopping group"),
        None => info!("Interrupted, stopping group"),
    }

    let budget = config.teardown_grace() + REPORT_SLACK;
    let report = group
        .stop(Signal::Interrupt, budget)
        .await
        .context("Group did not stop")?;
    Ok(report)
}

fn print_report(report: &GroupReport) {
    if let Some(signal) = report.teardown_signal {
        println!("Torn down with {}", signal);
    }
    if report.escalated {
        println!("Some members had to be killed");
    }
    for exit in &report.exits {
        let marker = match &report.fault {
            Some(fault) if fault.name == exit.name => "  <- fault",
            _ => "",
        };
        println!("  {:<16} exit {}{}", exit.name, exit.code, marker);
    }
}
