//! `clientbench`: repeatable client benchmark iterations.
//!
//! Reads `clientbench.toml`, runs every configured test for its iteration
//! count, and writes per-iteration results under the results directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use clientbench::exit_codes;
use clientbench::io::config::{
    BenchConfig, DEFAULT_CONFIG_FILE, ensure_writable, load_config, write_config,
};
use clientbench::io::input::CommandInputDriver;
use clientbench::io::process::SystemSupervisor;
use clientbench::io::screen::CommandScreenMatcher;
use clientbench::io::snapshot::{FsWorldStore, WorldStore, has_pending_backup};
use clientbench::iteration::Harness;
use clientbench::logging;
use clientbench::looping::{RunOutcome, run_benchmark};
use clientbench::plan::{TestSpec, new_run_id};

#[derive(Parser)]
#[command(
    name = "clientbench",
    version,
    about = "Benchmark iteration orchestrator for a game client"
)]
struct Cli {
    /// Config file.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a template config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Load the config and resolve every test's paths.
    Validate,
    /// Run every configured test.
    Run {
        /// Only run the named test(s).
        #[arg(short, long = "test")]
        tests: Vec<String>,
    },
    /// Restore worlds from backups left behind by an interrupted run.
    Recover {
        /// Only recover the named test's world.
        #[arg(short, long)]
        test: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Init { force } => cmd_init(&cli.config, force),
        Command::Validate => cmd_validate(&cli.config),
        Command::Run { tests } => cmd_run(&cli.config, &tests),
        Command::Recover { test } => cmd_recover(&cli.config, test.as_deref()),
    }
}

fn cmd_init(path: &Path, force: bool) -> Result<i32> {
    ensure_writable(path, force)?;
    write_config(path, &BenchConfig::template())?;
    println!("wrote {}", path.display());
    Ok(exit_codes::OK)
}

fn cmd_validate(path: &Path) -> Result<i32> {
    let cfg = load_config(path)?;
    let specs = resolve_specs(&cfg, &[])?;
    for spec in &specs {
        println!(
            "{}: {} iteration(s), world {}",
            spec.name,
            spec.n_iterations,
            spec.world_path.display()
        );
    }
    Ok(exit_codes::OK)
}

fn cmd_run(path: &Path, only: &[String]) -> Result<i32> {
    let cfg = load_config(path)?;
    let specs = resolve_specs(&cfg, only)?;
    let ctx = cfg.run_context(&new_run_id());

    let supervisor = SystemSupervisor::new();
    let world = FsWorldStore;
    let screen = CommandScreenMatcher::new(
        cfg.screen.command.clone(),
        BenchConfig::helper_timeout(&cfg.screen),
    )?;
    let input = CommandInputDriver::new(
        cfg.input.command.clone(),
        BenchConfig::helper_timeout(&cfg.input),
    )?;
    let harness = Harness {
        supervisor: &supervisor,
        world: &world,
        screen: &screen,
        input: &input,
    };

    let outcome = run_benchmark(&ctx, &specs, harness, |test, iteration| {
        let status = if iteration.succeeded() { "ok" } else { "FAILED" };
        println!("{test} #{}: {status}", iteration.iter);
        for failure in iteration.all_failures() {
            println!("  {}: {:#}", failure.stage, failure.source);
        }
    })?;
    Ok(report(&outcome))
}

fn report(outcome: &RunOutcome) -> i32 {
    for test in &outcome.tests {
        let summary = test.summary();
        match summary.mean_avg_fps {
            Some(fps) => println!(
                "{}: {}/{} succeeded, {}, mean {fps:.1} fps",
                summary.test, summary.succeeded, summary.iterations, summary.stop
            ),
            None => println!(
                "{}: {}/{} succeeded, {}",
                summary.test, summary.succeeded, summary.iterations, summary.stop
            ),
        }
    }
    for name in &outcome.skipped {
        println!("{name}: skipped");
    }

    if outcome.stopped_early() {
        exit_codes::ABORTED
    } else if outcome.all_succeeded() {
        exit_codes::OK
    } else {
        exit_codes::ITERATION_FAILED
    }
}

fn cmd_recover(path: &Path, only: Option<&str>) -> Result<i32> {
    let cfg = load_config(path)?;
    let filter: Vec<String> = only.map(str::to_string).into_iter().collect();
    let specs = resolve_specs(&cfg, &filter)?;

    let mut by_backup: BTreeMap<&Path, Vec<&TestSpec>> = BTreeMap::new();
    for spec in &specs {
        by_backup.entry(spec.backup_path.as_path()).or_default().push(spec);
    }

    let store = FsWorldStore;
    let mut restored = 0usize;
    for (backup, owners) in by_backup {
        if !has_pending_backup(backup) {
            continue;
        }
        let first = owners[0];
        if owners.iter().any(|s| s.world_path != first.world_path) {
            let names: Vec<&str> = owners.iter().map(|s| s.name.as_str()).collect();
            bail!(
                "backup {} is shared by tests with different worlds ({}); pass --test",
                backup.display(),
                names.join(", ")
            );
        }
        info!(backup = %backup.display(), world = %first.world_path.display(), "restoring world");
        store
            .restore(&first.world_path, backup)
            .with_context(|| format!("recover world for test '{}'", first.name))?;
        println!("restored {} from {}", first.world_path.display(), backup.display());
        restored += 1;
    }
    if restored == 0 {
        warn!("no pending backups found");
        println!("nothing to recover");
    }
    Ok(exit_codes::OK)
}

fn resolve_specs(cfg: &BenchConfig, only: &[String]) -> Result<Vec<TestSpec>> {
    for name in only {
        if !cfg.tests.iter().any(|t| &t.name == name) {
            bail!("no test named '{name}' in config");
        }
    }
    cfg.tests
        .iter()
        .filter(|t| only.is_empty() || only.contains(&t.name))
        .map(|t| t.to_spec())
        .collect()
}
