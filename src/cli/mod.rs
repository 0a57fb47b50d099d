//! Command-line interface for troubleshoot.
//!
//! Provides commands for initializing a home directory, running the
//! orchestrator, asking for solutions, and inspecting reports, accuracy
//! and mailboxes.

use std::io::{self, BufRead, Write};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::config::{self, ResolvedConfig};
use crate::core::orchestrator::{self, Orchestrator, TASKS};
use crate::stages::{IntakeOutcome, PerformanceMonitor, SimilarityModel};

pub mod mailbox;

/// troubleshoot - File-mailbox orchestrator for smart troubleshooting
#[derive(Parser, Debug)]
#[command(name = "troubleshoot")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write default stage configs, schemas and empty mailboxes
    Init {
        /// Overwrite existing configs and schemas
        #[arg(short, long)]
        force: bool,
    },

    /// Start every periodic task (console: accuracy, train, status, quit)
    Run,

    /// Ask for solutions to a problem and record the outcome
    Ask {
        /// Problem description
        problem: String,
    },

    /// Run one cycle of one task
    Once {
        /// Task name (e.g. troubleshooting, training)
        stage: String,
    },

    /// Show the last report of every task
    Status,

    /// Fold new performance reports into the accuracy figure
    Accuracy,

    /// Inspect mailboxes
    Mailbox {
        #[command(subcommand)]
        command: mailbox::MailboxCommands,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Init { force } => init(force).await,
            Commands::Run => run().await,
            Commands::Ask { problem } => ask(&problem).await,
            Commands::Once { stage } => once(&stage).await,
            Commands::Status => {
                let orchestrator = Orchestrator::new(config::config()?.clone())?;
                print_status(&orchestrator).await
            }
            Commands::Accuracy => {
                let orchestrator = Orchestrator::new(config::config()?.clone())?;
                print_accuracy(&orchestrator.monitor()).await
            }
            Commands::Mailbox { command } => command.execute().await,
            Commands::Config => show_config(config::config()?),
        }
    }
}

/// Initialize the home directory
async fn init(force: bool) -> Result<()> {
    let layout = config::layout()?;
    let written = orchestrator::initialize(&layout, force).await?;

    println!("Home: {}", layout.home().display());
    if written.is_empty() {
        println!("Nothing to write (use --force to overwrite configs and schemas)");
    }
    for path in written {
        println!("  wrote {}", path.display());
    }
    Ok(())
}

/// Run every task until `quit` or Ctrl-C
async fn run() -> Result<()> {
    let orchestrator = Orchestrator::new(config::config()?.clone())?;
    orchestrator
        .mailboxes()
        .ensure_all()
        .await
        .context("Mailboxes are not usable; run `troubleshoot init`")?;

    let handles = orchestrator.start();
    println!("Running {} tasks. Commands: accuracy, train, status, quit", handles.len());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    // stdin closed; keep running until interrupted
                    Ok(None) => {
                        tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl-C")?;
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Console read failed");
                        continue;
                    }
                };

                match line.trim() {
                    "" => {}
                    "accuracy" => {
                        if let Err(e) = print_accuracy(&orchestrator.monitor()).await {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    "train" => {
                        if let Err(e) = train(&orchestrator).await {
                            eprintln!("Error: {:#}", e);
                        }
                    }
                    "status" => {
                        for handle in &handles {
                            println!("{:<20} {:<14} cycles={}", handle.name(), handle.state().to_string(), handle.cycles());
                        }
                    }
                    "quit" | "exit" => break,
                    other => println!("Unknown command '{}'. Commands: accuracy, train, status, quit", other),
                }
            }
        }
    }

    orchestrator::shutdown(handles).await;
    Ok(())
}

/// Run an intake session for one problem
async fn ask(problem: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config::config()?.clone())?;
    let mut session = orchestrator.intake();

    println!("Looking for solutions...");
    match session.find_solutions(problem).await {
        IntakeOutcome::Solutions(solutions) => {
            println!();
            for (i, solution) in solutions.iter().enumerate() {
                println!("  {}. {}", i + 1, solution.solution_description);
            }
            println!();
        }
        IntakeOutcome::NoResult => {
            println!("No result available.");
        }
    }

    if session.active_description().is_none() {
        return Ok(());
    }

    print!("Solution number, your own solution, or empty to skip: ");
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("Failed to read from stdin")?;
    let answer = answer.trim();

    if answer.is_empty() {
        session.reset();
        println!("Nothing recorded");
        return Ok(());
    }

    let record = match answer.parse::<u32>() {
        Ok(index) => session.select(index).await?,
        Err(_) => session.manual(answer).await?,
    };

    if record.is_solution_manual {
        println!("Recorded your solution");
    } else {
        println!(
            "Recorded solution {} of {}",
            record.solution_index.unwrap_or_default(),
            record.total_presented_solutions
        );
    }
    Ok(())
}

/// Run a single cycle of one task
async fn once(stage: &str) -> Result<()> {
    let orchestrator = Orchestrator::new(config::config()?.clone())?;
    let report = orchestrator.run_once(stage).await?;

    match &report.error_message {
        None => println!("{}: {}", stage, report.status),
        Some(message) => println!("{}: {} ({})", stage, report.status, message),
    }
    if !report.is_ok() {
        anyhow::bail!("Task '{}' reported an error", stage);
    }
    Ok(())
}

/// Train now instead of waiting for the next training cycle
async fn train(orchestrator: &Orchestrator) -> Result<()> {
    let report = orchestrator.run_once("training").await?;
    if let Some(message) = report.error_message {
        anyhow::bail!("Training failed: {}", message);
    }

    match SimilarityModel::load(orchestrator.layout().similarity_model()).await? {
        Some(model) => println!(
            "Trained by {} on {} pairs: validation {:.3}, test {}",
            model.trainer,
            model.training_pairs,
            model.validation_score,
            model
                .test_score
                .map(|score| format!("{:.3}", score))
                .unwrap_or_else(|| "-".to_string())
        ),
        None => println!("Nothing to train on yet"),
    }
    Ok(())
}

async fn print_status(orchestrator: &Orchestrator) -> Result<()> {
    println!("{:<20} {:<8} {:<26} {}", "TASK", "STATUS", "AT", "MESSAGE");
    println!("{}", "-".repeat(80));

    for (task, report) in orchestrator.status().await? {
        match report {
            Some(report) => println!(
                "{:<20} {:<8} {:<26} {}",
                task,
                report.status.to_string(),
                report.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                report.error_message.unwrap_or_default()
            ),
            None => println!("{:<20} {:<8}", task, "-"),
        }
    }
    Ok(())
}

async fn print_accuracy(monitor: &PerformanceMonitor) -> Result<()> {
    let snapshot = monitor
        .compute_accuracy()
        .await
        .context("Failed to compute accuracy")?;

    match snapshot.accuracy {
        Some(accuracy) => println!(
            "Accuracy: {:.3} over {} solved problems ({} new){}",
            accuracy,
            snapshot.samples,
            snapshot.new_samples,
            if snapshot.below_threshold {
                format!(", below threshold {:.3}", snapshot.threshold)
            } else {
                String::new()
            }
        ),
        None => println!("Accuracy: no solved problems yet"),
    }
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    let layout = cfg.layout();

    println!("troubleshoot configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", layout.home().display());
    println!("  Mailboxes: {}", layout.mailboxes_dir().display());
    println!("  Data:      {}", layout.data_dir().display());
    println!("  Configs:   {}", layout.config_dir().display());
    println!("  Schemas:   {}", layout.schemas_dir().display());
    println!("  Reports:   {}", layout.reports_dir().display());
    println!();
    println!("Tasks:");
    for (task, config_name) in TASKS {
        println!("  {:<20} {}", task, layout.stage_config(config_name).display());
    }
    println!();
    println!("Collaborators:");
    print!(
        "{}",
        serde_yaml::to_string(&cfg.collaborators).context("Failed to render collaborators")?
    );
    println!();
    println!("Intake poll: {:?}", cfg.intake_poll);
    println!("Fallback period: {}s", cfg.fallback_period.as_secs());

    Ok(())
}
