//! Relay Demo Suite
//!
//! This crate provides demonstrations of the Relay job engine:
//!
//! - **Chains**: compress → upload → send with a network constraint
//! - **Queues**: several conversations, each strictly ordered
//! - **Recovery**: enqueue, exit, restart, resume
//!
//! All demos use [`jobs::SimulatedStep`], a job that sleeps for a while and
//! fails transiently at a configurable rate.

pub mod jobs;

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use relay_jobs::{JobId, JobManager, JobState, LoggingConfig};
use tracing_subscriber::EnvFilter;

/// Setup logging from a repeated `-v` flag, falling back to the configured
/// level when the flag is absent.
pub fn init_logging(verbose: u8, config: &LoggingConfig) {
    let filter = match verbose {
        0 => config.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();
}

/// Create a progress bar for demo operations.
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let pb = ProgressBar::new(len);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .map(|s| s.progress_chars("#>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// Final states of a batch of jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Outcome {
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl Outcome {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.timed_out
    }
}

/// Wait for every job, optionally showing progress.
pub async fn track(
    manager: &JobManager,
    ids: &[JobId],
    timeout: Duration,
    show_progress: bool,
) -> Outcome {
    let pb = show_progress.then(|| create_progress_bar(ids.len() as u64, "jobs"));
    let mut outcome = Outcome::default();

    for id in ids {
        match manager.wait_for(*id, timeout).await {
            Some(JobState::Succeeded) => outcome.succeeded += 1,
            Some(_) => outcome.failed += 1,
            None => outcome.timed_out += 1,
        }
        if let Some(pb) = &pb {
            pb.inc(1);
        }
    }

    if let Some(pb) = pb {
        pb.finish_with_message("done");
    }
    outcome
}

/// Print a demo header.
pub fn print_header(title: &str) {
    println!();
    println!("{}", style("═".repeat(60)).cyan());
    println!("{}", style(format!("  {title}")).cyan().bold());
    println!("{}", style("═".repeat(60)).cyan());
    println!();
}

/// Print a demo section.
pub fn print_section(title: &str) {
    println!();
    println!("{}", style(format!("▶ {title}")).green().bold());
    println!("{}", style("─".repeat(40)).dim());
}

/// Print a result line.
pub fn print_result(label: &str, value: impl std::fmt::Display) {
    println!("  {} {}", style(format!("{label}:")).dim(), value);
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print a failure message.
pub fn print_failure(message: &str) {
    println!("{} {}", style("✗").red().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", style("ℹ").blue(), message);
}

/// Print the summary of a tracked batch.
pub fn print_outcome(outcome: &Outcome) {
    print_result("Succeeded", outcome.succeeded);
    print_result("Failed permanently", outcome.failed);
    if outcome.timed_out > 0 {
        print_result("Still pending", outcome.timed_out);
    }

    if outcome.succeeded == outcome.total() {
        print_success("All jobs succeeded");
    } else {
        print_failure("Some jobs did not succeed");
    }
}
