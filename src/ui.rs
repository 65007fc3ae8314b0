//! Terminal output: progress bar and colored job summary.
//!
//! [`JobProgress`] is a [`JobObserver`] driving an `indicatif` bar; retries
//! and failures are printed above the bar with `console` styles.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::ExecutionError;
use crate::item::{ItemStatus, JobResult, WorkItem};
use crate::orchestrator::JobObserver;

const TEMPLATE: &str = "{spinner:.cyan} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}";

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl JobProgress {
    /// Visible bar on stderr, ticking while items run.
    pub fn new() -> Self {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::with_template(TEMPLATE)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Hidden bar, for non-interactive output.
    pub fn hidden() -> Self {
        let progress = Self::new();
        progress.pb.set_draw_target(indicatif::ProgressDrawTarget::hidden());
        progress
    }

    /// Clear the bar and print the final counts.
    pub fn finish(&self, result: &JobResult) {
        self.pb.finish_and_clear();
        let headline = if result.failed == 0 && !result.aborted && !result.cancelled {
            self.green.apply_to("✓ Job completed")
        } else if result.cancelled {
            self.yellow.apply_to("⏸ Job cancelled")
        } else {
            self.red.apply_to("✗ Job finished with failures")
        };
        println!("  {headline} in {}ms", result.duration_ms());
        println!(
            "  {} succeeded, {} failed, {} skipped ({} resumed) of {}",
            self.green.apply_to(result.succeeded),
            self.red.apply_to(result.failed),
            self.yellow.apply_to(result.skipped),
            result.resumed,
            result.total,
        );
        if let Some(health) = &result.destination_health {
            for (destination, h) in health {
                println!(
                    "  {} {destination}: {} ({:.0}% ok, p95 {}ms)",
                    self.dim.apply_to("•"),
                    h.status,
                    h.success_rate * 100.0,
                    h.p95_latency_ms
                );
            }
        }
    }

    /// Stop the bar where it is, after a fatal error.
    pub fn abandon(&self) {
        self.pb.abandon();
    }
}

impl Default for JobProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl JobObserver for JobProgress {
    fn job_started(&self, total: usize, resumed: usize) {
        self.pb.set_length(total as u64);
        self.pb.set_position(resumed as u64);
        if resumed > 0 {
            self.pb.println(format!(
                "  {} resuming: {resumed} of {total} items already done",
                self.dim.apply_to("↺")
            ));
        }
    }

    fn item_started(&self, item: &WorkItem) {
        self.pb.set_message(format!("item {}", item.id));
    }

    fn item_retrying(&self, item: &WorkItem, error: &ExecutionError, delay: Duration) {
        self.pb.println(format!(
            "  {} item {} attempt {}: {} (retry in {}ms)",
            self.yellow.apply_to("↻"),
            item.id,
            item.attempts,
            error.message,
            delay.as_millis()
        ));
    }

    fn item_finished(&self, item: &WorkItem) {
        if item.status == ItemStatus::Failed
            && let Some(error) = &item.error
        {
            self.pb.println(format!(
                "  {} item {}: {error}",
                self.red.apply_to("✗"),
                item.id
            ));
        }
        self.pb.inc(1);
    }
}
