//! Result aggregation and report output.
//!
//! [`aggregate`] folds job results into an [`AggregateReport`]; [`junit`]
//! reads the reports runners embed in their output and writes the merged
//! JUnit file. This module holds the console side: the live progress bar and
//! the final summary.

pub mod aggregate;
pub mod junit;

use std::sync::Mutex;

pub use aggregate::{AggregateReport, Aggregator, Entry, Verdict, fold};
pub use junit::{CaseKind, Embedded, ReportParseError, SuiteReport};

use crate::job::JobResult;

/// Live progress of a run in the terminal.
pub struct ProgressReporter {
    progress: Mutex<Option<indicatif::ProgressBar>>,
    verbose: bool,
}

impl ProgressReporter {
    pub fn new(verbose: bool) -> Self {
        Self {
            progress: Mutex::new(None),
            verbose,
        }
    }

    /// Starts the bar once the number of units is known.
    pub fn start(&self, units: usize) {
        println!("Dispatching {} test units", units);

        let pb = indicatif::ProgressBar::new(units as u64);
        let style = indicatif::ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar())
            .progress_chars("#>-");
        pb.set_style(style);

        if let Ok(mut slot) = self.progress.lock() {
            *slot = Some(pb);
        }
    }

    pub fn on_result(&self, result: &JobResult) {
        let Ok(slot) = self.progress.lock() else {
            return;
        };
        let Some(pb) = slot.as_ref() else {
            return;
        };
        pb.inc(1);

        let status = match &result.failure {
            Some(_) => console::style("ERR ").red().bold(),
            None if result.exit_code == 0 => console::style("DONE").green(),
            None => console::style("FAIL").red(),
        };
        if self.verbose || !result.success() {
            let worker = result.worker.as_deref().unwrap_or("?");
            pb.println(format!("{} {} ({})", status, result.test_id, worker));
        }
    }

    pub fn finish(&self) {
        if let Ok(mut slot) = self.progress.lock()
            && let Some(pb) = slot.take()
        {
            pb.finish_and_clear();
        }
    }
}

/// Prints a summary of the build to the console.
pub fn print_summary(report: &AggregateReport) {
    println!();
    println!("Test Results:");
    if let Some(build_id) = &report.build_id {
        println!("  Build:    {}", build_id);
    }
    println!("  Jobs:     {}", report.jobs);
    println!("  Tests:    {}", report.tests);
    println!("  Failures: {}", console::style(report.failures).red());
    println!("  Errors:   {}", console::style(report.errors).red());
    println!("  Skipped:  {}", console::style(report.skips).yellow());

    if report.not_run > 0 {
        println!("  Not Run:  {}", console::style(report.not_run).red().bold());
    }

    println!("  Duration: {:?}", report.duration);

    println!();
    match report.verdict() {
        Verdict::Ok => println!("{}", console::style("All tests passed!").green().bold()),
        Verdict::NotRun => {
            println!(
                "{}",
                console::style("Tests could not be executed.").red().bold()
            );
            if let Some(reason) = &report.reason {
                println!("{}", console::style(reason).dim());
            }
        }
        Verdict::Failed if report.interrupted => println!(
            "{}",
            console::style("Run was interrupted before all tests ran.")
                .red()
                .bold()
        ),
        Verdict::Failed => println!("{}", console::style("Some tests failed.").red().bold()),
    }
}
