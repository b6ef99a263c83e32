//! Folding job results into one build report.
//!
//! Each [`JobResult`] contributes to the totals according to what its stdout
//! carries:
//!
//! | Result                                  | tests | failures | errors | skips |
//! |-----------------------------------------|-------|----------|--------|-------|
//! | timed out, infrastructure failure, lost | +1    |          | +1     |       |
//! | no embedded report, exit code 0         | +1    |          |        |       |
//! | no embedded report, non-zero exit code  | +1    |          | +1     |       |
//! | malformed embedded report               | +1    |          | +1     |       |
//! | parsed embedded report                  | +n    | +n       | +n     | +n    |
//!
//! Totals are sums and entries are sorted on [`Aggregator::finish`], so the
//! order in which results are added does not change the report.

use std::fmt::{self, Write as _};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::junit::{self, CaseKind, Embedded};
use crate::job::{BuildId, JobResult};

const SEPARATOR_HEAVY: &str =
    "======================================================================";
const SEPARATOR_LIGHT: &str =
    "----------------------------------------------------------------------";

/// Overall outcome of a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Every test passed.
    Ok,
    /// Tests ran and at least one failed or errored, or some never ran.
    Failed,
    /// The build could not execute at all.
    NotRun,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ok => f.write_str("OK"),
            Verdict::Failed => f.write_str("FAILED"),
            Verdict::NotRun => f.write_str("NOT RUN"),
        }
    }
}

/// One itemized failure, error or skip.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Entry {
    pub kind: CaseKind,
    /// Test case name, or the test id when the job had no report.
    pub name: String,
    /// Test id of the job the entry came from.
    pub job: String,
    /// Elapsed seconds.
    pub elapsed: f64,
    pub message: String,
    pub body: String,
}

/// Folded totals and entries of one build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub build_id: Option<BuildId>,
    pub tests: usize,
    pub failures: usize,
    pub errors: usize,
    pub skips: usize,
    /// Units that were never executed.
    pub not_run: usize,
    /// Number of job results folded.
    pub jobs: usize,
    pub entries: Vec<Entry>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    /// The run was stopped by the operator or by fail-fast.
    pub interrupted: bool,
    /// Why the build could not execute.
    pub reason: Option<String>,
}

mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}

impl AggregateReport {
    /// Report for a build that never got to run any job.
    pub fn not_run(build_id: Option<BuildId>, units: usize, reason: impl Into<String>) -> Self {
        Self {
            build_id,
            not_run: units,
            reason: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn verdict(&self) -> Verdict {
        if self.failures + self.errors > 0 {
            Verdict::Failed
        } else if self.reason.is_some() || (self.jobs == 0 && self.not_run > 0) {
            Verdict::NotRun
        } else if self.not_run > 0 {
            Verdict::Failed
        } else {
            Verdict::Ok
        }
    }

    /// Process exit code for the verdict: 0 OK, 1 FAILED, 2 NOT RUN.
    pub fn exit_code(&self) -> i32 {
        match self.verdict() {
            Verdict::Ok => 0,
            Verdict::Failed => 1,
            Verdict::NotRun => 2,
        }
    }

    /// Tests that actually ran.
    pub fn ran(&self) -> usize {
        self.tests.saturating_sub(self.skips)
    }

    /// The verdict line, e.g. `FAILED (failures=1, errors=2)`.
    pub fn status_line(&self) -> String {
        match self.verdict() {
            Verdict::Ok if self.skips > 0 => format!("OK (skipped={})", self.skips),
            Verdict::Ok => "OK".to_string(),
            Verdict::NotRun => format!(
                "NOT RUN ({})",
                self.reason.as_deref().unwrap_or("no job was executed")
            ),
            Verdict::Failed => {
                let parts: Vec<String> = [
                    ("failures", self.failures),
                    ("errors", self.errors),
                    ("skipped", self.skips),
                    ("not_run", self.not_run),
                ]
                .iter()
                .filter(|(_, n)| *n > 0)
                .map(|(label, n)| format!("{}={}", label, n))
                .collect();
                format!("FAILED ({})", parts.join(", "))
            }
        }
    }

    /// Renders the report in the unittest text layout.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let _ = writeln!(out, "{}", SEPARATOR_HEAVY);
            let _ = writeln!(
                out,
                "{}: {} [{:.3}s]: {}",
                entry.kind.label(),
                entry.name,
                entry.elapsed,
                entry.job
            );
            let _ = writeln!(out, "{}", SEPARATOR_LIGHT);
            if !entry.message.is_empty() {
                let _ = writeln!(out, "{}", entry.message);
            }
            if !entry.body.is_empty() {
                let _ = writeln!(out, "{}", entry.body);
            }
            out.push('\n');
        }
        let _ = writeln!(out, "{}", SEPARATOR_LIGHT);
        let _ = writeln!(
            out,
            "Ran {} test{} in {:.3}s",
            self.ran(),
            if self.ran() == 1 { "" } else { "s" },
            self.duration.as_secs_f64()
        );
        out.push('\n');
        let _ = writeln!(out, "{}", self.status_line());
        out
    }
}

/// Accumulates job results into an [`AggregateReport`].
#[derive(Debug, Default)]
pub struct Aggregator {
    report: AggregateReport,
    first_start: Option<DateTime<Utc>>,
    last_finish: Option<DateTime<Utc>>,
}

impl Aggregator {
    pub fn new(build_id: Option<BuildId>) -> Self {
        Self {
            report: AggregateReport {
                build_id,
                ..AggregateReport::default()
            },
            ..Self::default()
        }
    }

    /// Number of results added so far.
    pub fn jobs(&self) -> usize {
        self.report.jobs
    }

    /// Failures plus errors so far.
    pub fn problems(&self) -> usize {
        self.report.failures + self.report.errors
    }

    pub fn add(&mut self, result: &JobResult) {
        let report = &mut self.report;
        report.jobs += 1;
        self.first_start = Some(match self.first_start {
            Some(t) => t.min(result.started_at),
            None => result.started_at,
        });
        self.last_finish = Some(match self.last_finish {
            Some(t) => t.max(result.finished_at),
            None => result.finished_at,
        });

        let elapsed = result.duration().as_secs_f64();
        if let Some(failure) = &result.failure {
            report.tests += 1;
            report.errors += 1;
            report
                .entries
                .push(raw_entry(result, elapsed, failure.to_string()));
            return;
        }

        match junit::extract(&result.stdout) {
            Embedded::Absent if result.exit_code == 0 => report.tests += 1,
            Embedded::Absent => {
                report.tests += 1;
                report.errors += 1;
                report.entries.push(raw_entry(
                    result,
                    elapsed,
                    format!("exited with code {}", result.exit_code),
                ));
            }
            Embedded::Malformed(reason) => {
                tracing::warn!("Malformed report from {}: {}", result.test_id, reason);
                report.tests += 1;
                report.errors += 1;
                report.entries.push(raw_entry(
                    result,
                    elapsed,
                    format!("malformed report: {}", reason),
                ));
            }
            Embedded::Parsed(suite) => {
                report.tests += suite.tests;
                report.failures += suite.failures;
                report.errors += suite.errors;
                report.skips += suite.skips;
                report
                    .entries
                    .extend(suite.cases.into_iter().map(|case| Entry {
                        kind: case.kind,
                        name: case.name,
                        job: result.test_id.clone(),
                        elapsed: case.time,
                        message: case.message,
                        body: case.body,
                    }));
            }
        }
    }

    /// Finishes the report. The duration spans the earliest start to the
    /// latest finish of the added results.
    pub fn finish(self) -> AggregateReport {
        let mut report = self.report;
        if let (Some(start), Some(finish)) = (self.first_start, self.last_finish) {
            report.duration = (finish - start).to_std().unwrap_or(Duration::ZERO);
        }
        report.entries.sort_by(|a, b| {
            (a.job.as_str(), a.kind, a.name.as_str(), a.message.as_str()).cmp(&(
                b.job.as_str(),
                b.kind,
                b.name.as_str(),
                b.message.as_str(),
            ))
        });
        report
    }
}

/// Reason recorded when a fold sees no results at all.
pub const NO_RESULTS: &str = "no job results";

/// Folds a set of results into a report. An empty set is NOT RUN, since
/// nothing shows that any job executed.
pub fn fold<'a>(results: impl IntoIterator<Item = &'a JobResult>) -> AggregateReport {
    let mut aggregator = Aggregator::default();
    for result in results {
        if aggregator.report.build_id.is_none() {
            aggregator.report.build_id = Some(result.build_id.clone());
        }
        aggregator.add(result);
    }
    let mut report = aggregator.finish();
    if report.jobs == 0 {
        report.reason = Some(NO_RESULTS.to_string());
    }
    report
}

/// Error entry carrying the job's output verbatim.
fn raw_entry(result: &JobResult, elapsed: f64, message: String) -> Entry {
    let mut body = String::new();
    if !result.stdout.is_empty() {
        body.push_str(result.stdout.trim_end());
    }
    if !result.stderr.is_empty() {
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(result.stderr.trim_end());
    }
    Entry {
        kind: CaseKind::Error,
        name: result.test_id.clone(),
        job: result.test_id.clone(),
        elapsed,
        message,
        body,
    }
}
