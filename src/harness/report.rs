use crate::error::{FailureKind, ProbeError};
use crate::mqtt::{ConnectionConfig, MqttMessage};
use std::fmt;
use std::io::Write;
use std::time::Duration;
use tracing::warn;

const RULE_WIDTH: usize = 78;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Warning,
    Failed,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let label = match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Warning => "WARNING",
            TestStatus::Failed => "FAILED",
        };
        // pad() so width specifiers in the table apply
        f.pad(label)
    }
}

/// What a scenario concluded, before timing and naming are attached.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub status: TestStatus,
    pub message_count: Option<usize>,
    pub detail: Option<String>,
    pub failure: Option<FailureKind>,
    pub hint: Option<&'static str>,
}

impl Verdict {
    pub fn passed(detail: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Passed,
            message_count: None,
            detail: Some(detail.into()),
            failure: None,
            hint: None,
        }
    }

    pub fn warning(detail: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Warning,
            ..Self::passed(detail)
        }
    }

    pub fn failed(detail: impl Into<String>, failure: Option<FailureKind>, hint: &'static str) -> Self {
        Self {
            status: TestStatus::Failed,
            message_count: None,
            detail: Some(detail.into()),
            failure,
            hint: Some(hint),
        }
    }

    pub fn with_messages(mut self, count: usize) -> Self {
        self.message_count = Some(count);
        self
    }
}

impl From<ProbeError> for Verdict {
    fn from(err: ProbeError) -> Self {
        Verdict::failed(err.to_string(), Some(err.kind()), err.hint())
    }
}

/// One row of the summary table
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioResult {
    pub name: String,
    pub status: TestStatus,
    pub message_count: Option<usize>,
    pub detail: Option<String>,
    pub failure: Option<FailureKind>,
    pub hint: Option<&'static str>,
    pub elapsed: Duration,
}

impl ScenarioResult {
    pub fn from_outcome(
        name: &str,
        outcome: Result<Verdict, ProbeError>,
        elapsed: Duration,
    ) -> Self {
        let verdict = outcome.unwrap_or_else(Verdict::from);
        Self {
            name: name.to_string(),
            status: verdict.status,
            message_count: verdict.message_count,
            detail: verdict.detail,
            failure: verdict.failure,
            hint: verdict.hint,
            elapsed,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Aggregate counts over the ordered results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub warnings: usize,
    pub failed: usize,
}

impl Summary {
    pub fn from_results(results: &[ScenarioResult]) -> Self {
        results.iter().fold(Summary::default(), |mut summary, result| {
            summary.total += 1;
            match result.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Warning => summary.warnings += 1,
                TestStatus::Failed => summary.failed += 1,
            }
            summary
        })
    }

    /// Warnings do not fail a run.
    pub fn all_ok(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{} scenarios passed", self.passed, self.total)?;
        if self.warnings > 0 || self.failed > 0 {
            write!(f, " ({} warning(s), {} failed)", self.warnings, self.failed)?;
        }
        Ok(())
    }
}

/// Human readable progress and summary output.
pub struct ConsoleReporter<W: Write> {
    out: W,
}

impl<W: Write> ConsoleReporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_line(&mut self, line: fmt::Arguments) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            warn!("Failed to write report output: {}", e);
        }
    }

    pub fn banner(&mut self, config: &ConnectionConfig, scenarios: usize) {
        self.write_line(format_args!("{}", "=".repeat(RULE_WIDTH)));
        self.write_line(format_args!(
            "MQTT probe: {}:{} (user {}, prefix {})",
            config.host, config.port, config.username, config.topic_prefix
        ));
        self.write_line(format_args!("Running {} scenario(s)", scenarios));
        self.write_line(format_args!("{}", "=".repeat(RULE_WIDTH)));
    }

    pub fn scenario_started(&mut self, index: usize, total: usize, name: &str) {
        self.write_line(format_args!(""));
        self.write_line(format_args!("[{}/{}] {}", index, total, name));
    }

    pub fn line(&mut self, text: &str) {
        self.write_line(format_args!("  - {}", text));
    }

    pub fn message(&mut self, message: &MqttMessage) {
        self.write_line(format_args!("    <- {}", message));
    }

    pub fn scenario_finished(&mut self, result: &ScenarioResult) {
        let detail = result.detail.as_deref().unwrap_or("");
        self.write_line(format_args!(
            "  => {} ({:.2}s) {}",
            result.status,
            result.elapsed.as_secs_f64(),
            detail
        ));
        if let Some(hint) = result.hint {
            self.write_line(format_args!("     hint: {}", hint));
        }
    }

    /// Prints the table and returns the fold it was built from.
    pub fn summary(&mut self, results: &[ScenarioResult]) -> Summary {
        let summary = Summary::from_results(results);

        self.write_line(format_args!(""));
        self.write_line(format_args!("{}", "=".repeat(RULE_WIDTH)));
        self.write_line(format_args!(
            "{:<22} {:<8} {:>8}  {}",
            "SCENARIO", "STATUS", "MESSAGES", "DETAIL"
        ));
        self.write_line(format_args!("{}", "-".repeat(RULE_WIDTH)));
        for result in results {
            let count = result
                .message_count
                .map(|c| c.to_string())
                .unwrap_or_else(|| "-".to_string());
            self.write_line(format_args!(
                "{:<22} {:<8} {:>8}  {}",
                result.name,
                result.status,
                count,
                result.detail.as_deref().unwrap_or("")
            ));
            if result.status == TestStatus::Failed {
                if let Some(kind) = result.failure {
                    self.write_line(format_args!("{:<22} cause: {}", "", kind));
                }
                if let Some(hint) = result.hint {
                    self.write_line(format_args!("{:<22} hint:  {}", "", hint));
                }
            }
        }
        self.write_line(format_args!("{}", "-".repeat(RULE_WIDTH)));
        self.write_line(format_args!("{}", summary));
        self.write_line(format_args!("{}", "=".repeat(RULE_WIDTH)));

        summary
    }
}
