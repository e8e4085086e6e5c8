//! Diagnostic lines printed on failure.
//!
//! Structured detail goes through `tracing`; these are the single lines a
//! user sees at the end of a failed launch.

use scredis_common::constants::BIN_NAME;
use scredis_runtime::bootstrap::LaunchFailure;
use scredis_runtime::rollback::TeardownReport;

const BOLD: &str = "\x1b[1m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

/// Formats a failed launch as one line naming stage and cause.
#[must_use]
pub fn failure_line(failure: &LaunchFailure) -> String {
    format!(
        "{RED}{BOLD}{BIN_NAME}:{RESET} launch failed during {BOLD}{}{RESET}: {}",
        failure.stage, failure.source
    )
}

/// Formats an incomplete teardown.
#[must_use]
pub fn teardown_line(report: &TeardownReport) -> String {
    format!(
        "{YELLOW}{BOLD}{BIN_NAME}:{RESET} teardown incomplete: {}",
        report.failures.join("; ")
    )
}

/// Prints [`failure_line`] to stderr.
pub fn print_failure(failure: &LaunchFailure) {
    eprintln!("{}", failure_line(failure));
    if !failure.teardown.is_clean() {
        print_teardown(&failure.teardown);
    }
}

/// Prints [`teardown_line`] to stderr.
pub fn print_teardown(report: &TeardownReport) {
    eprintln!("{}", teardown_line(report));
}

/// Prints an error that prevented the launcher from running at all.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{RED}{BOLD}{BIN_NAME}:{RESET} {err:#}");
}

#[cfg(test)]
mod tests {
    use scredis_common::error::ScredisError;
    use scredis_common::types::LaunchStage;

    use super::*;

    #[test]
    fn failure_line_names_stage_and_cause() {
        let failure = LaunchFailure {
            stage: LaunchStage::NetworkReady,
            source: ScredisError::PoolExhausted,
            teardown: TeardownReport::default(),
        };
        let line = failure_line(&failure);
        assert!(line.contains(&format!("{BIN_NAME}:")));
        assert!(line.contains("network-ready"));
        assert!(line.contains("no more ip addr available"));
    }

    #[test]
    fn teardown_line_lists_failures() {
        let report = TeardownReport {
            released: 2,
            failures: vec!["lease: io".into(), "work-dir: busy".into()],
        };
        assert!(teardown_line(&report).contains("lease: io; work-dir: busy"));
    }
}
