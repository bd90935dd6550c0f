//! Error reporting with extension attribution.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::extension::ExtensionInfo;

/// An error surfaced to the user, attributed to the extension that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Short title.
    pub title: String,

    /// Extension the error originated from, `None` for host errors.
    pub extension: Option<ExtensionInfo>,

    /// Error details.
    pub message: String,

    /// Whether the error may be reported upstream as a host bug.
    pub allow_report: bool,
}

impl ErrorReport {
    /// Create a report. Errors from third-party extensions are never reportable.
    pub fn new(
        title: impl Into<String>,
        extension: Option<&ExtensionInfo>,
        message: impl Into<String>,
    ) -> Self {
        let allow_report = extension.is_none_or(|ext| ext.official);
        Self {
            title: title.into(),
            extension: extension.cloned(),
            message: message.into(),
            allow_report,
        }
    }

    /// Mark the report as not reportable upstream.
    pub fn not_reportable(mut self) -> Self {
        self.allow_report = false;
        self
    }

    /// Name of the originating extension.
    pub fn extension_name(&self) -> Option<&str> {
        self.extension.as_ref().map(|ext| ext.name.as_str())
    }
}

/// Sink for user-visible errors.
pub trait ErrorReporter: Send + Sync {
    /// Surface an error.
    fn report(&self, report: ErrorReport);
}

/// Reporter writing to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        match report.extension {
            Some(ref ext) => tracing::error!(
                extension = %ext.name,
                dynamic = ext.dynamic,
                official = ext.official,
                allow_report = report.allow_report,
                "{}: {}",
                report.title,
                report.message
            ),
            None => tracing::error!(
                allow_report = report.allow_report,
                "{}: {}",
                report.title,
                report.message
            ),
        }
    }
}

/// Reporter collecting reports in memory.
#[derive(Debug, Default)]
pub struct MemoryReporter {
    reports: Mutex<Vec<ErrorReport>>,
}

impl MemoryReporter {
    /// Create an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// All reports received so far.
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.reports.lock().clone()
    }

    /// Number of reports received.
    pub fn len(&self) -> usize {
        self.reports.lock().len()
    }

    /// Whether no reports were received.
    pub fn is_empty(&self) -> bool {
        self.reports.lock().is_empty()
    }

    /// Remove and return all reports.
    pub fn take(&self) -> Vec<ErrorReport> {
        std::mem::take(&mut *self.reports.lock())
    }
}

impl ErrorReporter for MemoryReporter {
    fn report(&self, report: ErrorReport) {
        self.reports.lock().push(report);
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn third_party() -> ExtensionInfo {
        ExtensionInfo {
            name: "community-tool".into(),
            namespace: "community-tool".into(),
            path: PathBuf::from("/plugins/community-tool"),
            dynamic: true,
            official: false,
        }
    }

    #[test]
    fn test_third_party_reports_not_reportable() {
        let ext = third_party();
        let report = ErrorReport::new("Failed", Some(&ext), "boom");
        assert!(!report.allow_report);
        assert_eq!(report.extension_name(), Some("community-tool"));

        let host = ErrorReport::new("Failed", None, "boom");
        assert!(host.allow_report);
        assert!(!host.not_reportable().allow_report);
    }

    #[test]
    fn test_memory_reporter_collects() {
        let reporter = MemoryReporter::new();
        assert!(reporter.is_empty());
        reporter.report(ErrorReport::new("a", None, "1"));
        reporter.report(ErrorReport::new("b", None, "2"));
        assert_eq!(reporter.len(), 2);
        let taken = reporter.take();
        assert_eq!(taken[1].title, "b");
        assert!(reporter.is_empty());
    }
}
