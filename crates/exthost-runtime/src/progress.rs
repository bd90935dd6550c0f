//! Ready phase progress reporting.

use std::sync::Arc;
use std::time::Duration;

use compact_str::CompactString;

/// Progress of the ready phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadProgress {
    /// Extension whose hook is about to run; `None` once all hooks ran.
    pub extension: Option<CompactString>,
    /// Index of the hook, or the total count when done.
    pub index: usize,
    /// Number of hooks in this pass.
    pub total: usize,
    /// Time elapsed since the pass started.
    pub elapsed: Duration,
}

impl LoadProgress {
    pub(crate) fn running(extension: &str, index: usize, total: usize, elapsed: Duration) -> Self {
        Self {
            extension: Some(extension.into()),
            index,
            total,
            elapsed,
        }
    }

    pub(crate) fn done(total: usize, elapsed: Duration) -> Self {
        Self {
            extension: None,
            index: total,
            total,
            elapsed,
        }
    }

    /// Whether every hook has run.
    pub fn is_done(&self) -> bool {
        self.extension.is_none()
    }

    /// Fraction of hooks started, between 0 and 1.
    pub fn fraction(&self) -> f64 {
        if self.total > 0 {
            self.index as f64 / self.total as f64
        } else {
            1.0
        }
    }
}

/// Callback receiving `(Some(extension), index)` before each hook and
/// `(None, total)` at the end.
pub type LoadingCallback = Arc<dyn Fn(Option<&str>, usize) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fraction() {
        let progress = LoadProgress::running("a", 1, 4, Duration::ZERO);
        assert!(!progress.is_done());
        assert_eq!(progress.fraction(), 0.25);

        let done = LoadProgress::done(0, Duration::ZERO);
        assert!(done.is_done());
        assert_eq!(done.fraction(), 1.0);
    }
}
