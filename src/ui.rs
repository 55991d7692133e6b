//! Collaborator interfaces the engine reports to: progress/cancellation/user
//! questions, and optional lock-holder introspection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PatchError, Result};
use crate::validation::{ValidationKind, ValidationOption, ValidationResult};

pub trait UpdaterUi {
    fn start_process(&self, title: &str);
    fn set_status(&self, text: &str);
    fn set_progress(&self, percent: u8);
    fn set_progress_indeterminate(&self);
    /// Returns [`PatchError::Cancelled`] once cancellation was requested.
    fn check_cancelled(&self) -> Result<()>;
    /// Resolve validation results to a chosen option per path.
    fn ask_user(&self, results: &[ValidationResult]) -> Result<HashMap<String, ValidationOption>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockingProcess {
    pub pid: u32,
    pub name: String,
}

/// Platform-specific "who holds this file open" lookup.
pub trait LockInspector {
    fn processes_using(&self, path: &Path) -> Vec<LockingProcess>;
}

/// Percentage of `done` out of `total`, clamped to 100.
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done * 100) / total).min(100) as u8
    }
}

/// Non-interactive UI: answers from a preset map and never prints.
#[derive(Debug, Default, Clone)]
pub struct SilentUi {
    cancelled: Arc<AtomicBool>,
    checks_left: Option<Arc<AtomicUsize>>,
    answers: HashMap<String, ValidationOption>,
}

impl SilentUi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer(mut self, path: &str, option: ValidationOption) -> Self {
        self.answers.insert(path.to_string(), option);
        self
    }

    /// Report cancellation after `checks` successful cancellation checks.
    pub fn cancel_after(mut self, checks: usize) -> Self {
        self.checks_left = Some(Arc::new(AtomicUsize::new(checks)));
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl UpdaterUi for SilentUi {
    fn start_process(&self, _title: &str) {}
    fn set_status(&self, _text: &str) {}
    fn set_progress(&self, _percent: u8) {}
    fn set_progress_indeterminate(&self) {}

    fn check_cancelled(&self) -> Result<()> {
        if let Some(left) = &self.checks_left {
            let remaining = left.load(Ordering::SeqCst);
            if remaining == 0 {
                self.cancelled.store(true, Ordering::SeqCst);
            } else {
                left.store(remaining - 1, Ordering::SeqCst);
            }
        }
        if self.cancelled.load(Ordering::SeqCst) {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ask_user(&self, results: &[ValidationResult]) -> Result<HashMap<String, ValidationOption>> {
        Ok(results
            .iter()
            .filter_map(|r| self.answers.get(&r.path).map(|o| (r.path.clone(), *o)))
            .collect())
    }
}

/// Console UI: progress goes to the log, questions are answered from
/// command-line choices.
#[derive(Debug, Default)]
pub struct ConsoleUi {
    cancelled: Arc<AtomicBool>,
    answers: HashMap<String, ValidationOption>,
    ignore_errors: bool,
}

impl ConsoleUi {
    pub fn new(answers: HashMap<String, ValidationOption>, ignore_errors: bool) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            answers,
            ignore_errors,
        }
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

impl UpdaterUi for ConsoleUi {
    fn start_process(&self, title: &str) {
        info!("{title}");
    }

    fn set_status(&self, text: &str) {
        debug!("{text}");
    }

    fn set_progress(&self, percent: u8) {
        debug!("progress {percent}%");
    }

    fn set_progress_indeterminate(&self) {}

    fn check_cancelled(&self) -> Result<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn ask_user(&self, results: &[ValidationResult]) -> Result<HashMap<String, ValidationOption>> {
        let mut choices = HashMap::new();
        for result in results {
            warn!("{result}");
            if let Some(option) = self.answers.get(&result.path) {
                choices.insert(result.path.clone(), *option);
            } else if self.ignore_errors
                && result.kind == ValidationKind::Error
                && result.options.contains(&ValidationOption::Ignore)
            {
                choices.insert(result.path.clone(), ValidationOption::Ignore);
            }
        }
        Ok(choices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::{ValidationAction, MODIFIED};

    #[test]
    fn test_cancel_after_counts_checks() {
        let ui = SilentUi::new().cancel_after(2);
        assert!(ui.check_cancelled().is_ok());
        assert!(ui.check_cancelled().is_ok());
        assert!(ui.check_cancelled().unwrap_err().is_cancelled());
        assert!(ui.check_cancelled().is_err());
    }

    #[test]
    fn test_console_ignores_errors_on_request() {
        let error = ValidationResult::error(
            "a.txt",
            ValidationAction::Update,
            MODIFIED,
            vec![ValidationOption::Ignore],
        );
        let ui = ConsoleUi::new(HashMap::new(), true);
        let choices = ui.ask_user(std::slice::from_ref(&error)).unwrap();
        assert_eq!(choices["a.txt"], ValidationOption::Ignore);

        let ui = ConsoleUi::new(HashMap::new(), false);
        assert!(ui.ask_user(&[error]).unwrap().is_empty());
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(5, 4), 100);
    }
}
