use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationKind {
    /// Unrecoverable without an explicit override.
    Error,
    /// A real choice between the offered options.
    Conflict,
}

/// Which kind of step produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationAction {
    Create,
    Update,
    Delete,
    Validate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationOption {
    None,
    Ignore,
    Keep,
    Replace,
    Delete,
    KillProcess,
}

impl ValidationOption {
    /// Options under which the associated action must not run.
    pub fn skips_action(self) -> bool {
        matches!(self, Self::None | Self::Ignore | Self::Keep)
    }
}

impl fmt::Display for ValidationOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Ignore => "ignore",
            Self::Keep => "keep",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::KillProcess => "kill-process",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ValidationOption {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "ignore" => Ok(Self::Ignore),
            "keep" => Ok(Self::Keep),
            "replace" => Ok(Self::Replace),
            "delete" => Ok(Self::Delete),
            "kill-process" | "kill_process" => Ok(Self::KillProcess),
            other => Err(format!("unknown option: {other}")),
        }
    }
}

pub const MODIFIED: &str = "Modified";
pub const ABSENT: &str = "Absent";
pub const ALREADY_EXISTS: &str = "Already exists";
pub const UNEXPECTED_FILE: &str = "Unexpected file";
pub const SOURCE_MISSING: &str = "Source missing";
pub const SOURCE_MODIFIED: &str = "Source modified";
pub const ACCESS_DENIED: &str = "Access denied";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub kind: ValidationKind,
    pub path: String,
    pub action: ValidationAction,
    pub message: String,
    pub options: Vec<ValidationOption>,
}

impl ValidationResult {
    pub fn error(
        path: &str,
        action: ValidationAction,
        message: impl Into<String>,
        options: Vec<ValidationOption>,
    ) -> Self {
        Self {
            kind: ValidationKind::Error,
            path: path.to_string(),
            action,
            message: message.into(),
            options,
        }
    }

    pub fn conflict(
        path: &str,
        action: ValidationAction,
        message: impl Into<String>,
        options: Vec<ValidationOption>,
    ) -> Self {
        Self {
            kind: ValidationKind::Conflict,
            path: path.to_string(),
            action,
            message: message.into(),
            options,
        }
    }

    /// Option used when the caller gives none: conflicts take their first
    /// offered option, errors have no default.
    pub fn default_option(&self) -> Option<ValidationOption> {
        match self.kind {
            ValidationKind::Conflict => self.options.first().copied(),
            ValidationKind::Error => None,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.kind == ValidationKind::Error
            && self.options.iter().all(|o| *o == ValidationOption::None)
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let options: Vec<String> = self.options.iter().map(|o| o.to_string()).collect();
        write!(
            f,
            "{:?} {:?} {}: {} [{}]",
            self.kind,
            self.action,
            self.path,
            self.message,
            options.join(", ")
        )
    }
}
