//! Directory-tree patching: diff two versions of an installation into a
//! self-contained patch, validate a target against it, apply it with per-file
//! backups and revert from those backups.

pub mod action;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod patch;
pub mod patch_format;
pub mod runner;
pub mod ui;
pub mod util;
pub mod validation;
pub mod validator;

pub use action::PatchAction;
pub use config::PatchSpec;
pub use digest::Signature;
pub use error::{PatchError, Result};
pub use patch::{Patch, PatchSummary};
pub use patch_format::Payload;
pub use runner::{ApplicationResult, PreparationResult};
pub use ui::{ConsoleUi, LockInspector, SilentUi, UpdaterUi};
pub use validation::{ValidationKind, ValidationOption, ValidationResult};
