//! WF-019: Typed weave errors.
//!
//! Failures scoped to one aspect instance are diagnostics, not errors; this
//! enum covers what stops a run.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeaveError {
    /// Project file could not be read or parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failed
    #[error("{} validation error(s): {}", .0.len(), .0.join("; "))]
    Validation(Vec<String>),

    /// No total layer order exists
    #[error("layer ordering failed: {0}")]
    Ordering(String),

    /// An invariant established by an earlier phase does not hold
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O on lock or event files
    #[error("I/O error for {path}: {reason}")]
    Io { path: String, reason: String },

    /// The run was cancelled before every unit completed
    #[error("weave cancelled after {completed} of {total} unit(s)")]
    Cancelled { completed: usize, total: usize },
}

impl WeaveError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<WeaveError> for String {
    fn from(e: WeaveError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wf019_validation_display() {
        let e = WeaveError::Validation(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(e.to_string(), "2 validation error(s): a; b");
    }

    #[test]
    fn test_wf019_into_string() {
        let s: String = WeaveError::internal("chain broken").into();
        assert_eq!(s, "internal error: chain broken");
    }
}
