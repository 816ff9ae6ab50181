//! WF-018: Diagnostics and the diagnostic sink.
//!
//! Every component that can fail for one aspect without aborting the run
//! reports here. Rendering is left to the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCode {
    OrderCycle,
    UndeterminedOrder,
    Ineligible,
    ConflictingIntroduction,
    MissingMember,
    IncompatibleOverride,
    DuplicateInterface,
    UnresolvedReference,
    AnchorVanished,
    AspectFailed,
    InvalidChildAspect,
}

impl DiagnosticCode {
    pub fn id(self) -> &'static str {
        match self {
            Self::OrderCycle => "WEFT001",
            Self::UndeterminedOrder => "WEFT002",
            Self::Ineligible => "WEFT010",
            Self::ConflictingIntroduction => "WEFT020",
            Self::MissingMember => "WEFT021",
            Self::IncompatibleOverride => "WEFT022",
            Self::DuplicateInterface => "WEFT023",
            Self::UnresolvedReference => "WEFT024",
            Self::AnchorVanished => "WEFT025",
            Self::AspectFailed => "WEFT030",
            Self::InvalidChildAspect => "WEFT031",
        }
    }
}

/// One reported problem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    /// Aspect class the diagnostic is scoped to, if any.
    #[serde(default)]
    pub aspect: Option<String>,
    /// Declaration location (`Type.member`), if any.
    #[serde(default)]
    pub location: Option<String>,
}

impl Diagnostic {
    pub fn error(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            code,
            message: message.into(),
            aspect: None,
            location: None,
        }
    }

    pub fn warning(code: DiagnosticCode, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            ..Self::error(code, message)
        }
    }

    pub fn with_aspect(mut self, aspect: &str) -> Self {
        self.aspect = Some(aspect.to_string());
        self
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}: {}", self.severity, self.code.id(), self.message)?;
        if let Some(ref loc) = self.location {
            write!(f, " (at {})", loc)?;
        }
        if let Some(ref aspect) = self.aspect {
            write!(f, " [{}]", aspect)?;
        }
        Ok(())
    }
}

/// Where diagnostics go.
pub trait DiagnosticSink: Sync {
    fn report(&self, diagnostic: Diagnostic);
    fn error_count(&self) -> usize;
}

/// Collects diagnostics in memory, in report order.
#[derive(Debug, Default)]
pub struct CollectingSink {
    items: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.items.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn with_code(&self, code: DiagnosticCode) -> Vec<Diagnostic> {
        self.diagnostics()
            .into_iter()
            .filter(|d| d.code == code)
            .collect()
    }
}

impl DiagnosticSink for CollectingSink {
    fn report(&self, diagnostic: Diagnostic) {
        match diagnostic.severity {
            Severity::Error => tracing::warn!(code = diagnostic.code.id(), "{}", diagnostic.message),
            Severity::Warning => tracing::debug!(code = diagnostic.code.id(), "{}", diagnostic.message),
        }
        if let Ok(mut items) = self.items.lock() {
            items.push(diagnostic);
        }
    }

    fn error_count(&self) -> usize {
        self.items
            .lock()
            .map(|v| v.iter().filter(|d| d.severity == Severity::Error).count())
            .unwrap_or(0)
    }
}
