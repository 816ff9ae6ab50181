//! WF-011: Invocation boundary — every call into aspect code passes here.
//!
//! Two invokers ship with the crate: [`DirectInvoker`] calls straight
//! through, [`GuardedInvoker`] translates panics into errors and enforces a
//! time budget. [`AnyInvoker`] picks one from the project policy.

pub mod direct;
pub mod guarded;

pub use direct::DirectInvoker;
pub use guarded::GuardedInvoker;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Which aspect entry point is being called, and on what.
#[derive(Debug, Clone)]
pub struct InvokeSite<'a> {
    pub aspect: &'a str,
    pub entry: &'static str,
    pub target: Option<String>,
}

impl<'a> InvokeSite<'a> {
    pub fn new(aspect: &'a str, entry: &'static str) -> Self {
        Self {
            aspect,
            entry,
            target: None,
        }
    }

    pub fn at(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

impl fmt::Display for InvokeSite<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.aspect, self.entry)?;
        if let Some(ref t) = self.target {
            write!(f, " on {}", t)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvokeError {
    #[error("aspect '{aspect}' failed in {entry}: {message}")]
    Panicked {
        aspect: String,
        entry: String,
        message: String,
    },

    #[error("aspect '{aspect}' exceeded its {budget_ms}ms budget in {entry} ({elapsed_ms}ms)")]
    OverBudget {
        aspect: String,
        entry: String,
        elapsed_ms: u64,
        budget_ms: u64,
    },
}

/// The one narrow hook wrapping calls into aspect-author code.
pub trait Invoker: Sync {
    fn invoke<T>(&self, site: &InvokeSite<'_>, f: impl FnOnce() -> T) -> Result<T, InvokeError>;
}

/// Invoker selected from the project policy.
#[derive(Debug, Clone)]
pub enum AnyInvoker {
    Direct(DirectInvoker),
    Guarded(GuardedInvoker),
}

impl AnyInvoker {
    /// Guarded unless explicitly disabled; `budget_ms` of 0 means unbounded.
    pub fn from_policy(guarded: bool, budget_ms: u64) -> Self {
        if guarded {
            let budget = (budget_ms > 0).then(|| std::time::Duration::from_millis(budget_ms));
            Self::Guarded(GuardedInvoker::new(budget))
        } else {
            Self::Direct(DirectInvoker)
        }
    }
}

impl Invoker for AnyInvoker {
    fn invoke<T>(&self, site: &InvokeSite<'_>, f: impl FnOnce() -> T) -> Result<T, InvokeError> {
        match self {
            Self::Direct(i) => i.invoke(site, f),
            Self::Guarded(i) => i.invoke(site, f),
        }
    }
}

/// Cooperative whole-run abort, checked at the start of each unit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wf011_site_display() {
        let site = InvokeSite::new("Logged", "build_aspect").at("Calc.add");
        assert_eq!(site.to_string(), "Logged::build_aspect on Calc.add");
    }

    #[test]
    fn test_wf011_policy_selects_invoker() {
        assert!(matches!(AnyInvoker::from_policy(false, 0), AnyInvoker::Direct(_)));
        match AnyInvoker::from_policy(true, 250) {
            AnyInvoker::Guarded(g) => assert_eq!(g.budget_ms(), Some(250)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wf011_any_invoker_dispatch() {
        let inv = AnyInvoker::from_policy(true, 0);
        let out = inv.invoke(&InvokeSite::new("A", "build_aspect"), || 7);
        assert_eq!(out, Ok(7));
    }

    #[test]
    fn test_wf011_cancellation_shared() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
