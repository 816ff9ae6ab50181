//! WF-011: Guarded invocation — crash translation and time budget.
//!
//! A panic in aspect code becomes [`InvokeError::Panicked`]. The budget is
//! checked after the call returns; aspect code is not preempted.

use super::{InvokeError, InvokeSite, Invoker};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Default)]
pub struct GuardedInvoker {
    budget: Option<Duration>,
}

impl GuardedInvoker {
    pub fn new(budget: Option<Duration>) -> Self {
        Self { budget }
    }

    pub fn budget_ms(&self) -> Option<u64> {
        self.budget.map(|b| b.as_millis() as u64)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Invoker for GuardedInvoker {
    fn invoke<T>(&self, site: &InvokeSite<'_>, f: impl FnOnce() -> T) -> Result<T, InvokeError> {
        let _span = tracing::debug_span!("invoke", aspect = site.aspect, entry = site.entry).entered();
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
            let message = panic_message(payload.as_ref());
            tracing::warn!(site = %site, "aspect code panicked: {}", message);
            InvokeError::Panicked {
                aspect: site.aspect.to_string(),
                entry: site.entry.to_string(),
                message,
            }
        })?;

        let elapsed = start.elapsed();
        if let Some(budget) = self.budget {
            if elapsed > budget {
                return Err(InvokeError::OverBudget {
                    aspect: site.aspect.to_string(),
                    entry: site.entry.to_string(),
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_ms: budget.as_millis() as u64,
                });
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wf011_guarded_translates_panic() {
        let inv = GuardedInvoker::default();
        let site = InvokeSite::new("Boom", "build_aspect");
        let err = inv.invoke(&site, || -> u32 { panic!("kaboom") }).unwrap_err();
        assert_eq!(
            err,
            InvokeError::Panicked {
                aspect: "Boom".to_string(),
                entry: "build_aspect".to_string(),
                message: "kaboom".to_string(),
            }
        );
    }

    #[test]
    fn test_wf011_guarded_formatted_panic() {
        let inv = GuardedInvoker::default();
        let site = InvokeSite::new("Boom", "build_eligibility");
        let err = inv
            .invoke(&site, || -> u32 { panic!("bad value {}", 3) })
            .unwrap_err();
        assert!(err.to_string().contains("bad value 3"));
    }

    #[test]
    fn test_wf011_guarded_budget() {
        let inv = GuardedInvoker::new(Some(Duration::from_millis(1)));
        let site = InvokeSite::new("Slow", "build_aspect");
        let err = inv
            .invoke(&site, || std::thread::sleep(Duration::from_millis(20)))
            .unwrap_err();
        assert!(matches!(err, InvokeError::OverBudget { budget_ms: 1, .. }));
    }

    #[test]
    fn test_wf011_guarded_ok() {
        let inv = GuardedInvoker::new(Some(Duration::from_secs(5)));
        assert_eq!(inv.invoke(&InvokeSite::new("A", "x"), || 1 + 1), Ok(2));
    }
}
