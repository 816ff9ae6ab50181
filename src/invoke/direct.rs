//! WF-011: Direct invocation — no guard, panics propagate.

use super::{InvokeError, InvokeSite, Invoker};

/// Calls aspect code in place. Used by tests and trusted in-process aspects.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectInvoker;

impl Invoker for DirectInvoker {
    fn invoke<T>(&self, site: &InvokeSite<'_>, f: impl FnOnce() -> T) -> Result<T, InvokeError> {
        let _span = tracing::trace_span!("invoke", aspect = site.aspect, entry = site.entry).entered();
        Ok(f())
    }
}
