//! Deferred execution on an owning task context.

/// Handle to the task context that owns a protocol component.
///
/// Components never call back into the upper layer from interrupt level.
/// Instead they request a deferred pass with [`schedule`], and the platform
/// guarantees that the component's `process()` entry point runs on the
/// owning context soon afterwards. Multiple pending requests may be
/// coalesced into a single `process()` call.
///
/// [`schedule`]: ExecutionContext::schedule
pub trait ExecutionContext {
    fn schedule(&self);
}
