//! Execution-context predicates.
use crate::{error::BadContextError, KernelTraits};

/// If the current context is not a task context, return `Err(BadContext)`.
pub(super) fn expect_task_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}

/// If the current context is not waitable, return `Err(BadContext)`.
///
/// Only a task context with CPU Lock inactive on entry may suspend the
/// caller. The caller is expected to have just acquired CPU Lock itself, so
/// this checks the context kind only.
pub(super) fn expect_waitable_context<Traits: KernelTraits>() -> Result<(), BadContextError> {
    if !Traits::is_task_context() {
        Err(BadContextError::BadContext)
    } else {
        Ok(())
    }
}
