//! Consistency faults.

use log::error;
use pipemgr_hw::PipeError;

/// Reports a broken invariant.
///
/// Logs with full context and asserts in debug builds. Release builds
/// surface it to the caller as [`PipeError::Unexpected`].
#[track_caller]
pub fn consistency_fault(context: impl Into<String>) -> PipeError {
    let context = context.into();
    report_fault(&context);
    PipeError::unexpected(context)
}

/// Logs and asserts a broken invariant found where no caller can take an
/// error, such as while rolling back.
#[track_caller]
pub fn report_fault(context: &str) {
    error!("consistency fault: {}", context);
    debug_assert!(false, "consistency fault: {}", context);
}
