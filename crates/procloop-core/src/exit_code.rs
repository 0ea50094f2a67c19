//! Sentinel exit codes.
//!
//! Real exit statuses are small non-negative integers (or a signal number
//! when the child was killed by a signal), so the sentinels sit at the edges
//! of the `i32` range where no real status can collide with them.

/// The child was never started (launch failed or was rejected).
pub const NEVER_STARTED: i32 = i32::MIN;

/// The child reported status 127: the program could not be executed.
pub const EXEC_FAILED: i32 = i32::MIN + 1;

/// The child was force-killed because its pool shut down.
pub const KILLED_ON_SHUTDOWN: i32 = i32::MAX - 1;

/// The exit status could not be collected.
pub const UNKNOWN: i32 = i32::MAX;

/// Shell convention for "command not found / not executable".
pub(crate) const EXEC_FAILED_STATUS: i32 = 127;

/// True for any of the sentinel values above.
pub fn is_sentinel(code: i32) -> bool {
    matches!(
        code,
        NEVER_STARTED | EXEC_FAILED | KILLED_ON_SHUTDOWN | UNKNOWN
    )
}

/// Short name for a sentinel value.
pub fn describe(code: i32) -> Option<&'static str> {
    match code {
        NEVER_STARTED => Some("never started"),
        EXEC_FAILED => Some("exec failed"),
        KILLED_ON_SHUTDOWN => Some("killed on shutdown"),
        UNKNOWN => Some("unknown"),
        _ => None,
    }
}
