//! Exit status contract between `winecage` and its callers.
//!
//! Scripts branch on these codes instead of parsing diagnostics.

/// The target program succeeded.
pub const SUCCESS: i32 = 0;

/// A probe inside the sandbox found a requested path that should not have
/// been visible. Produced by the target, passed through untouched.
pub const PATH_EXPOSED: i32 = 2;

/// Network access was required but not granted. Produced by a layer that
/// checks for the missing `--network` intent, never by the supervisor.
pub const NETWORK_DISABLED: i32 = 4;

/// A nested display never received input before the target's own timeout.
pub const DISPLAY_TIMEOUT: i32 = 5;

/// Base for "killed by signal N" (`128 + N`).
pub const SIGNAL_BASE: i32 = 128;

/// Highest signal number the backend reports as `128 + N`.
const MAX_SIGNAL: i32 = 64;

/// Configuration or unexpected I/O failure inside `winecage` itself.
pub const GENERAL_FAILURE: i32 = 1;

/// Contradictory or malformed command-line intents (sysexits `EX_USAGE`).
pub const USAGE_ERROR: i32 = 64;

/// A path that had to be exposed is missing (sysexits `EX_NOINPUT`).
pub const MISSING_PATH: i32 = 66;

/// A nested display or audio endpoint never became ready (`EX_UNAVAILABLE`).
pub const SERVICE_UNAVAILABLE: i32 = 69;

/// The sandbox backend binary is missing (shell "command not found").
pub const BACKEND_UNAVAILABLE: i32 = 127;

/// Exit code for a process killed by `signal`.
pub fn from_signal(signal: i32) -> i32 {
    SIGNAL_BASE + signal
}

/// Signal number encoded in a `128 + N` exit code, if any.
pub fn signal_from_code(code: i32) -> Option<i32> {
    let signal = code - SIGNAL_BASE;
    (1..=MAX_SIGNAL).contains(&signal).then_some(signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_codes() {
        assert_eq!(from_signal(9), 137);
        assert_eq!(signal_from_code(137), Some(9));
        assert_eq!(signal_from_code(130), Some(2));
    }

    #[test]
    fn test_plain_codes_are_not_signals() {
        assert_eq!(signal_from_code(SUCCESS), None);
        assert_eq!(signal_from_code(DISPLAY_TIMEOUT), None);
        assert_eq!(signal_from_code(SIGNAL_BASE), None);
        assert_eq!(signal_from_code(255), None);
    }
}
