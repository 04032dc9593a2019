//! Termination analysis for worker processes.
//!
//! Turns a raw process exit status into a [`TerminationReason`] that can be
//! logged and used to decide whether the worker finished cleanly.

use nix::sys::signal::Signal;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Reason why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal it did not handle.
    Signaled { signal: Signal, core_dumped: bool },
    /// Killed by a signal number nix does not know.
    UnknownSignal(i32),
    /// Forcibly stopped after exceeding its deadline.
    TimedOut,
    /// Forcibly stopped because the run was cancelled.
    Cancelled,
    /// The exit status could not be obtained.
    Unknown,
}

impl TerminationReason {
    /// Only a voluntary exit with code 0 counts as success.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the orchestrator itself ended the process.
    pub fn is_forced(&self) -> bool {
        matches!(self, Self::TimedOut | Self::Cancelled)
    }

    /// Exit code when the process exited voluntarily.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Number of the signal that killed the process, if one did.
    pub fn signal(&self) -> Option<i32> {
        match self {
            Self::Signaled { signal, .. } => Some(*signal as i32),
            Self::UnknownSignal(sig) => Some(*sig),
            _ => None,
        }
    }

    pub fn signal_name(&self) -> Option<&'static str> {
        match self {
            Self::Signaled { signal, .. } => Some(signal.as_str()),
            _ => None,
        }
    }

    /// Short machine-friendly label used in JSON records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exited(_) => "exited",
            Self::Signaled { .. } | Self::UnknownSignal(_) => "signaled",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Exited(code) => format!("exited with code {}", code),
            Self::Signaled {
                signal,
                core_dumped: true,
            } => format!("killed by signal {} (core dumped)", signal.as_str()),
            Self::Signaled { signal, .. } => format!("killed by signal {}", signal.as_str()),
            Self::UnknownSignal(sig) => format!("killed by signal {}", sig),
            Self::TimedOut => "stopped after exceeding its deadline".to_string(),
            Self::Cancelled => "stopped because the run was cancelled".to_string(),
            Self::Unknown => "unknown exit status".to_string(),
        }
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description())
    }
}

/// Analyze an [`ExitStatus`] to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }

    match status.signal() {
        Some(raw) => match Signal::try_from(raw) {
            Ok(signal) => TerminationReason::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            },
            Err(_) => TerminationReason::UnknownSignal(raw),
        },
        None => TerminationReason::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Raw wait(2) encodings: exit code in bits 8..16, signal in bits 0..7.
    fn exited(code: i32) -> ExitStatus {
        ExitStatus::from_raw(code << 8)
    }

    fn signaled(sig: Signal) -> ExitStatus {
        ExitStatus::from_raw(sig as i32)
    }

    #[test]
    fn test_clean_exit() {
        let reason = analyze_exit_status(exited(0));
        assert_eq!(reason, TerminationReason::Exited(0));
        assert!(reason.is_success());
        assert_eq!(reason.code(), Some(0));
    }

    #[test]
    fn test_nonzero_exit_is_not_success() {
        let reason = analyze_exit_status(exited(3));
        assert_eq!(reason, TerminationReason::Exited(3));
        assert!(!reason.is_success());
        assert_eq!(reason.to_string(), "exited with code 3");
    }

    #[test]
    fn test_signal_termination() {
        let reason = analyze_exit_status(signaled(Signal::SIGKILL));
        assert_eq!(
            reason,
            TerminationReason::Signaled {
                signal: Signal::SIGKILL,
                core_dumped: false
            }
        );
        assert!(!reason.is_success());
        assert_eq!(reason.code(), None);
        assert!(reason.description().contains("SIGKILL"));
        assert_eq!(reason.kind(), "signaled");
    }

    #[test]
    fn test_core_dump_flag() {
        let status = ExitStatus::from_raw(Signal::SIGSEGV as i32 | 0x80);
        let reason = analyze_exit_status(status);
        assert!(reason.description().contains("core dumped"));
    }

    #[test]
    fn test_forced_reasons() {
        assert!(TerminationReason::TimedOut.is_forced());
        assert!(TerminationReason::Cancelled.is_forced());
        assert!(!TerminationReason::TimedOut.is_success());
        assert!(!TerminationReason::Exited(0).is_forced());
        assert_eq!(TerminationReason::TimedOut.kind(), "timed_out");
    }
}
