//! Turns how a worker died into the error the interpreter keeps for the rest of its life.

use crate::error::BridgeError;
use crate::supervisor::ExitStatus;

/// The signal the OS sends when a process exceeds its CPU-time limit.
#[cfg(unix)]
pub fn cpu_limit_signal() -> Option<i32> {
    Some(nix::sys::signal::Signal::SIGXCPU as i32)
}

#[cfg(not(unix))]
pub fn cpu_limit_signal() -> Option<i32> {
    None
}

/// Classify a reaped worker. `None` means the status was never obtained.
pub fn classify(status: Option<ExitStatus>) -> BridgeError {
    let Some(status) = status else {
        return BridgeError::ProcessGone;
    };

    match (status.signaled, status.signal, status.exit_code) {
        (true, Some(signal), _) if Some(signal) == cpu_limit_signal() => {
            BridgeError::ResourceLimitExceeded
        }
        (true, Some(signal), _) => BridgeError::KilledBySignal(signal),
        (false, _, Some(code)) => BridgeError::ExitedWithCode(code),
        _ => BridgeError::ProcessGone,
    }
}
