//! Error types for the replay pipeline.
//!
//! Every failure is classified into one of four [`ErrorCategory`] values so
//! callers can decide mechanically between "log and continue" and "tear down".

use std::fmt;

use once_cell::sync::OnceCell;
use thiserror::Error;

/// Failure reported by a device collaborator for a single call.
///
/// Vendor SDKs report status codes rather than rich errors; `code` carries the
/// raw status so operators can look it up in the vendor documentation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("device status {code:#010x}: {message}")]
pub struct DeviceError {
    pub code: i32,
    pub message: String,
}

impl DeviceError {
    pub fn new<S: Into<String>>(code: i32, message: S) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Result type returned by device and decode collaborators.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum Error {
    /// No device exists at the requested index.
    #[error("Device not found at index {index} ({available} available)")]
    DeviceNotFound { index: usize, available: usize },

    /// A device call was rejected while configuring an adapter.
    ///
    /// `call` names the capability that failed so the operator can identify it.
    #[error("Device call {call} failed: {source}")]
    DeviceCall {
        call: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A per-frame device or decoder call failed while the pipeline was running.
    ///
    /// Unlike [`Error::DeviceCall`] this is not a setup fault: the adapter was
    /// already streaming when the collaborator broke its contract.
    #[error("Device call {call} failed while running: {source}")]
    DeviceFault {
        call: &'static str,
        #[source]
        source: DeviceError,
    },

    /// A canonical pixel format has no mapping to the requested native layout.
    #[error("Unsupported pixel format mapping: {0}")]
    UnsupportedFormat(String),

    /// Configuration parameters are invalid.
    ///
    /// This can occur when builder validation fails or conflicting options are set.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The audio preroll barrier was not signalled in time.
    #[error("Audio preroll did not complete within {0:?}")]
    PrerollTimeout(std::time::Duration),

    /// The media source could not be opened or is missing a required stream.
    #[error("Failed to open media source: {0}")]
    SourceOpen(String),

    /// The other end of a hand-off queue has been torn down.
    #[error("Peer died: {0}")]
    PeerDeath(String),

    /// A fixed pipeline assumption was broken at runtime.
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Frame data is invalid or inconsistent with its declared geometry.
    #[error("Invalid frame data: {0}")]
    InvalidFrame(String),

}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Setup failed; the adapter never reaches a running state.
    Configuration,
    /// A queue peer was torn down; no recovery is possible.
    PeerDeath,
    /// Momentary hardware condition; logged and absorbed.
    Transient,
    /// A fixed assumption was broken; continuing would corrupt output.
    ContractViolation,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Configuration => "configuration",
            ErrorCategory::PeerDeath => "peer-death",
            ErrorCategory::Transient => "transient",
            ErrorCategory::ContractViolation => "contract-violation",
        };
        f.write_str(name)
    }
}

impl Error {
    pub(crate) fn device(call: &'static str, source: DeviceError) -> Self {
        Error::DeviceCall { call, source }
    }

    pub(crate) fn device_fault(call: &'static str, source: DeviceError) -> Self {
        Error::DeviceFault { call, source }
    }

    /// Returns the category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::DeviceNotFound { .. }
            | Error::DeviceCall { .. }
            | Error::UnsupportedFormat(_)
            | Error::InvalidConfiguration(_)
            | Error::PrerollTimeout(_)
            | Error::SourceOpen(_) => ErrorCategory::Configuration,
            Error::PeerDeath(_) => ErrorCategory::PeerDeath,
            Error::DeviceFault { .. } | Error::ContractViolation(_) | Error::InvalidFrame(_) => {
                ErrorCategory::ContractViolation
            }
        }
    }

    /// Every [`Error`] value is fatal to the adapter or step that raised it.
    ///
    /// Transient conditions never become an `Error`; they are reported as
    /// [`TransientCondition`] and logged.
    pub fn is_fatal(&self) -> bool {
        self.category() != ErrorCategory::Transient
    }
}

/// Recoverable hardware conditions. These are logged and counted, never escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientCondition {
    DisplayedLate,
    Dropped,
    Flushed,
    NoInputSignal,
    NoContentAvailable,
}

impl TransientCondition {
    pub fn category(self) -> ErrorCategory {
        ErrorCategory::Transient
    }
}

impl fmt::Display for TransientCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TransientCondition::DisplayedLate => "frame displayed late (running too slow)",
            TransientCondition::Dropped => "frame dropped",
            TransientCondition::Flushed => "frame flushed",
            TransientCondition::NoInputSignal => "no input signal",
            TransientCondition::NoContentAvailable => "no content available",
        };
        f.write_str(text)
    }
}

/// First-fault-wins latch for errors raised inside device callbacks.
///
/// Device callbacks cannot propagate a `Result` back to the application, so the
/// observer records the fault here and goes inert. The owning adapter exposes it
/// through `fault()` / `check()`.
#[derive(Debug, Default)]
pub(crate) struct FaultLatch {
    fault: OnceCell<Error>,
}

impl FaultLatch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records `err` if no fault was recorded before. Returns true if it was stored.
    pub(crate) fn latch(&self, context: &str, err: Error) -> bool {
        tracing::error!(%context, category = %err.category(), "{err}");
        self.fault.set(err).is_ok()
    }

    pub(crate) fn is_tripped(&self) -> bool {
        self.fault.get().is_some()
    }

    pub(crate) fn get(&self) -> Option<&Error> {
        self.fault.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(
            Error::DeviceNotFound {
                index: 3,
                available: 1
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::device("EnableVideoOutput", DeviceError::new(-1, "busy")).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            Error::PeerDeath("consumer dead".into()).category(),
            ErrorCategory::PeerDeath
        );
        assert_eq!(
            Error::ContractViolation("need 48khz".into()).category(),
            ErrorCategory::ContractViolation
        );
        assert_eq!(
            TransientCondition::Dropped.category(),
            ErrorCategory::Transient
        );
    }

    #[test]
    fn test_device_call_message_names_call() {
        let err = Error::device("EnableAudioOutput", DeviceError::new(0x8000_4005u32 as i32, "fail"));
        let msg = err.to_string();
        assert!(msg.contains("EnableAudioOutput"), "{msg}");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_runtime_device_failure_is_not_a_setup_fault() {
        let err = Error::device_fault("schedule_video_frame", DeviceError::new(-1, "rejected"));
        assert_eq!(err.category(), ErrorCategory::ContractViolation);
        assert!(err.to_string().contains("schedule_video_frame"), "{err}");
        assert!(err.to_string().contains("while running"), "{err}");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_fault_latch_first_wins() {
        let latch = FaultLatch::new();
        assert!(!latch.is_tripped());
        assert!(latch.latch("test", Error::PeerDeath("first".into())));
        assert!(!latch.latch("test", Error::ContractViolation("second".into())));
        match latch.get() {
            Some(Error::PeerDeath(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected fault: {other:?}"),
        }
    }

    #[test]
    fn test_fault_latch_keeps_one_fault_across_threads() {
        let latch = std::sync::Arc::new(FaultLatch::new());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let latch = latch.clone();
                std::thread::spawn(move || latch.latch("worker", Error::PeerDeath(format!("{i}"))))
            })
            .collect();
        let stored = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(stored, 1);
        assert!(matches!(latch.get(), Some(Error::PeerDeath(_))));
    }
}
