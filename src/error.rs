//! Error taxonomy for the call session, relay and registry.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::engine::{ChannelId, Facet, Status};
use crate::session::SessionState;

/// One engine call issued by the session, named for error reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Init,
    RegisterObserver,
    GetVersion,
    CreateChannel,
    GetCodec,
    SetSendCodec,
    NumPlayoutDevices,
    NumRecordingDevices,
    PlayoutDeviceName,
    RecordingDeviceName,
    SetPlayoutDevice,
    SetRecordingDevice,
    SetVadStatus,
    SetAgcStatus,
    SetEcStatus,
    SetNsStatus,
    SetRxAgcStatus,
    SetRxNsStatus,
    StartReceive,
    StartPlayout,
    StartSend,
    StartRecordingMicrophone,
    StartRecordingPlayout,
    GetMicVolume,
    StopRecordingMicrophone,
    StopRecordingPlayout,
    StopSend,
    StopPlayout,
    StopReceive,
    DeregisterTransport,
    DeleteChannel,
    DeregisterObserver,
    Terminate,
    DeleteEngine,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A teardown step that returned a non-zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFailure {
    pub step: Step,
    pub code: Status,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.step, self.code)
    }
}

/// Errors raised by the session lifecycle and its collaborators.
#[derive(Error, Debug)]
pub enum VoeError {
    #[error("Facet {0} is unavailable")]
    UnavailableFacet(Facet),

    #[error("Network facet rejected transport registration for channel {channel} (status {code})")]
    RegistrationFailed { channel: ChannelId, code: Status },

    #[error("Failed to open receive sockets on port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("Invalid send destination {address}:{port}: {reason}")]
    InvalidDestination {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("{step} failed with status {code}{}", engine_detail(.last_error))]
    FacetCallFailed {
        step: Step,
        code: Status,
        /// Engine's last error code at the time of the failure, if it set one
        last_error: Option<Status>,
    },

    #[error("Teardown finished with failed steps: {}", join_failures(.steps))]
    TeardownPartialFailure { steps: Vec<StepFailure> },

    #[error("{operation} is not allowed in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Invalid operator input: {reason}")]
    Input { reason: String },
}

impl VoeError {
    /// Status code carried by the error, if it wraps an engine call.
    pub fn status(&self) -> Option<Status> {
        match self {
            VoeError::RegistrationFailed { code, .. } | VoeError::FacetCallFailed { code, .. } => {
                Some(*code)
            }
            _ => None,
        }
    }

    /// Attach the engine's last error code to a failed engine call.
    /// Zero means the engine set none; other errors pass through.
    pub fn with_last_error(self, engine_code: Status) -> Self {
        match self {
            VoeError::FacetCallFailed {
                step,
                code,
                last_error: None,
            } if engine_code != 0 => VoeError::FacetCallFailed {
                step,
                code,
                last_error: Some(engine_code),
            },
            other => other,
        }
    }
}

fn engine_detail(last_error: &Option<Status>) -> String {
    match last_error {
        Some(code) => format!(" (engine error {})", code),
        None => String::new(),
    }
}

fn join_failures(steps: &[StepFailure]) -> String {
    steps
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert an engine status into a result: zero is success.
pub fn check(step: Step, status: Status) -> Result<(), VoeError> {
    if status == 0 {
        Ok(())
    } else {
        Err(VoeError::FacetCallFailed {
            step,
            code: status,
            last_error: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_zero_is_success() {
        assert!(check(Step::Init, 0).is_ok());
    }

    #[test]
    fn test_check_non_zero_names_step() {
        let err = check(Step::StartReceive, -1).unwrap_err();
        assert_eq!(err.status(), Some(-1));
        assert_eq!(err.to_string(), "StartReceive failed with status -1");
    }

    #[test]
    fn test_engine_code_is_reported() {
        let err = check(Step::StartSend, -1).unwrap_err().with_last_error(8104);
        assert!(matches!(
            err,
            VoeError::FacetCallFailed {
                step: Step::StartSend,
                code: -1,
                last_error: Some(8104)
            }
        ));
        assert_eq!(
            err.to_string(),
            "StartSend failed with status -1 (engine error 8104)"
        );

        // No engine code, nothing attached
        let err = check(Step::StartSend, -1).unwrap_err().with_last_error(0);
        assert_eq!(err.to_string(), "StartSend failed with status -1");
    }

    #[test]
    fn test_teardown_failure_lists_steps() {
        let err = VoeError::TeardownPartialFailure {
            steps: vec![
                StepFailure { step: Step::StopSend, code: -1 },
                StepFailure { step: Step::DeleteChannel, code: 8002 },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("StopSend (status -1)"));
        assert!(text.contains("DeleteChannel (status 8002)"));
    }
}
