// src/error.rs
//
// =============================================================================
// SUNBENCH: FAULT TAXONOMY
// =============================================================================
//
// Every fault the dispatch engine can observe. Faults are caught at the
// nearest task or phase boundary and turned into a log event on the bus;
// none of them may take down the router, manager, worker or sender loops.

use crate::instruments::InstrumentKind;
use crate::logs::Severity;
use thiserror::Error;

pub type LabResult<T> = std::result::Result<T, LabError>;

#[derive(Error, Debug)]
pub enum LabError {
    /// Payload failed to deserialize or has the wrong shape.
    #[error("Malformed message on '{topic}': {reason}")]
    MalformedMessage { topic: String, reason: String },

    /// Admission refusal. Reported, never an error state.
    #[error("Backend busy")]
    Busy,

    #[error("Unable to connect to {kind} at '{address}': {reason}")]
    InstrumentConnect {
        kind: InstrumentKind,
        address: String,
        reason: String,
    },

    /// I/O fault on an already open handle.
    #[error("{kind} fault: {reason}")]
    Instrument { kind: InstrumentKind, reason: String },

    #[error("{kind} at '{address}' is held by another context")]
    AddressInUse {
        kind: InstrumentKind,
        address: String,
    },

    #[error("Aborted by user")]
    UserAbort,

    #[error("DAQ not ready: {0}")]
    DaqNotReady(String),

    #[error(transparent)]
    Unhandled(#[from] anyhow::Error),
}

impl LabError {
    pub fn connect(kind: InstrumentKind, address: &str, reason: impl ToString) -> Self {
        LabError::InstrumentConnect {
            kind,
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn instrument(kind: InstrumentKind, reason: impl ToString) -> Self {
        LabError::Instrument {
            kind,
            reason: reason.to_string(),
        }
    }

    /// Interruption and a missing DAQ both short-circuit a run without being
    /// an error state.
    pub fn is_abort(&self) -> bool {
        matches!(self, LabError::UserAbort | LabError::DaqNotReady(_))
    }

    /// Severity used when this fault is reported on the bus.
    pub fn severity(&self) -> Severity {
        match self {
            LabError::UserAbort => Severity::Info,
            LabError::Busy | LabError::DaqNotReady(_) | LabError::MalformedMessage { .. } => {
                Severity::Warning
            }
            _ => Severity::Error,
        }
    }
}

impl From<serde_json::Error> for LabError {
    fn from(e: serde_json::Error) -> Self {
        LabError::Unhandled(e.into())
    }
}
