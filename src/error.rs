//! Error types for the capture session and its BLE backend.
//!
//! Every [`CaptureError`] maps to exactly one terminal [`Status`]; the
//! session reports that status and never lets the error escape the worker.

use thiserror::Error;

use crate::types::Status;

/// Failures raised by a [`crate::backend`] implementation.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error(transparent)]
    Btleplug(#[from] btleplug::Error),
    #[error("no Bluetooth adapter found")]
    NoAdapter,
    #[error("device {0} is not known to the adapter")]
    UnknownDevice(String),
    #[error("characteristic {0} is not exposed by the device")]
    MissingCharacteristic(uuid::Uuid),
    #[error("GATT operation failed: {0}")]
    Gatt(String),
}

/// Why a capture session ended without being asked to stop.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A configured UUID string could not be parsed.
    #[error("{status}: {value:?}")]
    Configuration {
        status: Status,
        value: String,
        #[source]
        source: uuid::Error,
    },
    /// The device, a service or a characteristic could not be found.
    #[error("{0}")]
    Discovery(Status),
    /// The device refused a GATT operation the session cannot proceed without.
    #[error("{status}")]
    Protocol {
        status: Status,
        #[source]
        source: BackendError,
    },
    /// The radio stack could not be brought up.
    #[error("backend initialisation failed")]
    Backend(#[source] BackendError),
    /// Anything else.
    #[error("unexpected failure: {0}")]
    Unclassified(String),
}

impl CaptureError {
    /// The status reported to the consumer for this failure.
    pub fn status(&self) -> Status {
        match self {
            CaptureError::Configuration { status, .. } => *status,
            CaptureError::Discovery(status) => *status,
            CaptureError::Protocol { status, .. } => *status,
            CaptureError::Backend(_) => Status::BackendInitFailed,
            CaptureError::Unclassified(_) => Status::WorkerException,
        }
    }

    pub(crate) fn configuration(status: Status, value: &str, source: uuid::Error) -> Self {
        CaptureError::Configuration {
            status,
            value: value.to_owned(),
            source,
        }
    }
}

impl From<BackendError> for CaptureError {
    fn from(e: BackendError) -> Self {
        CaptureError::Unclassified(e.to_string())
    }
}
