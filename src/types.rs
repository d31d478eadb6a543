//! Event, status and state types shared by the session, the codec and the
//! event sink.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

// ── CaptureMode ───────────────────────────────────────────────────────────────

/// Which biosignal the device is asked to stream.
///
/// The mode only selects the header byte of outgoing control frames (see
/// [`crate::protocol::encode_control`]); inbound frames are classified by
/// their own marker regardless of the mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    #[default]
    Eeg,
    Ecg,
}

impl CaptureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureMode::Eeg => "EEG",
            CaptureMode::Ecg => "ECG",
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a mode string is neither `eeg` nor `ecg`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown capture mode {0:?} (expected \"EEG\" or \"ECG\")")]
pub struct UnknownMode(pub String);

impl FromStr for CaptureMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("eeg") {
            Ok(CaptureMode::Eeg)
        } else if s.eq_ignore_ascii_case("ecg") {
            Ok(CaptureMode::Ecg)
        } else {
            Err(UnknownMode(s.to_owned()))
        }
    }
}

// ── FrameType ─────────────────────────────────────────────────────────────────

/// Shape of an inbound notification, identified by its two-byte marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameType {
    #[serde(rename = "EEG")]
    Eeg,
    #[serde(rename = "ECG")]
    Ecg,
    #[serde(rename = "unknown")]
    Unknown,
}

impl FrameType {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::Eeg => "EEG",
            FrameType::Ecg => "ECG",
            FrameType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SampleBatch ───────────────────────────────────────────────────────────────

/// One data event: the accounting for a single BLE notification.
///
/// Serialises with the same field names the capture consumer has always
/// seen (`lastPacketBytes`, `totalBytes`, `samples`, `channels`, `type`,
/// `raw`), so a JSON line per batch is a drop-in feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleBatch {
    /// Byte length of this notification.
    pub last_packet_bytes: u64,
    /// Bytes received so far in the session, this notification included.
    /// Never decreases.
    pub total_bytes: u64,
    /// Samples per channel carried by this notification; `0` for
    /// unrecognised payloads.
    pub samples: u32,
    /// Channel count of the session, pinned by the first recognised frame.
    /// `0` until a frame has been recognised.
    pub channels: u32,
    /// Marker-derived frame shape.
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// The notification payload, absent when the notification was empty.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<u8>>,
}

// ── Status ────────────────────────────────────────────────────────────────────

/// Session lifecycle events, in the fixed vocabulary the consumer matches on.
///
/// [`Status::as_str`] (and `Display`) yields the exact wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    AlreadyRunning,
    Scanning,
    WatcherStartFailed,
    Stopped,
    DeviceNotFound,
    Connecting,
    DeviceOpenFailed,
    InvalidServiceUuid,
    ServiceNotFound,
    NoServices,
    InvalidNotifyUuid,
    NotifyCharacteristicNotFound,
    EnableNotifyFailed,
    InvalidWriteUuid,
    WriteCharacteristicNotFound,
    Subscribing,
    SendingReset,
    SendingStart,
    StartCommandFailed,
    Collecting,
    SendingStop,
    WorkerException,
    BackendInitFailed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::AlreadyRunning => "already running",
            Status::Scanning => "scanning",
            Status::WatcherStartFailed => "watcher start failed",
            Status::Stopped => "stopped",
            Status::DeviceNotFound => "device not found",
            Status::Connecting => "connecting",
            Status::DeviceOpenFailed => "device open failed",
            Status::InvalidServiceUuid => "invalid service UUID",
            Status::ServiceNotFound => "service not found",
            Status::NoServices => "no services",
            Status::InvalidNotifyUuid => "invalid notify UUID",
            Status::NotifyCharacteristicNotFound => "characteristic (notify) not found",
            Status::EnableNotifyFailed => "enable notify failed",
            Status::InvalidWriteUuid => "invalid write UUID",
            Status::WriteCharacteristicNotFound => "characteristic (write) not found",
            Status::Subscribing => "subscribing",
            Status::SendingReset => "sending reset",
            Status::SendingStart => "sending start",
            Status::StartCommandFailed => "start command failed",
            Status::Collecting => "collecting",
            Status::SendingStop => "sending stop",
            Status::WorkerException => "worker exception",
            Status::BackendInitFailed => "backend init failed",
        }
    }

    /// `true` for statuses after which the session emits nothing further.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            Status::AlreadyRunning
                | Status::Scanning
                | Status::WatcherStartFailed
                | Status::Connecting
                | Status::Subscribing
                | Status::SendingReset
                | Status::SendingStart
                | Status::StartCommandFailed
                | Status::Collecting
                | Status::SendingStop
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── SessionState ──────────────────────────────────────────────────────────────

/// Where a session currently is in its scan-through-stop cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SessionState {
    #[default]
    Idle,
    Scanning,
    Connecting,
    ResolvingService,
    ResolvingNotifyCharacteristic,
    EnablingNotify,
    ResolvingWriteCharacteristic,
    Subscribing,
    SendingReset,
    SendingStart,
    Collecting,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    /// A new session may only be started from these states.
    pub fn accepts_start(self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Stopped | SessionState::Failed
        )
    }
}
