//! GATT UUID defaults, frame markers and the control-command wire format.
//!
//! The sensor exposes one notify characteristic that streams telemetry
//! frames and one write characteristic that accepts six-byte control frames.

use uuid::Uuid;

use crate::types::CaptureMode;

// ── Characteristics ───────────────────────────────────────────────────────────

/// Default telemetry (notify) characteristic.
pub const DEFAULT_NOTIFY_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xffee5343_0001_4ae5_8fa1_9fafd205e455);

/// Default control (write) characteristic.
pub const DEFAULT_WRITE_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xffee5343_0001_4ae5_8fa2_9fafd205e455);

/// Advertised-name prefix matched when none is configured.
pub const DEFAULT_NAME_PREFIX: &str = "brain";

// ── Telemetry frames ──────────────────────────────────────────────────────────

/// Leading byte shared by both telemetry frame markers.
pub const FRAME_SYNC: u8 = 0xFC;

/// Second marker byte of an EEG frame (`FC FA`).
pub const EEG_MARKER: u8 = 0xFA;

/// Second marker byte of an ECG frame (`FC FB`).
pub const ECG_MARKER: u8 = 0xFB;

/// EEG header length in bytes: marker + 4 header bytes.
pub const EEG_HEADER_LEN: usize = 6;

/// ECG header length in bytes: marker + 6 header bytes.
pub const ECG_HEADER_LEN: usize = 8;

/// Channels in an EEG frame.
pub const EEG_CHANNELS: u32 = 4;

/// Channels in an ECG frame.
pub const ECG_CHANNELS: u32 = 1;

/// Every sample is a 24-bit value.
pub const BYTES_PER_SAMPLE: usize = 3;

/// Shortest payload the strict validity predicate accepts.
pub const MIN_DATA_FRAME_LEN: usize = 7;

// ── Control commands ──────────────────────────────────────────────────────────

/// First byte of every control frame, whatever the mode.
pub const CONTROL_LEAD: u8 = 0xFD;

/// Control header byte sent in EEG mode.
pub const EEG_CONTROL_HEADER: u8 = 0xFC;

/// Control header byte sent in ECG mode.
pub const ECG_CONTROL_HEADER: u8 = 0xFD;

/// Control opcodes understood by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    /// Halt acquisition and return to the idle state.
    Reset = 0x00,
    /// Begin streaming telemetry notifications.
    Start = 0x01,
}

/// Header byte selected by the capture mode.
pub fn control_header(mode: CaptureMode) -> u8 {
    match mode {
        CaptureMode::Ecg => ECG_CONTROL_HEADER,
        CaptureMode::Eeg => EEG_CONTROL_HEADER,
    }
}

/// Encode a control command for the write characteristic.
///
/// ```text
/// byte 0 : 0xFD            (always)
/// byte 1 : mode header     (0xFC = EEG, 0xFD = ECG)
/// byte 2 : 0x00
/// byte 3 : 0x02
/// byte 4 : opcode          (0x00 = reset, 0x01 = start)
/// byte 5 : 0x00
/// ```
///
/// The mode lives in the *second* byte; the first is `0xFD` in both modes.
/// Devices in the field accept this layout, so it is kept as is.
///
/// # Example
///
/// ```
/// # use ble_capture::protocol::{encode_control, ControlOpcode};
/// # use ble_capture::types::CaptureMode;
/// assert_eq!(
///     encode_control(CaptureMode::Eeg, ControlOpcode::Start),
///     [0xFD, 0xFC, 0x00, 0x02, 0x01, 0x00]
/// );
/// ```
pub fn encode_control(mode: CaptureMode, opcode: ControlOpcode) -> [u8; 6] {
    [CONTROL_LEAD, control_header(mode), 0x00, 0x02, opcode as u8, 0x00]
}
