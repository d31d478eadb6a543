//! Decoders for telemetry notification payloads.
//!
//! All functions here are pure and allocation-light; they run on the
//! session's notification path and from offline tools alike.
//!
//! # Frame layout
//!
//! | Marker | Shape | Header | Body stride |
//! |---|---|---|---|
//! | `FC FA` | EEG, 4 channels | 6 bytes | 12 bytes (4 × 24-bit) |
//! | `FC FB` | ECG, 1 channel  | 8 bytes | 3 bytes (1 × 24-bit) |
//!
//! # Live vs. strict rule
//!
//! [`decode`] is the rule applied to every live notification: it only looks
//! at the marker and the length, so short or zero-filled frames still count
//! (with whatever sample count their length implies). [`is_data_frame`] is
//! the stricter predicate for offline validation; it additionally drops
//! frames shorter than [`MIN_DATA_FRAME_LEN`] and keep-alive frames whose
//! body is all zeros.

use crate::protocol::{
    BYTES_PER_SAMPLE, ECG_CHANNELS, ECG_HEADER_LEN, ECG_MARKER, EEG_CHANNELS, EEG_HEADER_LEN,
    EEG_MARKER, FRAME_SYNC, MIN_DATA_FRAME_LEN,
};
use crate::types::FrameType;

/// Result of classifying one notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decoded {
    /// The payload carries a known marker.
    Frame {
        frame_type: FrameType,
        samples: u32,
        channels: u32,
    },
    /// Unknown marker or a payload shorter than two bytes.
    Unrecognized,
}

impl Decoded {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Decoded::Frame { frame_type, .. } => *frame_type,
            Decoded::Unrecognized => FrameType::Unknown,
        }
    }
}

/// Frame geometry for a marker-identified payload.
struct Shape {
    frame_type: FrameType,
    header_len: usize,
    channels: u32,
}

fn shape_of(payload: &[u8]) -> Option<Shape> {
    match payload {
        [FRAME_SYNC, EEG_MARKER, ..] => Some(Shape {
            frame_type: FrameType::Eeg,
            header_len: EEG_HEADER_LEN,
            channels: EEG_CHANNELS,
        }),
        [FRAME_SYNC, ECG_MARKER, ..] => Some(Shape {
            frame_type: FrameType::Ecg,
            header_len: ECG_HEADER_LEN,
            channels: ECG_CHANNELS,
        }),
        _ => None,
    }
}

impl Shape {
    fn body<'a>(&self, payload: &'a [u8]) -> &'a [u8] {
        payload.get(self.header_len..).unwrap_or(&[])
    }

    fn stride(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    fn samples(&self, payload: &[u8]) -> u32 {
        (self.body(payload).len() / self.stride()) as u32
    }
}

/// Classify a notification payload and count its samples.
///
/// The body is everything after the header; a payload shorter than its
/// header has an empty body and therefore zero samples.
///
/// ```
/// # use ble_capture::parse::{decode, Decoded};
/// # use ble_capture::types::FrameType;
/// let mut eeg = vec![0xFC, 0xFA, 0, 0, 0, 0];
/// eeg.extend_from_slice(&[1; 24]);
/// assert_eq!(
///     decode(&eeg),
///     Decoded::Frame { frame_type: FrameType::Eeg, samples: 2, channels: 4 }
/// );
/// assert_eq!(decode(&[0x01, 0x02, 0x03]), Decoded::Unrecognized);
/// ```
pub fn decode(payload: &[u8]) -> Decoded {
    match shape_of(payload) {
        Some(shape) => Decoded::Frame {
            frame_type: shape.frame_type,
            samples: shape.samples(payload),
            channels: shape.channels,
        },
        None => Decoded::Unrecognized,
    }
}

/// Strict validity predicate for offline checks.
///
/// Accepts only payloads that are at least [`MIN_DATA_FRAME_LEN`] bytes,
/// carry a known marker, have a non-empty body that is not all zeros, and
/// hold at least one complete sample.
pub fn is_data_frame(payload: &[u8]) -> bool {
    if payload.len() < MIN_DATA_FRAME_LEN {
        return false;
    }
    let Some(shape) = shape_of(payload) else {
        return false;
    };
    let body = shape.body(payload);
    if body.iter().all(|&b| b == 0) {
        return false;
    }
    shape.samples(payload) > 0
}

/// Sign-extend a 24-bit little-endian integer.
pub fn decode_int24_le(bytes: [u8; 3]) -> i32 {
    // Place the value in the top three bytes, then arithmetic-shift back.
    i32::from_le_bytes([0, bytes[0], bytes[1], bytes[2]]) >> 8
}

/// Split the body of a recognised frame into per-channel sample vectors.
///
/// Samples are channel-interleaved 24-bit little-endian signed integers:
/// `[ch0 s0][ch1 s0]…[chN s0][ch0 s1]…`. A trailing partial group is
/// ignored. Returns `None` for unrecognised payloads.
pub fn decode_samples(payload: &[u8]) -> Option<Vec<Vec<i32>>> {
    let shape = shape_of(payload)?;
    let channels = shape.channels as usize;
    let groups = shape.body(payload).chunks_exact(shape.stride());

    let mut out: Vec<Vec<i32>> = (0..channels)
        .map(|_| Vec::with_capacity(groups.len()))
        .collect();
    for group in groups {
        for (ch, sample) in group.chunks_exact(BYTES_PER_SAMPLE).enumerate() {
            out[ch].push(decode_int24_le([sample[0], sample[1], sample[2]]));
        }
    }
    Some(out)
}
