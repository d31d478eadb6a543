//! Rolling per-channel store of decoded EEG samples.
//!
//! [`SampleBuffer`] keeps the most recent `sample_rate × capacity_secs`
//! samples of each of the four EEG channels and hands out sliding windows of
//! the newest samples for downstream analysis. ECG and unrecognised frames
//! are ignored.

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::parse::decode_int24_le;
use crate::protocol::{BYTES_PER_SAMPLE, EEG_CHANNELS, EEG_HEADER_LEN, EEG_MARKER, FRAME_SYNC};

/// Sample rate of the sensor's EEG stream.
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 250;

/// Seconds of history kept per channel.
pub const DEFAULT_CAPACITY_SECS: u32 = 60;

/// Electrode order of the four EEG channels within a sample group.
pub const CHANNEL_LABELS: [&str; EEG_CHANNELS as usize] = ["EEG", "EOG-L", "EOG-R", "M1"];

/// Shorter packets are not buffered.
const MIN_PACKET_LEN: usize = 8;

// ── ByteOrder ─────────────────────────────────────────────────────────────────

/// Byte order of each 24-bit sample on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ByteOrder {
    /// Least significant byte first (what the sensor sends).
    #[default]
    Lsb24,
    Msb24,
}

impl ByteOrder {
    pub fn as_str(self) -> &'static str {
        match self {
            ByteOrder::Lsb24 => "lsb24",
            ByteOrder::Msb24 => "msb24",
        }
    }

    fn decode(self, [b0, b1, b2]: [u8; 3]) -> i32 {
        match self {
            ByteOrder::Lsb24 => decode_int24_le([b0, b1, b2]),
            ByteOrder::Msb24 => decode_int24_le([b2, b1, b0]),
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown byte order {0:?} (expected lsb24 or msb24)")]
pub struct UnknownByteOrder(pub String);

impl FromStr for ByteOrder {
    type Err = UnknownByteOrder;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lsb24" => Ok(ByteOrder::Lsb24),
            "msb24" => Ok(ByteOrder::Msb24),
            _ => Err(UnknownByteOrder(s.to_owned())),
        }
    }
}

// ── SampleBuffer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    pub sample_rate_hz: u32,
    pub capacity_secs: u32,
    pub byte_order: ByteOrder,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            capacity_secs: DEFAULT_CAPACITY_SECS,
            byte_order: ByteOrder::Lsb24,
        }
    }
}

impl BufferConfig {
    /// Samples kept per channel.
    pub fn capacity(&self) -> usize {
        self.sample_rate_hz as usize * self.capacity_secs as usize
    }
}

/// Fixed-capacity ring of EEG samples, one lane per channel.
///
/// All lanes always hold the same number of samples; once full, each new
/// sample group evicts the oldest one.
///
/// ```
/// use ble_capture::buffer::{BufferConfig, SampleBuffer};
///
/// let mut buffer = SampleBuffer::new(BufferConfig::default());
/// let mut packet = vec![0xFC, 0xFA, 0, 0, 0, 0];
/// packet.extend([0x01, 0x00, 0x00].repeat(4)); // one group, every channel = 1
/// assert_eq!(buffer.push_packet(&packet), 1);
/// assert_eq!(buffer.take_window(1), Some(vec![vec![1]; 4]));
/// ```
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    config: BufferConfig,
    lanes: [VecDeque<i32>; EEG_CHANNELS as usize],
}

impl SampleBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity();
        Self {
            config,
            lanes: std::array::from_fn(|_| VecDeque::with_capacity(capacity)),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Samples currently held per channel.
    pub fn len(&self) -> usize {
        self.lanes[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signal time currently held.
    pub fn buffered(&self) -> Duration {
        match self.config.sample_rate_hz {
            0 => Duration::ZERO,
            hz => Duration::from_secs_f64(self.len() as f64 / f64::from(hz)),
        }
    }

    /// Append every complete sample group of an EEG notification and return
    /// how many were appended. Anything that is not an EEG frame of at least
    /// eight bytes is ignored.
    pub fn push_packet(&mut self, packet: &[u8]) -> usize {
        if packet.len() < MIN_PACKET_LEN || packet[..2] != [FRAME_SYNC, EEG_MARKER] {
            return 0;
        }
        let capacity = self.config.capacity();
        let order = self.config.byte_order;
        let groups = packet[EEG_HEADER_LEN..].chunks_exact(self.lanes.len() * BYTES_PER_SAMPLE);
        let appended = groups.len();

        for group in groups {
            for (lane, bytes) in self.lanes.iter_mut().zip(group.chunks_exact(BYTES_PER_SAMPLE)) {
                lane.push_back(order.decode([bytes[0], bytes[1], bytes[2]]));
                while lane.len() > capacity {
                    lane.pop_front();
                }
            }
        }
        appended
    }

    /// The newest `samples` of every channel, oldest first, or `None` while
    /// fewer than that many are buffered.
    pub fn take_window(&self, samples: usize) -> Option<Vec<Vec<i32>>> {
        let held = self.len();
        if held < samples {
            return None;
        }
        Some(
            self.lanes
                .iter()
                .map(|lane| lane.range(held - samples..).copied().collect())
                .collect(),
        )
    }

    pub fn clear(&mut self) {
        self.lanes.iter_mut().for_each(VecDeque::clear);
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}
