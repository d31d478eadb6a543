//! # ble-capture
//!
//! Live telemetry capture from EEG and ECG biosignal sensors over Bluetooth
//! Low Energy.
//!
//! A [`SessionController`](capture_client::SessionController) drives one
//! session at a time: it scans for a device by advertised-name prefix,
//! connects, resolves the notify and write characteristics, subscribes,
//! sends the reset/start control frames, and streams every notification to
//! the consumer as a [`SampleBatch`](types::SampleBatch). Lifecycle is
//! reported as a sequence of [`Status`](types::Status) events.
//!
//! ## Quick start
//!
//! ```no_run
//! use ble_capture::prelude::*;
//!
//! let mut controller = SessionController::new();
//! let started = controller.start(
//!     CaptureOptions { mode: CaptureMode::Ecg, ..Default::default() },
//!     |status| eprintln!("[{status}]"),
//!     |batch| println!("{} {} samples", batch.frame_type, batch.samples),
//! );
//! assert!(started);
//!
//! // … later, from the same thread:
//! controller.stop();
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the commonly needed types |
//! | [`capture_client`] | Options, the session state machine, start/stop |
//! | [`types`] | Status, state, mode and data event types |
//! | [`protocol`] | Default UUIDs, frame markers, control-frame encoder |
//! | [`parse`] | Notification decoders and the strict validity predicate |
//! | [`buffer`] | Rolling per-channel EEG sample store and windows |
//! | [`selector`] | Advertised-name matching |
//! | [`events`] | Bounded status/data delivery to consumer callbacks |
//! | [`backend`] | Traits abstracting the BLE stack |
//! | [`btleplug_backend`] | The system BLE stack via btleplug |
//! | [`error`] | Error taxonomy |

pub mod backend;
pub mod btleplug_backend;
pub mod buffer;
pub mod capture_client;
pub mod error;
pub mod events;
pub mod parse;
pub mod protocol;
pub mod selector;
pub mod types;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Session ───────────────────────────────────────────────────────────────
    pub use crate::capture_client::{CaptureOptions, SessionController, Timings};

    // ── Events and data types ─────────────────────────────────────────────────
    pub use crate::types::{CaptureMode, FrameType, SampleBatch, SessionState, Status};

    // ── Codec ─────────────────────────────────────────────────────────────────
    pub use crate::buffer::{BufferConfig, ByteOrder, SampleBuffer};
    pub use crate::parse::{decode, decode_samples, is_data_frame, Decoded};
    pub use crate::protocol::{encode_control, ControlOpcode};

    // ── Errors ────────────────────────────────────────────────────────────────
    pub use crate::error::{BackendError, CaptureError};
}
