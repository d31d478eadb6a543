//! Ordered, bounded delivery of session events to the consumer's callbacks.
//!
//! The session worker never calls consumer code directly. It pushes owned
//! [`Status`] and [`SampleBatch`] values into two bounded tokio channels; one
//! dispatcher thread per channel drains it and invokes whichever callback is
//! currently registered.
//!
//! | Channel | Capacity | When full |
//! |---|---|---|
//! | status | [`STATUS_CAPACITY`] | producer waits |
//! | data   | [`DATA_CAPACITY`]   | producer waits |
//!
//! Nothing is coalesced or dropped: a slow consumer slows the session down
//! instead of losing samples. The producer awaits free capacity, so the
//! worker's runtime keeps driving its other tasks meanwhile.
//!
//! A sink belongs to exactly one session. Dropping it closes both channels
//! and returns only after every queued event has been delivered, so events
//! of one session can never reach the callbacks of the next.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use log::{debug, warn};
use tokio::sync::mpsc::{self, error::TrySendError, Receiver, Sender};

use crate::types::{SampleBatch, Status};

/// Status channel depth. Status events are rare; the bound only guards
/// against a stalled consumer.
pub const STATUS_CAPACITY: usize = 64;

/// Data channel depth, in batches (one per BLE notification).
pub const DATA_CAPACITY: usize = 256;

pub type StatusCallback = Box<dyn FnMut(Status) + Send>;
pub type DataCallback = Box<dyn FnMut(SampleBatch) + Send>;

type Slot<T> = Arc<Mutex<Option<Box<dyn FnMut(T) + Send>>>>;

fn lock<T>(slot: &Mutex<T>) -> MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Emitter ───────────────────────────────────────────────────────────────────

/// Producer half handed to the session worker.
#[derive(Clone)]
pub struct Emitter {
    status: Sender<Status>,
    data: Sender<SampleBatch>,
}

impl Emitter {
    /// Queue a status event, waiting while the status channel is full.
    pub async fn status(&self, status: Status) {
        debug!("status: {status}");
        if self.status.send(status).await.is_err() {
            warn!("status {status:?} not delivered: event sink closed");
        }
    }

    /// Queue a data event, waiting while the data channel is full.
    pub async fn data(&self, batch: SampleBatch) {
        if self.data.send(batch).await.is_err() {
            warn!("sample batch not delivered: event sink closed");
        }
    }

    /// Queue a status event from a thread that is not running a tokio
    /// runtime.
    pub fn blocking_status(&self, status: Status) {
        debug!("status: {status}");
        if self.status.blocking_send(status).is_err() {
            warn!("status {status:?} not delivered: event sink closed");
        }
    }

    /// Queue a status event without waiting. Used on the caller's thread,
    /// which may itself be inside a runtime.
    pub fn try_status(&self, status: Status) {
        debug!("status: {status}");
        match self.status.try_send(status) {
            Ok(()) => {}
            Err(TrySendError::Full(status)) => warn!("status {status:?} dropped: channel full"),
            Err(TrySendError::Closed(status)) => {
                warn!("status {status:?} not delivered: event sink closed")
            }
        }
    }
}

// ── EventSink ─────────────────────────────────────────────────────────────────

/// Owns both channels, their dispatcher threads and the callback slots.
pub struct EventSink {
    emitter: Option<Emitter>,
    on_status: Slot<Status>,
    on_data: Slot<SampleBatch>,
    dispatchers: Vec<JoinHandle<()>>,
}

impl EventSink {
    pub fn new() -> Self {
        Self::with_capacity(STATUS_CAPACITY, DATA_CAPACITY)
    }

    /// Both capacities must be non-zero.
    pub fn with_capacity(status_capacity: usize, data_capacity: usize) -> Self {
        let (status_tx, status_rx) = mpsc::channel(status_capacity);
        let (data_tx, data_rx) = mpsc::channel(data_capacity);
        let on_status: Slot<Status> = Arc::new(Mutex::new(None));
        let on_data: Slot<SampleBatch> = Arc::new(Mutex::new(None));

        let dispatchers = vec![
            spawn_dispatcher("status", status_rx, Arc::clone(&on_status)),
            spawn_dispatcher("data", data_rx, Arc::clone(&on_data)),
        ];

        Self {
            emitter: Some(Emitter {
                status: status_tx,
                data: data_tx,
            }),
            on_status,
            on_data,
            dispatchers,
        }
    }

    /// A producer handle for the session worker.
    pub fn emitter(&self) -> Emitter {
        // Only `Drop` takes the emitter out.
        match &self.emitter {
            Some(emitter) => emitter.clone(),
            None => unreachable!("event sink used after drop"),
        }
    }

    /// Replace the status callback. Takes effect from the next event; a call
    /// already in progress runs to completion.
    ///
    /// May be called from inside a callback of this sink.
    pub fn set_status_callback(&self, callback: impl FnMut(Status) + Send + 'static) {
        *lock(&self.on_status) = Some(Box::new(callback));
    }

    /// Replace the data callback. Same rules as
    /// [`set_status_callback`](Self::set_status_callback).
    pub fn set_data_callback(&self, callback: impl FnMut(SampleBatch) + Send + 'static) {
        *lock(&self.on_data) = Some(Box::new(callback));
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventSink {
    /// Blocks until every queued event has been delivered. Must not run on a
    /// dispatcher thread, i.e. not from inside a callback.
    fn drop(&mut self) {
        // Closing our senders ends each dispatcher once every worker-held
        // clone is gone and the queue is drained.
        self.emitter.take();
        for handle in self.dispatchers.drain(..) {
            if handle.join().is_err() {
                warn!("event dispatcher thread panicked");
            }
        }
    }
}

fn spawn_dispatcher<T: Send + 'static>(
    name: &'static str,
    mut rx: Receiver<T>,
    slot: Slot<T>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Some(event) = rx.blocking_recv() {
            // Out of the slot for the duration of the call, so the callback
            // can replace itself without deadlocking.
            let Some(mut callback) = lock(&slot).take() else {
                continue;
            };
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                warn!("{name} callback panicked; event discarded");
            }
            let mut current = lock(&slot);
            if current.is_none() {
                *current = Some(callback);
            }
        }
        debug!("{name} dispatcher finished");
    })
}
