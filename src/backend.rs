//! The seam between the capture session and the host's BLE stack.
//!
//! Three layers, each handed out by the one above:
//!
//! * [`BleRadio`] brings the stack up inside the session's runtime.
//! * [`BleCentral`] scans and connects.
//! * [`GattLink`] is one connected device: service/characteristic lookup,
//!   CCCD writes, notifications and command writes.
//!
//! Platform callbacks (advertisements, value-changed notifications) never
//! reach session state directly. Implementations forward them into a bounded
//! [`Feed`] which the session drains at its own pace.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::BackendError;

/// Depth of the advertisement feed.
pub const ADVERTISEMENT_QUEUE: usize = 64;

/// Depth of the notification feed.
pub const NOTIFICATION_QUEUE: usize = 256;

/// One advertisement seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Backend-specific device address, passed back to [`BleCentral::connect`].
    pub address: String,
    /// Advertised local name, when the device sent one.
    pub local_name: Option<String>,
}

/// A characteristic located inside a specific service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub uuid: Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithoutResponse,
    WithResponse,
}

// ── Feed ──────────────────────────────────────────────────────────────────────

/// Receiving end of a forwarded platform event stream.
///
/// Dropping the feed detaches it: the forwarding task, if any, is aborted so
/// no further platform events are pulled on its behalf.
pub struct Feed<T> {
    rx: mpsc::Receiver<T>,
    pump: Option<JoinHandle<()>>,
}

pub type AdvertisementFeed = Feed<Advertisement>;
pub type NotificationFeed = Feed<Vec<u8>>;

impl<T> Feed<T> {
    /// Wrap a receiver fed by `pump`.
    pub fn new(rx: mpsc::Receiver<T>, pump: Option<JoinHandle<()>>) -> Self {
        Self { rx, pump }
    }

    /// A bounded channel and the feed reading from it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx, None))
    }

    /// Attach the task producing into this feed so it is aborted on drop.
    pub fn with_pump(mut self, pump: JoinHandle<()>) -> Self {
        self.pump = Some(pump);
        self
    }

    /// Next item; `None` once the producer side has gone away.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next already-queued item, without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Drop for Feed<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// ── Traits ────────────────────────────────────────────────────────────────────

/// Entry point to a BLE stack. Called once per session, on the session's
/// own runtime.
#[async_trait]
pub trait BleRadio: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn BleCentral>, BackendError>;
}

/// Scanning and connection establishment.
#[async_trait]
pub trait BleCentral: Send + Sync {
    /// Begin an active scan and return the advertisement feed.
    async fn start_scan(&self) -> Result<AdvertisementFeed, BackendError>;

    async fn stop_scan(&self) -> Result<(), BackendError>;

    /// Open a GATT link to a device previously seen in an advertisement.
    async fn connect(&self, address: &str) -> Result<Box<dyn GattLink>, BackendError>;
}

/// A connected device.
#[async_trait]
pub trait GattLink: Send + Sync {
    /// Discovered services. The session treats the first entry as the
    /// default service; btleplug yields them ordered by UUID.
    async fn services(&self) -> Result<Vec<Uuid>, BackendError>;

    /// Characteristics of one service.
    async fn characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BackendError>;

    /// Write the CCCD so the device starts sending notifications.
    async fn enable_notify(&self, characteristic: &CharacteristicRef) -> Result<(), BackendError>;

    /// Clear the CCCD.
    async fn disable_notify(&self, characteristic: &CharacteristicRef)
        -> Result<(), BackendError>;

    /// Attach a listener for value-changed notifications on `characteristic`.
    async fn listen(&self, characteristic: &CharacteristicRef)
        -> Result<NotificationFeed, BackendError>;

    async fn write(
        &self,
        characteristic: &CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BackendError>;

    /// Release the connection and every service handle it holds.
    async fn close(&self) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn feed_yields_queued_items_then_none() {
        let (tx, mut feed) = Feed::channel(4);
        tx.send(1u8).await.unwrap();
        tx.send(2u8).await.unwrap();
        drop(tx);
        assert_eq!(feed.try_recv(), Some(1));
        assert_eq!(feed.recv().await, Some(2));
        assert_eq!(feed.recv().await, None);
    }

    #[tokio::test]
    async fn dropping_feed_aborts_its_pump() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        struct Flag(Arc<AtomicBool>);
        impl Drop for Flag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let flag = Flag(Arc::clone(&dropped));
        let (_tx, feed) = Feed::<u8>::channel(1);
        let pump = tokio::spawn(async move {
            let _flag = flag;
            std::future::pending::<()>().await;
        });
        drop(feed.with_pump(pump));

        for _ in 0..16 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(dropped.load(Ordering::SeqCst));
    }
}
