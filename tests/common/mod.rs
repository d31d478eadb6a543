//! Scripted in-memory BLE stack for driving `SessionController` in tests.

#![allow(dead_code)]

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc::Sender;
use uuid::Uuid;

use ble_capture::backend::{
    Advertisement, AdvertisementFeed, BleCentral, BleRadio, CharacteristicRef, Feed, GattLink,
    NotificationFeed, WriteMode,
};
use ble_capture::capture_client::{CaptureOptions, Timings};
use ble_capture::error::BackendError;
use ble_capture::protocol::{DEFAULT_NOTIFY_CHARACTERISTIC, DEFAULT_WRITE_CHARACTERISTIC};
use ble_capture::types::{SampleBatch, Status};

pub const SERVICE: Uuid = Uuid::from_u128(0x0000fff0_0000_1000_8000_00805f9b34fb);
pub const OTHER_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// What the fake stack does at each step.
#[derive(Debug, Clone)]
pub struct Script {
    pub open_fails: bool,
    pub scan_fails: bool,
    pub advertisements: Vec<Advertisement>,
    pub connect_fails: bool,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    pub enable_notify_fails: bool,
    pub start_fails: bool,
    pub teardown_fails: bool,
    /// Pushed to the listener once a start frame has been written.
    pub notifications: Vec<Vec<u8>>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            open_fails: false,
            scan_fails: false,
            advertisements: vec![
                advertisement("Headphones", "11:22:33:44:55:66"),
                advertisement("BrainLink-01", ADDRESS),
            ],
            connect_fails: false,
            services: vec![(
                SERVICE,
                vec![DEFAULT_NOTIFY_CHARACTERISTIC, DEFAULT_WRITE_CHARACTERISTIC],
            )],
            enable_notify_fails: false,
            start_fails: false,
            teardown_fails: false,
            notifications: Vec::new(),
        }
    }
}

pub fn advertisement(name: &str, address: &str) -> Advertisement {
    Advertisement {
        address: address.into(),
        local_name: Some(name.into()),
    }
}

/// Calls observed by the fake, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(String),
    EnableNotify(Uuid),
    Listen(Uuid),
    Write(Vec<u8>, WriteMode),
    DisableNotify(Uuid),
    Close,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    listener: Option<Sender<Vec<u8>>>,
    streaming: bool,
}

#[derive(Clone)]
pub struct FakeRadio {
    script: Arc<Script>,
    state: Arc<Mutex<State>>,
}

impl FakeRadio {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            state: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, call: Call) {
        self.state.lock().unwrap().calls.push(call);
    }

    /// Push the scripted notifications once, even if the start write is
    /// rejected.
    fn stream_notifications(&self) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if state.streaming {
                return;
            }
            state.streaming = true;
            state.listener.clone()
        };
        let Some(tx) = listener else {
            return;
        };
        let payloads = self.script.notifications.clone();
        tokio::spawn(async move {
            for payload in payloads {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl BleRadio for FakeRadio {
    async fn open(&self) -> Result<Box<dyn BleCentral>, BackendError> {
        if self.script.open_fails {
            return Err(BackendError::NoAdapter);
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl BleCentral for FakeRadio {
    async fn start_scan(&self) -> Result<AdvertisementFeed, BackendError> {
        self.record(Call::StartScan);
        if self.script.scan_fails {
            return Err(BackendError::Gatt("radio off".into()));
        }
        let (tx, feed) = Feed::channel(64);
        for adv in &self.script.advertisements {
            tx.try_send(adv.clone()).unwrap();
        }
        Ok(feed)
    }

    async fn stop_scan(&self) -> Result<(), BackendError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn GattLink>, BackendError> {
        self.record(Call::Connect(address.into()));
        if self.script.connect_fails {
            return Err(BackendError::UnknownDevice(address.into()));
        }
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl GattLink for FakeRadio {
    async fn services(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(self.script.services.iter().map(|(s, _)| *s).collect())
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BackendError> {
        self.script
            .services
            .iter()
            .find(|(s, _)| *s == service)
            .map(|(_, chars)| chars.clone())
            .ok_or_else(|| BackendError::Gatt(format!("no service {service}")))
    }

    async fn enable_notify(&self, ch: &CharacteristicRef) -> Result<(), BackendError> {
        self.record(Call::EnableNotify(ch.uuid));
        if self.script.enable_notify_fails {
            return Err(BackendError::Gatt("CCCD write rejected".into()));
        }
        Ok(())
    }

    async fn disable_notify(&self, ch: &CharacteristicRef) -> Result<(), BackendError> {
        self.record(Call::DisableNotify(ch.uuid));
        if self.script.teardown_fails {
            return Err(BackendError::Gatt("link lost".into()));
        }
        Ok(())
    }

    async fn listen(&self, ch: &CharacteristicRef) -> Result<NotificationFeed, BackendError> {
        self.record(Call::Listen(ch.uuid));
        let (tx, feed) = Feed::channel(256);
        {
            let mut state = self.state.lock().unwrap();
            state.listener = Some(tx);
            state.streaming = false;
        }
        Ok(feed)
    }

    async fn write(
        &self,
        _ch: &CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BackendError> {
        self.record(Call::Write(data.to_vec(), mode));
        let is_start = data.get(4) == Some(&0x01);
        let is_reset = data.get(4) == Some(&0x00);
        if is_start {
            self.stream_notifications();
        }
        if (is_start && self.script.start_fails) || (is_reset && self.script.teardown_fails) {
            return Err(BackendError::Gatt("write rejected".into()));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        self.record(Call::Close);
        if self.script.teardown_fails {
            return Err(BackendError::Gatt("already closed".into()));
        }
        Ok(())
    }
}

// ── Consumer side ─────────────────────────────────────────────────────────────

pub const WAIT: Duration = Duration::from_secs(5);

/// Options with fast polling so tests finish quickly.
pub fn fast_options() -> CaptureOptions {
    CaptureOptions {
        timings: Timings {
            scan_poll_interval: Duration::from_millis(5),
            scan_polls: 400,
            settle_delay: Duration::from_millis(1),
            collect_poll_interval: Duration::from_millis(5),
        },
        ..Default::default()
    }
}

/// Collects events delivered to the controller's callbacks.
pub struct Recorder {
    pub statuses: Receiver<Status>,
    pub batches: Receiver<SampleBatch>,
    seen: Vec<Status>,
}

impl Recorder {
    pub fn callbacks() -> (
        Self,
        impl FnMut(Status) + Send + 'static,
        impl FnMut(SampleBatch) + Send + 'static,
    ) {
        let (status_tx, statuses) = mpsc::channel();
        let (data_tx, batches) = mpsc::channel();
        let recorder = Self {
            statuses,
            batches,
            seen: Vec::new(),
        };
        let on_status = move |s: Status| {
            let _ = status_tx.send(s);
        };
        let on_data = move |b: SampleBatch| {
            let _ = data_tx.send(b);
        };
        (recorder, on_status, on_data)
    }

    /// Block until `wanted` is delivered; returns every status seen so far.
    pub fn wait_for(&mut self, wanted: Status) -> &[Status] {
        let deadline = Instant::now() + WAIT;
        while !self.seen.contains(&wanted) {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.statuses.recv_timeout(left) {
                Ok(s) => self.seen.push(s),
                Err(_) => panic!("timed out waiting for {wanted:?}; saw {:?}", self.seen),
            }
        }
        &self.seen
    }

    /// Every status delivered so far, after letting stragglers arrive.
    pub fn drain(&mut self) -> &[Status] {
        while let Ok(s) = self.statuses.recv_timeout(Duration::from_millis(100)) {
            self.seen.push(s);
        }
        &self.seen
    }

    pub fn take_batches(&self, n: usize) -> Vec<SampleBatch> {
        (0..n)
            .map(|i| {
                self.batches
                    .recv_timeout(WAIT)
                    .unwrap_or_else(|_| panic!("timed out waiting for batch {i}"))
            })
            .collect()
    }
}

pub fn eeg_frame(samples: usize, fill: u8) -> Vec<u8> {
    let mut v = vec![0xFC, 0xFA, 0x00, 0x00, 0x00, 0x00];
    v.extend(std::iter::repeat(fill).take(samples * 12));
    v
}

pub fn ecg_frame(samples: usize, fill: u8) -> Vec<u8> {
    let mut v = vec![0xFC, 0xFB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    v.extend(std::iter::repeat(fill).take(samples * 3));
    v
}
