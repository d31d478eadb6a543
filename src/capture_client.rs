//! The capture session: options, the session state machine, and the
//! [`SessionController`] handle that starts and stops it.
//!
//! A session runs on its own OS thread with a single-threaded tokio runtime
//! and walks these phases, reporting each through the [`EventSink`]:
//!
//! ```text
//! scanning → connecting → resolve service → resolve notify char
//!   → enable notify → resolve write char → subscribing
//!   → sending reset → sending start → collecting → sending stop → stopped
//! ```
//!
//! Every phase can fail; a failure reports exactly one terminal status,
//! releases whatever the session holds, and ends the worker.
//! [`SessionController::stop`] is the only way out of `collecting`.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use futures::FutureExt;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::backend::{
    AdvertisementFeed, BleCentral, BleRadio, CharacteristicRef, GattLink, NotificationFeed,
    WriteMode,
};
use crate::btleplug_backend::Btleplug;
use crate::error::{BackendError, CaptureError};
use crate::events::{Emitter, EventSink};
use crate::parse::{decode, Decoded};
use crate::protocol::{
    encode_control, ControlOpcode, DEFAULT_NAME_PREFIX, DEFAULT_NOTIFY_CHARACTERISTIC,
    DEFAULT_WRITE_CHARACTERISTIC,
};
use crate::selector;
use crate::types::{CaptureMode, FrameType, SampleBatch, SessionState, Status};

// ── Timings ───────────────────────────────────────────────────────────────────

/// Polling and settle intervals of a session.
///
/// The defaults give a 20 s scan window and a worst-case stop latency of
/// about 100 ms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// Pause between scan polls.
    pub scan_poll_interval: Duration,
    /// Scan polls before giving up with "device not found".
    pub scan_polls: u32,
    /// Pause between the reset and start commands.
    pub settle_delay: Duration,
    /// How often the collecting phase checks for a stop request when no
    /// notifications arrive.
    pub collect_poll_interval: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            scan_poll_interval: Duration::from_millis(100),
            scan_polls: 200,
            settle_delay: Duration::from_millis(50),
            collect_poll_interval: Duration::from_millis(100),
        }
    }
}

// ── CaptureOptions ────────────────────────────────────────────────────────────

/// Configuration of one capture session.
///
/// UUIDs are kept as strings and parsed in the phase that needs them, so a
/// malformed value is reported as a status event rather than refused here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    /// Case-insensitive prefix of the advertised device name. Default `"brain"`.
    pub name_prefix: String,
    /// Service to resolve. Empty means "first discovered service".
    pub service_uuid: String,
    /// Telemetry (notify) characteristic.
    pub notify_uuid: String,
    /// Control (write) characteristic.
    pub write_uuid: String,
    /// Selects the control-frame header byte.
    pub mode: CaptureMode,
    pub timings: Timings,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.into(),
            service_uuid: String::new(),
            notify_uuid: DEFAULT_NOTIFY_CHARACTERISTIC.to_string(),
            write_uuid: DEFAULT_WRITE_CHARACTERISTIC.to_string(),
            mode: CaptureMode::Eeg,
            timings: Timings::default(),
        }
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

/// State shared between the controller and its worker.
///
/// The counters are only ever read for display, so relaxed ordering is
/// enough; nothing relies on the two being consistent with each other.
#[derive(Default)]
struct Shared {
    cancel: AtomicBool,
    state: Mutex<SessionState>,
    total_bytes: AtomicU64,
    channels: AtomicU32,
}

impl Shared {
    fn reset(&self) {
        self.cancel.store(false, Ordering::Relaxed);
        self.total_bytes.store(0, Ordering::Relaxed);
        self.channels.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Idle);
    }

    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Pin the channel count on the first recognised frame and return the
    /// pinned value.
    fn pin_channels(&self, channels: u32, frame_type: FrameType) -> u32 {
        match self
            .channels
            .compare_exchange(0, channels, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => {
                info!("first {frame_type} frame: {channels} channel(s)");
                channels
            }
            Err(pinned) => {
                if pinned != channels {
                    debug!("{frame_type} frame ({channels} ch) in a {pinned}-channel session");
                }
                pinned
            }
        }
    }
}

// ── SessionController ─────────────────────────────────────────────────────────

/// Handle owning at most one capture session at a time.
///
/// ```no_run
/// use ble_capture::prelude::*;
///
/// let mut controller = SessionController::new();
/// controller.start(
///     CaptureOptions::default(),
///     |status| println!("status: {status}"),
///     |batch| println!("{} bytes, {} samples", batch.last_packet_bytes, batch.samples),
/// );
/// std::thread::sleep(std::time::Duration::from_secs(30));
/// controller.stop();
/// ```
pub struct SessionController {
    radio: Arc<dyn BleRadio>,
    /// Event delivery of the current (or last) session.
    sink: Option<EventSink>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl SessionController {
    /// A controller backed by the system BLE stack.
    pub fn new() -> Self {
        Self::with_radio(Btleplug)
    }

    /// A controller backed by an arbitrary [`BleRadio`].
    pub fn with_radio(radio: impl BleRadio) -> Self {
        Self {
            radio: Arc::new(radio),
            sink: None,
            shared: Arc::default(),
            worker: None,
        }
    }

    /// Start a session on a new worker thread and return immediately.
    ///
    /// Returns `false` (and reports `"already running"` to the current
    /// status callback) unless the controller is idle, stopped or failed;
    /// the running session and its callbacks are left untouched in that
    /// case. Events still queued from a previous session are delivered to
    /// that session's callbacks before the new ones are installed.
    pub fn start<S, D>(&mut self, options: CaptureOptions, mut on_status: S, on_data: D) -> bool
    where
        S: FnMut(Status) + Send + 'static,
        D: FnMut(SampleBatch) + Send + 'static,
    {
        if self.is_running() || !self.state().accepts_start() {
            warn!("start requested in state {:?}", self.state());
            match &self.sink {
                Some(sink) => sink.emitter().try_status(Status::AlreadyRunning),
                None => on_status(Status::AlreadyRunning),
            }
            return false;
        }
        self.reap();

        let sink = EventSink::new();
        sink.set_status_callback(on_status);
        sink.set_data_callback(on_data);
        self.shared.reset();

        let session = Session {
            options,
            shared: Arc::clone(&self.shared),
            emitter: sink.emitter(),
        };
        let emitter = sink.emitter();
        self.sink = Some(sink);

        let radio = Arc::clone(&self.radio);
        let spawned = thread::Builder::new()
            .name("ble-capture-session".into())
            .spawn(move || session.run_blocking(radio));

        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                true
            }
            Err(e) => {
                error!("could not spawn session worker: {e}");
                self.shared.set_state(SessionState::Failed);
                emitter.try_status(Status::WorkerException);
                false
            }
        }
    }

    /// Request a stop and wait until the worker has fully unwound and every
    /// event it queued has reached the callbacks.
    ///
    /// A no-op when no session is active. Latency is bounded by the polling
    /// interval of the current phase plus the time the callbacks need to
    /// drain. Must not be called from inside a callback.
    pub fn stop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.shared.cancel.store(true, Ordering::Relaxed);
            if worker.join().is_err() {
                error!("session worker panicked");
            }
        }
        drop(self.sink.take());
    }

    /// Replace the status callback of the current session. Ignored once the
    /// session has been stopped; the next [`start`](Self::start) takes its
    /// own callbacks.
    pub fn on_status(&self, callback: impl FnMut(Status) + Send + 'static) {
        match &self.sink {
            Some(sink) => sink.set_status_callback(callback),
            None => debug!("no session; status callback ignored"),
        }
    }

    /// Replace the data callback of the current session. Same rules as
    /// [`on_status`](Self::on_status).
    pub fn on_data(&self, callback: impl FnMut(SampleBatch) + Send + 'static) {
        match &self.sink {
            Some(sink) => sink.set_data_callback(callback),
            None => debug!("no session; data callback ignored"),
        }
    }

    /// `true` while a worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Bytes received so far in the current (or last) session.
    pub fn total_bytes(&self) -> u64 {
        self.shared.total_bytes.load(Ordering::Relaxed)
    }

    /// Pinned channel count of the current (or last) session, `0` if no
    /// frame has been recognised yet.
    pub fn channels(&self) -> u32 {
        self.shared.channels.load(Ordering::Relaxed)
    }

    /// Join a worker that has already finished on its own and flush its
    /// events.
    fn reap(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("previous session worker panicked");
            }
        }
        drop(self.sink.take());
    }
}

impl Default for SessionController {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Session (worker side) ─────────────────────────────────────────────────────

enum ScanOutcome {
    Found(String),
    Cancelled,
    TimedOut,
}

/// Everything acquired after connecting, released by [`ActiveLink::release`].
struct ActiveLink {
    link: Box<dyn GattLink>,
    notify: Option<CharacteristicRef>,
    write: Option<CharacteristicRef>,
    feed: Option<NotificationFeed>,
}

impl ActiveLink {
    fn new(link: Box<dyn GattLink>) -> Self {
        Self {
            link,
            notify: None,
            write: None,
            feed: None,
        }
    }

    /// Best-effort teardown: reset the device, detach the listener, clear
    /// the CCCD, close the link. Failures are logged and otherwise ignored.
    async fn release(mut self, mode: CaptureMode) {
        let link = self.link.as_ref();
        if let Some(write) = &self.write {
            if let Err(e) = send_command(link, write, mode, ControlOpcode::Reset).await {
                debug!("reset on teardown failed: {e}");
            }
        }
        drop(self.feed.take());
        if let Some(notify) = &self.notify {
            if let Err(e) = link.disable_notify(notify).await {
                debug!("disabling notifications failed: {e}");
            }
        }
        if let Err(e) = link.close().await {
            debug!("closing link failed: {e}");
        }
    }
}

struct Session {
    options: CaptureOptions,
    shared: Arc<Shared>,
    emitter: Emitter,
}

impl Session {
    /// Worker thread body.
    fn run_blocking(self, radio: Arc<dyn BleRadio>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                error!("could not build session runtime: {e}");
                self.shared.set_state(SessionState::Failed);
                self.emitter.blocking_status(Status::BackendInitFailed);
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let emitter = self.emitter.clone();
        let outcome = runtime.block_on(AssertUnwindSafe(self.run(radio.as_ref())).catch_unwind());
        if outcome.is_err() {
            error!("session worker panicked");
            shared.set_state(SessionState::Failed);
            emitter.blocking_status(Status::WorkerException);
        }
    }

    async fn run(self, radio: &dyn BleRadio) {
        let central = match radio.open().await {
            Ok(central) => central,
            Err(e) => return self.fail(CaptureError::Backend(e)).await,
        };

        let address = match self.scan(central.as_ref()).await {
            ScanOutcome::Found(address) => address,
            ScanOutcome::Cancelled => {
                return self.finish(SessionState::Stopped, Status::Stopped).await
            }
            ScanOutcome::TimedOut => {
                return self.fail(CaptureError::Discovery(Status::DeviceNotFound)).await
            }
        };

        self.enter(SessionState::Connecting, Some(Status::Connecting)).await;
        let link = match central.connect(&address).await {
            Ok(link) => link,
            Err(e) => {
                warn!("connecting to {address} failed: {e}");
                return self.fail(CaptureError::Discovery(Status::DeviceOpenFailed)).await;
            }
        };

        let mut active = ActiveLink::new(link);
        let outcome = AssertUnwindSafe(self.drive(&mut active)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => {
                self.enter(SessionState::Stopping, None).await;
                if active.write.is_some() {
                    self.emitter.status(Status::SendingStop).await;
                }
                active.release(self.options.mode).await;
                self.finish(SessionState::Stopped, Status::Stopped).await;
            }
            Ok(Err(e)) => {
                warn!("capture session failed: {e}");
                self.emitter.status(e.status()).await;
                active.release(self.options.mode).await;
                self.shared.set_state(SessionState::Failed);
            }
            Err(_) => {
                error!("session panicked while connected");
                self.emitter.status(Status::WorkerException).await;
                active.release(self.options.mode).await;
                self.shared.set_state(SessionState::Failed);
            }
        }
    }

    // ── Phase 1: scan ─────────────────────────────────────────────────────────

    async fn scan(&self, central: &dyn BleCentral) -> ScanOutcome {
        self.enter(SessionState::Scanning, Some(Status::Scanning)).await;
        let timings = self.options.timings;

        let mut feed = match central.start_scan().await {
            Ok(feed) => Some(feed),
            Err(e) => {
                warn!("scan start failed: {e}");
                self.emitter.status(Status::WatcherStartFailed).await;
                None
            }
        };

        info!(
            "scanning for \"{}\" ({} polls × {:?})",
            self.options.name_prefix, timings.scan_polls, timings.scan_poll_interval
        );
        let mut found = None;
        for _ in 0..timings.scan_polls {
            if self.shared.cancelled() {
                break;
            }
            if let Some(feed) = feed.as_mut() {
                found = self.first_match(feed);
            }
            if found.is_some() {
                break;
            }
            tokio::time::sleep(timings.scan_poll_interval).await;
        }

        drop(feed);
        if let Err(e) = central.stop_scan().await {
            debug!("stop_scan failed: {e}");
        }

        if self.shared.cancelled() {
            return ScanOutcome::Cancelled;
        }
        match found {
            Some(address) => ScanOutcome::Found(address),
            None => ScanOutcome::TimedOut,
        }
    }

    /// Drain queued advertisements; the first matching one wins.
    fn first_match(&self, feed: &mut AdvertisementFeed) -> Option<String> {
        while let Some(adv) = feed.try_recv() {
            let Some(name) = adv.local_name.as_deref() else {
                continue;
            };
            if selector::matches(name, &self.options.name_prefix) {
                info!("found {name} at {}", adv.address);
                return Some(adv.address);
            }
        }
        None
    }

    // ── Phases 3-10 ───────────────────────────────────────────────────────────

    /// Resolve, subscribe, start and collect. `Ok` means a stop was
    /// requested; the caller tears down either way.
    async fn drive(&self, active: &mut ActiveLink) -> Result<(), CaptureError> {
        let link = active.link.as_ref();

        self.enter(SessionState::ResolvingService, None).await;
        let service = self.resolve_service(link).await?;
        if self.shared.cancelled() {
            return Ok(());
        }

        self.enter(SessionState::ResolvingNotifyCharacteristic, None).await;
        let notify_uuid = parse_uuid(&self.options.notify_uuid, Status::InvalidNotifyUuid)?;
        let notify = find_characteristic(link, service, notify_uuid)
            .await
            .ok_or(CaptureError::Discovery(Status::NotifyCharacteristicNotFound))?;

        self.enter(SessionState::EnablingNotify, None).await;
        link.enable_notify(&notify)
            .await
            .map_err(|source| CaptureError::Protocol {
                status: Status::EnableNotifyFailed,
                source,
            })?;
        active.notify = Some(notify);
        if self.shared.cancelled() {
            return Ok(());
        }

        self.enter(SessionState::ResolvingWriteCharacteristic, None).await;
        let write_uuid = parse_uuid(&self.options.write_uuid, Status::InvalidWriteUuid)?;
        let write = find_characteristic(link, service, write_uuid)
            .await
            .ok_or(CaptureError::Discovery(Status::WriteCharacteristicNotFound))?;
        active.write = Some(write);
        if self.shared.cancelled() {
            return Ok(());
        }

        // The listener must be attached before Start or the first frames
        // are lost.
        self.enter(SessionState::Subscribing, Some(Status::Subscribing)).await;
        let mut feed = link.listen(&notify).await?;

        let mode = self.options.mode;
        self.enter(SessionState::SendingReset, Some(Status::SendingReset)).await;
        if let Err(e) = send_command(link, &write, mode, ControlOpcode::Reset).await {
            debug!("reset command failed: {e}");
        }
        tokio::time::sleep(self.options.timings.settle_delay).await;

        self.enter(SessionState::SendingStart, Some(Status::SendingStart)).await;
        let started = match send_command(link, &write, mode, ControlOpcode::Start).await {
            Ok(()) => Status::Collecting,
            Err(e) => {
                // Soft failure: some firmware streams anyway.
                warn!("start command failed: {e}");
                Status::StartCommandFailed
            }
        };

        self.enter(SessionState::Collecting, Some(started)).await;
        self.collect(&mut feed).await;
        active.feed = Some(feed);
        Ok(())
    }

    async fn resolve_service(&self, link: &dyn GattLink) -> Result<Uuid, CaptureError> {
        if self.options.service_uuid.is_empty() {
            return match link.services().await {
                Ok(services) => services
                    .first()
                    .copied()
                    .ok_or(CaptureError::Discovery(Status::NoServices)),
                Err(e) => {
                    debug!("service discovery failed: {e}");
                    Err(CaptureError::Discovery(Status::NoServices))
                }
            };
        }

        let wanted = parse_uuid(&self.options.service_uuid, Status::InvalidServiceUuid)?;
        match link.services().await {
            Ok(services) if services.contains(&wanted) => Ok(wanted),
            Ok(_) => Err(CaptureError::Discovery(Status::ServiceNotFound)),
            Err(e) => {
                debug!("service discovery failed: {e}");
                Err(CaptureError::Discovery(Status::ServiceNotFound))
            }
        }
    }

    /// Forward notifications until a stop is requested.
    async fn collect(&self, feed: &mut NotificationFeed) {
        let mut tick = tokio::time::interval(self.options.timings.collect_poll_interval);
        let mut feed_open = true;
        info!("collecting");

        while !self.shared.cancelled() {
            tokio::select! {
                payload = feed.recv(), if feed_open => match payload {
                    Some(payload) => self.forward(payload).await,
                    None => {
                        warn!("notification stream closed; waiting for stop");
                        feed_open = false;
                    }
                },
                _ = tick.tick() => {}
            }
        }
        info!(
            "stop requested after {} byte(s)",
            self.shared.total_bytes.load(Ordering::Relaxed)
        );
    }

    /// Account for one notification and hand it to the data channel.
    async fn forward(&self, payload: Vec<u8>) {
        let len = payload.len() as u64;
        let total = self.shared.total_bytes.fetch_add(len, Ordering::Relaxed) + len;

        let decoded = decode(&payload);
        let (samples, channels) = match decoded {
            Decoded::Frame {
                frame_type,
                samples,
                channels,
            } => (samples, self.shared.pin_channels(channels, frame_type)),
            Decoded::Unrecognized => (0, self.shared.channels.load(Ordering::Relaxed)),
        };

        self.emitter.data(SampleBatch {
            last_packet_bytes: len,
            total_bytes: total,
            samples,
            channels,
            frame_type: decoded.frame_type(),
            raw: (!payload.is_empty()).then_some(payload),
        })
        .await;
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    async fn enter(&self, state: SessionState, status: Option<Status>) {
        debug!("session → {state:?}");
        self.shared.set_state(state);
        if let Some(status) = status {
            self.emitter.status(status).await;
        }
    }

    async fn finish(&self, state: SessionState, status: Status) {
        self.shared.set_state(state);
        self.emitter.status(status).await;
    }

    async fn fail(&self, e: CaptureError) {
        warn!("capture session failed: {e}");
        self.finish(SessionState::Failed, e.status()).await;
    }
}

fn parse_uuid(value: &str, status: Status) -> Result<Uuid, CaptureError> {
    Uuid::parse_str(value).map_err(|e| CaptureError::configuration(status, value, e))
}

/// Look in `preferred` first, then in every other discovered service.
async fn find_characteristic(
    link: &dyn GattLink,
    preferred: Uuid,
    uuid: Uuid,
) -> Option<CharacteristicRef> {
    if let Ok(chars) = link.characteristics(preferred).await {
        if chars.contains(&uuid) {
            return Some(CharacteristicRef {
                service: preferred,
                uuid,
            });
        }
    }

    let services = link.services().await.ok()?;
    for service in services.into_iter().filter(|s| *s != preferred) {
        match link.characteristics(service).await {
            Ok(chars) if chars.contains(&uuid) => {
                debug!("{uuid} found outside the preferred service, in {service}");
                return Some(CharacteristicRef { service, uuid });
            }
            Ok(_) => {}
            Err(e) => debug!("listing characteristics of {service} failed: {e}"),
        }
    }
    None
}

/// Write a control frame, without response first and with response if that
/// is refused.
async fn send_command(
    link: &dyn GattLink,
    write: &CharacteristicRef,
    mode: CaptureMode,
    opcode: ControlOpcode,
) -> Result<(), BackendError> {
    let frame = encode_control(mode, opcode);
    if let Err(e) = link.write(write, &frame, WriteMode::WithoutResponse).await {
        debug!("{opcode:?} without response failed ({e}), retrying with response");
        link.write(write, &frame, WriteMode::WithResponse).await?;
    }
    Ok(())
}
