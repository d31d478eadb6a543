//! [`BleRadio`] implementation on top of `btleplug`.
//!
//! Works on every platform btleplug supports (BlueZ, CoreBluetooth, WinRT).
//! Advertisements and notifications are pumped out of btleplug's event
//! streams by spawned tasks into bounded [`Feed`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, Service,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::time::timeout;
use uuid::Uuid;

use crate::backend::{
    Advertisement, AdvertisementFeed, BleCentral, BleRadio, CharacteristicRef, Feed, GattLink,
    NotificationFeed, WriteMode, ADVERTISEMENT_QUEUE, NOTIFICATION_QUEUE,
};
use crate::error::BackendError;

/// BlueZ's `Device1.Connect` can block indefinitely on a device that went
/// out of range; a BLE connect normally completes in under two seconds.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const DISCOVER_TIMEOUT: Duration = Duration::from_secs(15);

/// The system BLE stack, via btleplug. Uses the first adapter found.
#[derive(Debug, Clone, Copy, Default)]
pub struct Btleplug;

#[async_trait]
impl BleRadio for Btleplug {
    async fn open(&self) -> Result<Box<dyn BleCentral>, BackendError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(BackendError::NoAdapter)?;

        #[cfg(target_os = "macos")]
        wait_powered_on(&adapter).await;

        if let Ok(info) = adapter.adapter_info().await {
            info!("using adapter {info}");
        }
        Ok(Box::new(BtleplugCentral {
            adapter,
            seen: Arc::default(),
        }))
    }
}

/// CoreBluetooth starts in an "unknown" state and silently ignores scan
/// requests until it reaches poweredOn.
#[cfg(target_os = "macos")]
async fn wait_powered_on(adapter: &Adapter) {
    use btleplug::api::CentralState;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        match adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => break,
            Ok(state) if tokio::time::Instant::now() >= deadline => {
                warn!("adapter still {state:?} after 3 s, scanning anyway");
                break;
            }
            Ok(state) => debug!("adapter state = {state:?}, waiting"),
            Err(e) => {
                warn!("adapter_state() failed: {e}");
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

// ── Central ───────────────────────────────────────────────────────────────────

type SeenPeripherals = Arc<Mutex<HashMap<String, Peripheral>>>;

struct BtleplugCentral {
    adapter: Adapter,
    /// Peripherals reported during the scan, keyed by advertised address.
    seen: SeenPeripherals,
}

async fn advertisement_of(peripheral: &Peripheral, seen: &SeenPeripherals) -> Advertisement {
    let local_name = match peripheral.properties().await {
        Ok(Some(props)) => props.local_name,
        Ok(None) => None,
        Err(e) => {
            debug!("properties() failed for {}: {e}", peripheral.id());
            None
        }
    };
    let address = peripheral.id().to_string();
    seen.lock()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(address.clone(), peripheral.clone());
    Advertisement {
        address,
        local_name,
    }
}

#[async_trait]
impl BleCentral for BtleplugCentral {
    async fn start_scan(&self) -> Result<AdvertisementFeed, BackendError> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;

        let (tx, feed) = Feed::channel(ADVERTISEMENT_QUEUE);
        let adapter = self.adapter.clone();
        let seen = Arc::clone(&self.seen);
        let pump = tokio::spawn(async move {
            // Devices the adapter already knows about never produce a fresh
            // DeviceDiscovered event.
            for peripheral in adapter.peripherals().await.unwrap_or_default() {
                if tx.send(advertisement_of(&peripheral, &seen).await).await.is_err() {
                    return;
                }
            }
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let peripheral = match adapter.peripheral(&id).await {
                    Ok(p) => p,
                    Err(e) => {
                        debug!("peripheral({id:?}) failed: {e}");
                        continue;
                    }
                };
                if tx.send(advertisement_of(&peripheral, &seen).await).await.is_err() {
                    return;
                }
            }
        });
        Ok(feed.with_pump(pump))
    }

    async fn stop_scan(&self) -> Result<(), BackendError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn GattLink>, BackendError> {
        let peripheral = self
            .seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
            .ok_or_else(|| BackendError::UnknownDevice(address.to_owned()))?;

        timeout(CONNECT_TIMEOUT, peripheral.connect())
            .await
            .map_err(|_| timed_out("connect", CONNECT_TIMEOUT))??;

        // BlueZ reports the link as up before its GATT cache is populated;
        // discovering straight away can return an empty service set.
        #[cfg(target_os = "linux")]
        tokio::time::sleep(Duration::from_millis(600)).await;

        timeout(DISCOVER_TIMEOUT, peripheral.discover_services())
            .await
            .map_err(|_| timed_out("service discovery", DISCOVER_TIMEOUT))??;
        info!("connected to {address}, {} service(s)", peripheral.services().len());

        Ok(Box::new(BtleplugLink { peripheral }))
    }
}

fn timed_out(what: &str, after: Duration) -> BackendError {
    BackendError::Gatt(format!("{what} timed out after {after:?}"))
}

/// btleplug keeps services in a `BTreeSet`, so "first" means lowest UUID,
/// not first discovered.
fn service_uuids(services: &BTreeSet<Service>) -> Vec<Uuid> {
    services.iter().map(|s| s.uuid).collect()
}

// ── Link ──────────────────────────────────────────────────────────────────────

struct BtleplugLink {
    peripheral: Peripheral,
}

impl BtleplugLink {
    fn characteristic(&self, target: &CharacteristicRef) -> Result<Characteristic, BackendError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == target.uuid && c.service_uuid == target.service)
            .ok_or(BackendError::MissingCharacteristic(target.uuid))
    }
}

#[async_trait]
impl GattLink for BtleplugLink {
    async fn services(&self) -> Result<Vec<Uuid>, BackendError> {
        Ok(service_uuids(&self.peripheral.services()))
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<Uuid>, BackendError> {
        self.peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(|c| c.uuid).collect())
            .ok_or_else(|| BackendError::Gatt(format!("service {service} not present")))
    }

    async fn enable_notify(&self, target: &CharacteristicRef) -> Result<(), BackendError> {
        let characteristic = self.characteristic(target)?;
        self.peripheral.subscribe(&characteristic).await?;
        Ok(())
    }

    async fn disable_notify(&self, target: &CharacteristicRef) -> Result<(), BackendError> {
        let characteristic = self.characteristic(target)?;
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn listen(&self, target: &CharacteristicRef) -> Result<NotificationFeed, BackendError> {
        let mut notifications = self.peripheral.notifications().await?;
        let (tx, feed) = Feed::channel(NOTIFICATION_QUEUE);
        let uuid = target.uuid;
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
            debug!("notification stream for {uuid} ended");
        });
        Ok(feed.with_pump(pump))
    }

    async fn write(
        &self,
        target: &CharacteristicRef,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BackendError> {
        let characteristic = self.characteristic(target)?;
        let write_type = match mode {
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
            WriteMode::WithResponse => WriteType::WithResponse,
        };
        self.peripheral.write(&characteristic, data, write_type).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), BackendError> {
        if self.peripheral.is_connected().await.unwrap_or(false) {
            self.peripheral.disconnect().await?;
        } else {
            warn!("link to {} already down", self.peripheral.id());
        }
        Ok(())
    }
}
