//! BLE link over the Nordic UART service.
//!
//! Replies arrive as GATT notifications. A pump task keeps only the latest
//! one in a single-slot mailbox; each write empties the slot, so a reply that
//! shows up late can never be read as the answer to a later request. When the
//! link drops the pump exits and a pending `recv` wakes up with
//! `Disconnected` instead of sitting out its timeout.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::{Stream, StreamExt};
use smartball_protocol::{decode, Frame, CMD_OTA_DATA, FRAME_HEADER_SIZE};
use smartball_session::{PortFactory, TransportError, TransportKind, TransportPort};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::SetupError;

pub const NUS_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host writes frames here (write without response).
pub const NUS_RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);
/// Device notifies frames here.
pub const NUS_TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Fallback for adapters that miss a disconnect event.
const LINK_POLL: Duration = Duration::from_millis(500);

type NotificationStream = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;
type EventStream = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;
type LinkDown = Pin<Box<dyn Stream<Item = ()> + Send>>;

/// Receiving half of the notification mailbox.
///
/// Holds at most one unread notification; a newer one replaces it. The
/// sending half belongs to the pump and is dropped when the link goes down.
struct ReplySlot {
    rx: watch::Receiver<Option<Vec<u8>>>,
}

fn reply_slot() -> (watch::Sender<Option<Vec<u8>>>, ReplySlot) {
    let (tx, rx) = watch::channel(None);
    (tx, ReplySlot { rx })
}

impl ReplySlot {
    /// Forget anything that arrived before now.
    fn clear(&mut self) {
        self.rx.borrow_and_update();
    }

    fn is_closed(&self) -> bool {
        self.rx.has_changed().is_err()
    }

    /// Wait for a notification newer than the last one taken.
    /// `None` once the pump is gone.
    async fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            self.rx.changed().await.ok()?;
            if let Some(value) = self.rx.borrow_and_update().clone() {
                return Some(value);
            }
        }
    }
}

/// Which advertiser to talk to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BleTarget {
    /// Advertised local name contains this text.
    Name(String),
    /// Exact address, case-insensitive.
    Address(String),
}

impl BleTarget {
    pub fn matches(&self, local_name: Option<&str>, address: &str) -> bool {
        match self {
            BleTarget::Name(name) => local_name.is_some_and(|n| n.contains(name.as_str())),
            BleTarget::Address(want) => want.eq_ignore_ascii_case(address),
        }
    }
}

impl fmt::Display for BleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BleTarget::Name(name) => write!(f, "{name}"),
            BleTarget::Address(address) => write!(f, "{address}"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BleSettings {
    /// Pause after service discovery before subscribing and writing.
    pub settle: Duration,
    /// Gap after each OTA_DATA write.
    pub chunk_gap: Duration,
}

async fn matching(peripheral: &Peripheral, target: &BleTarget) -> bool {
    let name = peripheral
        .properties()
        .await
        .ok()
        .flatten()
        .and_then(|props| props.local_name);
    target.matches(name.as_deref(), &peripheral.address().to_string())
}

/// Scan until `target` advertises or `window` runs out.
///
/// With `cached`, peripherals the adapter already knows match immediately;
/// without it only a fresh advertisement counts (presence checks).
async fn scan_for(
    adapter: &Adapter,
    target: &BleTarget,
    window: Duration,
    cached: bool,
) -> Result<Option<Peripheral>, btleplug::Error> {
    let mut events = adapter.events().await?;
    adapter.start_scan(ScanFilter::default()).await?;

    let found = tokio::time::timeout(window, async {
        if cached {
            for peripheral in adapter.peripherals().await? {
                if matching(&peripheral, target).await {
                    return Ok(Some(peripheral));
                }
            }
        }
        while let Some(event) = events.next().await {
            let id = match event {
                CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                _ => continue,
            };
            let peripheral = adapter.peripheral(&id).await?;
            if matching(&peripheral, target).await {
                return Ok(Some(peripheral));
            }
        }
        Ok::<_, btleplug::Error>(None)
    })
    .await;

    let _ = adapter.stop_scan().await;
    match found {
        Ok(result) => result,
        Err(_) => Ok(None),
    }
}

fn link_error(e: btleplug::Error) -> TransportError {
    TransportError::Link(e.to_string())
}

fn is_disconnect_of(event: &CentralEvent, id: &PeripheralId) -> bool {
    matches!(event, CentralEvent::DeviceDisconnected(gone) if gone == id)
}

/// Fires once the peripheral is gone: on the adapter's disconnect event, or
/// when the `is_connected` poll first reports false.
fn link_down(peripheral: &Peripheral, events: EventStream) -> LinkDown {
    let id = peripheral.id();
    let disconnected = events.filter_map(move |event| {
        let gone = is_disconnect_of(&event, &id);
        async move { gone.then_some(()) }
    });
    let polled = futures::stream::unfold(peripheral.clone(), |peripheral| async move {
        loop {
            tokio::time::sleep(LINK_POLL).await;
            if !peripheral.is_connected().await.unwrap_or(false) {
                return Some(((), peripheral));
            }
        }
    });
    Box::pin(futures::stream::select(disconnected, polled))
}

/// Post notifications into the mailbox until the link goes down.
///
/// Returning drops `slot`, which is how `recv` and `send` learn the link is gone.
async fn pump_notifications<N, D>(
    mut values: N,
    mut link_down: D,
    slot: watch::Sender<Option<Vec<u8>>>,
) where
    N: Stream<Item = Vec<u8>> + Unpin,
    D: Stream<Item = ()> + Unpin,
{
    loop {
        tokio::select! {
            value = values.next() => match value {
                Some(value) => {
                    slot.send_replace(Some(value));
                }
                None => break,
            },
            _ = link_down.next() => break,
        }
    }
}

struct Connection {
    peripheral: Peripheral,
    rx_char: Characteristic,
    tx_char: Characteristic,
    replies: ReplySlot,
    pump: JoinHandle<()>,
}

/// One BLE connection attempt. Notify-driven: `recv` waits on the mailbox.
pub struct BleLink {
    adapter: Adapter,
    settings: BleSettings,
    conn: Option<Connection>,
}

impl BleLink {
    pub fn new(adapter: Adapter, settings: BleSettings) -> Self {
        Self {
            adapter,
            settings,
            conn: None,
        }
    }

    async fn open_uart(
        &self,
        peripheral: &Peripheral,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        tokio::time::timeout(timeout, peripheral.discover_services())
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .map_err(link_error)?;

        if !peripheral.services().iter().any(|s| s.uuid == NUS_SERVICE) {
            return Err(TransportError::Connect(
                "device has no Nordic UART service".into(),
            ));
        }
        let chars = peripheral.characteristics();
        let find = |uuid: Uuid| {
            chars
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| TransportError::Connect(format!("characteristic {uuid} missing")))
        };
        let rx_char = find(NUS_RX)?;
        let tx_char = find(NUS_TX)?;

        // Writes straight after discovery can race the link layer
        tokio::time::sleep(self.settings.settle).await;

        let events = self.adapter.events().await.map_err(link_error)?;
        let notifications: NotificationStream =
            peripheral.notifications().await.map_err(link_error)?;
        peripheral.subscribe(&tx_char).await.map_err(link_error)?;

        let values = Box::pin(notifications.filter_map(|n| async move {
            (n.uuid == NUS_TX).then_some(n.value)
        }));
        let down = link_down(peripheral, events);
        let (slot, replies) = reply_slot();
        let address = peripheral.address();
        let pump = tokio::spawn(async move {
            pump_notifications(values, down, slot).await;
            tracing::warn!(%address, "BLE link dropped");
        });

        Ok(Connection {
            peripheral: peripheral.clone(),
            rx_char,
            tx_char,
            replies,
            pump,
        })
    }
}

#[async_trait]
impl TransportPort for BleLink {
    type Handle = BleTarget;

    fn kind(&self) -> TransportKind {
        TransportKind::Ble
    }

    async fn connect(
        &mut self,
        handle: &BleTarget,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        self.disconnect().await;

        tracing::info!(device = %handle, "scanning");
        let peripheral = scan_for(&self.adapter, handle, timeout, true)
            .await
            .map_err(link_error)?
            .ok_or_else(|| TransportError::Connect(format!("{handle} not found")))?;

        let address = peripheral.address();
        tracing::info!(device = %handle, %address, "connecting");
        match tokio::time::timeout(timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(TransportError::Connect(e.to_string())),
            Err(_) => {
                let _ = peripheral.disconnect().await;
                return Err(TransportError::Timeout(timeout));
            }
        }

        match self.open_uart(&peripheral, timeout).await {
            Ok(conn) => {
                tracing::info!(%address, "connected, UART ready");
                self.conn = Some(conn);
                Ok(())
            }
            Err(e) => {
                let _ = peripheral.disconnect().await;
                Err(e)
            }
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        if conn.replies.is_closed() {
            return Err(TransportError::Disconnected);
        }
        conn.replies.clear();

        let bytes = frame.to_bytes();
        tracing::trace!(msg_type = frame.msg_type, bytes = %hex::encode(&bytes), "ble tx");
        conn.peripheral
            .write(&conn.rx_char, &bytes, WriteType::WithoutResponse)
            .await
            .map_err(link_error)?;

        if frame.msg_type == CMD_OTA_DATA && !self.settings.chunk_gap.is_zero() {
            tokio::time::sleep(self.settings.chunk_gap).await;
        }
        Ok(())
    }

    async fn recv(&mut self, accept: &[u8], timeout: Duration) -> Result<Frame, TransportError> {
        let conn = self.conn.as_mut().ok_or(TransportError::NotConnected)?;
        let deadline = Instant::now() + timeout;

        loop {
            let value = match tokio::time::timeout_at(deadline, conn.replies.next()).await {
                Ok(Some(value)) => value,
                Ok(None) => return Err(TransportError::Disconnected),
                Err(_) => return Err(TransportError::Timeout(timeout)),
            };

            tracing::trace!(bytes = %hex::encode(&value), "ble rx");
            // Zero-length RSP (the ABORT acknowledgment) is not a valid frame
            if value.len() >= FRAME_HEADER_SIZE && value[1] == 0 && value[2] == 0 {
                tracing::trace!(msg_type = value[0], "dropping zero-length frame");
                continue;
            }
            let frame = decode(&value)?;
            if accept.contains(&frame.msg_type) {
                return Ok(frame);
            }
            tracing::debug!(msg_type = frame.msg_type, "discarding unrequested notification");
        }
    }

    async fn disconnect(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        conn.pump.abort();
        let _ = conn.peripheral.unsubscribe(&conn.tx_char).await;
        if let Err(e) = conn.peripheral.disconnect().await {
            tracing::debug!(error = %e, "BLE disconnect");
        }
        tracing::info!(address = %conn.peripheral.address(), "disconnected");
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if let Some(conn) = &self.conn {
            conn.pump.abort();
        }
    }
}

/// Shares one adapter across attempts and presence checks.
#[derive(Clone)]
pub struct BleFactory {
    adapter: Adapter,
    settings: BleSettings,
}

impl BleFactory {
    /// Use the first Bluetooth adapter on the host.
    pub async fn new(settings: BleSettings) -> Result<Self, SetupError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(SetupError::NoAdapter)?;
        Ok(Self { adapter, settings })
    }

    /// Whether `target` is seen advertising (or already known) within `window`.
    pub async fn discover(&self, target: &BleTarget, window: Duration) -> bool {
        match scan_for(&self.adapter, target, window, true).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "BLE scan failed");
                false
            }
        }
    }
}

#[async_trait]
impl PortFactory for BleFactory {
    type Port = BleLink;

    fn open(&self) -> BleLink {
        BleLink::new(self.adapter.clone(), self.settings)
    }

    async fn is_present(&self, handle: &BleTarget, timeout: Duration) -> bool {
        // Adapters cache peripherals long after they go quiet; only a fresh
        // advertisement proves the device is up.
        match scan_for(&self.adapter, handle, timeout, false).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                tracing::warn!(error = %e, "presence scan failed");
                false
            }
        }
    }
}
