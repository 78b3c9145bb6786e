//! Serial link: the same frames over a USB CDC / UART byte stream.
//!
//! `serialport` is blocking, so every read and write runs on the blocking
//! pool. Reads use a short port timeout and loop until the caller's deadline.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use serialport::{ClearBuffer, SerialPortInfo, SerialPortType};
use smartball_protocol::{Frame, FrameCodec, CMD_OTA_DATA, MAX_PAYLOAD};
use smartball_session::{PortFactory, TransportError, TransportKind, TransportPort};
use tokio::time::Instant;
use tokio_util::codec::Decoder;

pub const DEFAULT_BAUD: u32 = 115_200;

/// Pause after each OTA_DATA write.
///
/// A 480-byte chunk is 491 bytes framed, about 43 ms on the wire at
/// 115200 baud 8N1. The device must also write flash before the next chunk
/// lands or its receive buffer overruns and bytes are silently lost.
pub const CHUNK_PACING: Duration = Duration::from_millis(60);

/// Timeout of one blocking read.
const READ_SLICE: Duration = Duration::from_millis(50);

/// Substrings of USB product/manufacturer strings that look like our board.
const USB_HINTS: [&str; 4] = ["Serial", "nRF", "XIAO", "Seeed"];

type SharedPort = Arc<Mutex<Box<dyn serialport::SerialPort>>>;

#[derive(Debug, Clone, Copy)]
pub struct SerialSettings {
    pub baud: u32,
    pub pacing: Duration,
    /// Wait after open for boards that reboot when DTR toggles.
    pub boot_wait: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: DEFAULT_BAUD,
            pacing: CHUNK_PACING,
            boot_wait: Duration::from_secs(4),
        }
    }
}

/// Time `bytes` take on the wire at `baud`, 10 bits per byte.
pub fn wire_time(bytes: usize, baud: u32) -> Duration {
    Duration::from_micros(bytes as u64 * 10 * 1_000_000 / baud.max(1) as u64)
}

/// One serial session. Polling: `recv` reads until a whole frame decodes.
pub struct SerialLink {
    settings: SerialSettings,
    port: Option<SharedPort>,
    inbox: BytesMut,
    codec: FrameCodec,
}

impl SerialLink {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            port: None,
            inbox: BytesMut::with_capacity(MAX_PAYLOAD * 2),
            codec: FrameCodec::lenient(),
        }
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Box<dyn serialport::SerialPort>) -> io::Result<T> + Send + 'static,
    {
        let port = self.port.clone().ok_or(TransportError::NotConnected)?;
        let result = tokio::task::spawn_blocking(move || {
            let mut guard = port
                .lock()
                .map_err(|_| io::Error::other("serial port lock poisoned"))?;
            op(&mut guard)
        })
        .await
        .map_err(|e| TransportError::Link(e.to_string()))?;
        Ok(result?)
    }

    async fn clear_input(&mut self) -> Result<(), TransportError> {
        self.inbox.clear();
        self.blocking(|port| port.clear(ClearBuffer::Input).map_err(io::Error::from))
            .await
    }
}

#[async_trait]
impl TransportPort for SerialLink {
    /// Port path, e.g. `/dev/ttyACM0` or `COM16`.
    type Handle = String;

    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    async fn connect(&mut self, handle: &String, timeout: Duration) -> Result<(), TransportError> {
        self.disconnect().await;

        let path = handle.clone();
        let baud = self.settings.baud;
        let opened = tokio::time::timeout(
            timeout,
            tokio::task::spawn_blocking(move || {
                serialport::new(&path, baud).timeout(READ_SLICE).open()
            }),
        )
        .await;
        let port = match opened {
            Err(_) => return Err(TransportError::Timeout(timeout)),
            Ok(Err(join)) => return Err(TransportError::Link(join.to_string())),
            Ok(Ok(Err(e))) => return Err(TransportError::Connect(format!("{handle}: {e}"))),
            Ok(Ok(Ok(port))) => port,
        };
        self.port = Some(Arc::new(Mutex::new(port)));

        if !self.settings.boot_wait.is_zero() {
            tracing::info!(
                port = %handle,
                wait_ms = self.settings.boot_wait.as_millis() as u64,
                "waiting for board to boot"
            );
            tokio::time::sleep(self.settings.boot_wait).await;
        }
        self.clear_input().await?;
        tracing::info!(port = %handle, baud, "serial port open");
        Ok(())
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), TransportError> {
        // Anything still buffered is a late reply to an earlier request
        self.inbox.clear();
        let bytes = frame.to_bytes();
        tracing::trace!(msg_type = frame.msg_type, bytes = %hex::encode(&bytes), "serial tx");
        self.blocking(move |port| {
            port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
            port.write_all(&bytes)?;
            port.flush()
        })
        .await?;

        if frame.msg_type == CMD_OTA_DATA && !self.settings.pacing.is_zero() {
            tokio::time::sleep(self.settings.pacing).await;
        }
        Ok(())
    }

    async fn recv(&mut self, accept: &[u8], timeout: Duration) -> Result<Frame, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            loop {
                match self.codec.decode(&mut self.inbox) {
                    Ok(Some(frame)) if accept.contains(&frame.msg_type) => return Ok(frame),
                    Ok(Some(frame)) => {
                        tracing::debug!(msg_type = frame.msg_type, "discarding unrequested frame");
                    }
                    Ok(None) => break,
                    Err(e) => {
                        self.inbox.clear();
                        return Err(e.into());
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(TransportError::Timeout(timeout));
            }
            let received = self
                .blocking(|port| {
                    let mut buf = [0u8; MAX_PAYLOAD];
                    match port.read(&mut buf) {
                        Ok(n) => Ok(buf[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
                        Err(e) => Err(e),
                    }
                })
                .await?;
            if !received.is_empty() {
                tracing::trace!(bytes = %hex::encode(&received), "serial rx");
                self.inbox.extend_from_slice(&received);
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.port.take().is_some() {
            tracing::debug!("serial port closed");
        }
        self.inbox.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct SerialFactory {
    settings: SerialSettings,
}

impl SerialFactory {
    pub fn new(settings: SerialSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl PortFactory for SerialFactory {
    type Port = SerialLink;

    fn open(&self) -> SerialLink {
        SerialLink::new(self.settings)
    }

    /// The port is enumerated by the OS. Returns at once; `timeout` unused.
    async fn is_present(&self, handle: &String, _timeout: Duration) -> bool {
        let path = handle.clone();
        tokio::task::spawn_blocking(move || {
            serialport::available_ports()
                .map(|ports| ports.iter().any(|p| p.port_name == path))
                .unwrap_or(false)
        })
        .await
        .unwrap_or(false)
    }
}

/// Best guess at the device's port: a USB port that names our board, then
/// any USB port, then anything that is not a Bluetooth serial port.
pub fn pick_port(ports: &[SerialPortInfo]) -> Option<String> {
    let hinted = ports.iter().find(|p| match &p.port_type {
        SerialPortType::UsbPort(usb) => [&usb.product, &usb.manufacturer]
            .iter()
            .filter_map(|s| s.as_deref())
            .any(|s| USB_HINTS.iter().any(|hint| s.contains(hint))),
        _ => false,
    });
    let usb = || {
        ports
            .iter()
            .find(|p| matches!(p.port_type, SerialPortType::UsbPort(_)))
    };
    let other = || {
        ports
            .iter()
            .find(|p| !matches!(p.port_type, SerialPortType::BluetoothPort))
    };
    hinted
        .or_else(usb)
        .or_else(other)
        .map(|p| p.port_name.clone())
}

/// Enumerate ports and pick one, see [`pick_port`].
pub fn detect_port() -> Option<String> {
    match serialport::available_ports() {
        Ok(ports) => pick_port(&ports),
        Err(e) => {
            tracing::warn!(error = %e, "cannot enumerate serial ports");
            None
        }
    }
}
