//! Serial port plumbing.
//!
//! # Types
//!
//! - [`SerialPortIO`]: trait alias combining `AsyncRead + AsyncWrite` for serial ports
//! - [`DynSerial`]: type-erased boxed serial port
//! - [`SerialLink`]: a [`BusLink`] speaking Modbus over a [`DynSerial`]
//!
//! # Utilities
//!
//! - [`open_serial_async`]: open a port with `spawn_blocking`
//! - [`drain_serial_buffer`]: drain stale bytes before a request

use crate::error::{AppResult, GatewayError};
use crate::hardware::modbus::{self, Framing, ReadRequest};
use crate::hardware::transport::BusLink;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can be used
/// as a serial port, including `tokio_serial::SerialStream` and
/// `tokio::io::DuplexStream` in tests.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Parity setting of a serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

/// Fully resolved line parameters of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub framing: Framing,
}

/// Open a serial port asynchronously using `spawn_blocking`.
///
/// # Errors
///
/// Returns [`GatewayError::SerialOpen`] if the port cannot be opened or the
/// line parameters are out of range.
#[cfg(feature = "serial")]
pub async fn open_serial_async(settings: &LineSettings) -> AppResult<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let open_error = |reason: String| GatewayError::SerialOpen {
        port: settings.port.clone(),
        reason,
    };

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => return Err(open_error(format!("unsupported data bits {other}"))),
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => return Err(open_error(format!("unsupported stop bits {other}"))),
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };

    let port = settings.port.clone();
    let baud_rate = settings.baud_rate;
    spawn_blocking(move || {
        tokio_serial::new(&port, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
    })
    .await
    .map_err(|e| open_error(format!("spawn_blocking for serial port opening failed: {e}")))?
    .map_err(|e| open_error(e.to_string()))
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until nothing arrives within `timeout_ms`. Returns the
/// number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin + ?Sized>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total_discarded
}

/// Modbus master over a serial byte stream.
pub struct SerialLink {
    name: String,
    port: DynSerial,
    framing: Framing,
    drain_timeout_ms: u64,
}

impl SerialLink {
    pub fn new(name: impl Into<String>, port: DynSerial, framing: Framing, drain_timeout_ms: u64) -> Self {
        Self {
            name: name.into(),
            port,
            framing,
            drain_timeout_ms,
        }
    }
}

#[async_trait]
impl BusLink for SerialLink {
    async fn read_registers(&mut self, request: &ReadRequest) -> AppResult<Vec<u16>> {
        if self.drain_timeout_ms > 0 {
            let discarded = drain_serial_buffer(&mut self.port, self.drain_timeout_ms).await;
            if discarded > 0 {
                tracing::debug!(connection = %self.name, discarded, "Discarded stale bytes");
            }
        }
        modbus::transact(&mut self.port, self.framing, request).await
    }
}
