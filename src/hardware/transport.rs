//! One physical serial connection and its exclusive gate.
//!
//! A half-duplex bus can carry exactly one request/response exchange at a time.
//! [`BusTransport`] owns the link behind a `tokio::sync::Mutex` and every read,
//! single register or full sensor sample, happens while that gate is held. Each
//! attempt gets its own timeout; transient failures are retried a fixed number
//! of times with a constant delay, all inside the same gate hold.
//!
//! State machine: `Closed -> Opening -> Open -> (Busy during a transaction) -> Open -> Closed`.

use crate::config::SensorDefinition;
use crate::error::{AppResult, GatewayError};
use crate::error_recovery::{with_timeout, RetryPolicy};
use crate::hardware::decoder::{self, BlockPlan, RegisterDescriptor};
use crate::hardware::modbus::ReadRequest;
use crate::reading::Measurements;
use async_trait::async_trait;
use parking_lot::Mutex as StateLock;
use std::time::Duration;
use tokio::sync::Mutex;

/// A request/response channel to the devices on one bus.
///
/// Implemented by [`SerialLink`](crate::hardware::serial::SerialLink) for real
/// ports and by fakes in tests.
#[async_trait]
pub trait BusLink: Send {
    async fn read_registers(&mut self, request: &ReadRequest) -> AppResult<Vec<u16>>;
}

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Open,
    Busy,
}

/// Per-connection transaction limits.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Timeout of one attempt
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Read all registers of a sample in one request when they are co-located
    pub combine_reads: bool,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            retry: RetryPolicy::with_retries(2, Duration::from_millis(20)),
            combine_reads: true,
        }
    }
}

pub struct BusTransport {
    name: String,
    gate: Mutex<Option<Box<dyn BusLink>>>,
    state: StateLock<LinkState>,
    settings: TransportSettings,
}

impl BusTransport {
    pub fn new(name: impl Into<String>, settings: TransportSettings) -> Self {
        Self {
            name: name.into(),
            gate: Mutex::new(None),
            state: StateLock::new(LinkState::Closed),
            settings,
        }
    }

    /// A transport that is already open on `link`.
    pub fn with_link(name: impl Into<String>, link: Box<dyn BusLink>, settings: TransportSettings) -> Self {
        Self {
            name: name.into(),
            gate: Mutex::new(Some(link)),
            state: StateLock::new(LinkState::Open),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock()
    }

    /// Open the physical serial port described by `line`.
    ///
    /// On failure the transport returns to `Closed` and the error is handed back
    /// to the caller, which leaves this connection out of the live set.
    #[cfg(feature = "serial")]
    pub async fn open_serial(
        &self,
        line: &crate::hardware::serial::LineSettings,
        drain_timeout_ms: u64,
    ) -> AppResult<()> {
        use crate::hardware::serial::{open_serial_async, SerialLink};

        *self.state.lock() = LinkState::Opening;
        match open_serial_async(line).await {
            Ok(port) => {
                let link = SerialLink::new(self.name.clone(), Box::new(port), line.framing, drain_timeout_ms);
                self.attach(Box::new(link)).await;
                tracing::info!(
                    connection = %self.name,
                    port = %line.port,
                    baud = line.baud_rate,
                    framing = ?line.framing,
                    "Serial connection opened"
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock() = LinkState::Closed;
                Err(e)
            }
        }
    }

    /// Install an already-connected link.
    pub async fn attach(&self, link: Box<dyn BusLink>) {
        let mut gate = self.gate.lock().await;
        *gate = Some(link);
        *self.state.lock() = LinkState::Open;
    }

    /// Drop the link. Waits for an in-flight transaction to finish first.
    pub async fn close(&self) {
        let mut gate = self.gate.lock().await;
        if gate.take().is_some() {
            tracing::info!(connection = %self.name, "Serial connection closed");
        }
        *self.state.lock() = LinkState::Closed;
    }

    /// Read raw registers under the gate.
    pub async fn read(&self, request: &ReadRequest) -> AppResult<Vec<u16>> {
        let mut gate = self.gate.lock().await;
        let link = gate
            .as_mut()
            .ok_or_else(|| GatewayError::ConnectionNotOpen(self.name.clone()))?;
        let _busy = BusyGuard::enter(&self.state);
        self.exchange(&mut **link, request).await
    }

    /// Read every configured measurement of `sensor` in one gate hold.
    ///
    /// Fails when the temperature register is missing or unreadable. Humidity and
    /// pressure are recorded as absent when their read fails.
    #[tracing::instrument(skip_all, fields(connection = %self.name, sensor = %sensor.id))]
    pub async fn read_sample(&self, sensor: &SensorDefinition) -> AppResult<Measurements> {
        let temperature = sensor.temperature.as_ref().ok_or_else(|| {
            GatewayError::Configuration(format!("sensor {} has no temperature register", sensor.id))
        })?;
        let measured: Vec<&RegisterDescriptor> = [Some(temperature), sensor.humidity.as_ref(), sensor.pressure.as_ref()]
            .into_iter()
            .flatten()
            .collect();

        let raw = {
            let mut gate = self.gate.lock().await;
            let link = gate
                .as_mut()
                .ok_or_else(|| GatewayError::ConnectionNotOpen(self.name.clone()))?;
            let _busy = BusyGuard::enter(&self.state);
            self.collect_raw(&mut **link, sensor.unit, &measured).await
        };

        let decode_optional = |descriptor: Option<&RegisterDescriptor>, what: &str| {
            let descriptor = descriptor?;
            let value = raw.decode(descriptor);
            if let Err(e) = &value {
                tracing::debug!(error = %e, "{} unavailable", what);
            }
            value.ok()
        };

        Ok(Measurements {
            temperature: raw.decode(temperature)?,
            humidity: decode_optional(sensor.humidity.as_ref(), "humidity"),
            pressure: decode_optional(sensor.pressure.as_ref(), "pressure"),
        })
    }

    /// Issue the bus reads for `descriptors`. Decoding happens after the gate is released.
    async fn collect_raw(&self, link: &mut dyn BusLink, unit: u8, descriptors: &[&RegisterDescriptor]) -> RawSample {
        if self.settings.combine_reads && descriptors.len() > 1 {
            if let Some(plan) = BlockPlan::covering(descriptors.iter().copied()) {
                let request = ReadRequest {
                    unit,
                    kind: plan.kind,
                    start: plan.start,
                    count: plan.count,
                };
                match self.exchange(link, &request).await {
                    Ok(block) => return RawSample::Block(plan, block),
                    // A gap in the span may be unmapped on the device.
                    Err(GatewayError::ModbusException { code, .. }) => {
                        tracing::debug!(code, "Combined read rejected, reading registers one by one");
                    }
                    Err(e) => return RawSample::Failed(e.to_string()),
                }
            }
        }

        let mut words = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let request = ReadRequest {
                unit,
                kind: descriptor.kind,
                start: descriptor.address,
                count: descriptor.register_count(),
            };
            let result = self.exchange(link, &request).await;
            words.push((descriptor.address, descriptor.kind, result));
        }
        RawSample::Individual(words)
    }

    /// One request with per-attempt timeout and fixed retries.
    async fn exchange(&self, link: &mut dyn BusLink, request: &ReadRequest) -> AppResult<Vec<u16>> {
        let policy = &self.settings.retry;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match with_timeout(self.settings.timeout, link.read_registers(request)).await {
                Ok(words) => return Ok(words),
                Err(e) if policy.should_retry(attempt, &e) => {
                    tracing::debug!(
                        connection = %self.name,
                        unit = request.unit,
                        address = request.start,
                        attempt,
                        error = %e,
                        "Bus transaction failed, retrying"
                    );
                    policy.pause().await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

type IndividualRead = (u16, crate::hardware::decoder::RegisterKind, AppResult<Vec<u16>>);

/// Register words captured under the gate.
enum RawSample {
    Block(BlockPlan, Vec<u16>),
    Individual(Vec<IndividualRead>),
    Failed(String),
}

impl RawSample {
    fn decode(&self, descriptor: &RegisterDescriptor) -> AppResult<f64> {
        match self {
            RawSample::Block(plan, block) => plan.slice(block, descriptor),
            RawSample::Individual(reads) => {
                let (_, _, result) = reads
                    .iter()
                    .find(|(address, kind, _)| *address == descriptor.address && *kind == descriptor.kind)
                    .ok_or_else(|| GatewayError::Decode(format!("address {} was not read", descriptor.address)))?;
                match result {
                    Ok(words) => decoder::decode(words, descriptor),
                    Err(e) => Err(GatewayError::Decode(e.to_string())),
                }
            }
            RawSample::Failed(reason) => Err(GatewayError::Decode(reason.clone())),
        }
    }
}

/// Marks the link `Busy` for the lifetime of a transaction.
struct BusyGuard<'a> {
    state: &'a StateLock<LinkState>,
}

impl<'a> BusyGuard<'a> {
    fn enter(state: &'a StateLock<LinkState>) -> Self {
        *state.lock() = LinkState::Busy;
        Self { state }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if *state == LinkState::Busy {
            *state = LinkState::Open;
        }
    }
}
