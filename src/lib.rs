//! # Edge Gateway Core Library
//!
//! Samples temperature, humidity and pressure sensors over half-duplex Modbus
//! serial buses, persists the series locally, raises alarms from thresholds and
//! remote forecasts, downsamples old data into coarser tiers and forwards
//! everything to a remote store.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: register decoding, Modbus RTU/ASCII framing, serial links and
//!   the per-connection `BusTransport` that serializes bus transactions.
//! - **`polling`**: one round-robin `ConnectionScheduler` per open connection and
//!   the `PollingSupervisor` that starts and reschedules them.
//! - **`ingest`**: turns samples into stored Readings and runs enrichment
//!   (prediction, alarm evaluation, export fast path) on a worker pool.
//! - **`alarm`**: layered thresholds and alarm classification.
//! - **`export`**: the export fast path and the batched sweep.
//! - **`compaction`**: `REALTIME -> MINUTELY -> HOURLY` aggregation and retention purge.
//! - **`trend`**: forecast-based predictive alarms.
//! - **`config_sync`**: remote threshold and poll interval overrides.
//! - **`storage`**: the `ReadingStore` boundary with in-memory and SQLite backends.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`logging`**: tracing subscriber setup.
//! - **`gateway`**: wiring of all of the above into a running service.

pub mod alarm;
pub mod compaction;
pub mod config;
pub mod config_sync;
pub mod error;
pub mod error_recovery;
pub mod export;
pub mod gateway;
pub mod hardware;
pub mod ingest;
pub mod logging;
pub mod periodic;
pub mod polling;
pub mod prediction;
pub mod reading;
pub mod storage;
pub mod trend;

pub use error::{AppResult, GatewayError};
pub use gateway::{Gateway, GatewayBuilder};
pub use reading::{Reading, StorageTier};
