//! Field bus access.
//!
//! - [`decoder`]: register words to scaled physical values
//! - [`modbus`]: RTU and ASCII framing of register reads
//! - [`serial`]: port opening, stale-byte draining, the serial [`transport::BusLink`]
//! - [`transport`]: one connection, its exclusive gate and retry policy

pub mod decoder;
pub mod modbus;
pub mod serial;
pub mod transport;

pub use decoder::{ByteOrder, DataType, RegisterDescriptor, RegisterKind};
pub use modbus::{Framing, ReadRequest};
pub use transport::{BusLink, BusTransport, LinkState, TransportSettings};
