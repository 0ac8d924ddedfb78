//! Register decoding.
//!
//! Converts raw 16-bit register words into scaled physical values. A register
//! descriptor names the register space, the starting address, how many words the
//! value spans (implied by the data type), how the bytes are ordered on the wire,
//! and the scale factor applied to the interpreted integer or float.
//!
//! Decoding a contiguous block and slicing per-measurement offsets out of it
//! yields exactly the same values as decoding each register on its own; the
//! combined read is purely a bus round-trip optimisation.

use crate::error::{AppResult, GatewayError};
use serde::{Deserialize, Serialize};

/// Largest register count a single read request may ask for.
pub const MAX_REGISTERS_PER_READ: u16 = 125;

/// Modbus register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Read/write registers, function code 0x03.
    Holding,
    /// Read-only registers, function code 0x04.
    Input,
}

/// Interpretation of the raw register words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "uint16")]
    U16,
    #[default]
    #[serde(alias = "int16")]
    I16,
    #[serde(alias = "uint32")]
    U32,
    #[serde(alias = "int32")]
    I32,
    #[serde(alias = "float32", alias = "float")]
    F32,
    #[serde(alias = "uint64")]
    U64,
    #[serde(alias = "int64")]
    I64,
    #[serde(alias = "float64", alias = "double")]
    F64,
}

impl DataType {
    /// Number of 16-bit registers the value occupies.
    pub fn register_count(self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 => 1,
            DataType::U32 | DataType::I32 | DataType::F32 => 2,
            DataType::U64 | DataType::I64 | DataType::F64 => 4,
        }
    }
}

/// Byte ordering of a multi-byte value, named by the position of the most
/// significant byte `A` through the least significant byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// `ABCD`: registers and bytes in natural Modbus order.
    #[default]
    #[serde(alias = "abcd")]
    BigEndian,
    /// `DCBA`: everything reversed.
    #[serde(alias = "dcba")]
    LittleEndian,
    /// `BADC`: words in order, bytes swapped inside each word.
    #[serde(alias = "badc")]
    BigEndianByteSwap,
    /// `CDAB`: words reversed, bytes inside each word in order.
    #[serde(alias = "cdab")]
    LittleEndianByteSwap,
}

/// Where and how one measurement lives on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Register space.
    #[serde(alias = "register_type")]
    pub kind: RegisterKind,
    /// Starting register address.
    pub address: u16,
    /// Value interpretation.
    #[serde(default)]
    pub data_type: DataType,
    /// Multiplier applied to the interpreted value. Zero is read as 1.0.
    #[serde(default = "default_scale")]
    pub scale: f64,
    /// Byte ordering of multi-word values.
    #[serde(default)]
    pub byte_order: ByteOrder,
}

fn default_scale() -> f64 {
    1.0
}

impl RegisterDescriptor {
    /// Descriptor for a single holding register with the given scale.
    pub fn holding(address: u16, scale: f64) -> Self {
        Self {
            kind: RegisterKind::Holding,
            address,
            data_type: DataType::I16,
            scale,
            byte_order: ByteOrder::BigEndian,
        }
    }

    /// Number of registers spanned by this descriptor.
    pub fn register_count(&self) -> u16 {
        self.data_type.register_count()
    }

    fn end_address(&self) -> u32 {
        u32::from(self.address) + u32::from(self.register_count())
    }
}

/// Decode the value described by `descriptor` from `words`, which must start
/// at the descriptor's address.
pub fn decode(words: &[u16], descriptor: &RegisterDescriptor) -> AppResult<f64> {
    let count = usize::from(descriptor.register_count());
    if words.len() < count {
        return Err(GatewayError::Decode(format!(
            "{:?} at address {} needs {} registers, got {}",
            descriptor.data_type,
            descriptor.address,
            count,
            words.len()
        )));
    }

    let bytes = ordered_bytes(&words[..count], descriptor.byte_order);
    let raw = interpret(&bytes, descriptor.data_type);
    if !raw.is_finite() {
        return Err(GatewayError::Decode(format!(
            "non-finite value at address {}",
            descriptor.address
        )));
    }
    Ok(raw * effective_scale(descriptor.scale))
}

/// A single read that covers several descriptors in one register space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
}

impl BlockPlan {
    /// Plan one read covering every descriptor, or `None` when they cannot share
    /// a request (mixed register spaces, or a span longer than one request allows).
    pub fn covering<'a, I>(descriptors: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a RegisterDescriptor>,
    {
        let mut iter = descriptors.into_iter();
        let first = iter.next()?;
        let kind = first.kind;
        let mut start = u32::from(first.address);
        let mut end = first.end_address();
        for descriptor in iter {
            if descriptor.kind != kind {
                return None;
            }
            start = start.min(u32::from(descriptor.address));
            end = end.max(descriptor.end_address());
        }
        let count = end - start;
        if count > u32::from(MAX_REGISTERS_PER_READ) {
            return None;
        }
        Some(Self {
            kind,
            start: u16::try_from(start).ok()?,
            count: u16::try_from(count).ok()?,
        })
    }

    /// Decode one descriptor out of the block that was read for this plan.
    pub fn slice(&self, block: &[u16], descriptor: &RegisterDescriptor) -> AppResult<f64> {
        let offset = descriptor
            .address
            .checked_sub(self.start)
            .map(usize::from)
            .filter(|offset| *offset < block.len())
            .ok_or_else(|| {
                GatewayError::Decode(format!(
                    "address {} outside block {}..{}",
                    descriptor.address,
                    self.start,
                    u32::from(self.start) + block.len() as u32
                ))
            })?;
        decode(&block[offset..], descriptor)
    }
}

fn effective_scale(scale: f64) -> f64 {
    if scale == 0.0 {
        1.0
    } else {
        scale
    }
}

fn ordered_bytes(words: &[u16], order: ByteOrder) -> Vec<u8> {
    match order {
        ByteOrder::BigEndian => words.iter().flat_map(|w| w.to_be_bytes()).collect(),
        ByteOrder::LittleEndian => words.iter().rev().flat_map(|w| w.to_le_bytes()).collect(),
        ByteOrder::BigEndianByteSwap => words.iter().flat_map(|w| w.to_le_bytes()).collect(),
        ByteOrder::LittleEndianByteSwap => words.iter().rev().flat_map(|w| w.to_be_bytes()).collect(),
    }
}

fn interpret(bytes: &[u8], data_type: DataType) -> f64 {
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    match data_type {
        DataType::U16 => f64::from(u16::from_be_bytes([buf[0], buf[1]])),
        DataType::I16 => f64::from(i16::from_be_bytes([buf[0], buf[1]])),
        DataType::U32 => f64::from(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
        DataType::I32 => f64::from(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
        DataType::F32 => f64::from(f32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])),
        DataType::U64 => u64::from_be_bytes(buf) as f64,
        DataType::I64 => i64::from_be_bytes(buf) as f64,
        DataType::F64 => f64::from_be_bytes(buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(address: u16, data_type: DataType, byte_order: ByteOrder) -> RegisterDescriptor {
        RegisterDescriptor {
            kind: RegisterKind::Holding,
            address,
            data_type,
            scale: 1.0,
            byte_order,
        }
    }

    #[test]
    fn scales_single_register() {
        let d = RegisterDescriptor::holding(0, 0.1);
        let value = decode(&[250], &d).unwrap();
        assert!((value - 25.0).abs() < 1e-9);
    }

    #[test]
    fn signed_sixteen_bit_is_negative() {
        let d = RegisterDescriptor::holding(0, 0.1);
        let value = decode(&[0xFF9C], &d).unwrap(); // -100
        assert!((value + 10.0).abs() < 1e-9);
    }

    #[test]
    fn zero_scale_is_identity() {
        let d = RegisterDescriptor::holding(0, 0.0);
        assert_eq!(decode(&[42], &d).unwrap(), 42.0);
    }

    #[test]
    fn float32_in_every_byte_order() {
        // 25.5f32 == 0x41CC0000
        let cases = [
            (ByteOrder::BigEndian, [0x41CC, 0x0000]),
            (ByteOrder::LittleEndian, [0x0000, 0xCC41]),
            (ByteOrder::BigEndianByteSwap, [0xCC41, 0x0000]),
            (ByteOrder::LittleEndianByteSwap, [0x0000, 0x41CC]),
        ];
        for (order, words) in cases {
            let d = descriptor(0, DataType::F32, order);
            assert_eq!(decode(&words, &d).unwrap(), 25.5, "{order:?}");
        }
    }

    #[test]
    fn u32_word_swapped() {
        let d = descriptor(0, DataType::U32, ByteOrder::LittleEndianByteSwap);
        assert_eq!(decode(&[0x0001, 0x0002], &d).unwrap(), 0x0002_0001 as f64);
    }

    #[test]
    fn short_input_is_decode_error() {
        let d = descriptor(0, DataType::F32, ByteOrder::BigEndian);
        assert!(matches!(decode(&[1], &d), Err(GatewayError::Decode(_))));
    }

    #[test]
    fn nan_is_rejected() {
        let d = descriptor(0, DataType::F32, ByteOrder::BigEndian);
        assert!(decode(&[0x7FC0, 0x0000], &d).is_err());
    }

    #[test]
    fn block_slice_matches_individual_decode() {
        let temperature = RegisterDescriptor::holding(0, 0.1);
        let humidity = RegisterDescriptor::holding(1, 0.1);
        let pressure = descriptor(2, DataType::U32, ByteOrder::BigEndian);
        let block = [250u16, 512, 0x0001, 0x86A0];

        let plan = BlockPlan::covering([&temperature, &humidity, &pressure]).unwrap();
        assert_eq!(plan.start, 0);
        assert_eq!(plan.count, 4);

        for d in [&temperature, &humidity, &pressure] {
            let offset = usize::from(d.address);
            assert_eq!(plan.slice(&block, d).unwrap(), decode(&block[offset..], d).unwrap());
        }
    }

    #[test]
    fn block_refuses_mixed_register_space() {
        let a = RegisterDescriptor::holding(0, 1.0);
        let mut b = RegisterDescriptor::holding(1, 1.0);
        b.kind = RegisterKind::Input;
        assert!(BlockPlan::covering([&a, &b]).is_none());
    }

    #[test]
    fn block_refuses_oversized_span() {
        let a = RegisterDescriptor::holding(0, 1.0);
        let b = RegisterDescriptor::holding(200, 1.0);
        assert!(BlockPlan::covering([&a, &b]).is_none());
    }
}
