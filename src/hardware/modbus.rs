//! Modbus serial framing for register reads.
//!
//! Only the two read functions the gateway needs are supported: 0x03 (read holding
//! registers) and 0x04 (read input registers). Both RTU (binary, CRC-16/MODBUS
//! trailer, CRC low byte first) and ASCII (`:` + hex + LRC + CRLF) framings are
//! implemented over any async byte stream, so tests can run them against
//! `tokio::io::duplex` pipes.

use crate::error::{AppResult, GatewayError};
use crate::hardware::decoder::RegisterKind;
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Upper bound on an ASCII frame, start colon and CRLF included.
const MAX_ASCII_FRAME: usize = 513;

/// Wire framing of a serial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Framing {
    #[default]
    #[serde(alias = "rtu")]
    Rtu,
    #[serde(alias = "ascii")]
    Ascii,
}

/// One register read addressed to a unit on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadRequest {
    pub unit: u8,
    pub kind: RegisterKind,
    pub start: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn function_code(&self) -> u8 {
        match self.kind {
            RegisterKind::Holding => 0x03,
            RegisterKind::Input => 0x04,
        }
    }

    /// Protocol data unit with the unit address in front, no checksum.
    fn body(&self) -> [u8; 6] {
        let start = self.start.to_be_bytes();
        let count = self.count.to_be_bytes();
        [
            self.unit,
            self.function_code(),
            start[0],
            start[1],
            count[0],
            count[1],
        ]
    }
}

/// Encode an RTU request frame.
pub fn encode_rtu(request: &ReadRequest) -> Vec<u8> {
    let body = request.body();
    let mut frame = body.to_vec();
    frame.extend_from_slice(&CRC16.checksum(&body).to_le_bytes());
    frame
}

/// Encode an ASCII request frame.
pub fn encode_ascii(request: &ReadRequest) -> Vec<u8> {
    let body = request.body();
    let mut frame = String::with_capacity(17);
    frame.push(':');
    for byte in body.iter().chain(std::iter::once(&lrc(&body))) {
        frame.push_str(&format!("{byte:02X}"));
    }
    frame.push_str("\r\n");
    frame.into_bytes()
}

/// Longitudinal redundancy check used by ASCII framing.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b))
        .wrapping_neg()
}

/// Write `request` and read the matching response, returning the register words.
///
/// The caller is responsible for holding the connection gate and for applying a
/// timeout; this function blocks until a full frame has arrived.
pub async fn transact<S>(io: &mut S, framing: Framing, request: &ReadRequest) -> AppResult<Vec<u16>>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    match framing {
        Framing::Rtu => {
            io.write_all(&encode_rtu(request)).await?;
            io.flush().await?;
            let pdu = read_rtu_response(io).await?;
            parse_pdu(request, &pdu)
        }
        Framing::Ascii => {
            io.write_all(&encode_ascii(request)).await?;
            io.flush().await?;
            let pdu = read_ascii_response(io).await?;
            parse_pdu(request, &pdu)
        }
    }
}

/// Read one RTU frame and return it without its CRC trailer.
async fn read_rtu_response<S>(io: &mut S) -> AppResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 3];
    io.read_exact(&mut header).await?;

    // Exception frames carry a single code byte where the byte count would be.
    let remaining = if header[1] & 0x80 != 0 {
        2
    } else {
        usize::from(header[2]) + 2
    };

    let mut frame = Vec::with_capacity(3 + remaining);
    frame.extend_from_slice(&header);
    frame.resize(3 + remaining, 0);
    io.read_exact(&mut frame[3..]).await?;

    let split = frame.len() - 2;
    let expected = u16::from_le_bytes([frame[split], frame[split + 1]]);
    let actual = CRC16.checksum(&frame[..split]);
    if expected != actual {
        return Err(GatewayError::MalformedFrame(format!(
            "CRC mismatch: frame 0x{expected:04X}, computed 0x{actual:04X}"
        )));
    }
    frame.truncate(split);
    Ok(frame)
}

/// Read one ASCII frame and return its decoded bytes without the LRC.
async fn read_ascii_response<S>(io: &mut S) -> AppResult<Vec<u8>>
where
    S: AsyncRead + Unpin + ?Sized,
{
    // Skip anything before the start colon.
    loop {
        if io.read_u8().await? == b':' {
            break;
        }
    }

    let mut text = Vec::with_capacity(64);
    loop {
        let byte = io.read_u8().await?;
        if byte == b'\n' {
            break;
        }
        text.push(byte);
        if text.len() > MAX_ASCII_FRAME {
            return Err(GatewayError::MalformedFrame(
                "ASCII frame exceeds maximum length".into(),
            ));
        }
    }
    if text.last() == Some(&b'\r') {
        text.pop();
    }
    if text.len() % 2 != 0 || text.len() < 6 {
        return Err(GatewayError::MalformedFrame(format!(
            "ASCII frame has {} hex digits",
            text.len()
        )));
    }

    let mut bytes = text
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| GatewayError::MalformedFrame("invalid hex digit".into()))
        })
        .collect::<AppResult<Vec<u8>>>()?;

    let received = bytes.pop().unwrap_or_default();
    let computed = lrc(&bytes);
    if received != computed {
        return Err(GatewayError::MalformedFrame(format!(
            "LRC mismatch: frame 0x{received:02X}, computed 0x{computed:02X}"
        )));
    }
    Ok(bytes)
}

/// Validate a response PDU (unit address included) against its request.
fn parse_pdu(request: &ReadRequest, pdu: &[u8]) -> AppResult<Vec<u16>> {
    if pdu.len() < 3 {
        return Err(GatewayError::MalformedFrame(format!(
            "response of {} bytes is too short",
            pdu.len()
        )));
    }
    let (unit, function) = (pdu[0], pdu[1]);
    if unit != request.unit {
        return Err(GatewayError::MalformedFrame(format!(
            "response from unit {unit}, expected {}",
            request.unit
        )));
    }
    if function == request.function_code() | 0x80 {
        return Err(GatewayError::ModbusException {
            unit,
            function: request.function_code(),
            code: pdu[2],
        });
    }
    if function != request.function_code() {
        return Err(GatewayError::MalformedFrame(format!(
            "function 0x{function:02X} in response, expected 0x{:02X}",
            request.function_code()
        )));
    }

    let byte_count = usize::from(pdu[2]);
    let data = &pdu[3..];
    if byte_count != data.len() || byte_count != usize::from(request.count) * 2 {
        return Err(GatewayError::Decode(format!(
            "expected {} data bytes, got {}",
            usize::from(request.count) * 2,
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn holding(unit: u8, start: u16, count: u16) -> ReadRequest {
        ReadRequest {
            unit,
            kind: RegisterKind::Holding,
            start,
            count,
        }
    }

    fn rtu_frame(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&CRC16.checksum(body).to_le_bytes());
        frame
    }

    #[test]
    fn rtu_request_matches_known_frame() {
        // 01 03 00 00 00 03 05 CB
        assert_eq!(
            encode_rtu(&holding(1, 0, 3)),
            vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x03, 0x05, 0xCB]
        );
    }

    #[test]
    fn input_registers_use_function_four() {
        let request = ReadRequest {
            kind: RegisterKind::Input,
            ..holding(1, 0, 1)
        };
        assert_eq!(encode_rtu(&request)[1], 0x04);
    }

    #[test]
    fn ascii_request_has_lrc_and_crlf() {
        let frame = String::from_utf8(encode_ascii(&holding(1, 0, 3))).unwrap();
        // 01+03+00+00+00+03 = 0x07, LRC = 0xF9
        assert_eq!(frame, ":010300000003F9\r\n");
    }

    #[tokio::test]
    async fn rtu_transaction_reads_registers() {
        let (mut client, mut device) = duplex(64);
        let request = holding(1, 0, 2);

        let responder = tokio::spawn(async move {
            let mut incoming = [0u8; 8];
            device.read_exact(&mut incoming).await.unwrap();
            assert_eq!(incoming.to_vec(), encode_rtu(&holding(1, 0, 2)));
            device
                .write_all(&rtu_frame(&[0x01, 0x03, 0x04, 0x00, 0xFA, 0x01, 0xF4]))
                .await
                .unwrap();
        });

        let words = transact(&mut client, Framing::Rtu, &request).await.unwrap();
        assert_eq!(words, vec![250, 500]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn rtu_exception_is_reported() {
        let (mut client, mut device) = duplex(64);
        device
            .write_all(&rtu_frame(&[0x01, 0x83, 0x02]))
            .await
            .unwrap();

        let err = transact(&mut client, Framing::Rtu, &holding(1, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::ModbusException {
                unit: 1,
                function: 0x03,
                code: 0x02
            }
        ));
    }

    #[tokio::test]
    async fn rtu_bad_crc_is_malformed() {
        let (mut client, mut device) = duplex(64);
        device
            .write_all(&[0x01, 0x03, 0x02, 0x00, 0xFA, 0x00, 0x00])
            .await
            .unwrap();

        let err = transact(&mut client, Framing::Rtu, &holding(1, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn rtu_wrong_unit_is_malformed() {
        let (mut client, mut device) = duplex(64);
        device
            .write_all(&rtu_frame(&[0x02, 0x03, 0x02, 0x00, 0xFA]))
            .await
            .unwrap();

        let err = transact(&mut client, Framing::Rtu, &holding(1, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn ascii_transaction_reads_registers() {
        let (mut client, mut device) = duplex(128);
        let body = [0x01u8, 0x03, 0x02, 0x00, 0xFA];
        let mut reply = String::from(":");
        for b in body.iter().chain(std::iter::once(&lrc(&body))) {
            reply.push_str(&format!("{b:02X}"));
        }
        reply.push_str("\r\n");
        device.write_all(reply.as_bytes()).await.unwrap();

        let words = transact(&mut client, Framing::Ascii, &holding(1, 0, 1))
            .await
            .unwrap();
        assert_eq!(words, vec![250]);
    }

    #[tokio::test]
    async fn ascii_bad_lrc_is_malformed() {
        let (mut client, mut device) = duplex(128);
        device.write_all(b":01030200FA00\r\n").await.unwrap();

        let err = transact(&mut client, Framing::Ascii, &holding(1, 0, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::MalformedFrame(_)));
    }
}
