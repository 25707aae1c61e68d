//! Modbus RTU frames for the force sensor.
//!
//! Requests are fixed 8-byte frames:
//! `[station, function, addr_hi, addr_lo, value_hi, value_lo, crc_lo, crc_hi]`.
//! Read responses carry a byte count and payload; write responses echo the
//! request; exception responses set the function's high bit.

use crate::error::{RigError, RigResult};
use crate::sensor::crc::{append_crc, check};

/// Modbus function codes used by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read holding registers
    ReadHoldingRegisters = 0x03,
    /// Write single register
    WriteSingleRegister = 0x06,
}

impl FunctionCode {
    /// Wire value.
    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Exception flag set on the function byte of an error response.
pub const EXCEPTION_FLAG: u8 = 0x80;

fn request(station: u8, function: FunctionCode, address: u16, value: u16) -> Vec<u8> {
    let [addr_hi, addr_lo] = address.to_be_bytes();
    let [value_hi, value_lo] = value.to_be_bytes();
    let mut frame = vec![
        station,
        function.code(),
        addr_hi,
        addr_lo,
        value_hi,
        value_lo,
    ];
    append_crc(&mut frame);
    frame
}

/// Read `count` holding registers starting at `start`.
pub fn read_request(station: u8, start: u16, count: u16) -> Vec<u8> {
    request(station, FunctionCode::ReadHoldingRegisters, start, count)
}

/// Write `value` to `register`.
pub fn write_request(station: u8, register: u16, value: u16) -> Vec<u8> {
    request(station, FunctionCode::WriteSingleRegister, register, value)
}

/// Total length of the response whose first bytes are `header`.
///
/// `Ok(None)` until enough of the header has arrived to tell.
pub fn response_len(header: &[u8]) -> RigResult<Option<usize>> {
    if header.len() < 2 {
        return Ok(None);
    }
    let function = header[1];
    if function & EXCEPTION_FLAG != 0 {
        return Ok(Some(5));
    }
    match function {
        0x03 | 0x04 => Ok(header.get(2).map(|&count| 3 + usize::from(count) + 2)),
        0x06 => Ok(Some(8)),
        other => Err(RigError::Protocol(format!(
            "unexpected function code {other:#04x}"
        ))),
    }
}

fn check_header(body: &[u8], station: u8, function: FunctionCode) -> RigResult<()> {
    if body[0] != station {
        return Err(RigError::Protocol(format!(
            "response from station {} while talking to {}",
            body[0], station
        )));
    }
    if body[1] == function.code() | EXCEPTION_FLAG {
        let code = body.get(2).copied().unwrap_or_default();
        return Err(RigError::Protocol(format!(
            "device exception {code:#04x} for function {:#04x}",
            function.code()
        )));
    }
    if body[1] != function.code() {
        return Err(RigError::Protocol(format!(
            "expected function {:#04x}, got {:#04x}",
            function.code(),
            body[1]
        )));
    }
    Ok(())
}

/// Validate a read response and return its register payload.
///
/// The checksum is checked before anything else in the frame is trusted.
pub fn parse_read_response(frame: &[u8], station: u8) -> RigResult<&[u8]> {
    let body = check(frame)?;
    if body.len() < 3 {
        return Err(RigError::Protocol(format!(
            "read response of {} bytes is truncated",
            frame.len()
        )));
    }
    check_header(body, station, FunctionCode::ReadHoldingRegisters)?;

    let count = usize::from(body[2]);
    let payload = &body[3..];
    if payload.len() != count {
        return Err(RigError::Protocol(format!(
            "byte count {} does not match {} payload bytes",
            count,
            payload.len()
        )));
    }
    Ok(payload)
}

/// Validate a write response: it must echo the request.
pub fn parse_write_response(frame: &[u8], request: &[u8], station: u8) -> RigResult<()> {
    let body = check(frame)?;
    if body.len() < 2 {
        return Err(RigError::Protocol("write response is truncated".to_string()));
    }
    check_header(body, station, FunctionCode::WriteSingleRegister)?;
    if frame != request {
        return Err(RigError::Protocol(
            "write response does not echo the request".to_string(),
        ));
    }
    Ok(())
}

/// Big-endian IEEE-754 value from the first four payload bytes.
pub fn decode_f32_be(payload: &[u8]) -> RigResult<f32> {
    match payload {
        [a, b, c, d, ..] => Ok(f32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(RigError::Protocol(format!(
            "need 4 payload bytes for a float, got {}",
            payload.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::crc::append_crc;

    /// Response to a two-register read carrying `value`.
    fn float_response(station: u8, value: f32) -> Vec<u8> {
        let mut frame = vec![station, 0x03, 0x04];
        frame.extend_from_slice(&value.to_be_bytes());
        append_crc(&mut frame);
        frame
    }

    #[test]
    fn read_request_layout() {
        let frame = read_request(0x01, 0x9C40, 2);
        assert_eq!(&frame[..6], &[0x01, 0x03, 0x9C, 0x40, 0x00, 0x02]);
        assert_eq!(frame.len(), 8);
        assert!(crate::sensor::crc::verify(&frame));
    }

    #[test]
    fn write_request_layout() {
        let frame = write_request(0x02, 0x0004, 0x0100);
        assert_eq!(&frame[..6], &[0x02, 0x06, 0x00, 0x04, 0x01, 0x00]);
    }

    #[test]
    fn decodes_float_payload() {
        let frame = float_response(1, 12.5);
        assert_eq!(frame.len(), 9);
        let payload = parse_read_response(&frame, 1).unwrap();
        assert_eq!(decode_f32_be(payload).unwrap(), 12.5);
    }

    #[test]
    fn corrupted_byte_is_a_checksum_error() {
        let mut frame = float_response(1, 12.5);
        frame[4] ^= 0xFF;
        assert!(matches!(
            parse_read_response(&frame, 1),
            Err(RigError::Checksum { .. })
        ));
    }

    #[test]
    fn wrong_station_and_exceptions_are_rejected() {
        let frame = float_response(7, 1.0);
        assert!(matches!(
            parse_read_response(&frame, 1),
            Err(RigError::Protocol(_))
        ));

        let mut exception = vec![0x01, 0x83, 0x02];
        append_crc(&mut exception);
        let err = parse_read_response(&exception, 1).unwrap_err();
        assert!(err.to_string().contains("device exception 0x02"));
    }

    #[test]
    fn response_length_from_header() {
        assert_eq!(response_len(&[0x01]).unwrap(), None);
        assert_eq!(response_len(&[0x01, 0x03]).unwrap(), None);
        assert_eq!(response_len(&[0x01, 0x03, 0x04]).unwrap(), Some(9));
        assert_eq!(response_len(&[0x01, 0x06]).unwrap(), Some(8));
        assert_eq!(response_len(&[0x01, 0x83]).unwrap(), Some(5));
        assert!(response_len(&[0x01, 0x10]).is_err());
    }

    #[test]
    fn write_echo_must_match() {
        let request = write_request(1, 4, 2);
        assert!(parse_write_response(&request, &request, 1).is_ok());
        let other = write_request(1, 4, 3);
        assert!(parse_write_response(&other, &request, 1).is_err());
    }

    #[test]
    fn short_payload_cannot_be_a_float() {
        assert!(decode_f32_be(&[0x00, 0x01]).is_err());
    }
}
