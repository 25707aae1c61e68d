//! CRC-16/MODBUS: reflected polynomial 0xA001, seed 0xFFFF, appended low byte first.

use crate::error::{RigError, RigResult};
use crc::{Crc, CRC_16_MODBUS};

const MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Checksum of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS.checksum(data)
}

/// Append the checksum of `frame` to it, little-endian.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a frame whose last two bytes are its checksum.
///
/// Returns the frame body, possibly empty, on success and
/// [`RigError::Checksum`] on mismatch. Frames shorter than the two checksum
/// bytes are rejected as malformed.
pub fn check(frame: &[u8]) -> RigResult<&[u8]> {
    if frame.len() < 2 {
        return Err(RigError::Protocol(format!(
            "frame of {} bytes is too short to carry a checksum",
            frame.len()
        )));
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    let computed = crc16(body);
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    if computed != received {
        return Err(RigError::Checksum { computed, received });
    }
    Ok(body)
}

/// Whether `frame` ends in a valid checksum of its body.
pub fn verify(frame: &[u8]) -> bool {
    check(frame).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn standard_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn known_read_request() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(frame, [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        assert!(verify(&frame));
    }

    #[test]
    fn short_frames_are_malformed() {
        assert!(matches!(check(&[0x01]), Err(RigError::Protocol(_))));
        assert!(!verify(&[]));
        assert!(matches!(
            check(&[0x01, 0x02]),
            Err(RigError::Checksum { .. })
        ));
    }

    #[test]
    fn empty_body_carries_only_the_seed() {
        let mut frame = Vec::new();
        append_crc(&mut frame);
        assert_eq!(frame, [0xFF, 0xFF]);
        assert!(verify(&frame));
        assert!(check(&frame).unwrap().is_empty());
    }

    #[test]
    fn mismatch_reports_both_values() {
        let frame = [0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0B];
        match check(&frame) {
            Err(RigError::Checksum { computed, received }) => {
                assert_eq!(computed, 0x0A84);
                assert_eq!(received, 0x0B84);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    proptest! {
        #[test]
        fn appended_crc_verifies(payload in proptest::collection::vec(any::<u8>(), 0..64)) {
            let mut frame = payload.clone();
            append_crc(&mut frame);
            prop_assert!(verify(&frame));
            prop_assert_eq!(check(&frame).unwrap(), payload.as_slice());
        }

        #[test]
        fn single_bit_flip_is_detected(
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            position in any::<proptest::sample::Index>(),
            bit in 0u8..8,
        ) {
            let mut frame = payload;
            append_crc(&mut frame);
            let byte = position.index(frame.len());
            frame[byte] ^= 1 << bit;
            prop_assert!(!verify(&frame));
        }
    }
}
