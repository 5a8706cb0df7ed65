//! CRC-16 engine for Modbus RTU frames.
//!
//! The standard algorithm is CRC-16/MODBUS: initial value 0xFFFF,
//! reflected polynomial 0xA001, checksum appended low byte first. Field
//! units (Waveshare relay and analog modules in particular) ship firmware
//! that deviates: checksum byte-swapped on the wire, seeded with zero,
//! computed with the 0x8408 polynomial, or computed over the reversed
//! payload. [`match_any_variant`] recognises all of them so the parser can
//! salvage such frames when the caller opts in.

use std::fmt;

/// Checksum flavours observed in the field, in the order they are tried.
/// `Standard` is the only one a conforming device produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcVariant {
    /// CRC-16/MODBUS, little-endian on the wire.
    Standard,
    /// Standard checksum with the two wire bytes swapped.
    Swapped,
    /// Standard polynomial seeded with 0x0000 instead of 0xFFFF.
    ZeroInit,
    /// Reflected CCITT polynomial 0x8408.
    AltPoly,
    /// Standard checksum computed over the byte-reversed frame body.
    ReversedData,
}

impl fmt::Display for CrcVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrcVariant::Standard => "standard",
            CrcVariant::Swapped => "byte-swapped",
            CrcVariant::ZeroInit => "zero-init",
            CrcVariant::AltPoly => "poly-8408",
            CrcVariant::ReversedData => "reversed-data",
        };
        write!(f, "{name}")
    }
}

/// CRC-16/MODBUS over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    crc16_with(data, 0xFFFF, 0xA001)
}

fn crc16_with(data: &[u8], init: u16, poly: u16) -> u16 {
    let mut crc = init;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ poly;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the standard checksum to `frame`, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Strict check: the trailing two bytes, read little-endian, must equal the
/// standard CRC of everything before them.
pub fn check(frame: &[u8]) -> bool {
    let Some((body, tail)) = split_checksum(frame) else {
        return false;
    };
    tail == crc16(body)
}

/// Try every known variant in order and return the first that matches the
/// trailing two bytes, or `None` when the frame satisfies none of them.
pub fn match_any_variant(frame: &[u8]) -> Option<CrcVariant> {
    let (body, wire) = split_checksum(frame)?;
    let standard = crc16(body);
    if wire == standard {
        return Some(CrcVariant::Standard);
    }
    if wire == standard.swap_bytes() {
        return Some(CrcVariant::Swapped);
    }
    if wire == crc16_with(body, 0x0000, 0xA001) {
        return Some(CrcVariant::ZeroInit);
    }
    if wire == crc16_with(body, 0xFFFF, 0x8408) {
        return Some(CrcVariant::AltPoly);
    }
    let reversed: Vec<u8> = body.iter().rev().copied().collect();
    if wire == crc16(&reversed) {
        return Some(CrcVariant::ReversedData);
    }
    None
}

fn split_checksum(frame: &[u8]) -> Option<(&[u8], u16)> {
    if frame.len() < 3 {
        return None;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    Some((body, u16::from_le_bytes([tail[0], tail[1]])))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_checksums() {
        // Reference frames with their wire checksums (low byte first).
        assert_eq!(crc16(&[0x01, 0x01, 0x00, 0x00, 0x00, 0x01]), 0xCAFD);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
        assert_eq!(crc16(&[0x01, 0x01, 0x01, 0x00]), 0x8851);
        assert_eq!(crc16(&[0x01, 0x83, 0x02]), 0xF1C0);
    }

    #[test]
    fn test_round_trip_always_validates() {
        let bodies: [&[u8]; 4] = [
            &[0x01],
            &[0x0B, 0x10, 0x00, 0x20, 0x00, 0x02, 0x04, 0xDE, 0xAD, 0xBE, 0xEF],
            &[0x00; 32],
            &[0xFF; 7],
        ];
        for body in bodies {
            let mut frame = body.to_vec();
            append_crc(&mut frame);
            assert!(check(&frame), "round trip failed for {frame:02X?}");
            assert_eq!(match_any_variant(&frame), Some(CrcVariant::Standard));
        }
    }

    #[test]
    fn test_swapped_checksum_is_recognised() {
        let mut frame = vec![0x01, 0x01, 0x01, 0x00];
        let crc = crc16(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert!(!check(&frame));
        assert_eq!(match_any_variant(&frame), Some(CrcVariant::Swapped));
    }

    #[test]
    fn test_zero_init_checksum_is_recognised() {
        let body = [0x01u8, 0x03, 0x02, 0x12, 0x34];
        let mut frame = body.to_vec();
        let crc = crc16_with(&body, 0x0000, 0xA001);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(match_any_variant(&frame), Some(CrcVariant::ZeroInit));
    }

    #[test]
    fn test_alt_poly_checksum_is_recognised() {
        let body = [0x01u8, 0x04, 0x02, 0x00, 0x2A];
        let mut frame = body.to_vec();
        let crc = crc16_with(&body, 0xFFFF, 0x8408);
        frame.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(match_any_variant(&frame), Some(CrcVariant::AltPoly));
    }

    #[test]
    fn test_reversed_data_checksum_is_recognised() {
        let body = [0x01u8, 0x02, 0x01, 0x55];
        let reversed: Vec<u8> = body.iter().rev().copied().collect();
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(&reversed).to_le_bytes());
        assert_eq!(match_any_variant(&frame), Some(CrcVariant::ReversedData));
    }

    #[test]
    fn test_garbage_matches_nothing() {
        let frame = [0x01u8, 0x01, 0x01, 0x00, 0x12, 0x34];
        assert!(!check(&frame));
        assert_eq!(match_any_variant(&frame), None);
    }
}
