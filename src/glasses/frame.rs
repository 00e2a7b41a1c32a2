//! 64-byte framed packets exchanged with the glasses.
//!
//! Layout (all multi-byte fields little-endian):
//! - `[0..2]`: magic, `FF FE` for the MCU interface, `FF FC` for the IMU interface
//! - `[2..4]`: CRC-16/CCITT over `[4 .. 4 + L + 2)`
//! - `[4..6]`: length field `L` (covers the 12 header bytes plus data)
//! - `[6..14]`: reserved on send; device timestamp in `[6..10]` on receive
//! - `[14..16]`: command identifier
//! - `[16..18]`: reserved
//! - `[18..18 + L - 12]`: command data, zero padding up to 64 bytes

use crate::error::ProtocolError;

pub const PACKET_SIZE: usize = 64;

pub const MAGIC_MCU: [u8; 2] = [0xFF, 0xFE];
pub const MAGIC_IMU: [u8; 2] = [0xFF, 0xFC];

/// Smallest legal length field: 8 reserved + 2 cmd_id + 2 reserved.
pub const MIN_LENGTH: u16 = 0x0C;

const OFFSET_CRC: usize = 2;
const OFFSET_LENGTH: usize = 4;
const OFFSET_TIMESTAMP: usize = 6;
pub const OFFSET_CMD_ID: usize = 14;
const OFFSET_DATA: usize = 18;

/// Largest command data that fits in one packet.
pub const MAX_DATA: usize = PACKET_SIZE - OFFSET_DATA;

const CRC_POLY: u16 = 0x1021;

/// MSB-first CRC-16/CCITT lookup table, built at compile time.
static CRC_TABLE: [u16; 256] = build_crc_table();

const fn build_crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 0x8000 != 0 {
                (c << 1) ^ CRC_POLY
            } else {
                c << 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

/// CRC-16/CCITT, initial value 0, no final XOR.
///
/// Over a packet the window is `[4 .. 4 + L + 2)`: the length field itself
/// through the last data byte.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        CRC_TABLE[((crc >> 8) as u8 ^ b) as usize] ^ (crc << 8)
    })
}

/// Build an outbound MCU packet.
///
/// Data longer than [`MAX_DATA`] is truncated.
pub fn build(cmd_id: u16, data: &[u8]) -> [u8; PACKET_SIZE] {
    let mut buf = [0u8; PACKET_SIZE];
    buf[..2].copy_from_slice(&MAGIC_MCU);
    buf[OFFSET_CMD_ID..OFFSET_CMD_ID + 2].copy_from_slice(&cmd_id.to_le_bytes());

    let len = data.len().min(MAX_DATA);
    if len < data.len() {
        tracing::warn!(
            "command 0x{:04X}: {} data bytes truncated to {}",
            cmd_id,
            data.len(),
            MAX_DATA
        );
    }
    buf[OFFSET_DATA..OFFSET_DATA + len].copy_from_slice(&data[..len]);

    let length = MIN_LENGTH + len as u16;
    buf[OFFSET_LENGTH..OFFSET_LENGTH + 2].copy_from_slice(&length.to_le_bytes());

    let crc = crc16(&buf[OFFSET_LENGTH..crc_end(length)]);
    buf[OFFSET_CRC..OFFSET_CRC + 2].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn crc_end(length: u16) -> usize {
    OFFSET_LENGTH + length as usize + 2
}

/// A decoded packet, borrowing its payload from the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet<'a> {
    pub cmd_id: u16,
    pub timestamp: u32,
    pub payload: &'a [u8],
}

/// Result of [`parse`]: a CRC mismatch still carries the decoded fields for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parsed<'a> {
    Valid(Packet<'a>),
    CrcMismatch {
        packet: Packet<'a>,
        error: ProtocolError,
    },
}

impl<'a> Parsed<'a> {
    pub fn packet(&self) -> Packet<'a> {
        match *self {
            Parsed::Valid(p) => p,
            Parsed::CrcMismatch { packet, .. } => packet,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Parsed::Valid(_))
    }

    /// Collapse into a plain result, treating a CRC mismatch as an error.
    pub fn into_result(self) -> Result<Packet<'a>, ProtocolError> {
        match self {
            Parsed::Valid(p) => Ok(p),
            Parsed::CrcMismatch { error, .. } => Err(error),
        }
    }
}

/// Read the raw command identifier without validating the rest of the packet.
pub fn peek_cmd_id(bytes: &[u8]) -> Option<u16> {
    bytes
        .get(OFFSET_CMD_ID..OFFSET_CMD_ID + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
}

/// Parse an inbound packet carrying `magic`.
pub fn parse(bytes: &[u8], magic: [u8; 2]) -> Result<Parsed<'_>, ProtocolError> {
    if bytes.len() < OFFSET_DATA {
        return Err(ProtocolError::ShortFrame(bytes.len()));
    }
    if bytes[..2] != magic {
        return Err(ProtocolError::BadMagic(bytes[0], bytes[1]));
    }

    let length = u16::from_le_bytes([bytes[OFFSET_LENGTH], bytes[OFFSET_LENGTH + 1]]);
    if length < MIN_LENGTH {
        return Err(ProtocolError::BadLength(length));
    }
    let data_len = (length - MIN_LENGTH) as usize;
    if OFFSET_DATA + data_len > PACKET_SIZE {
        return Err(ProtocolError::BadLength(length));
    }
    if OFFSET_DATA + data_len > bytes.len() {
        return Err(ProtocolError::ShortFrame(bytes.len()));
    }

    let packet = Packet {
        cmd_id: u16::from_le_bytes([bytes[OFFSET_CMD_ID], bytes[OFFSET_CMD_ID + 1]]),
        timestamp: u32::from_le_bytes([
            bytes[OFFSET_TIMESTAMP],
            bytes[OFFSET_TIMESTAMP + 1],
            bytes[OFFSET_TIMESTAMP + 2],
            bytes[OFFSET_TIMESTAMP + 3],
        ]),
        payload: &bytes[OFFSET_DATA..OFFSET_DATA + data_len],
    };

    let received = u16::from_le_bytes([bytes[OFFSET_CRC], bytes[OFFSET_CRC + 1]]);
    let computed = crc16(&bytes[OFFSET_LENGTH..crc_end(length)]);
    if computed != received {
        return Ok(Parsed::CrcMismatch {
            packet,
            error: ProtocolError::Crc { computed, received },
        });
    }

    Ok(Parsed::Valid(packet))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc_check_vector() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0x0000);
    }

    #[test]
    fn test_crc_table_entries() {
        assert_eq!(CRC_TABLE[0], 0x0000);
        assert_eq!(CRC_TABLE[1], 0x1021);
        assert_eq!(CRC_TABLE[255], 0x1EF0);
    }

    #[test]
    fn test_empty_command_crc_is_stable() {
        let pkt = build(0, &[]);
        assert_eq!(u16::from_le_bytes([pkt[2], pkt[3]]), 0x16CE);
    }

    #[test]
    fn test_build_set_imu_layout() {
        let pkt = build(0x0015, &[0x01]);
        assert_eq!(&pkt[0..2], &[0xFF, 0xFE]);
        assert_eq!(&pkt[4..6], &[0x0D, 0x00]);
        assert_eq!(&pkt[14..16], &[0x15, 0x00]);
        assert_eq!(pkt[18], 0x01);
        assert!(pkt[19..].iter().all(|&b| b == 0));
        assert_eq!(u16::from_le_bytes([pkt[2], pkt[3]]), 0x2527);

        let parsed = parse(&pkt, MAGIC_MCU).unwrap();
        assert!(parsed.is_valid());
        let p = parsed.packet();
        assert_eq!(p.cmd_id, 0x0015);
        assert_eq!(p.payload, &[0x01]);
        assert_eq!(p.timestamp, 0);
    }

    #[test]
    fn test_parse_rejects_wrong_magic() {
        let pkt = build(0x0015, &[0x01]);
        assert_eq!(
            parse(&pkt, MAGIC_IMU),
            Err(ProtocolError::BadMagic(0xFF, 0xFE))
        );
    }

    #[test]
    fn test_parse_short_frame() {
        assert_eq!(
            parse(&[0xFF, 0xFE, 0, 0], MAGIC_MCU),
            Err(ProtocolError::ShortFrame(4))
        );
    }

    #[test]
    fn test_parse_bad_length() {
        let mut pkt = build(0x0001, &[]);
        pkt[4] = 0x0B;
        assert_eq!(parse(&pkt, MAGIC_MCU), Err(ProtocolError::BadLength(0x0B)));

        pkt[4] = 0x0C + 47;
        assert_eq!(
            parse(&pkt, MAGIC_MCU),
            Err(ProtocolError::BadLength(0x0C + 47))
        );
    }

    #[test]
    fn test_crc_mismatch_keeps_fields() {
        let mut pkt = build(0x0042, &[1, 2, 3]);
        pkt[2] ^= 0xFF;
        match parse(&pkt, MAGIC_MCU).unwrap() {
            Parsed::CrcMismatch { packet, error } => {
                assert_eq!(packet.cmd_id, 0x0042);
                assert_eq!(packet.payload, &[1, 2, 3]);
                assert!(matches!(error, ProtocolError::Crc { .. }));
            }
            other => panic!("expected CRC mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_timestamp_is_decoded() {
        let mut pkt = build(0x0100, &[9]);
        pkt[6..10].copy_from_slice(&0xDEADBEEFu32.to_le_bytes());
        // Timestamp sits inside the CRC region, so re-stamp the CRC.
        let crc = crc16(&pkt[4..4 + 0x0D + 2]);
        pkt[2..4].copy_from_slice(&crc.to_le_bytes());
        let p = parse(&pkt, MAGIC_MCU).unwrap().into_result().unwrap();
        assert_eq!(p.timestamp, 0xDEADBEEF);
    }

    #[test]
    fn test_max_data_fills_packet() {
        let data = [0xAB; MAX_DATA];
        let pkt = build(7, &data);
        assert_eq!(&pkt[4..6], &[0x0C + MAX_DATA as u8, 0x00]);
        let p = parse(&pkt, MAGIC_MCU).unwrap().into_result().unwrap();
        assert_eq!(p.payload, &data[..]);
    }

    proptest! {
        #[test]
        fn prop_parse_build_roundtrip(cmd_id in any::<u16>(), data in proptest::collection::vec(any::<u8>(), 0..=MAX_DATA)) {
            let pkt = build(cmd_id, &data);
            let p = parse(&pkt, MAGIC_MCU).unwrap().into_result().unwrap();
            prop_assert_eq!(p.cmd_id, cmd_id);
            prop_assert_eq!(p.payload, &data[..]);
        }
    }
}
