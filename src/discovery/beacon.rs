//! HELO beacon wire format (spec §6): a fixed 38-byte UDP datagram used to
//! announce a node's presence to the rest of its mesh.

use uuid::Uuid;

use crate::crc16::crc16;
use crate::error::{MeshError, Result};
use crate::wire::{ByteReader, ByteWriter};

pub const BEACON_LEN: usize = 38;
const MAGIC: [u8; 4] = *b"HELO";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beacon {
    pub sender: Uuid,
    pub port: u16,
    pub transmit_interval_secs: u16,
    pub counter: u32,
    pub timestamp_ms: i64,
}

impl Beacon {
    pub fn encode(&self) -> [u8; BEACON_LEN] {
        let mut w = ByteWriter::with_capacity(BEACON_LEN);
        w.write_fixed(&MAGIC);
        w.write_fixed(self.sender.as_bytes());
        w.write_u16(self.port);
        w.write_u16(self.transmit_interval_secs);
        w.write_u32(self.counter);
        w.write_i64(self.timestamp_ms);
        let body = w.as_slice();
        let crc = crc16(body);
        let mut out = [0u8; BEACON_LEN];
        out[..body.len()].copy_from_slice(body);
        out[body.len()..].copy_from_slice(&crc.to_be_bytes());
        out
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() != BEACON_LEN {
            return Err(MeshError::Protocol(format!(
                "beacon length {} != {}",
                raw.len(),
                BEACON_LEN
            )));
        }
        let body = &raw[..raw.len() - 2];
        let expected_crc = crc16(body);
        let mut r = ByteReader::new(raw);
        let magic = r.read_fixed(4)?;
        if magic.as_slice() != MAGIC {
            return Err(MeshError::Protocol("bad beacon magic".into()));
        }
        let sender = Uuid::from_bytes(r.read_fixed(16)?.try_into().unwrap());
        let port = r.read_u16()?;
        let transmit_interval_secs = r.read_u16()?;
        let counter = r.read_u32()?;
        let timestamp_ms = r.read_i64()?;
        let crc = r.read_u16()?;
        if crc != expected_crc {
            return Err(MeshError::Protocol("beacon CRC mismatch".into()));
        }
        Ok(Beacon {
            sender,
            port,
            transmit_interval_secs,
            counter,
            timestamp_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Beacon {
        Beacon {
            sender: Uuid::from_u128(0x1234_5678_90ab_cdef_1122_3344_5566_7788),
            port: 9000,
            transmit_interval_secs: 5,
            counter: 42,
            timestamp_ms: 1_700_000_000_000,
        }
    }

    #[test]
    fn round_trips() {
        let b = sample();
        let raw = b.encode();
        assert_eq!(raw.len(), BEACON_LEN);
        let decoded = Beacon::decode(&raw).unwrap();
        assert_eq!(decoded, b);
    }

    #[test]
    fn flipped_bit_fails_crc() {
        let mut raw = sample().encode();
        raw[10] ^= 0x01;
        let err = Beacon::decode(&raw).unwrap_err();
        assert!(matches!(err, MeshError::Protocol(_)));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = sample().encode();
        raw[0] = b'X';
        assert!(Beacon::decode(&raw).is_err());
    }

    #[test]
    fn wrong_length_rejected() {
        assert!(Beacon::decode(&[0u8; 10]).is_err());
    }
}
