//! Packet layer (C2): fixed-size wire packets, fragmentation and reassembly.
//!
//! Wire layout (spec §6), `P` bytes total, big-endian:
//!
//! ```text
//! offset  len  field
//!   0      1   type
//!   1      2   packetsize (= P)
//!   3     16   addresser UUID
//!  19      2   payloadsize (<= P - 29)
//!  21      4   partcount
//!  25      4   partindex
//!  29    P-29  payload (tail zero-padded)
//! ```

use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::wire::{ByteReader, ByteWriter};

pub const HEADER_SIZE: usize = 1 + 2 + 16 + 2 + 4 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Regular = 0,
    Hello = 1,
    FileCredentials = 2,
    FileRequest = 3,
    FileStop = 4,
    FileBegin = 5,
    FileChunk = 6,
    FileEnd = 7,
    FileState = 8,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => PacketType::Regular,
            1 => PacketType::Hello,
            2 => PacketType::FileCredentials,
            3 => PacketType::FileRequest,
            4 => PacketType::FileStop,
            5 => PacketType::FileBegin,
            6 => PacketType::FileChunk,
            7 => PacketType::FileEnd,
            8 => PacketType::FileState,
            other => return Err(MeshError::Protocol(format!("unknown packet type {other}"))),
        })
    }

    pub fn is_file(&self) -> bool {
        !matches!(self, PacketType::Regular | PacketType::Hello)
    }
}

/// One on-the-wire packet: a header plus up to `packetsize - HEADER_SIZE`
/// payload bytes (already stripped of tail padding).
#[derive(Debug, Clone)]
pub struct Packet {
    pub packet_type: PacketType,
    pub packet_size: u16,
    pub addresser: Uuid,
    pub payload: Vec<u8>,
    pub partcount: u32,
    pub partindex: u32,
}

impl Packet {
    /// Serializes this packet into exactly `packet_size` bytes, zero-padding
    /// the unused tail.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(self.packet_size as usize);
        w.write_u8(self.packet_type as u8);
        w.write_u16(self.packet_size);
        w.write_fixed(self.addresser.as_bytes());
        w.write_u16(self.payload.len() as u16);
        w.write_u32(self.partcount);
        w.write_u32(self.partindex);
        w.write_fixed(&self.payload);
        let mut bytes = w.into_vec();
        bytes.resize(self.packet_size as usize, 0);
        bytes
    }

    /// Parses and validates exactly `raw.len()` bytes as one packet (C2
    /// `unpack`). `raw.len()` must equal the header's own `packetsize`
    /// field, and every structural invariant from spec §4.2 is checked.
    pub fn decode(raw: &[u8]) -> Result<Packet> {
        if raw.len() < HEADER_SIZE {
            return Err(MeshError::Protocol("corrupt_packet: too short".into()));
        }
        let mut r = ByteReader::new(raw);
        let packet_type = PacketType::from_u8(r.read_u8()?)?;
        let packet_size = r.read_u16()?;
        if packet_size as usize != raw.len() {
            return Err(MeshError::Protocol(format!(
                "corrupt_packet: packetsize {packet_size} != frame length {}",
                raw.len()
            )));
        }
        let addresser = Uuid::from_bytes(r.read_array16()?);
        let payloadsize = r.read_u16()? as usize;
        let partcount = r.read_u32()?;
        let partindex = r.read_u32()?;

        let max_payload = raw.len() - HEADER_SIZE;
        if payloadsize > max_payload {
            return Err(MeshError::Protocol(format!(
                "corrupt_packet: payloadsize {payloadsize} exceeds capacity {max_payload}"
            )));
        }
        if partcount == 0 {
            return Err(MeshError::Protocol("corrupt_packet: partcount is zero".into()));
        }
        if partindex == 0 || partindex > partcount {
            return Err(MeshError::Protocol(format!(
                "corrupt_packet: partindex {partindex} out of range 1..={partcount}"
            )));
        }

        let payload = r.read_fixed(payloadsize)?;
        Ok(Packet {
            packet_type,
            packet_size,
            addresser,
            payload,
            partcount,
            partindex,
        })
    }
}

/// Splits `payload` into a sequence of `packet_size`-byte packets (C2
/// `pack`). `partcount = ceil(len / (packet_size - HEADER_SIZE))`, with a
/// minimum of one packet even for an empty payload.
pub fn pack(
    payload: &[u8],
    sender: Uuid,
    packet_type: PacketType,
    packet_size: u16,
) -> Result<Vec<Packet>> {
    let capacity = packet_size as usize;
    if capacity <= HEADER_SIZE {
        return Err(MeshError::Configuration(format!(
            "packet_size {packet_size} must exceed header size {HEADER_SIZE}"
        )));
    }
    let chunk_len = capacity - HEADER_SIZE;
    let partcount = if payload.is_empty() {
        1
    } else {
        ((payload.len() + chunk_len - 1) / chunk_len) as u32
    };

    let mut packets = Vec::with_capacity(partcount as usize);
    for i in 0..partcount {
        let start = i as usize * chunk_len;
        let end = (start + chunk_len).min(payload.len());
        packets.push(Packet {
            packet_type,
            packet_size,
            addresser: sender,
            payload: payload[start..end].to_vec(),
            partcount,
            partindex: i + 1,
        });
    }
    Ok(packets)
}

/// Reassembles a complete run of packets (same message, in partindex order)
/// back into the original payload bytes.
pub fn unpack_sequence(packets: &[Packet]) -> Result<Vec<u8>> {
    if packets.is_empty() {
        return Err(MeshError::Protocol("corrupt_packet: empty sequence".into()));
    }
    let partcount = packets[0].partcount;
    let mut out = Vec::new();
    for (idx, p) in packets.iter().enumerate() {
        if p.partcount != partcount || p.partindex != idx as u32 + 1 {
            return Err(MeshError::Protocol("corrupt_packet: out-of-order sequence".into()));
        }
        out.extend_from_slice(&p.payload);
    }
    if packets.last().unwrap().partindex != partcount {
        return Err(MeshError::Protocol("corrupt_packet: incomplete sequence".into()));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: &[u8], packet_size: u16) {
        let sender = Uuid::new_v4();
        let packets = pack(payload, sender, PacketType::Regular, packet_size).unwrap();
        let expected_chunk = packet_size as usize - HEADER_SIZE;
        let expected_count = if payload.is_empty() {
            1
        } else {
            (payload.len() + expected_chunk - 1) / expected_chunk
        };
        assert_eq!(packets.len(), expected_count);

        let mut decoded = Vec::with_capacity(packets.len());
        for p in &packets {
            let raw = p.encode();
            assert_eq!(raw.len(), packet_size as usize);
            decoded.push(Packet::decode(&raw).unwrap());
        }
        let rebuilt = unpack_sequence(&decoded).unwrap();
        assert_eq!(rebuilt, payload);
    }

    #[test]
    fn fragmentation_round_trip_various_sizes() {
        roundtrip(b"", 64);
        roundtrip(b"short", 64);
        roundtrip(&vec![7u8; 1000], 64);
        roundtrip(&vec![9u8; 50_000], 1430);
        roundtrip(b"exact-one-packet!", 64);
    }

    #[test]
    fn rejects_size_mismatch() {
        let sender = Uuid::new_v4();
        let packets = pack(b"hello", sender, PacketType::Regular, 64).unwrap();
        let mut raw = packets[0].encode();
        raw.truncate(raw.len() - 1);
        assert!(Packet::decode(&raw).is_err());
    }

    #[test]
    fn rejects_bad_partindex() {
        let sender = Uuid::new_v4();
        let mut packets = pack(b"hello world", sender, PacketType::Regular, 32).unwrap();
        packets[0].partindex = 0;
        let raw = packets[0].encode();
        assert!(Packet::decode(&raw).is_err());
    }

    #[test]
    fn pack_rejects_undersized_packet() {
        assert!(pack(b"x", Uuid::new_v4(), PacketType::Regular, HEADER_SIZE as u16).is_err());
    }
}
