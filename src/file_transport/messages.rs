//! Wire payloads carried inside the file transporter's C5 control packets
//! (spec §4.6, §6). Hand-rolled with the C1 codec, same as the overlay's
//! envelope frames — these are payload bytes inside an already-typed
//! packet, not a second framing layer.

use crate::error::Result;
use crate::wire::{ByteReader, ByteWriter};

#[derive(Debug, Clone)]
pub struct Credentials {
    pub file_id: u64,
    pub filesize: u64,
    pub offset: u64,
    pub filename: String,
}

impl Credentials {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.write_u64(self.filesize);
        w.write_u64(self.offset);
        w.write_var_bytes(self.filename.as_bytes());
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self {
            file_id: r.read_u64()?,
            filesize: r.read_u64()?,
            offset: r.read_u64()?,
            filename: String::from_utf8_lossy(&r.read_var_bytes()?).into_owned(),
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub file_id: u64,
    pub offset: u64,
}

impl Request {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.write_u64(self.offset);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()?, offset: r.read_u64()? })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Stop {
    pub file_id: u64,
}

impl Stop {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()? })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Begin {
    pub file_id: u64,
    pub offset: u64,
}

impl Begin {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.write_u64(self.offset);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()?, offset: r.read_u64()? })
    }
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_id: u64,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.write_u64(self.offset);
        w.write_var_bytes(&self.data);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()?, offset: r.read_u64()?, data: r.read_var_bytes()? })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct End {
    pub file_id: u64,
}

impl End {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()? })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct State {
    pub file_id: u64,
    pub success: bool,
}

impl State {
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_u64(self.file_id);
        w.write_u8(self.success as u8);
        w.into_vec()
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        Ok(Self { file_id: r.read_u64()?, success: r.read_u8()? != 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_round_trip() {
        let c = Credentials { file_id: 7, filesize: 65536, offset: 0, filename: "src.bin".into() };
        let decoded = Credentials::decode(&c.encode()).unwrap();
        assert_eq!(decoded.file_id, 7);
        assert_eq!(decoded.filesize, 65536);
        assert_eq!(decoded.filename, "src.bin");
    }

    #[test]
    fn chunk_round_trip() {
        let c = Chunk { file_id: 1, offset: 4096, data: vec![9u8; 256] };
        let decoded = Chunk::decode(&c.encode()).unwrap();
        assert_eq!(decoded.offset, 4096);
        assert_eq!(decoded.data, vec![9u8; 256]);
    }
}
