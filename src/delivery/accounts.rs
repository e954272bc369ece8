//! Reader/writer accounts (spec §3, §9): the delivery engine's two slab-style
//! containers. Accounts are referenced by stable key (UUID for writers,
//! `mio::Token` for readers) rather than by pointer, per the arena+index
//! design note — sockets are moved into an account on creation and never
//! aliased elsewhere.

use std::collections::{HashMap, HashSet, VecDeque};

use mio::net::TcpStream;
use mio::Token;
use uuid::Uuid;

use crate::packet::{Packet, PacketType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Connecting,
    Connected,
}

/// One outbound socket toward a single peer (spec §3 "writer account").
pub struct WriterAccount {
    pub uuid: Uuid,
    pub stream: TcpStream,
    pub token: Token,
    pub state: WriterState,
    pub can_write: bool,
    pub hello_sent: bool,
    pub regular_queue: VecDeque<Packet>,
    pub file_queues: HashMap<u64, VecDeque<Packet>>,
    pub file_queue_order: VecDeque<u64>,
    /// File queues for which a `FileChunkNeeded` event has already been
    /// emitted this round; cleared once the transporter replies (by pushing
    /// packets or dropping the queue), so one empty queue doesn't spam the
    /// application with duplicate requests every tick.
    pub file_chunk_requested: HashSet<u64>,
    /// Serialized bytes awaiting a socket write.
    pub pending: Vec<u8>,
}

impl WriterAccount {
    pub fn new(uuid: Uuid, stream: TcpStream, token: Token) -> Self {
        Self {
            uuid,
            stream,
            token,
            state: WriterState::Connecting,
            can_write: false,
            hello_sent: false,
            regular_queue: VecDeque::new(),
            file_queues: HashMap::new(),
            file_queue_order: VecDeque::new(),
            file_chunk_requested: HashSet::new(),
            pending: Vec::new(),
        }
    }

    pub fn ensure_file_queue(&mut self, file_id: u64) {
        if !self.file_queues.contains_key(&file_id) {
            self.file_queues.insert(file_id, VecDeque::new());
            self.file_queue_order.push_back(file_id);
        }
    }

    pub fn remove_file_queue(&mut self, file_id: u64) {
        self.file_queues.remove(&file_id);
        self.file_queue_order.retain(|id| *id != file_id);
        self.file_chunk_requested.remove(&file_id);
    }
}

/// One inbound socket accepted by the listener (spec §3 "reader account").
/// `uuid` is `None` until the first `hello` packet binds it.
pub struct ReaderAccount {
    pub uuid: Option<Uuid>,
    pub stream: TcpStream,
    pub token: Token,
    /// Bytes read off the socket but not yet sliced into whole packets.
    pub raw: Vec<u8>,
    /// Payload bytes accumulated for the in-progress multi-part message.
    pub reassembly: Vec<u8>,
    pub current_type: Option<PacketType>,
    pub current_addresser: Option<Uuid>,
    pub next_partindex: u32,
    pub expected_partcount: u32,
}

impl ReaderAccount {
    pub fn new(stream: TcpStream, token: Token) -> Self {
        Self {
            uuid: None,
            stream,
            token,
            raw: Vec::new(),
            reassembly: Vec::new(),
            current_type: None,
            current_addresser: None,
            next_partindex: 0,
            expected_partcount: 0,
        }
    }

    /// Folds one decoded, in-order packet into the in-progress message.
    /// Returns `Some((type, addresser, payload))` once the last part lands.
    pub fn accept_packet(&mut self, p: Packet) -> Option<(PacketType, Uuid, Vec<u8>)> {
        if p.partindex == 1 {
            self.reassembly.clear();
            self.current_type = Some(p.packet_type);
            self.current_addresser = Some(p.addresser);
            self.expected_partcount = p.partcount;
            self.next_partindex = 0;
        }
        self.next_partindex += 1;
        self.reassembly.extend_from_slice(&p.payload);
        if p.partindex == p.partcount {
            let payload = std::mem::take(&mut self.reassembly);
            let packet_type = self.current_type.take().unwrap_or(p.packet_type);
            let addresser = self.current_addresser.take().unwrap_or(p.addresser);
            self.expected_partcount = 0;
            self.next_partindex = 0;
            Some((packet_type, addresser, payload))
        } else {
            None
        }
    }
}
