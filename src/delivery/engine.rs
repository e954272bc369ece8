//! Delivery engine (C5): listener + per-peer writer sockets, reader
//! reassembly, and the writer output path (spec §4.5).

use std::collections::HashMap;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddrV4;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::Token;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::accounts::{ReaderAccount, WriterAccount, WriterState};
use crate::error::{MeshError, Result};
use crate::events::Event;
use crate::packet::{self, Packet, PacketType};
use crate::poller::{MeshPoller, SocketKind};

const READ_CHUNK: usize = 64 * 1024;
const MAX_PACKETS_PER_QUEUE_PER_STEP: usize = 10;

pub struct DeliveryEngine {
    own_uuid: Uuid,
    packet_size: u16,
    listener: TcpListener,
    listener_token: Token,
    poller: MeshPoller,
    writers: HashMap<Uuid, WriterAccount>,
    writer_tokens: HashMap<Token, Uuid>,
    readers: HashMap<Token, ReaderAccount>,
    reader_index: HashMap<Uuid, Token>,
    established: std::collections::HashSet<Uuid>,
    /// Peers whose channel should be torn down at the start of the next
    /// `step`, per spec §4.5/§9's defer-expire convention: a send failure
    /// or malformed packet observed mid-iteration is recorded here instead
    /// of mutating `writers`/`readers` immediately.
    deferred_expirations: Vec<Uuid>,
}

impl DeliveryEngine {
    pub fn new(
        own_uuid: Uuid,
        listener_saddr: SocketAddrV4,
        backlog: u32,
        packet_size: u16,
    ) -> io::Result<Self> {
        let std_listener = {
            use socket2::{Domain, Socket, Type};
            let socket = Socket::new(Domain::IPV4, Type::STREAM, None)?;
            socket.set_reuse_address(true)?;
            socket.bind(&listener_saddr.into())?;
            socket.listen(backlog as i32)?;
            socket.set_nonblocking(true)?;
            std::net::TcpListener::from(socket)
        };
        let mut listener = TcpListener::from_std(std_listener);
        let mut poller = MeshPoller::new(1024)?;
        let listener_token = poller.tokens.alloc();
        poller.listener.watch(&mut listener, listener_token)?;
        Ok(Self {
            own_uuid,
            packet_size,
            listener,
            listener_token,
            poller,
            writers: HashMap::new(),
            writer_tokens: HashMap::new(),
            readers: HashMap::new(),
            reader_index: HashMap::new(),
            established: std::collections::HashSet::new(),
            deferred_expirations: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub fn is_established(&self, uuid: Uuid) -> bool {
        self.established.contains(&uuid)
    }

    /// Begins dialing a newly-discovered peer (spec §4.5). A no-op if a
    /// writer account for this peer already exists.
    pub fn peer_discovered(&mut self, uuid: Uuid, addr: SocketAddrV4) -> Result<()> {
        if self.writers.contains_key(&uuid) {
            return Ok(());
        }
        let mut stream = TcpStream::connect(addr.into())?;
        let token = self.poller.tokens.alloc();
        self.poller.connecting.watch(&mut stream, token)?;
        self.writer_tokens.insert(token, uuid);
        self.writers.insert(uuid, WriterAccount::new(uuid, stream, token));
        Ok(())
    }

    /// Enqueues an application payload split into `regular` packets.
    pub fn send_regular(&mut self, uuid: Uuid, payload: &[u8]) -> Result<()> {
        self.send_typed(uuid, PacketType::Regular, payload)
    }

    /// Enqueues a control-plane payload (hello, or any `file_*` control
    /// message other than chunks) onto the regular output queue.
    pub fn send_typed(&mut self, uuid: Uuid, packet_type: PacketType, payload: &[u8]) -> Result<()> {
        let Some(writer) = self.writers.get_mut(&uuid) else {
            return Err(MeshError::Internal(format!("no writer account for {uuid}")));
        };
        let packets = packet::pack(payload, self.own_uuid, packet_type, self.packet_size)?;
        writer.regular_queue.extend(packets);
        Ok(())
    }

    /// Pushes chunk packets onto a per-file round-robin queue (spec §4.5:
    /// "round-robin across file-chunk queues").
    pub fn push_file_packets(&mut self, uuid: Uuid, file_id: u64, payloads: Vec<(PacketType, Vec<u8>)>) -> Result<()> {
        let Some(writer) = self.writers.get_mut(&uuid) else {
            return Err(MeshError::Internal(format!("no writer account for {uuid}")));
        };
        writer.ensure_file_queue(file_id);
        writer.file_chunk_requested.remove(&file_id);
        let queue = writer.file_queues.get_mut(&file_id).unwrap();
        for (packet_type, payload) in payloads {
            let packets = packet::pack(&payload, self.own_uuid, packet_type, self.packet_size)?;
            queue.extend(packets);
        }
        Ok(())
    }

    pub fn remove_file_queue(&mut self, uuid: Uuid, file_id: u64) {
        if let Some(writer) = self.writers.get_mut(&uuid) {
            writer.remove_file_queue(file_id);
        }
    }

    /// Queues a peer for release at the top of the next `step`, rather than
    /// mutating the account maps mid-callback (spec §4.5 `defere_expire_peer`).
    pub fn defer_expire_peer(&mut self, uuid: Uuid) {
        if !self.deferred_expirations.contains(&uuid) {
            self.deferred_expirations.push(uuid);
        }
    }

    /// Synchronous teardown: removes both accounts and fires
    /// `ChannelClosed` if the channel had been established.
    pub fn release_peer(&mut self, uuid: Uuid) -> Vec<Event> {
        let mut out = Vec::new();
        if let Some(writer) = self.writers.remove(&uuid) {
            self.writer_tokens.remove(&writer.token);
        }
        if let Some(token) = self.reader_index.remove(&uuid) {
            self.readers.remove(&token);
        }
        if self.established.remove(&uuid) {
            out.push(Event::ChannelClosed { uuid });
        }
        out
    }

    /// Drains and releases every peer queued by `defer_expire_peer`.
    pub fn flush_deferred(&mut self) -> Vec<Event> {
        let pending = std::mem::take(&mut self.deferred_expirations);
        let mut out = Vec::new();
        for uuid in pending {
            out.extend(self.release_peer(uuid));
        }
        out
    }

    /// Drives one tick: services readiness events, then the writer output
    /// path. Returns every event produced, plus `(uuid, file_id)` pairs
    /// whose file-chunk queue ran dry (the caller pulls more chunks from
    /// the file transporter and calls `push_file_packets`/`remove_file_queue`).
    pub fn step(&mut self, timeout: Duration) -> Result<(Vec<Event>, Vec<(Uuid, u64)>)> {
        let mut out = Vec::new();
        let mut chunk_needed = Vec::new();

        let readiness = self.poller.poll(Some(timeout))?;
        for r in readiness {
            match r.kind {
                SocketKind::Connecting => self.handle_connecting(r.token, &mut out),
                SocketKind::Listener => self.handle_accept(&mut out),
                SocketKind::Reader => self.handle_reader_ready(r.token, &mut out),
                SocketKind::Writer => self.handle_can_write(r.token),
            }
        }

        let uuids: Vec<Uuid> = self.writers.keys().copied().collect();
        for uuid in uuids {
            self.drain_writer(uuid, &mut out, &mut chunk_needed);
        }

        Ok((out, chunk_needed))
    }

    fn handle_connecting(&mut self, token: Token, out: &mut Vec<Event>) {
        let Some(&uuid) = self.writer_tokens.get(&token) else { return };
        let Some(writer) = self.writers.get_mut(&uuid) else { return };
        match crate::poller::ConnectingPoller::resolve(&writer.stream, token) {
            crate::poller::ConnectingEvent::Connected(_) => {
                let _ = self.poller.connecting.stop(&mut writer.stream, token);
                writer.state = WriterState::Connected;
                writer.can_write = true;
                debug!(%uuid, "writer connected");
                out.push(Event::WriterReady { uuid });
                if !writer.hello_sent {
                    writer.hello_sent = true;
                    if let Ok(packets) = packet::pack(&[], self.own_uuid, PacketType::Hello, self.packet_size) {
                        writer.regular_queue.extend(packets);
                    }
                }
                self.maybe_fire_established(uuid, out);
            }
            crate::poller::ConnectingEvent::ConnectionRefused(_, reason)
            | crate::poller::ConnectingEvent::Failure(_, reason) => {
                warn!(%uuid, %reason, "writer connect failed");
                out.push(Event::OnError { context: "delivery.connect".into(), message: reason });
                self.defer_expire_peer(uuid);
            }
        }
    }

    fn handle_accept(&mut self, out: &mut Vec<Event>) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _peer_addr)) => {
                    let token = self.poller.tokens.alloc();
                    if let Err(e) = self.poller.reader.watch(&mut stream, token) {
                        out.push(Event::OnError { context: "delivery.accept".into(), message: e.to_string() });
                        continue;
                    }
                    self.readers.insert(token, ReaderAccount::new(stream, token));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    out.push(Event::OnError { context: "delivery.accept".into(), message: e.to_string() });
                    break;
                }
            }
        }
    }

    fn handle_reader_ready(&mut self, token: Token, out: &mut Vec<Event>) {
        let Some(reader) = self.readers.get_mut(&token) else { return };
        let mut buf = [0u8; READ_CHUNK];
        let mut closed = false;
        loop {
            match reader.stream.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => reader.raw.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "reader socket error");
                    out.push(Event::OnError { context: "delivery.read".into(), message: e.to_string() });
                    closed = true;
                    break;
                }
            }
        }

        let ps = self.packet_size as usize;
        while reader.raw.len() >= ps {
            let frame: Vec<u8> = reader.raw.drain(..ps).collect();
            match Packet::decode(&frame) {
                Ok(p) => {
                    if let Some(uuid) = reader.uuid {
                        if p.addresser != uuid {
                            warn!(%uuid, other = %p.addresser, "addresser changed mid-channel");
                            self.defer_expire_peer(uuid);
                            return;
                        }
                    }
                    if let Some((packet_type, addresser, payload)) = reader.accept_packet(p) {
                        self.dispatch_message(token, packet_type, addresser, payload, out);
                        // `dispatch_message` may have removed `reader` via
                        // expiry; re-borrow for the next loop iteration.
                        let Some(r) = self.readers.get_mut(&token) else { return };
                        let _ = r;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "corrupt packet");
                    out.push(Event::OnError { context: "delivery.decode".into(), message: e.to_string() });
                    if let Some(uuid) = self.readers.get(&token).and_then(|r| r.uuid) {
                        self.defer_expire_peer(uuid);
                    } else {
                        self.readers.remove(&token);
                    }
                    return;
                }
            }
            let Some(r) = self.readers.get_mut(&token) else { return };
            if r.raw.len() < ps {
                break;
            }
        }

        if closed {
            if let Some(uuid) = self.readers.get(&token).and_then(|r| r.uuid) {
                self.defer_expire_peer(uuid);
            } else {
                self.readers.remove(&token);
            }
        }
    }

    fn dispatch_message(
        &mut self,
        token: Token,
        packet_type: PacketType,
        addresser: Uuid,
        payload: Vec<u8>,
        out: &mut Vec<Event>,
    ) {
        match packet_type {
            PacketType::Hello => {
                let Some(reader) = self.readers.get_mut(&token) else { return };
                match reader.uuid {
                    Some(existing) if existing == addresser => {}
                    Some(_other) => {
                        self.defer_expire_peer(addresser);
                        return;
                    }
                    None => {
                        reader.uuid = Some(addresser);
                        self.reader_index.insert(addresser, token);
                        trace!(uuid = %addresser, "reader bound via hello");
                        out.push(Event::ReaderReady { uuid: addresser });
                        self.maybe_fire_established(addresser, out);
                    }
                }
            }
            PacketType::Regular => {
                if self.readers.get(&token).and_then(|r| r.uuid).is_none() {
                    self.defer_expire_peer(addresser);
                    return;
                }
                out.push(Event::DataReceived { uuid: addresser, payload });
            }
            other => {
                if self.readers.get(&token).and_then(|r| r.uuid).is_none() {
                    self.defer_expire_peer(addresser);
                    return;
                }
                out.push(Event::FileDataReceived { uuid: addresser, packet_type: other, payload });
            }
        }
    }

    fn maybe_fire_established(&mut self, uuid: Uuid, out: &mut Vec<Event>) {
        let reader_bound = self.reader_index.contains_key(&uuid);
        let writer_connected = self
            .writers
            .get(&uuid)
            .map(|w| w.state == WriterState::Connected)
            .unwrap_or(false);
        if reader_bound && writer_connected && !self.established.contains(&uuid) {
            self.established.insert(uuid);
            out.push(Event::ChannelEstablished { uuid });
        }
    }

    fn handle_can_write(&mut self, token: Token) {
        let Some(&uuid) = self.writer_tokens.get(&token) else { return };
        if let Some(writer) = self.writers.get_mut(&uuid) {
            let _ = self.poller.writer.disarm(&mut writer.stream, token);
            writer.can_write = true;
        }
    }

    fn drain_writer(&mut self, uuid: Uuid, out: &mut Vec<Event>, chunk_needed: &mut Vec<(Uuid, u64)>) {
        let packet_size = self.packet_size as usize;
        let send_cap = packet_size * MAX_PACKETS_PER_QUEUE_PER_STEP;
        let Some(writer) = self.writers.get_mut(&uuid) else { return };
        if !writer.can_write {
            return;
        }

        if writer.pending.len() < packet_size {
            for _ in 0..MAX_PACKETS_PER_QUEUE_PER_STEP {
                match writer.regular_queue.pop_front() {
                    Some(p) => writer.pending.extend(p.encode()),
                    None => break,
                }
            }
            let file_ids: Vec<u64> = writer.file_queue_order.iter().copied().collect();
            for file_id in file_ids {
                let mut drained = 0usize;
                let mut went_dry = false;
                if let Some(q) = writer.file_queues.get_mut(&file_id) {
                    while drained < MAX_PACKETS_PER_QUEUE_PER_STEP {
                        match q.pop_front() {
                            Some(p) => {
                                writer.pending.extend(p.encode());
                                drained += 1;
                            }
                            None => break,
                        }
                    }
                    went_dry = q.is_empty();
                }
                if went_dry && !writer.file_chunk_requested.contains(&file_id) {
                    writer.file_chunk_requested.insert(file_id);
                    chunk_needed.push((uuid, file_id));
                }
            }
        }

        if writer.pending.is_empty() {
            return;
        }
        let to_send = writer.pending.len().min(send_cap);
        match writer.stream.write(&writer.pending[..to_send]) {
            Ok(0) => {}
            Ok(n) => {
                writer.pending.drain(..n);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                writer.can_write = false;
                let _ = self.poller.writer.wait_for_write(&mut writer.stream, writer.token);
            }
            Err(e) => {
                warn!(%uuid, error = %e, "writer send failed");
                out.push(Event::OnError { context: "delivery.write".into(), message: e.to_string() });
                self.defer_expire_peer(uuid);
            }
        }
    }
}
