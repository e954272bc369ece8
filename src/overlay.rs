//! Reliable-delivery overlay (C8): wraps C5's `regular` packet type with
//! envelope ids and an ack/nack/again control protocol, backed by the
//! persistent outbox (C7) for exactly-once-from-the-application's-view
//! delivery across reconnections (spec §4.8).
//!
//! Envelope frames are carried inside ordinary `regular` payloads — the
//! overlay doesn't need a dedicated packet type, since C5 already
//! delivers `regular` payloads in strict per-direction FIFO order (spec
//! §3 invariant), which is exactly what this layer needs underneath it.

use std::collections::{BTreeMap, HashMap};

use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::events::Event;
use crate::outbox::Outbox;
use crate::wire::{ByteReader, ByteWriter};

const TAG_DATA: u8 = 0;
const TAG_ACK: u8 = 1;
const TAG_NACK: u8 = 2;
const TAG_AGAIN: u8 = 3;

enum OverlayMsg {
    Data { id: u64, payload: Vec<u8> },
    Ack { id: u64 },
    Nack { id: u64 },
    Again { ids: Vec<u64> },
}

impl OverlayMsg {
    fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        match self {
            OverlayMsg::Data { id, payload } => {
                w.write_u8(TAG_DATA);
                w.write_u64(*id);
                w.write_var_bytes(payload);
            }
            OverlayMsg::Ack { id } => {
                w.write_u8(TAG_ACK);
                w.write_u64(*id);
            }
            OverlayMsg::Nack { id } => {
                w.write_u8(TAG_NACK);
                w.write_u64(*id);
            }
            OverlayMsg::Again { ids } => {
                w.write_u8(TAG_AGAIN);
                w.write_u32(ids.len() as u32);
                for id in ids {
                    w.write_u64(*id);
                }
            }
        }
        w.into_vec()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(raw);
        let tag = r.read_u8()?;
        Ok(match tag {
            TAG_DATA => {
                let id = r.read_u64()?;
                let payload = r.read_var_bytes()?;
                OverlayMsg::Data { id, payload }
            }
            TAG_ACK => OverlayMsg::Ack { id: r.read_u64()? },
            TAG_NACK => OverlayMsg::Nack { id: r.read_u64()? },
            TAG_AGAIN => {
                let n = r.read_u32()? as usize;
                let mut ids = Vec::with_capacity(n);
                for _ in 0..n {
                    ids.push(r.read_u64()?);
                }
                OverlayMsg::Again { ids }
            }
            other => return Err(MeshError::Protocol(format!("unknown overlay tag {other}"))),
        })
    }
}

/// Wraps one engine's persistent outbox into the envelope ack/nack/again
/// protocol. Holds no sockets itself — the caller (C9) is responsible for
/// pushing the `Vec<u8>` wire frames this type produces through C5's
/// `send_regular`, and for feeding C5's `DataReceived` events back into
/// `receive` instead of surfacing them to the application directly.
pub struct ReliableOverlay {
    outbox: Outbox,
    /// Out-of-order payloads cached per addresser, awaiting the gap ahead
    /// of them to close (spec §4.8 "gap").
    gap_cache: HashMap<Uuid, BTreeMap<u64, Vec<u8>>>,
}

impl ReliableOverlay {
    pub fn new(outbox: Outbox) -> Self {
        Self { outbox, gap_cache: HashMap::new() }
    }

    /// `send_reliable`: persists the envelope then returns the wire frame
    /// to enqueue via C5.
    pub fn send(&mut self, addressee: Uuid, bytes: Vec<u8>) -> Result<(u64, Vec<u8>)> {
        self.outbox.meet_peer(addressee)?;
        let id = self.outbox.save(addressee, &bytes)?;
        let payload = OverlayMsg::Data { id, payload: bytes }.encode();
        Ok((id, payload))
    }

    /// Handles one incoming regular-channel payload from `from`. Returns
    /// the application events to surface and the outgoing control/resend
    /// frames to send back to `from` (already wire-encoded).
    pub fn receive(&mut self, from: Uuid, raw: &[u8]) -> Result<(Vec<Event>, Vec<Vec<u8>>)> {
        let msg = OverlayMsg::decode(raw)?;
        let mut events = Vec::new();
        let mut outgoing = Vec::new();
        match msg {
            OverlayMsg::Data { id, payload } => {
                let recent = self.outbox.recent_eid(from)?;
                if id == recent + 1 {
                    events.push(Event::DataReceived { uuid: from, payload });
                    self.outbox.set_recent_eid(from, id)?;
                    outgoing.push(OverlayMsg::Ack { id }.encode());
                    let mut next = id + 1;
                    if let Some(cache) = self.gap_cache.get_mut(&from) {
                        while let Some(cached) = cache.remove(&next) {
                            events.push(Event::DataReceived { uuid: from, payload: cached });
                            self.outbox.set_recent_eid(from, next)?;
                            outgoing.push(OverlayMsg::Ack { id: next }.encode());
                            next += 1;
                        }
                        if cache.is_empty() {
                            self.gap_cache.remove(&from);
                        }
                    }
                } else if id <= recent {
                    outgoing.push(OverlayMsg::Nack { id }.encode());
                } else {
                    let cache = self.gap_cache.entry(from).or_default();
                    cache.insert(id, payload);
                    let missing: Vec<u64> =
                        ((recent + 1)..id).filter(|m| !cache.contains_key(m)).collect();
                    outgoing.push(OverlayMsg::Again { ids: missing }.encode());
                }
            }
            OverlayMsg::Ack { id } => self.outbox.ack(from, id)?,
            OverlayMsg::Nack { id } => self.outbox.nack(from, id)?,
            OverlayMsg::Again { ids } => {
                for id in ids {
                    if let Some(payload) = self.outbox.get(from, id)? {
                        outgoing.push(OverlayMsg::Data { id, payload }.encode());
                    }
                }
            }
        }
        Ok((events, outgoing))
    }

    /// On channel (re-)establishment with `peer`, reinjects every
    /// not-yet-acked envelope in ascending order (spec §4.8).
    pub fn resend_unacked(&mut self, peer: Uuid) -> Result<Vec<Vec<u8>>> {
        let mut out = Vec::new();
        self.outbox.again_all(peer, |id, payload| {
            out.push(OverlayMsg::Data { id, payload: payload.to_vec() }.encode());
        })?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn overlay() -> (ReliableOverlay, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ReliableOverlay::new(Outbox::open(dir.path()).unwrap()), dir)
    }

    #[test]
    fn in_order_delivery_acks_and_commits() {
        let (mut sender, _d1) = overlay();
        let (mut receiver, _d2) = overlay();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (id, frame) = sender.send(b, b"hello".to_vec()).unwrap();
        assert_eq!(id, 1);
        let (events, outgoing) = receiver.receive(a, &frame).unwrap();
        assert_eq!(events, vec![Event::DataReceived { uuid: a, payload: b"hello".to_vec() }]);
        assert_eq!(outgoing.len(), 1);

        // Receiver's ack reaches the sender.
        let (ack_events, _) = sender.receive(b, &outgoing[0]).unwrap();
        assert!(ack_events.is_empty());
        assert_eq!(sender.outbox.get(b, id).unwrap(), None);
    }

    #[test]
    fn duplicate_after_commit_is_nacked_not_redelivered() {
        let (mut sender, _d1) = overlay();
        let (mut receiver, _d2) = overlay();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (_id, frame) = sender.send(b, b"one".to_vec()).unwrap();
        let (events1, _) = receiver.receive(a, &frame).unwrap();
        assert_eq!(events1.len(), 1);

        // Simulate an ack loss: the sender resends the same envelope.
        let (events2, outgoing2) = receiver.receive(a, &frame).unwrap();
        assert!(events2.is_empty());
        assert_eq!(outgoing2.len(), 1);
    }

    #[test]
    fn gap_is_cached_and_delivered_in_order_once_filled() {
        let (mut sender, _d1) = overlay();
        let (mut receiver, _d2) = overlay();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let (_id1, f1) = sender.send(b, b"1".to_vec()).unwrap();
        let (_id2, f2) = sender.send(b, b"2".to_vec()).unwrap();
        let (_id3, f3) = sender.send(b, b"3".to_vec()).unwrap();

        let (events1, _) = receiver.receive(a, &f1).unwrap();
        assert_eq!(events1.len(), 1);

        // Envelope 2 is dropped in transit; envelope 3 arrives first.
        let (events3, outgoing3) = receiver.receive(a, &f3).unwrap();
        assert!(events3.is_empty());
        assert_eq!(outgoing3.len(), 1);

        let (events2, _) = receiver.receive(a, &f2).unwrap();
        assert_eq!(events2.len(), 2);
        assert_eq!(events2[0], Event::DataReceived { uuid: a, payload: b"2".to_vec() });
        assert_eq!(events2[1], Event::DataReceived { uuid: a, payload: b"3".to_vec() });
    }
}
