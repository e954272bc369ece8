//! Persistent outbox (C7): durable per-addressee envelope queue plus a
//! key-value "recent committed envelope id" marker per addresser.
//!
//! Backed by `sled` (spec §9 names this as one valid choice among several
//! for a logically-SQL-shaped contract). One tree per peer holds that
//! peer's envelope rows (big-endian `u64` keys so iteration order is
//! numeric); a shared `eids` tree tracks the next id to assign per
//! addressee; a shared `recent_eid` tree tracks the last committed
//! incoming id per addresser. `save` commits the envelope row and the
//! `eids` marker in one sled transaction (spec §4.7/§5 atomicity).

use std::convert::Infallible;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::transaction::Transactional;
use uuid::Uuid;

use crate::error::{MeshError, Result};

#[derive(Debug, Serialize, Deserialize)]
struct EnvelopeRow {
    payload: Vec<u8>,
    ack: bool,
}

pub struct Outbox {
    db: sled::Db,
}

impl Outbox {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn peer_tree(&self, peer: Uuid) -> Result<sled::Tree> {
        Ok(self.db.open_tree(format!("peer_{peer}"))?)
    }

    fn eids_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree("eids")?)
    }

    fn recent_tree(&self) -> Result<sled::Tree> {
        Ok(self.db.open_tree("recent_eid")?)
    }

    /// Opens the durable state for a peer. Trees are created lazily by
    /// `sled::open_tree`, so this exists mainly to make the lifecycle
    /// explicit at call sites (spec §4.7).
    pub fn meet_peer(&self, peer: Uuid) -> Result<()> {
        self.peer_tree(peer)?;
        Ok(())
    }

    /// Flushes a peer's tree. Does not delete it — unacked envelopes must
    /// survive to the next session (spec §3 envelope lifecycle).
    pub fn spend_peer(&self, peer: Uuid) -> Result<()> {
        self.peer_tree(peer)?.flush()?;
        Ok(())
    }

    /// Allocates the next monotonic envelope id for `addressee` and
    /// persists `(id, bytes, ack=false)` atomically with the new `eids`
    /// marker. Ordering survives process restart: `eids` is durable.
    pub fn save(&self, addressee: Uuid, bytes: &[u8]) -> Result<u64> {
        let peer_tree = self.peer_tree(addressee)?;
        let eids = self.eids_tree()?;
        let key = addressee.as_bytes().to_vec();
        let row = bincode::serialize(&EnvelopeRow { payload: bytes.to_vec(), ack: false })?;

        let next: Result<u64> = (&peer_tree, &eids)
            .transaction(|(pt, et)| {
                let prev = et
                    .get(&key)?
                    .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap()))
                    .unwrap_or(0);
                let next = prev + 1;
                et.insert(key.as_slice(), &next.to_be_bytes())?;
                pt.insert(&next.to_be_bytes(), row.as_slice())?;
                Ok::<u64, sled::transaction::ConflictableTransactionError<Infallible>>(next)
            })
            .map_err(|e| MeshError::Storage(e.to_string()));
        next
    }

    /// Acknowledged or duplicate-nacked envelopes are both removed from
    /// the durable queue (spec §3 invariant).
    pub fn ack(&self, addressee: Uuid, envelope_id: u64) -> Result<()> {
        let tree = self.peer_tree(addressee)?;
        tree.remove(envelope_id.to_be_bytes())?;
        Ok(())
    }

    pub fn nack(&self, addressee: Uuid, envelope_id: u64) -> Result<()> {
        self.ack(addressee, envelope_id)
    }

    /// Fetches one still-unacked envelope's payload, if present.
    pub fn get(&self, addressee: Uuid, envelope_id: u64) -> Result<Option<Vec<u8>>> {
        let tree = self.peer_tree(addressee)?;
        match tree.get(envelope_id.to_be_bytes())? {
            Some(bytes) => {
                let row: EnvelopeRow = bincode::deserialize(&bytes)?;
                Ok(if row.ack { None } else { Some(row.payload) })
            }
            None => Ok(None),
        }
    }

    /// Iterates unacked envelopes for `addressee` with id `> eid`, in
    /// ascending order.
    pub fn again_since<F: FnMut(u64, &[u8])>(&self, addressee: Uuid, eid: u64, mut f: F) -> Result<()> {
        let tree = self.peer_tree(addressee)?;
        let start = (eid + 1).to_be_bytes();
        for item in tree.range(start.to_vec()..) {
            let (k, v) = item?;
            let id = u64::from_be_bytes(k.as_ref().try_into().unwrap());
            let row: EnvelopeRow = bincode::deserialize(&v)?;
            if !row.ack {
                f(id, &row.payload);
            }
        }
        Ok(())
    }

    /// Iterates every unacked envelope for `addressee`, in ascending order
    /// (spec §4.7 `again(addressee, f)`; used on channel re-establishment).
    pub fn again_all<F: FnMut(u64, &[u8])>(&self, addressee: Uuid, f: F) -> Result<()> {
        self.again_since(addressee, 0, f)
    }

    /// Durable "last committed incoming envelope id" for `addresser`.
    pub fn set_recent_eid(&self, addresser: Uuid, eid: u64) -> Result<()> {
        let tree = self.recent_tree()?;
        tree.insert(addresser.as_bytes(), &eid.to_be_bytes())?;
        Ok(())
    }

    pub fn recent_eid(&self, addresser: Uuid) -> Result<u64> {
        let tree = self.recent_tree()?;
        Ok(tree
            .get(addresser.as_bytes())?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap()))
            .unwrap_or(0))
    }

    /// Purges ack-marked rows. A no-op under the current scheme (`ack`
    /// deletes immediately) but kept as an explicit maintenance hook so a
    /// future soft-delete storage layout doesn't need a new entry point.
    pub fn maintain(&self, peer: Uuid) -> Result<()> {
        self.peer_tree(peer)?.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (Outbox, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (Outbox::open(dir.path()).unwrap(), dir)
    }

    #[test]
    fn save_ids_are_monotonic() {
        let (ob, _dir) = open_tmp();
        let peer = Uuid::new_v4();
        let a = ob.save(peer, b"one").unwrap();
        let b = ob.save(peer, b"two").unwrap();
        assert!(a < b);
    }

    #[test]
    fn save_ids_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let peer = Uuid::new_v4();
        {
            let ob = Outbox::open(dir.path()).unwrap();
            ob.save(peer, b"one").unwrap();
            ob.save(peer, b"two").unwrap();
        }
        let ob = Outbox::open(dir.path()).unwrap();
        let next = ob.save(peer, b"three").unwrap();
        assert_eq!(next, 3);
    }

    #[test]
    fn ack_removes_envelope() {
        let (ob, _dir) = open_tmp();
        let peer = Uuid::new_v4();
        let id = ob.save(peer, b"payload").unwrap();
        assert_eq!(ob.get(peer, id).unwrap(), Some(b"payload".to_vec()));
        ob.ack(peer, id).unwrap();
        assert_eq!(ob.get(peer, id).unwrap(), None);
    }

    #[test]
    fn again_all_yields_unacked_in_order() {
        let (ob, _dir) = open_tmp();
        let peer = Uuid::new_v4();
        let a = ob.save(peer, b"a").unwrap();
        let b = ob.save(peer, b"b").unwrap();
        ob.save(peer, b"c").unwrap();
        ob.ack(peer, b).unwrap();
        let mut seen = Vec::new();
        ob.again_all(peer, |id, bytes| seen.push((id, bytes.to_vec()))).unwrap();
        assert_eq!(seen, vec![(a, b"a".to_vec()), (3, b"c".to_vec())]);
    }

    #[test]
    fn recent_eid_defaults_to_zero() {
        let (ob, _dir) = open_tmp();
        let peer = Uuid::new_v4();
        assert_eq!(ob.recent_eid(peer).unwrap(), 0);
        ob.set_recent_eid(peer, 7).unwrap();
        assert_eq!(ob.recent_eid(peer).unwrap(), 7);
    }
}
