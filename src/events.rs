//! Application-facing events.
//!
//! The C4/C5/C6 engines each produce a stream of these during `poll`/
//! `step`/`discover` calls; the facade (C9) merges all three streams in
//! call order and hands them to the application as a plain `Vec<Event>`
//! rather than the function-pointer callback-struct style, which doesn't
//! translate well to a synchronous, single-threaded poll loop with no
//! trait object indirection needed at this boundary.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::packet::PacketType;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A new peer was seen for the first time (or re-entered after an
    /// address change) via a beacon.
    PeerDiscovered { uuid: Uuid, addr: SocketAddrV4, timediff: i64 },
    /// A previously known peer's clock skew estimate moved but stayed
    /// within `timestamp_error_limit`.
    PeerTimediff { uuid: Uuid, timediff: i64 },
    /// A peer's expiration deadline passed, or its address changed (the
    /// old entry is retired; a fresh beacon will cause rediscovery).
    PeerExpired { uuid: Uuid, addr: SocketAddrV4 },

    /// A reader account finished binding to `uuid` via its `hello` packet.
    /// Always precedes `ChannelEstablished` for the same peer.
    ReaderReady { uuid: Uuid },
    /// A writer account's outbound socket finished connecting to `uuid` and
    /// is ready to accept queued packets.
    WriterReady { uuid: Uuid },
    /// A TCP channel to `uuid` finished the hello handshake in both
    /// directions and is ready for application payloads.
    ChannelEstablished { uuid: Uuid },
    /// A channel was torn down (peer expiration, socket error, or local
    /// shutdown).
    ChannelClosed { uuid: Uuid },
    /// An application-type payload was reassembled from one or more
    /// packets and delivered in order.
    DataReceived { uuid: Uuid, payload: Vec<u8> },
    /// A `file_*` payload was reassembled; the facade forwards it to the
    /// file transporter (C6) rather than surfacing it to the application.
    FileDataReceived { uuid: Uuid, packet_type: PacketType, payload: Vec<u8> },

    /// Incremental progress on an inbound file transfer.
    DownloadProgress { uuid: Uuid, file_id: u64, percent: u8 },
    /// An inbound file transfer finished and was renamed into place.
    DownloadComplete { uuid: Uuid, file_id: u64, path: PathBuf },
    /// An inbound file transfer was abandoned (peer expired mid-transfer,
    /// checksum/size mismatch, or local I/O error).
    DownloadInterrupted { uuid: Uuid, file_id: u64, reason: String },
    /// An outgoing file-chunk queue ran dry; the file transporter (C6)
    /// should push the next `file_chunk` (or `file_end`) for this transfer.
    FileChunkNeeded { uuid: Uuid, file_id: u64 },
    /// Either side abandoned a transfer with `file_stop`; the local
    /// outgoing-send state for it (if any) was torn down.
    UploadStopped { uuid: Uuid, file_id: u64 },

    /// Non-fatal failure: logged and surfaced, does not tear anything down.
    OnError { context: String, message: String },
    /// Fatal-to-one-peer failure: the engine will also emit `ChannelClosed`
    /// or `PeerExpired` for the same peer in this batch.
    OnFailure { uuid: Option<Uuid>, message: String },
}

/// Adaptive idle backoff for the facade's main loop (spec §4.9): starts at
/// zero latency and grows by 1ms per empty tick up to a ceiling, resetting
/// to zero the instant any poller produces an event.
#[derive(Debug, Clone, Copy)]
pub struct AdaptivePoll {
    current_ms: u64,
    ceiling_ms: u64,
}

impl AdaptivePoll {
    pub fn new(ceiling_ms: u64) -> Self {
        Self { current_ms: 0, ceiling_ms }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.current_ms)
    }

    /// Call once per loop tick with whether any events were produced.
    pub fn observe(&mut self, had_events: bool) {
        if had_events {
            self.current_ms = 0;
        } else if self.current_ms < self.ceiling_ms {
            self.current_ms += 1;
        }
    }
}

impl Default for AdaptivePoll {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_poll_grows_then_resets() {
        let mut p = AdaptivePoll::new(10);
        for _ in 0..15 {
            p.observe(false);
        }
        assert_eq!(p.interval(), Duration::from_millis(10));
        p.observe(true);
        assert_eq!(p.interval(), Duration::from_millis(0));
    }
}
