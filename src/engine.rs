//! Mesh engine facade (C9): binds discovery (C4), delivery (C5), the file
//! transporter (C6) and the reliable-delivery overlay (C8) into one
//! `step()` loop (spec §4.9), with an adaptive idle interval and the
//! defer-expire discipline C5 already establishes.

use std::net::SocketAddrV4;
use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use crate::config::MeshConfig;
use crate::delivery::DeliveryEngine;
use crate::discovery::DiscoveryEngine;
use crate::error::Result;
use crate::events::{AdaptivePoll, Event};
use crate::file_transport::FileTransporter;
use crate::outbox::Outbox;
use crate::overlay::ReliableOverlay;
use crate::packet::PacketType;

/// LAN mesh node: one discovery socket, one listener, per-peer writer
/// sockets, and the reliable-delivery + file-transfer sub-protocols riding
/// on top of them. `step()` is the entire public surface of the main loop;
/// everything else is request/command methods the application calls
/// between steps.
pub struct MeshEngine {
    own_uuid: Uuid,
    discovery: DiscoveryEngine,
    delivery: DeliveryEngine,
    overlay: ReliableOverlay,
    files: FileTransporter,
    adaptive: AdaptivePoll,
    /// Set on an internal-invariant error (spec §7): once set, `step()`
    /// becomes a no-op-with-sleep and every call re-emits `OnFailure`.
    dysfunctional: bool,
}

impl MeshEngine {
    pub fn new(own_uuid: Uuid, config: MeshConfig) -> Result<Self> {
        config.validate()?;
        let discovery = DiscoveryEngine::new(own_uuid, config.discovery.clone())?;
        let delivery = DeliveryEngine::new(
            own_uuid,
            config.listener_saddr,
            config.listener_backlog,
            config.packet_size,
        )?;
        let outbox = Outbox::open(&config.outbox_directory)?;
        let overlay = ReliableOverlay::new(outbox);
        let files = FileTransporter::new(config.file.clone())?;
        Ok(Self {
            own_uuid,
            discovery,
            delivery,
            overlay,
            files,
            adaptive: AdaptivePoll::default(),
            dysfunctional: false,
        })
    }

    /// Whether an internal-invariant error has marked this engine
    /// unrecoverable (spec §7). Once true, `step()` only sleeps.
    pub fn is_dysfunctional(&self) -> bool {
        self.dysfunctional
    }

    pub fn own_uuid(&self) -> Uuid {
        self.own_uuid
    }

    pub fn listener_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.delivery.local_addr()
    }

    /// Enqueues an application payload for reliable delivery to `addressee`
    /// (spec §4.8 `send_reliable`). Silently queued in the durable outbox
    /// even if the channel isn't established yet; flushed once it is.
    pub fn enqueue(&mut self, addressee: Uuid, payload: Vec<u8>) -> Result<()> {
        let (_id, frame) = self.overlay.send(addressee, payload)?;
        if self.delivery.is_established(addressee) {
            self.delivery.send_regular(addressee, &frame)?;
        }
        Ok(())
    }

    /// Begins sending a file to `addressee` (spec §4.6). Returns the
    /// locally-assigned `file_id`.
    pub fn send_file(&mut self, addressee: Uuid, path: impl AsRef<Path>) -> Result<u64> {
        let (file_id, payload) = self.files.send_file(None, path.as_ref())?;
        self.delivery.send_typed(addressee, PacketType::FileCredentials, &payload)?;
        Ok(file_id)
    }

    /// Abandons a transfer in either direction (spec §4.6 `file_stop`).
    pub fn stop_file(&mut self, peer: Uuid, file_id: u64) -> Result<()> {
        let payload = self.files.stop_file(peer, file_id);
        self.delivery.remove_file_queue(peer, file_id);
        self.delivery.send_typed(peer, PacketType::FileStop, &payload)?;
        Ok(())
    }

    /// Drops a channel and its delivery/file state immediately, without
    /// waiting for discovery to time the peer out.
    pub fn release_peer(&mut self, uuid: Uuid) -> Vec<Event> {
        let mut out = self.delivery.release_peer(uuid);
        out.extend(self.files.expire_addresser(uuid));
        out
    }

    /// Marks the engine dysfunctional (spec §7 internal-invariant class):
    /// every subsequent `step()` becomes a no-op-with-sleep that just
    /// re-emits `OnFailure`.
    fn mark_dysfunctional(&mut self, message: String) -> Event {
        self.dysfunctional = true;
        warn!(%message, "mesh engine marked dysfunctional");
        Event::OnFailure { uuid: None, message }
    }

    /// Drives exactly one iteration of the main loop (spec §4.9):
    /// 1. flush peer expirations deferred by the previous tick's callbacks;
    /// 2. discovery tick, emitting `peer_discovered`/`peer_expired` and
    ///    driving new outbound dials / peer teardown in delivery;
    /// 3. delivery tick, servicing socket readiness and the writer output
    ///    path;
    /// 4. reliable-overlay and file-transporter dispatch of whatever
    ///    `regular`/`file_*` payloads delivery reassembled this tick.
    /// Returns every application-facing event and the interval the caller
    /// should block for before calling `step` again.
    pub fn step(&mut self) -> Result<(Vec<Event>, Duration)> {
        if self.dysfunctional {
            return Ok((
                vec![Event::OnFailure { uuid: None, message: "engine is dysfunctional".into() }],
                Duration::from_millis(10),
            ));
        }

        let mut out = Vec::new();
        let timeout = self.adaptive.interval();

        let closed = self.delivery.flush_deferred();
        for event in &closed {
            if let Event::ChannelClosed { uuid } = *event {
                out.extend(self.files.expire_addresser(uuid));
            }
        }
        out.extend(closed);

        // A poller backend failure here is an internal invariant, not a
        // per-peer network error (spec §7): the reactor itself is broken,
        // not one socket on it.
        let discovery_events = match self.discovery.discover(timeout) {
            Ok(events) => events,
            Err(e) => return Ok((vec![self.mark_dysfunctional(format!("discovery poll failed: {e}"))], Duration::from_millis(10))),
        };
        for event in &discovery_events {
            match *event {
                Event::PeerDiscovered { uuid, addr, .. } => {
                    if let Err(e) = self.delivery.peer_discovered(uuid, addr) {
                        warn!(%uuid, error = %e, "failed to dial discovered peer");
                    }
                }
                Event::PeerExpired { uuid, .. } => {
                    self.delivery.defer_expire_peer(uuid);
                }
                _ => {}
            }
        }
        out.extend(discovery_events);

        let (delivery_events, chunk_needed) = match self.delivery.step(Duration::ZERO) {
            Ok(r) => r,
            Err(e) => {
                out.push(self.mark_dysfunctional(format!("delivery poll failed: {e}")));
                self.adaptive.observe(true);
                return Ok((out, Duration::from_millis(10)));
            }
        };
        for event in delivery_events {
            match event {
                Event::ChannelEstablished { uuid } => {
                    out.push(Event::ChannelEstablished { uuid });
                    if let Ok(frames) = self.overlay.resend_unacked(uuid) {
                        for frame in frames {
                            let _ = self.delivery.send_regular(uuid, &frame);
                        }
                    }
                }
                Event::DataReceived { uuid, payload } => match self.overlay.receive(uuid, &payload) {
                    Ok((app_events, replies)) => {
                        out.extend(app_events);
                        for reply in replies {
                            let _ = self.delivery.send_regular(uuid, &reply);
                        }
                    }
                    Err(e) => {
                        warn!(%uuid, error = %e, "malformed reliable-overlay frame");
                        out.push(Event::OnError {
                            context: "overlay.receive".into(),
                            message: e.to_string(),
                        });
                    }
                },
                Event::FileDataReceived { uuid, packet_type, payload } => {
                    match self.files.dispatch(uuid, packet_type, &payload) {
                        Ok(outcome) => {
                            out.extend(outcome.events);
                            for (reply_type, reply_payload) in outcome.replies {
                                let _ = self.delivery.send_typed(uuid, reply_type, &reply_payload);
                            }
                        }
                        Err(e) => {
                            warn!(%uuid, ?packet_type, error = %e, "file transporter dispatch failed");
                            out.push(Event::OnError {
                                context: "file_transport.dispatch".into(),
                                message: e.to_string(),
                            });
                        }
                    }
                }
                other => out.push(other),
            }
        }

        for (uuid, file_id) in chunk_needed {
            match self.files.next_chunk(uuid, file_id) {
                Ok(packets) if !packets.is_empty() => {
                    let _ = self.delivery.push_file_packets(uuid, file_id, packets);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(%uuid, file_id, error = %e, "failed to read next file chunk");
                    out.push(Event::OnError {
                        context: "file_transport.next_chunk".into(),
                        message: e.to_string(),
                    });
                }
            }
        }

        self.adaptive.observe(!out.is_empty());
        Ok((out, self.adaptive.interval()))
    }
}

impl std::fmt::Debug for MeshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshEngine").field("own_uuid", &self.own_uuid).finish_non_exhaustive()
    }
}

pub fn log_startup(own_uuid: Uuid, listener: SocketAddrV4) {
    info!(%own_uuid, %listener, "mesh engine starting");
}
