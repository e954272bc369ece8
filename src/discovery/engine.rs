//! Discovery engine (C4): owns the UDP beacon socket, the live peer
//! registry and the expiration sweep. Runs on its own `mio::Poll`
//! independent of the TCP-oriented poller backend in `poller::`, since
//! discovery's data flow never touches a reader/writer account directly
//! (it only ever emits `PeerDiscovered`/`PeerExpired` for C5 to act on).

use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::DiscoveryConfig;
use crate::discovery::beacon::{Beacon, BEACON_LEN};
use crate::error::Result;
use crate::events::Event;

const SOCKET_TOKEN: Token = Token(0);
const MIN_EXPIRATION: Duration = Duration::from_secs(5);

struct PeerRecord {
    addr: SocketAddrV4,
    timediff_ms: i64,
    expiration_deadline: Instant,
}

/// Maintains the beacon socket and the set of currently-credentialed peers.
pub struct DiscoveryEngine {
    own_uuid: Uuid,
    config: DiscoveryConfig,
    socket: UdpSocket,
    poll: Poll,
    events: Events,
    peers: HashMap<Uuid, PeerRecord>,
    counter: u32,
    next_transmit_at: Instant,
    recv_buf: [u8; 512],
}

impl DiscoveryEngine {
    pub fn new(own_uuid: Uuid, config: DiscoveryConfig) -> io::Result<Self> {
        let std_socket = bind_discovery_socket(config.bind, &config.targets)?;
        let mut socket = UdpSocket::from_std(std_socket);
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        Ok(Self {
            own_uuid,
            config,
            socket,
            poll,
            events: Events::with_capacity(64),
            peers: HashMap::new(),
            counter: 0,
            // First beacon may fire any time in [0, transmit_interval) after
            // start (spec §9 open question): starting the deadline "now"
            // sends on the very first tick, which is within that window.
            next_transmit_at: Instant::now(),
            recv_buf: [0u8; 512],
        })
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    /// Drives one tick: polls the UDP socket up to `timeout`, processes all
    /// pending datagrams, emits beacons if the transmit interval elapsed,
    /// and sweeps expired peers. Returns every event produced this tick.
    pub fn discover(&mut self, timeout: Duration) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        self.poll.poll(&mut self.events, Some(timeout))?;
        let readable = self.events.iter().any(|e| e.token() == SOCKET_TOKEN);
        if readable {
            self.drain_socket(&mut out)?;
        }
        self.maybe_transmit(&mut out);
        self.sweep_expired(&mut out);
        Ok(out)
    }

    fn drain_socket(&mut self, out: &mut Vec<Event>) -> Result<()> {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((n, from)) => {
                    let datagram = self.recv_buf[..n].to_vec();
                    self.handle_datagram(&datagram, from, out);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    out.push(Event::OnError {
                        context: "discovery.recv".into(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_datagram(&mut self, raw: &[u8], from: std::net::SocketAddr, out: &mut Vec<Event>) {
        if raw.len() != BEACON_LEN {
            trace!(len = raw.len(), "discarding non-beacon-sized datagram");
            return;
        }
        let beacon = match Beacon::decode(raw) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "malformed beacon");
                return;
            }
        };
        if beacon.sender == self.own_uuid {
            return;
        }
        let ip = match from {
            std::net::SocketAddr::V4(v4) => *v4.ip(),
            std::net::SocketAddr::V6(_) => return,
        };
        let addr = SocketAddrV4::new(ip, beacon.port);
        let now_utc_ms = now_utc_ms();
        let timediff = now_utc_ms - beacon.timestamp_ms;
        let expiration_interval = expiration_interval_for(beacon.transmit_interval_secs);
        let expiration_deadline = Instant::now() + expiration_interval;

        match self.peers.get_mut(&beacon.sender) {
            None => {
                self.peers.insert(
                    beacon.sender,
                    PeerRecord { addr, timediff_ms: timediff, expiration_deadline },
                );
                debug!(uuid = %beacon.sender, %addr, "peer discovered");
                out.push(Event::PeerDiscovered { uuid: beacon.sender, addr, timediff });
            }
            Some(peer) if peer.addr != addr => {
                let old_addr = peer.addr;
                self.peers.remove(&beacon.sender);
                out.push(Event::PeerExpired { uuid: beacon.sender, addr: old_addr });
            }
            Some(peer) => {
                peer.expiration_deadline = expiration_deadline;
                let delta = (timediff - peer.timediff_ms).abs() as u64;
                if delta < self.config.timestamp_error_limit_ms as u64 {
                    peer.timediff_ms = timediff;
                    out.push(Event::PeerTimediff { uuid: beacon.sender, timediff });
                }
            }
        }
    }

    fn maybe_transmit(&mut self, out: &mut Vec<Event>) {
        let now = Instant::now();
        if now < self.next_transmit_at {
            return;
        }
        self.next_transmit_at = now + self.config.transmit_interval();
        if self.config.targets.is_empty() {
            return;
        }
        let port = self.socket.local_addr().map(|a| a.port()).unwrap_or(0);
        for target in self.config.targets.clone() {
            self.counter = self.counter.wrapping_add(1);
            let beacon = Beacon {
                sender: self.own_uuid,
                port,
                transmit_interval_secs: self.config.transmit_interval_secs,
                counter: self.counter,
                timestamp_ms: now_utc_ms(),
            };
            if let Err(e) = self.socket.send_to(&beacon.encode(), target.into()) {
                out.push(Event::OnError {
                    context: "discovery.send".into(),
                    message: e.to_string(),
                });
            }
        }
    }

    fn sweep_expired(&mut self, out: &mut Vec<Event>) {
        let now = Instant::now();
        let expired: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.expiration_deadline < now)
            .map(|(uuid, _)| *uuid)
            .collect();
        for uuid in expired {
            if let Some(peer) = self.peers.remove(&uuid) {
                debug!(%uuid, addr = %peer.addr, "peer expired");
                out.push(Event::PeerExpired { uuid, addr: peer.addr });
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}

/// Builds the non-blocking UDP socket discovery beacons are sent and
/// received on (spec §4.4's "unicast, multicast, or broadcast" UDP socket
/// group). `SO_BROADCAST` is
/// always enabled so a broadcast target's `sendto` doesn't fail with
/// `EACCES`; the socket also joins the multicast group of every target
/// whose address falls in the multicast range, so datagrams sent *to* that
/// group by peers are actually delivered here. Built with `socket2` so
/// these options land before the socket is handed to `mio`.
fn bind_discovery_socket(bind: SocketAddrV4, targets: &[SocketAddrV4]) -> io::Result<std::net::UdpSocket> {
    use socket2::{Domain, Socket, Type};
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.bind(&bind.into())?;
    for target in targets {
        if target.ip().is_multicast() {
            socket.join_multicast_v4(target.ip(), bind.ip())?;
        }
    }
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn expiration_interval_for(peer_transmit_interval_secs: u16) -> Duration {
    let scaled = Duration::from_secs(peer_transmit_interval_secs as u64 * 5);
    scaled.max(MIN_EXPIRATION)
}

fn now_utc_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_interval_respects_minimum() {
        assert_eq!(expiration_interval_for(0), MIN_EXPIRATION);
        assert_eq!(expiration_interval_for(1), MIN_EXPIRATION);
    }

    #[test]
    fn expiration_interval_scales_with_transmit_interval() {
        assert_eq!(expiration_interval_for(5), Duration::from_secs(25));
        assert_eq!(expiration_interval_for(60), Duration::from_secs(300));
    }

    #[test]
    fn new_engine_has_no_peers() {
        let cfg = DiscoveryConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let engine = DiscoveryEngine::new(Uuid::new_v4(), cfg).unwrap();
        assert_eq!(engine.peer_count(), 0);
    }
}
