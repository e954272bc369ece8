//! End-to-end integration tests: real `MeshEngine` instances talking over
//! loopback UDP (discovery) and TCP (channels), in-process rather than as
//! separate spawned binaries (the library is embedded, not a standalone
//! per-node process — see SPEC_FULL.md §8). Covers spec §8 scenarios 1
//! (two-peer loopback message), 2 (self-beacon suppression) and 3 (file
//! transfer).

use std::fs;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use montana_mesh::config::{DiscoveryConfig, FileConfig, MeshConfig};
use montana_mesh::{Event, MeshEngine};
use uuid::Uuid;

/// Grabs an ephemeral UDP port and releases it immediately so two engines
/// can name each other as discovery targets before either is constructed.
fn reserve_udp_port() -> u16 {
    let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    sock.local_addr().unwrap().port()
}

fn test_config(discovery_port: u16, target_port: u16, tmp: &tempfile::TempDir) -> MeshConfig {
    MeshConfig {
        listener_saddr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0),
        discovery: DiscoveryConfig {
            transmit_interval_secs: 1,
            bind: SocketAddrV4::new(Ipv4Addr::LOCALHOST, discovery_port),
            targets: vec![SocketAddrV4::new(Ipv4Addr::LOCALHOST, target_port)],
            ..Default::default()
        },
        file: FileConfig { download_directory: tmp.path().join("downloads"), ..Default::default() },
        outbox_directory: tmp.path().join("outbox"),
        ..Default::default()
    }
}

/// Steps both engines in lockstep, accumulating events, until `predicate`
/// is satisfied or `deadline` elapses (whichever comes first).
fn drive_until(
    a: &mut MeshEngine,
    b: &mut MeshEngine,
    deadline: Duration,
    mut predicate: impl FnMut(&[Event], &[Event]) -> bool,
) -> (Vec<Event>, Vec<Event>) {
    let start = Instant::now();
    let mut events_a = Vec::new();
    let mut events_b = Vec::new();
    loop {
        let (ea, _) = a.step().unwrap();
        let (eb, _) = b.step().unwrap();
        events_a.extend(ea);
        events_b.extend(eb);
        if predicate(&events_a, &events_b) || start.elapsed() > deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    (events_a, events_b)
}

#[test]
fn two_peer_discovery_and_reliable_delivery() {
    let port_a = reserve_udp_port();
    let port_b = reserve_udp_port();
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();

    let uuid_a = Uuid::new_v4();
    let uuid_b = Uuid::new_v4();
    let mut node_a = MeshEngine::new(uuid_a, test_config(port_a, port_b, &tmp_a)).unwrap();
    let mut node_b = MeshEngine::new(uuid_b, test_config(port_b, port_a, &tmp_b)).unwrap();

    let (events_a, events_b) = drive_until(&mut node_a, &mut node_b, Duration::from_secs(5), |ea, eb| {
        ea.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_b))
            && eb.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_a))
    });

    assert!(events_a.iter().any(|e| matches!(e, Event::PeerDiscovered { uuid, .. } if *uuid == uuid_b)));
    assert!(events_b.iter().any(|e| matches!(e, Event::PeerDiscovered { uuid, .. } if *uuid == uuid_a)));
    assert!(events_a.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_b)));
    assert!(events_b.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_a)));

    node_a.enqueue(uuid_b, b"WORLD".to_vec()).unwrap();

    let (_events_a2, events_b2) = drive_until(&mut node_a, &mut node_b, Duration::from_secs(5), |_ea, eb| {
        eb.iter().any(|e| matches!(e, Event::DataReceived { uuid, payload } if *uuid == uuid_a && payload == b"WORLD"))
    });

    assert!(events_b2
        .iter()
        .any(|e| matches!(e, Event::DataReceived { uuid, payload } if *uuid == uuid_a && payload == b"WORLD")));
}

#[test]
fn self_beacon_does_not_trigger_peer_discovered() {
    let port = reserve_udp_port();
    let tmp = tempfile::tempdir().unwrap();
    let uuid = Uuid::new_v4();
    let mut node = MeshEngine::new(uuid, test_config(port, port, &tmp)).unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    let mut saw_self_discovery = false;
    while Instant::now() < deadline {
        let (events, _) = node.step().unwrap();
        if events.iter().any(|e| matches!(e, Event::PeerDiscovered { uuid: u, .. } if *u == uuid)) {
            saw_self_discovery = true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(!saw_self_discovery, "a node's own beacon must never surface as PeerDiscovered");
}

#[test]
fn file_transfer_end_to_end_via_engine() {
    let port_a = reserve_udp_port();
    let port_b = reserve_udp_port();
    let tmp_a = tempfile::tempdir().unwrap();
    let tmp_b = tempfile::tempdir().unwrap();
    let uuid_a = Uuid::new_v4();
    let uuid_b = Uuid::new_v4();
    let mut node_a = MeshEngine::new(uuid_a, test_config(port_a, port_b, &tmp_a)).unwrap();
    let mut node_b = MeshEngine::new(uuid_b, test_config(port_b, port_a, &tmp_b)).unwrap();

    drive_until(&mut node_a, &mut node_b, Duration::from_secs(5), |ea, eb| {
        ea.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_b))
            && eb.iter().any(|e| matches!(e, Event::ChannelEstablished { uuid } if *uuid == uuid_a))
    });

    let src_path = tmp_a.path().join("src.bin");
    let data: Vec<u8> = (0..65536u32).map(|i| (i % 256) as u8).collect();
    fs::File::create(&src_path).unwrap().write_all(&data).unwrap();

    node_a.send_file(uuid_b, &src_path).unwrap();

    let (_ea, eb) = drive_until(&mut node_a, &mut node_b, Duration::from_secs(10), |_ea, eb| {
        eb.iter().any(|e| matches!(e, Event::DownloadComplete { uuid, .. } if *uuid == uuid_a))
    });

    let completed_path = eb
        .iter()
        .find_map(|e| match e {
            Event::DownloadComplete { uuid, path, .. } if *uuid == uuid_a => Some(path.clone()),
            _ => None,
        })
        .expect("expected a DownloadComplete event from node_a's transfer");

    let got = fs::read(&completed_path).unwrap();
    assert_eq!(got, data);
}
