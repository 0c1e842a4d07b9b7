//! Ping/pong between two engines over localhost TCP

use codec::{to_bytes, Ping};
use e2e_tests::{ping_pong, PingPongPair};
use engine::EngineConfig;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.sessions.count = 2;
    config.send_pool.segment_count = 512;
    config.receive_pool.segment_count = 16;
    config.ring.capacity = 1024;
    config
}

#[test]
fn test_ping_9876_answered_exactly_once() {
    let pair = PingPongPair::connect(config()).unwrap();
    pair.send_ping(9876).unwrap();

    let event = pair.recv_pong(WAIT).expect("pong within bounded wait");
    assert_eq!(event.pong.ping_id, 9876);
    assert!(pair.recv_pong(Duration::from_millis(200)).is_none());
    pair.shutdown().unwrap();
}

#[test]
fn test_many_pings_each_answered_once() {
    let report = ping_pong(config(), 9876, 500, WAIT).unwrap();
    assert_eq!(report.pongs_received, 500);
    assert_eq!(report.duplicate_pongs, 0);
}

#[test]
fn test_conflated_pings() {
    let mut config = config();
    config.conflation.enabled = true;
    let report = ping_pong(config, 1, 300, WAIT).unwrap();
    assert_eq!(report.pongs_received, 300);
}

#[test]
fn test_version_mismatch_closes_session() {
    let pair = PingPongPair::connect(config()).unwrap();
    let mut payload = to_bytes(&Ping { id: 5 }).to_vec();
    payload[1] = 99;
    pair.send_raw(&payload).unwrap();

    assert_eq!(pair.responder_closed(WAIT), Some(pair.responder.session));
    // The responder's close reaches the initiator as a disconnect
    assert_eq!(pair.initiator_closed(WAIT), Some(pair.initiator.session));
    assert!(pair.recv_pong(Duration::from_millis(100)).is_none());
    pair.shutdown().unwrap();
}
