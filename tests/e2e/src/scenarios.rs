//! Scenarios runnable from tests and from the `e2e_runner` binary

use crate::framework::PingPongPair;
use anyhow::{bail, Result};
use engine::EngineConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub duplicate_pongs: u64,
    pub elapsed_ms: u64,
    pub mean_round_trip_us: u64,
    pub max_round_trip_us: u64,
}

/// Send `count` pings starting at `first_id` and expect exactly one pong per
/// ping within `timeout`
pub fn ping_pong(
    config: EngineConfig,
    first_id: u64,
    count: u64,
    timeout: Duration,
) -> Result<ScenarioReport> {
    let pair = PingPongPair::connect(config)?;
    let started = Instant::now();
    let mut sent_at = HashMap::with_capacity(count as usize);
    for id in first_id..first_id + count {
        sent_at.insert(id, Instant::now());
        pair.send_ping(id)?;
    }

    let deadline = started + timeout;
    let mut received: HashMap<u64, u32> = HashMap::with_capacity(count as usize);
    let mut round_trips = Vec::with_capacity(count as usize);
    while (received.len() as u64) < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let Some(event) = pair.recv_pong(remaining) else {
            bail!(
                "received {} of {} pongs within {:?}",
                received.len(),
                count,
                timeout
            );
        };
        let Some(sent) = sent_at.get(&event.pong.ping_id) else {
            bail!("pong for unknown ping {}", event.pong.ping_id);
        };
        round_trips.push(event.received_at.duration_since(*sent));
        *received.entry(event.pong.ping_id).or_default() += 1;
    }

    // Late duplicates would show up shortly after the last expected pong
    let mut duplicates = 0;
    while let Some(event) = pair.recv_pong(Duration::from_millis(50)) {
        duplicates += 1;
        info!(ping_id = event.pong.ping_id, "Duplicate pong");
    }
    duplicates += received.values().filter(|n| **n > 1).count() as u64;

    let elapsed = started.elapsed();
    pair.shutdown()?;

    let total: Duration = round_trips.iter().sum();
    let report = ScenarioReport {
        scenario: "ping_pong".to_string(),
        pings_sent: count,
        pongs_received: round_trips.len() as u64,
        duplicate_pongs: duplicates,
        elapsed_ms: elapsed.as_millis() as u64,
        mean_round_trip_us: (total / round_trips.len().max(1) as u32).as_micros() as u64,
        max_round_trip_us: round_trips
            .iter()
            .max()
            .map_or(0, |d| d.as_micros() as u64),
    };
    info!(
        pings = report.pings_sent,
        pongs = report.pongs_received,
        mean_us = report.mean_round_trip_us,
        "Ping/pong scenario finished"
    );
    Ok(report)
}
