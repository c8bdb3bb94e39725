//! Stress tests for pathological cases
//!
//! These tests verify we don't have accidentally quadratic behavior.

use convoy::server::{ConnectionRegistry, OutboundMessage, Scope, ServerEvent, TopicRouter};
use convoy::Identity;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use uuid::Uuid;

fn populate(
    registry: &ConnectionRegistry,
    count: usize,
    capacity: usize,
) -> Vec<mpsc::Receiver<OutboundMessage>> {
    (0..count)
        .map(|i| {
            let (tx, rx) = mpsc::channel(capacity);
            let id = Uuid::new_v4();
            registry.admit(id, Identity::new(format!("user-{}", i)), tx);
            registry.join_topic(id, &format!("vehicle:{}", i));
            rx
        })
        .collect()
}

/// Test that topic lookup does not degrade as the relay grows
#[test]
fn test_topic_lookup_not_quadratic() {
    let connection_counts = [100, 1_000, 10_000];
    let mut times = vec![];

    for &count in &connection_counts {
        let registry = ConnectionRegistry::new();
        let _receivers = populate(&registry, count, 1);

        // Time how long it takes to find the members of one topic
        let iterations = 10_000;
        let start = Instant::now();

        for i in 0..iterations {
            let members = registry.members(&format!("vehicle:{}", i % count));
            assert_eq!(members.len(), 1);
        }

        let elapsed = start.elapsed();
        let per_lookup_ns = elapsed.as_nanos() / iterations as u128;
        times.push((count, per_lookup_ns));

        println!(
            "Connections: {:>6}, Lookups: {}, Time: {:?}, Per lookup: {}ns",
            count, iterations, elapsed, per_lookup_ns
        );
    }

    let (small_count, small_time) = times[0];
    let (large_count, large_time) = times[times.len() - 1];

    let count_ratio = large_count as f64 / small_count as f64;
    let time_ratio = large_time as f64 / small_time.max(1) as f64;

    println!(
        "\nConnection count ratio: {:.0}x, Time ratio: {:.1}x",
        count_ratio, time_ratio
    );

    // The topic index makes this roughly constant; anything near linear is a regression
    assert!(
        time_ratio < count_ratio,
        "Topic lookup appears to scan every connection! Time grew {:.1}x for {:.0}x more connections",
        time_ratio,
        count_ratio
    );
}

/// Test that a broadcast costs one encode plus one enqueue per connection
#[test]
fn test_broadcast_fan_out_linear() {
    let connection_counts = [100, 1_000, 10_000];
    let mut times = vec![];

    for &count in &connection_counts {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = TopicRouter::new(registry.clone());
        let _receivers = populate(&registry, count, 16);

        let event = ServerEvent::TrackAck {
            vehicle_id: "broadcast".to_string(),
        };

        let iterations = 10;
        let start = Instant::now();
        for _ in 0..iterations {
            assert_eq!(router.publish(&Scope::All, &event), count);
        }

        let elapsed = start.elapsed();
        let per_recipient_ns = elapsed.as_nanos() / (iterations * count) as u128;
        times.push((count, per_recipient_ns));

        println!(
            "Connections: {:>6}, Broadcasts: {}, Time: {:?}, Per recipient: {}ns",
            count, iterations, elapsed, per_recipient_ns
        );
    }

    let (_, small_time) = times[0];
    let (_, large_time) = times[times.len() - 1];
    let time_ratio = large_time as f64 / small_time.max(1) as f64;

    // Per-recipient cost should stay flat
    assert!(
        time_ratio < 10.0,
        "Broadcast cost per recipient grew {:.1}x",
        time_ratio
    );
}

/// Test a realistic mix of drivers, riders and lookers-on
#[test]
fn test_realistic_workload() {
    let registry = Arc::new(ConnectionRegistry::new());
    let router = TopicRouter::new(registry.clone());

    // 200 vehicles, each with one driver and a few riders tracking it
    let mut receivers = vec![];
    for v in 0..200 {
        for member in 0..4 {
            let (tx, rx) = mpsc::channel(64);
            let id = Uuid::new_v4();
            registry.admit(id, Identity::new(format!("v{}-m{}", v, member)), tx);
            registry.join_topic(id, &format!("vehicle:v{}", v));
            receivers.push(rx);
        }
    }

    assert_eq!(registry.count(), 800);
    assert_eq!(registry.topic_count(), 200);

    let start = Instant::now();
    let mut delivered = 0;
    for round in 0..10 {
        for v in 0..200 {
            let event = ServerEvent::TrackAck {
                vehicle_id: format!("v{}-{}", v, round),
            };
            delivered += router.publish(&Scope::Topic(format!("vehicle:v{}", v)), &event);
        }
    }
    let elapsed = start.elapsed();

    println!("Routed {} events in {:?}", delivered, elapsed);
    assert_eq!(delivered, 10 * 200 * 4);

    for mut rx in receivers {
        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 10);
    }
}
