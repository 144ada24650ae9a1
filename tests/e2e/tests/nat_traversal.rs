//! Client and gateway behind independent symmetric NATs

use std::sync::atomic::Ordering;
use std::time::Duration;

use e2e::{ipv4_packet, relay_addr, Scenario, CLIENT_ID, CLIENT_TUNNEL_IP, GATEWAY_ID, RESOURCE_IP};
use relay_server::RelayConfig;
use tunnel_core::relay::message::{encode_relay, RelayBody, RelayErrorCode, RelayMessage};
use tunnel_core::{CloseReason, EngineConfig, EngineEvent, Via};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn established(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::ConnectionEstablished { .. }))
        .count()
}

#[test]
fn test_relayed_pair_selected_when_direct_fails() {
    init_logging();
    let mut scenario = Scenario::new(EngineConfig::default());

    assert!(scenario.connect(), "tunnel never came up");

    // Only the relay can carry traffic between the two NATs
    let path = scenario.client.selected_path(GATEWAY_ID).unwrap();
    assert!(matches!(path.via, Via::Relay(_)), "selected {:?}", path);
    assert!(scenario.unroutable > 0, "host candidates were never tried");
    assert!(scenario.client_nat.filtered + scenario.gateway_nat.filtered > 0);
    assert_eq!(established(&scenario.client_events), 1);

    scenario.gateway_received();
    let packet = scenario.client_send(b"through the relay");
    assert_eq!(scenario.gateway_received(), vec![packet]);

    let reply = ipv4_packet(RESOURCE_IP, CLIENT_TUNNEL_IP, b"and back");
    scenario.gateway.route_outbound(&reply, scenario.now).unwrap();
    scenario.pump();
    assert_eq!(scenario.client_received(), vec![reply]);

    assert!(scenario.relay_metrics.datagrams_relayed_total.load(Ordering::Relaxed) > 0);
    assert!(scenario.gateway.is_connected(CLIENT_ID));
}

#[test]
fn test_allocation_without_permissions_rejects_every_relay() {
    init_logging();
    let mut scenario = Scenario::new(EngineConfig::default());
    let client = "198.51.100.77:40000".parse().unwrap();

    let allocate = RelayMessage {
        transaction_id: [1u8; 12],
        body: RelayBody::AllocateRequest { lifetime_secs: 0 },
    };
    scenario
        .relay
        .handle_client(client, &encode_relay(&allocate).unwrap(), scenario.now)
        .unwrap();
    let allocation_id = match scenario.relay.poll_output() {
        Some(relay_server::Output::ToClient { payload, .. }) => {
            match tunnel_core::relay::decode_relay(&payload).unwrap().body {
                RelayBody::AllocateResponse { allocation_id, .. } => allocation_id,
                other => panic!("allocation failed: {:?}", other),
            }
        }
        other => panic!("no allocate response: {:?}", other),
    };

    let targets = [
        "198.51.100.1:20000".parse().unwrap(),
        "198.51.100.2:20000".parse().unwrap(),
        relay_addr(),
    ];
    for peer in targets {
        let send = RelayMessage {
            transaction_id: [0u8; 12],
            body: RelayBody::SendIndication {
                allocation_id,
                peer,
                data: b"let me through".to_vec(),
            },
        };
        let result = scenario
            .relay
            .handle_client(client, &encode_relay(&send).unwrap(), scenario.now);
        assert_eq!(result, Err(RelayErrorCode::NoPermission));
    }

    assert!(scenario.relay.poll_output().is_none());
    assert_eq!(
        scenario.relay_metrics.dropped_no_permission_total.load(Ordering::Relaxed),
        targets.len() as u64
    );
}

#[test]
fn test_idle_session_torn_down_then_rebuilt() {
    init_logging();
    let config = EngineConfig {
        idle_timeout_ms: 60_000,
        ..EngineConfig::default()
    };
    let mut scenario = Scenario::new(config);
    assert!(scenario.connect());

    scenario.run_for(Duration::from_secs(70), Duration::from_secs(1));

    assert!(scenario.client_events.iter().any(|e| matches!(
        e,
        EngineEvent::ConnectionClosed {
            reason: CloseReason::Idle,
            ..
        }
    )));
    assert!(!scenario.client.is_connected(GATEWAY_ID));
    assert!(scenario.client.router().is_empty());

    // The next packet misses the route and starts a fresh cycle
    scenario.client_events.clear();
    assert!(scenario.connect(), "tunnel did not come back");
    assert!(scenario
        .client_events
        .iter()
        .any(|e| matches!(e, EngineEvent::RouteMiss { .. })));
    assert_eq!(established(&scenario.client_events), 1);

    scenario.gateway_received();
    let packet = scenario.client_send(b"after idle");
    assert_eq!(scenario.gateway_received(), vec![packet]);
}

#[test]
fn test_rekey_over_relay_delivers_exactly_once() {
    init_logging();
    let mut scenario = Scenario::new(EngineConfig::default());
    assert!(scenario.connect());
    scenario.gateway_received();

    // Rekey after 120s; 40 packets spaced 5s apart straddle it
    let mut sent = Vec::new();
    for i in 0..40u32 {
        sent.push(scenario.client_send(&i.to_be_bytes()));
        scenario.advance(Duration::from_secs(5));
    }

    assert_eq!(scenario.gateway_received(), sent);
    let stats = scenario.client.stats();
    assert!(stats.peers[&GATEWAY_ID].handshakes_completed >= 2);
    assert_eq!(scenario.gateway.stats().peers[&CLIENT_ID].replays_detected, 0);
    assert!(scenario
        .client_events
        .iter()
        .all(|e| !matches!(e, EngineEvent::ConnectionClosed { .. })));
}

#[test]
fn test_relay_exhaustion_leaves_no_path() {
    init_logging();
    let relay_config = RelayConfig {
        max_allocations: 1,
        ..RelayConfig::default()
    };
    let mut scenario = Scenario::with_relay_config(EngineConfig::default(), relay_config);

    scenario.client_send(b"route miss");
    let connected = scenario.run_until(Duration::from_secs(30), Duration::from_millis(100), |s| {
        s.client.is_connected(GATEWAY_ID)
    });

    // Only one side gets a relayed candidate, and nothing else crosses the NATs
    assert!(!connected);
    assert_eq!(scenario.relay.allocation_count(), 1);
    assert!(scenario.relay_metrics.allocation_rejections_total.load(Ordering::Relaxed) >= 1);
    assert!(scenario
        .client_events
        .iter()
        .any(|e| matches!(e, EngineEvent::ConnectionFailed { peer, .. } if *peer == GATEWAY_ID)));
}
