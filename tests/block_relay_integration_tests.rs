//! Block relay integration tests
//!
//! Drives regtest nodes over real TCP sockets on 127.0.0.1 and checks the
//! harness end to end: handshakes, receipt bookkeeping, topology handling
//! and the full relay scenario.

use relay_harness::core::BlockBuilder;
use relay_harness::harness::{BlockRelayScenario, InvPolicy, NodeRpc, Stage};
use relay_harness::network::{Connection, ConnectionOptions, Message, MessageHandler, MessageKind};
use relay_harness::{start_network, HarnessConfig, HarnessError};
use std::net::TcpListener;
use std::thread;
use std::time::{Duration, Instant};

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn test_config() -> HarnessConfig {
    HarnessConfig {
        difficulty: 1,
        poll_interval_ms: 10,
        sync_timeout_ms: 20_000,
        ..HarnessConfig::default()
    }
}

struct Silent;

impl MessageHandler for Silent {}

#[test]
fn test_block_relay_scenario_end_to_end() {
    init_logger();
    let config = test_config();
    let (mut network, nodes) = start_network(3, &config).unwrap();

    let report = BlockRelayScenario::new(&mut network).run().unwrap();

    assert_eq!(report.expected_height, 12);
    assert_eq!(report.blocks.len(), 12);
    assert!(report.heights.iter().all(|h| h.height == 12));
    assert_eq!(report.heights.len(), 3);
    assert_eq!(
        report.stages.iter().map(|s| s.stage).collect::<Vec<_>>(),
        Stage::SEQUENCE.to_vec()
    );
    assert_eq!(report.generated_block.height, 12);
    assert_eq!(report.blocks[11], report.generated_block.hash);

    // node0 has the manual chain and the generated block too
    for node in &nodes {
        assert_eq!(node.get_best_block_hash().unwrap(), report.generated_block.hash);
    }

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["expected_height"], 12);
    assert_eq!(json["blocks"][0].as_str().map(str::len), Some(64));
}

#[test]
fn test_scenario_with_fewer_manual_blocks() {
    init_logger();
    let config = HarnessConfig {
        manual_blocks: 3,
        ..test_config()
    };
    let (mut network, _nodes) = start_network(3, &config).unwrap();

    let report = BlockRelayScenario::new(&mut network).run().unwrap();
    assert_eq!(report.expected_height, 5);
    assert_eq!(report.blocks.len(), 5);
}

#[test]
fn test_manual_blocks_are_accepted_and_announced() {
    init_logger();
    let config = test_config();
    let (mut network, nodes) = start_network(1, &config).unwrap();

    let sender = network.add_harness_peer(0, InvPolicy::Ignore).unwrap();
    let listener = network.add_harness_peer(0, InvPolicy::RequestBlocks).unwrap();

    // Once the pong is back the node has registered the listener
    network
        .harness_peer(0, listener)
        .unwrap()
        .sync_with_ping(Duration::from_secs(5))
        .unwrap();

    let genesis = nodes[0].get_best_block_hash().unwrap();
    let builder = BlockBuilder::new(config.difficulty);
    let mut parent = genesis;
    let mut built = Vec::new();
    for height in 1..=3 {
        let block = builder.build(parent, height, 1_700_000_000 + height as i64).unwrap();
        parent = block.hash();
        built.push(parent);
        network
            .harness_peer(0, sender)
            .unwrap()
            .send(Message::Block(block))
            .unwrap();
    }
    network
        .harness_peer(0, sender)
        .unwrap()
        .sync_with_ping(Duration::from_secs(5))
        .unwrap();
    assert_eq!(nodes[0].get_block_count().unwrap(), 3);
    assert_eq!(nodes[0].get_best_block_hash().unwrap(), built[2]);

    // The auto-requesting peer fetched every announced block exactly once
    let peer = network.harness_peer(0, listener).unwrap();
    peer.wait_for_blocks(&built, Duration::from_secs(5)).unwrap();
    let stats = peer.snapshot();
    assert!(stats.duplicates().is_empty());
    assert!(stats.message_count(MessageKind::Inv) >= 1);

    // The sender never gets its own blocks announced back
    let sender_stats = network.harness_peer(0, sender).unwrap().snapshot();
    assert_eq!(sender_stats.message_count(MessageKind::Inv), 0);
}

#[test]
fn test_unknown_block_request_gets_notfound() {
    init_logger();
    let config = test_config();
    let (mut network, _nodes) = start_network(1, &config).unwrap();
    let id = network.add_harness_peer(0, InvPolicy::Ignore).unwrap();
    let peer = network.harness_peer(0, id).unwrap();

    let missing = relay_harness::BlockHash([0x42; 32]);
    peer.request_blocks(&[missing]).unwrap();
    peer.wait_until("notfound reply", Duration::from_secs(5), |stats| {
        stats.message_count(MessageKind::NotFound) == 1
    })
    .unwrap();
    assert!(peer.snapshot().block_receipts.is_empty());
}

#[test]
fn test_handshake_times_out_against_silent_listener() {
    init_logger();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let holder = thread::spawn(move || {
        // Accept and hold the socket open without ever answering
        let (stream, _) = listener.accept().unwrap();
        thread::sleep(Duration::from_millis(800));
        drop(stream);
    });

    let mut options = ConnectionOptions::from_config(&test_config());
    options.handshake_timeout = Duration::from_millis(200);

    let started = Instant::now();
    let result = Connection::connect(addr, &options, Silent);
    assert!(matches!(result, Err(HarnessError::Handshake(_))));
    assert!(started.elapsed() < Duration::from_millis(700));
    holder.join().unwrap();
}

#[test]
fn test_connection_to_self_is_rejected() {
    init_logger();
    let (network, nodes) = start_network(1, &test_config()).unwrap();
    let result = nodes[0].add_peer(network.node(0).unwrap().p2p_addr());
    assert!(matches!(result, Err(HarnessError::Rpc(_))));
}

#[test]
fn test_topology_errors_for_unknown_nodes() {
    init_logger();
    let (mut network, _nodes) = start_network(2, &test_config()).unwrap();

    assert!(matches!(network.connect(0, 2), Err(HarnessError::Topology(_))));
    assert!(matches!(network.connect(0, 0), Err(HarnessError::Topology(_))));
    assert!(matches!(
        network.add_harness_peer(5, InvPolicy::Ignore),
        Err(HarnessError::Topology(_))
    ));
    assert!(matches!(
        network.disconnect_all_harness_peers(3),
        Err(HarnessError::Topology(_))
    ));
    assert!(!network.linked(0, 1));
}

#[test]
fn test_await_height_reports_lagging_node() {
    init_logger();
    let (network, nodes) = start_network(2, &test_config()).unwrap();
    nodes[0].generate(2).unwrap();

    // Not linked, so node1 never catches up
    let err = network
        .await_height(&[0, 1], 2, Duration::from_millis(100))
        .unwrap_err();
    assert_eq!(
        err,
        HarnessError::Convergence {
            target: "height 2".to_string(),
            lagging: vec!["node1 (height 0)".to_string()],
        }
    );
}

#[test]
fn test_wait_until_returns_within_bound() {
    init_logger();
    let (network, _nodes) = start_network(1, &test_config()).unwrap();
    let timeout = Duration::from_millis(120);

    let started = Instant::now();
    let result = network.lock().wait_until("never true", timeout, |_| false);
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(HarnessError::Timeout { .. })));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(300));
}

#[test]
fn test_disconnecting_harness_peers_keeps_node_links() {
    init_logger();
    let config = test_config();
    let (mut network, nodes) = start_network(2, &config).unwrap();
    network.connect(0, 1).unwrap();

    let first = network.add_harness_peer(0, InvPolicy::Ignore).unwrap();
    network.add_harness_peer(0, InvPolicy::Ignore).unwrap();
    assert_eq!(network.node(0).unwrap().harness_peers().len(), 2);

    network.disconnect_all_harness_peers(0).unwrap();
    network.disconnect_all_harness_peers(0).unwrap();
    assert!(network.node(0).unwrap().harness_peers().is_empty());
    assert!(network.harness_peer(0, first).is_err());

    // node0 is left with just its link to node1
    let deadline = Instant::now() + Duration::from_secs(5);
    while nodes[0].peer_count() != 1 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(nodes[0].peer_count(), 1);

    nodes[0].generate(1).unwrap();
    network.sync_blocks(&[0, 1], Duration::from_secs(10)).unwrap();
    network.assert_chains_match(&[0, 1], 1).unwrap();
}

#[test]
fn test_reject_block_with_insufficient_work() {
    init_logger();
    let config = HarnessConfig {
        difficulty: 4,
        ..test_config()
    };
    let (mut network, nodes) = start_network(1, &config).unwrap();
    let id = network.add_harness_peer(0, InvPolicy::Ignore).unwrap();
    let peer = network.harness_peer(0, id).unwrap();

    // Solved for difficulty 1 only, so the node's target is not met
    let genesis = nodes[0].get_best_block_hash().unwrap();
    let weak = BlockBuilder::new(1).build(genesis, 1, 1_700_000_001).unwrap();
    peer.send(Message::Block(weak)).unwrap();
    peer.sync_with_ping(Duration::from_secs(5)).unwrap();
    assert_eq!(nodes[0].get_block_count().unwrap(), 0);
}
