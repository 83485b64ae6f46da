#[path = "common/mod.rs"]
mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{introduce, spawn_node, spawn_node_with_config, test_config, Network};
use kadstream::RandomWalkConfig;

#[tokio::test]
async fn one_walk_iteration_grows_the_routing_table() {
    let network = Arc::new(Network::default());
    let origin = spawn_node(&network, 0x1000).await;
    let bootstrap = spawn_node(&network, 0x1001).await;

    // The bootstrap peer knows ten others.
    let mut others = Vec::new();
    for index in 0..10u32 {
        let peer = spawn_node(&network, 0x2000 + index).await;
        introduce(&bootstrap, &peer).await;
        others.push(peer);
    }

    introduce(&origin, &bootstrap).await;
    let before = origin.dht.stats().await.routing_table_size;
    assert_eq!(before, 1);

    origin.dht.bootstrap().await.expect("walk runs");

    let after = origin.dht.stats().await.routing_table_size;
    assert!(
        after > before,
        "routing table did not grow ({before} -> {after})"
    );
    assert!((2..=11).contains(&after), "unexpected table size {after}");
}

#[tokio::test]
async fn scheduled_walk_discovers_peers_without_user_calls() {
    let mut config = test_config();
    config.random_walk = RandomWalkConfig {
        enabled: true,
        delay: Duration::from_millis(50),
        interval: Duration::from_millis(200),
        queries_per_period: 1,
    };

    let network = Arc::new(Network::default());
    let origin = spawn_node_with_config(&network, 0x3000, config).await;
    let bootstrap = spawn_node(&network, 0x3001).await;
    let hidden = spawn_node(&network, 0x3002).await;

    introduce(&bootstrap, &hidden).await;
    introduce(&origin, &bootstrap).await;

    // Give the background walk a few periods to run.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let size = origin.dht.stats().await.routing_table_size;
        if size >= 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "walk never discovered the hidden peer"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    origin.dht.stop().await;
}
