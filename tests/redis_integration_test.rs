use std::sync::Arc;
use std::time::Duration;
use tokensim::graph::builder::GraphBuilder;
use tokensim::runtime::engine::Simulator;
use tokensim::runtime::log::LogStore;
use tokensim::runtime::redis_log::RedisLogStore;
use tokensim::runtime::{RunState, SimConfig};

fn redis_url() -> String {
    std::env::var("TOKENSIM_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string())
}

#[tokio::test]
#[ignore] // Ignored by default, run explicitly if redis is available
async fn test_redis_log_round_trip() {
    let store = Arc::new(RedisLogStore::connect(&redis_url()).expect("Invalid Redis URL"));
    store.clear("redis-test").await.expect("Failed to clear key");

    let graph = GraphBuilder::new()
        .start("s")
        .task("t", "Work")
        .end("e")
        .flow("f1", "s", "t")
        .flow("f2", "t", "e")
        .build();

    let config = SimConfig {
        delay: Duration::from_secs(60),
        log_key: "redis-test".to_string(),
        ..SimConfig::default()
    };
    let sim = Simulator::builder(Arc::new(graph))
        .log_store(store.clone())
        .config(config.clone())
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.stop();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let entries = store.load("redis-test").await;
    let visited: Vec<String> = entries.iter().map(|e| e.element_id.clone()).collect();
    assert_eq!(visited, vec!["s", "t"]);

    // A fresh simulator resumes from the stored log.
    let graph = GraphBuilder::new()
        .start("s")
        .task("t", "Work")
        .end("e")
        .flow("f1", "s", "t")
        .flow("f2", "t", "e")
        .build();
    let second = Simulator::builder(Arc::new(graph))
        .log_store(store.clone())
        .config(config)
        .build();
    assert!(second.restore().await);
    assert_eq!(second.state(), RunState::Paused);
    assert_eq!(second.tokens()[0].at.as_deref(), Some("t"));

    store.clear("redis-test").await.expect("Failed to clear key");
}
