use std::sync::Arc;
use std::time::Duration;
use tokensim::graph::builder::GraphBuilder;
use tokensim::runtime::engine::Simulator;
use tokensim::runtime::log::{InMemoryLogStore, LogStore};
use tokensim::runtime::{RunState, SimConfig};

fn test_config(log_key: &str) -> SimConfig {
    SimConfig {
        delay: Duration::from_secs(60),
        log_key: log_key.to_string(),
        ..SimConfig::default()
    }
}

fn linear_graph() -> tokensim::graph::GraphStore {
    GraphBuilder::new()
        .start("s")
        .task("t", "Work")
        .end("e")
        .flow("f1", "s", "t")
        .flow("f2", "t", "e")
        .build()
}

#[tokio::test]
async fn test_run_log_is_persisted() {
    let store = Arc::new(InMemoryLogStore::new());
    let sim = Simulator::builder(Arc::new(linear_graph()))
        .log_store(store.clone())
        .config(test_config("run-a"))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.state(), RunState::Idle);

    // Persistence happens off the hot path; give the writer a moment.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let entries = store.load("run-a").await;
    let visited: Vec<String> = entries.iter().map(|e| e.element_id.clone()).collect();
    assert_eq!(visited, vec!["s", "t", "e"]);
    assert!(entries.iter().all(|e| e.timestamp > 0));
}

#[tokio::test]
async fn test_restore_resumes_at_last_logged_position() {
    let store = Arc::new(InMemoryLogStore::new());
    let graph = Arc::new(linear_graph());

    let first = Simulator::builder(graph.clone())
        .log_store(store.clone())
        .config(test_config("run-b"))
        .build();
    first.start(None).unwrap();
    first.step(None);
    first.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A fresh simulator picks the run back up from the stored log.
    let second = Simulator::builder(graph)
        .log_store(store)
        .config(test_config("run-b"))
        .build();
    assert!(second.restore().await);
    assert_eq!(second.state(), RunState::Paused);
    assert_eq!(second.tokens().len(), 1);
    assert_eq!(second.tokens()[0].at.as_deref(), Some("t"));
    assert_eq!(second.run_log().len(), 2);

    second.step(None);
    assert_eq!(second.tokens()[0].at.as_deref(), Some("e"));
}

#[tokio::test]
async fn test_restore_with_empty_store_is_a_noop() {
    let sim = Simulator::builder(Arc::new(linear_graph()))
        .config(test_config("run-c"))
        .build();
    assert!(!sim.restore().await);
    assert_eq!(sim.state(), RunState::Idle);
}

#[tokio::test]
async fn test_corrupt_stored_log_reads_as_no_prior_run() {
    let store = Arc::new(InMemoryLogStore::new());
    store.put_raw("run-d", "][ this is not json");

    let sim = Simulator::builder(Arc::new(linear_graph()))
        .log_store(store)
        .config(test_config("run-d"))
        .build();
    assert!(!sim.restore().await);
    assert_eq!(sim.state(), RunState::Idle);
    assert!(sim.tokens().is_empty());
}

#[tokio::test]
async fn test_restore_refuses_mid_run() {
    let store = Arc::new(InMemoryLogStore::new());
    let graph = Arc::new(linear_graph());

    let first = Simulator::builder(graph.clone())
        .log_store(store.clone())
        .config(test_config("run-e"))
        .build();
    first.start(None).unwrap();
    first.step(None);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The same simulator still holds live tokens; restoring over them would
    // lose the run.
    assert!(!first.restore().await);
    assert_eq!(first.tokens().len(), 1);
}

#[tokio::test]
async fn test_reset_clears_persisted_log() {
    let store = Arc::new(InMemoryLogStore::new());
    let sim = Simulator::builder(Arc::new(linear_graph()))
        .log_store(store.clone())
        .config(test_config("run-f"))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!store.load("run-f").await.is_empty());

    sim.reset();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.load("run-f").await.is_empty());
}
