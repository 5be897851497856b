use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokensim::graph::GatewayDirection;
use tokensim::graph::builder::GraphBuilder;
use tokensim::runtime::engine::Simulator;
use tokensim::runtime::token::{DecisionInput, SuspendKind, TokenState};
use tokensim::runtime::{RunState, SimConfig};

fn config_with(vars: &[(&str, serde_json::Value)]) -> SimConfig {
    SimConfig {
        delay: Duration::from_secs(60),
        seed_context: vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>(),
        ..SimConfig::default()
    }
}

#[tokio::test]
async fn test_exclusive_gateway_single_satisfied_edge() {
    let graph = GraphBuilder::new()
        .start("s")
        .exclusive("x")
        .task("big", "Big order")
        .task("small", "Small order")
        .end("e")
        .flow("f1", "s", "x")
        .cond_flow("f_big", "x", "big", "amount > 100")
        .cond_flow("f_small", "x", "small", "amount <= 100")
        .flow("f2", "big", "e")
        .flow("f3", "small", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("amount", json!(250))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("big"));
    assert!(sim.pending_decision().is_none());
}

#[tokio::test]
async fn test_exclusive_gateway_falls_back_to_default() {
    let graph = GraphBuilder::new()
        .start("s")
        .exclusive("x")
        .task("special", "Special handling")
        .task("normal", "Normal handling")
        .end("e")
        .flow("f1", "s", "x")
        .cond_flow("f_special", "x", "special", "priority > 5")
        .default_flow("f_normal", "x", "normal")
        .flow("f2", "special", "e")
        .flow("f3", "normal", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("priority", json!(1))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("normal"));
    assert_eq!(sim.tokens()[0].via.as_deref(), Some("f_normal"));
}

#[tokio::test]
async fn test_exclusive_gateway_ambiguity_asks_for_decision() {
    let graph = GraphBuilder::new()
        .start("s")
        .exclusive("x")
        .task("a", "Path A")
        .task("b", "Path B")
        .end("e")
        .flow("f1", "s", "x")
        .cond_flow("fa", "x", "a", "amount > 10")
        .cond_flow("fb", "x", "b", "amount > 20")
        .flow("f2", "a", "e")
        .flow("f3", "b", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("amount", json!(50))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);

    assert_eq!(sim.state(), RunState::AwaitingDecision);
    let decision = sim.pending_decision().expect("ambiguous gateway must park");
    assert_eq!(decision.kind, SuspendKind::ExclusiveGateway);
    assert_eq!(decision.candidates.len(), 2);
    assert!(decision.candidates.iter().all(|c| c.satisfied));

    // Unrecognized input leaves the decision pending.
    sim.step(Some(DecisionInput::Edges(vec!["ghost".to_string()])));
    assert!(sim.pending_decision().is_some());

    sim.step(Some(DecisionInput::Edges(vec!["fb".to_string()])));
    assert!(sim.pending_decision().is_none());
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("b"));
}

#[tokio::test]
async fn test_exclusive_gateway_no_viable_edge_parks_with_flags() {
    let graph = GraphBuilder::new()
        .start("s")
        .exclusive("x")
        .task("a", "Path A")
        .task("b", "Path B")
        .end("e")
        .flow("f1", "s", "x")
        .cond_flow("fa", "x", "a", "amount > 100")
        .cond_flow("fb", "x", "b", "amount > 200")
        .flow("f2", "a", "e")
        .flow("f3", "b", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("amount", json!(1))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);

    let decision = sim.pending_decision().expect("dead-end gateway must park");
    assert!(decision.candidates.iter().all(|c| !c.satisfied));

    // An unsatisfied edge is discouraged but still selectable.
    sim.step(Some(DecisionInput::Edges(vec!["fa".to_string()])));
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("a"));
}

#[tokio::test]
async fn test_parallel_fork_and_join() {
    let graph = GraphBuilder::new()
        .start("s")
        .parallel("split")
        .task("t1", "Branch one")
        .task("t2", "Branch two")
        .parallel("join")
        .end("e")
        .flow("f1", "s", "split")
        .flow("fa", "split", "t1")
        .flow("fb", "split", "t2")
        .flow("fc", "t1", "join")
        .flow("fd", "t2", "join")
        .flow("f2", "join", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    // Fork: one token per outgoing edge.
    let mut at: Vec<_> = sim.tokens().iter().filter_map(|t| t.at.clone()).collect();
    at.sort();
    assert_eq!(at, vec!["t1", "t2"]);

    // Both branches arrive; the join releases a single merged token.
    sim.step(None);
    assert_eq!(sim.tokens().len(), 1);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("join"));
    assert_eq!(sim.tokens()[0].state, TokenState::Moving);

    sim.step(None);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("e"));
    sim.step(None);
    assert_eq!(sim.state(), RunState::Idle);
}

#[tokio::test]
async fn test_parallel_join_holds_early_arrivals() {
    let graph = GraphBuilder::new()
        .start("s")
        .parallel("split")
        .task("fast", "Fast branch")
        .task("slow_a", "Slow branch hop one")
        .task("slow_b", "Slow branch hop two")
        .parallel("join")
        .end("e")
        .flow("f1", "s", "split")
        .flow("fa", "split", "fast")
        .flow("fb", "split", "slow_a")
        .flow("fc", "fast", "join")
        .flow("fd", "slow_a", "slow_b")
        .flow("fe", "slow_b", "join")
        .flow("f2", "join", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    sim.step(None);

    // The fast branch waits at the join while the slow one catches up.
    let held: Vec<_> = sim
        .tokens()
        .into_iter()
        .filter(|t| t.state == TokenState::HeldAtJoin)
        .collect();
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].at.as_deref(), Some("join"));
    // Held tokens do not suspend the run as a whole.
    assert_ne!(sim.state(), RunState::AwaitingDecision);

    sim.step(None);
    assert_eq!(sim.tokens().len(), 1);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("join"));
}

#[tokio::test]
async fn test_inclusive_split_joins_only_taken_branches() {
    let graph = GraphBuilder::new()
        .start("s")
        .inclusive("split", Some(GatewayDirection::Diverging))
        .task("t1", "Branch one")
        .task("t2", "Branch two")
        .task("t3", "Branch three")
        .inclusive("merge", Some(GatewayDirection::Converging))
        .end("e")
        .flow("f1", "s", "split")
        .cond_flow("fa", "split", "t1", "a > 0")
        .cond_flow("fb", "split", "t2", "b > 0")
        .cond_flow("fc", "split", "t3", "c > 0")
        .flow("fd", "t1", "merge")
        .flow("fe", "t2", "merge")
        .flow("ff", "t3", "merge")
        .flow("f2", "merge", "e")
        .build();

    // Two of three guards hold: the merge must wait for exactly two arrivals.
    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[
            ("a", json!(1)),
            ("b", json!(1)),
            ("c", json!(0)),
        ]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.tokens().len(), 2);

    sim.step(None);
    assert_eq!(sim.tokens().len(), 1);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("merge"));

    sim.step(None);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("e"));
}

#[tokio::test]
async fn test_inclusive_single_branch_passes_merge_without_waiting() {
    let graph = GraphBuilder::new()
        .start("s")
        .inclusive("split", Some(GatewayDirection::Diverging))
        .task("t1", "Branch one")
        .task("t2", "Branch two")
        .inclusive("merge", Some(GatewayDirection::Converging))
        .end("e")
        .flow("f1", "s", "split")
        .cond_flow("fa", "split", "t1", "a > 0")
        .cond_flow("fb", "split", "t2", "b > 0")
        .flow("fc", "t1", "merge")
        .flow("fd", "t2", "merge")
        .flow("f2", "merge", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("a", json!(1)), ("b", json!(0))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.tokens().len(), 1);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("t1"));

    sim.step(None);
    // A lone arrival is not held hostage by the untaken branch.
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("merge"));
    assert_eq!(sim.tokens()[0].state, TokenState::Moving);
}

#[tokio::test]
async fn test_inclusive_no_satisfied_edge_asks_for_decision() {
    let graph = GraphBuilder::new()
        .start("s")
        .inclusive("split", Some(GatewayDirection::Diverging))
        .task("t1", "Branch one")
        .task("t2", "Branch two")
        .end("e")
        .flow("f1", "s", "split")
        .cond_flow("fa", "split", "t1", "a > 0")
        .cond_flow("fb", "split", "t2", "b > 0")
        .flow("fc", "t1", "e")
        .flow("fd", "t2", "e")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[("a", json!(0)), ("b", json!(0))]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);

    let decision = sim.pending_decision().expect("inclusive dead end must park");
    assert_eq!(decision.kind, SuspendKind::InclusiveGateway);

    // An inclusive decision accepts several edges at once.
    sim.step(Some(DecisionInput::Edges(vec![
        "fa".to_string(),
        "fb".to_string(),
    ])));
    assert_eq!(sim.tokens().len(), 2);
}

#[tokio::test]
async fn test_event_gateway_waits_for_branch_choice() {
    let graph = GraphBuilder::new()
        .start("s")
        .event_gateway("eg")
        .catch(
            "got_reply",
            tokensim::graph::EventKind::Message {
                name: Some("reply".to_string()),
            },
        )
        .catch(
            "timed_out",
            tokensim::graph::EventKind::Timer {
                definition: Some("PT1H".to_string()),
            },
        )
        .end("e1")
        .end("e2")
        .flow("f1", "s", "eg")
        .flow("fa", "eg", "got_reply")
        .flow("fb", "eg", "timed_out")
        .flow("f2", "got_reply", "e1")
        .flow("f3", "timed_out", "e2")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);

    let decision = sim.pending_decision().expect("event gateway must park");
    assert_eq!(decision.kind, SuspendKind::EventGateway);
    assert_eq!(decision.candidates.len(), 2);

    sim.step(Some(DecisionInput::Edges(vec!["fa".to_string()])));
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("got_reply"));

    // The chosen event already fired; the catch node routes straight through
    // instead of waiting again.
    sim.step(None);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("e1"));
}

#[tokio::test]
async fn test_plain_node_takes_first_outgoing_edge() {
    let graph = GraphBuilder::new()
        .start("s")
        .task("t", "Work")
        .end("e1")
        .end("e2")
        .flow("f1", "s", "t")
        .flow("fa", "t", "e1")
        .flow("fb", "t", "e2")
        .build();

    let sim = Simulator::builder(Arc::new(graph))
        .config(config_with(&[]))
        .build();

    sim.start(None).unwrap();
    sim.step(None);
    sim.step(None);
    assert_eq!(sim.tokens().len(), 1);
    assert_eq!(sim.tokens()[0].at.as_deref(), Some("e1"));
}
