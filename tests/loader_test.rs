use std::fs;
use tokensim::graph::loader::load_definition_from_yaml;
use tokensim::graph::{Dialect, ElementKind, EventKind, ProcessGraph, TaskKind};

#[test]
fn test_load_simple_yaml_process() {
    let yaml_content = r#"
id: "order-handling"
name: "Order handling"
elements:
  - id: "start"
    type: "start"
  - id: "check"
    type: "exclusive"
  - id: "approve"
    type: "manual"
    name: "Approve order"
  - id: "auto"
    type: "task"
    name: "Auto-approve"
  - id: "end"
    type: "end"
flows:
  - id: "f1"
    source: "start"
    target: "check"
  - id: "f2"
    source: "check"
    target: "approve"
    condition: "amount > 100"
  - id: "f3"
    source: "check"
    target: "auto"
    default: true
  - id: "f4"
    source: "approve"
    target: "end"
  - id: "f5"
    source: "auto"
    target: "end"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("process.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let definition =
        load_definition_from_yaml(&file_path).expect("Failed to load process definition");
    assert_eq!(definition.id, "order-handling");
    assert_eq!(definition.name.as_deref(), Some("Order handling"));

    let graph = definition.into_graph().expect("Failed to build graph");
    assert_eq!(graph.element_count(), 5);
    assert_eq!(graph.flow_count(), 5);

    let check = graph.element("check").expect("gateway must exist");
    assert_eq!(check.kind, ElementKind::ExclusiveGateway);
    assert_eq!(check.incoming, vec!["f1"]);
    assert_eq!(check.outgoing, vec!["f2", "f3"]);

    let approve = graph.element("approve").expect("task must exist");
    assert_eq!(
        approve.kind,
        ElementKind::Task {
            task: TaskKind::Manual
        }
    );

    let f2 = graph.flow("f2").expect("flow must exist");
    let condition = f2.condition.as_ref().expect("condition must survive");
    assert_eq!(condition.body, "amount > 100");
    assert_eq!(condition.dialect, Dialect::Expression);
    assert!(graph.flow("f3").unwrap().is_default);
}

#[test]
fn test_load_events_and_boundaries() {
    let yaml_content = r#"
id: "timer-demo"
elements:
  - id: "start"
    type: "start"
  - id: "work"
    type: "manual"
    name: "Do work"
  - id: "deadline"
    type: "boundary"
    event: "timer"
    timer: "PT5M"
    attached_to: "work"
    interrupting: false
  - id: "wait_reply"
    type: "catch"
    event: "message"
    message: "reply"
  - id: "end"
    type: "end"
flows:
  - id: "f1"
    source: "start"
    target: "work"
  - id: "f2"
    source: "work"
    target: "wait_reply"
  - id: "f3"
    source: "wait_reply"
    target: "end"
  - id: "f4"
    source: "deadline"
    target: "end"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("process.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let graph = load_definition_from_yaml(&file_path)
        .expect("Failed to load process definition")
        .into_graph()
        .expect("Failed to build graph");

    let deadline = graph.element("deadline").expect("boundary must exist");
    assert_eq!(
        deadline.kind,
        ElementKind::BoundaryEvent {
            event: EventKind::Timer {
                definition: Some("PT5M".to_string())
            },
            attached_to: "work".to_string(),
            cancel_activity: false,
        }
    );

    let wait = graph.element("wait_reply").expect("catch must exist");
    assert_eq!(
        wait.kind,
        ElementKind::IntermediateCatch {
            event: EventKind::Message {
                name: Some("reply".to_string())
            }
        }
    );

    // Boundary lookup goes through the host.
    let boundaries = graph.boundary_events_of("work");
    assert_eq!(boundaries.len(), 1);
    assert_eq!(boundaries[0].id, "deadline");
}

#[test]
fn test_friendly_dialect_and_message_flows() {
    let yaml_content = r#"
id: "friendly-demo"
elements:
  - id: "start"
    type: "start"
  - id: "gate"
    type: "exclusive"
  - id: "ship"
    type: "task"
    name: "Ship"
  - id: "hold"
    type: "task"
    name: "Hold"
  - id: "end"
    type: "end"
  - id: "warehouse"
    type: "participant"
    name: "Warehouse"
flows:
  - id: "f1"
    source: "start"
    target: "gate"
  - id: "f2"
    source: "gate"
    target: "ship"
    condition: "status = 'paid' and in_stock"
    language: "friendly"
  - id: "f3"
    source: "gate"
    target: "hold"
    default: true
  - id: "f4"
    source: "ship"
    target: "end"
  - id: "f5"
    source: "hold"
    target: "end"
message_flows:
  - id: "m1"
    source: "ship"
    target: "warehouse"
    message: "pick-order"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("process.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let graph = load_definition_from_yaml(&file_path)
        .expect("Failed to load process definition")
        .into_graph()
        .expect("Failed to build graph");

    let f2 = graph.flow("f2").unwrap();
    assert_eq!(f2.condition.as_ref().unwrap().dialect, Dialect::Friendly);

    let outgoing = graph.message_flows_from("ship");
    assert_eq!(outgoing.len(), 1);
    assert_eq!(outgoing[0].message.as_deref(), Some("pick-order"));
}

#[test]
fn test_unknown_element_type_is_rejected() {
    let yaml_content = r#"
id: "broken"
elements:
  - id: "start"
    type: "start"
  - id: "weird"
    type: "quantum-gateway"
"#;

    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let file_path = temp_dir.path().join("process.yaml");
    fs::write(&file_path, yaml_content).expect("Failed to write temp file");

    let err = load_definition_from_yaml(&file_path)
        .expect("definition itself parses")
        .into_graph()
        .unwrap_err();
    assert!(err.to_string().contains("quantum-gateway"));
}

#[test]
fn test_missing_file_reports_path() {
    let err = load_definition_from_yaml("/nonexistent/process.yaml").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/process.yaml"));
}
