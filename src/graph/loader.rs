use anyhow::{Context as AnyhowContext, Result, bail};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::graph::{
    Condition, Dialect, Element, ElementKind, EventKind, GatewayDirection, GraphStore, MessageFlow,
    SequenceFlow, TaskKind,
};

/// On-disk process definition. This is a convenience format for driving the
/// simulator outside a modeler; it is not BPMN XML and does not try to be.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, Value>,
    pub elements: Vec<ElementDef>,
    #[serde(default)]
    pub flows: Vec<FlowDef>,
    #[serde(default)]
    pub message_flows: Vec<MessageFlowDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDef {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    /// Event definition kind for start/catch/throw/boundary elements.
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub timer: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub attached_to: Option<String>,
    #[serde(default = "default_true")]
    pub interrupting: bool,
    #[serde(default)]
    pub direction: Option<GatewayDirection>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDef {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub language: Option<Dialect>,
    #[serde(default, rename = "default")]
    pub is_default: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageFlowDef {
    pub id: String,
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub message: Option<String>,
}

pub fn load_definition_from_yaml(path: impl AsRef<Path>) -> Result<ProcessDefinition> {
    let path = path.as_ref();
    let yaml = fs::read_to_string(path)
        .with_context(|| format!("Failed to read process definition from {}", path.display()))?;

    let def: ProcessDefinition = serde_yaml::from_str(&yaml)
        .with_context(|| format!("Failed to deserialize YAML content from {}", path.display()))?;

    Ok(def)
}

impl ProcessDefinition {
    fn event_kind(def: &ElementDef) -> Result<EventKind> {
        let tag = def
            .event
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Element '{}' is missing an event kind", def.id))?;
        Ok(match tag {
            "timer" => EventKind::Timer {
                definition: def.timer.clone(),
            },
            "message" => EventKind::Message {
                name: def.message.clone(),
            },
            "signal" => EventKind::Signal {
                name: def.message.clone(),
            },
            "error" => EventKind::Error,
            "escalation" => EventKind::Escalation,
            "cancel" => EventKind::Cancel,
            "compensate" => EventKind::Compensate,
            other => bail!("Element '{}' has unknown event kind '{}'", def.id, other),
        })
    }

    pub fn into_graph(self) -> Result<GraphStore> {
        let mut store = GraphStore::new();

        for def in &self.elements {
            let kind = match def.kind.as_str() {
                "start" => ElementKind::StartEvent {
                    event: match def.event {
                        Some(_) => Some(Self::event_kind(def)?),
                        None => None,
                    },
                },
                "end" => ElementKind::EndEvent,
                "task" => ElementKind::Task { task: TaskKind::Plain },
                "manual" => ElementKind::Task { task: TaskKind::Manual },
                "user" => ElementKind::Task { task: TaskKind::User },
                "service" => ElementKind::Task { task: TaskKind::Service },
                "script" => ElementKind::Task { task: TaskKind::Script },
                "receive" => ElementKind::Task { task: TaskKind::Receive },
                "send" => ElementKind::Task { task: TaskKind::Send },
                "subprocess" => ElementKind::SubProcess,
                "exclusive" => ElementKind::ExclusiveGateway,
                "parallel" => ElementKind::ParallelGateway,
                "inclusive" => ElementKind::InclusiveGateway {
                    direction: def.direction,
                },
                "event-based" => ElementKind::EventBasedGateway,
                "catch" => ElementKind::IntermediateCatch {
                    event: Self::event_kind(def)?,
                },
                "throw" => ElementKind::IntermediateThrow {
                    event: match def.event {
                        Some(_) => Some(Self::event_kind(def)?),
                        None => None,
                    },
                },
                "boundary" => ElementKind::BoundaryEvent {
                    event: Self::event_kind(def)?,
                    attached_to: def.attached_to.clone().ok_or_else(|| {
                        anyhow::anyhow!("Boundary event '{}' is missing attached_to", def.id)
                    })?,
                    cancel_activity: def.interrupting,
                },
                "participant" => ElementKind::Participant,
                other => bail!("Element '{}' has unknown type '{}'", def.id, other),
            };

            store.insert_element(Element {
                id: def.id.clone(),
                name: def.name.clone(),
                kind,
                incoming: Vec::new(),
                outgoing: Vec::new(),
                parent: def.parent.clone(),
            });
        }

        for flow in &self.flows {
            store.insert_flow(SequenceFlow {
                id: flow.id.clone(),
                source: flow.source.clone(),
                target: flow.target.clone(),
                condition: flow.condition.as_ref().map(|body| Condition {
                    body: body.clone(),
                    dialect: flow.language.unwrap_or_default(),
                }),
                is_default: flow.is_default,
            });
        }

        for flow in &self.message_flows {
            store.insert_message_flow(MessageFlow {
                id: flow.id.clone(),
                source: flow.source.clone(),
                target: flow.target.clone(),
                message: flow.message.clone(),
            });
        }

        Ok(store)
    }
}
