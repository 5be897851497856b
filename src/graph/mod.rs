pub mod builder;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type ElementId = String;
pub type FlowId = String;

/// Direction hint carried by inclusive gateways. Absent on most diagrams;
/// the engine falls back to the incoming-edge count to tell splits from merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayDirection {
    Diverging,
    Converging,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Plain,
    Manual,
    User,
    Service,
    Script,
    Receive,
    Send,
}

/// Event definition attached to start/catch/throw/boundary elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// `definition` is an ISO-8601 duration/cycle text (e.g. "PT5S", "R3/PT10S").
    Timer { definition: Option<String> },
    Message { name: Option<String> },
    Signal { name: Option<String> },
    Error,
    Escalation,
    Cancel,
    Compensate,
}

impl EventKind {
    /// Registry key for handler lookup.
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::Timer { .. } => "timer",
            EventKind::Message { .. } => "message",
            EventKind::Signal { .. } => "signal",
            EventKind::Error => "error",
            EventKind::Escalation => "escalation",
            EventKind::Cancel => "cancel",
            EventKind::Compensate => "compensate",
        }
    }
}

/// Closed set of node kinds the scheduler can route. Dispatch is a match over
/// this enum plus a registry lookup, never subclassing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ElementKind {
    StartEvent { event: Option<EventKind> },
    EndEvent,
    Task { task: TaskKind },
    SubProcess,
    ExclusiveGateway,
    ParallelGateway,
    InclusiveGateway { direction: Option<GatewayDirection> },
    EventBasedGateway,
    IntermediateCatch { event: EventKind },
    IntermediateThrow { event: Option<EventKind> },
    BoundaryEvent {
        event: EventKind,
        attached_to: ElementId,
        cancel_activity: bool,
    },
    /// Pool/lane endpoint of a message flow. Never executable.
    Participant,
}

impl ElementKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            ElementKind::StartEvent { .. } => "start",
            ElementKind::EndEvent => "end",
            ElementKind::Task { task } => match task {
                TaskKind::Plain => "task",
                TaskKind::Manual => "manual",
                TaskKind::User => "user",
                TaskKind::Service => "service",
                TaskKind::Script => "script",
                TaskKind::Receive => "receive",
                TaskKind::Send => "send",
            },
            ElementKind::SubProcess => "subprocess",
            ElementKind::ExclusiveGateway => "exclusive",
            ElementKind::ParallelGateway => "parallel",
            ElementKind::InclusiveGateway { .. } => "inclusive",
            ElementKind::EventBasedGateway => "event-based",
            ElementKind::IntermediateCatch { .. } => "catch",
            ElementKind::IntermediateThrow { .. } => "throw",
            ElementKind::BoundaryEvent { .. } => "boundary",
            ElementKind::Participant => "participant",
        }
    }

    pub fn event(&self) -> Option<&EventKind> {
        match self {
            ElementKind::StartEvent { event } | ElementKind::IntermediateThrow { event } => {
                event.as_ref()
            }
            ElementKind::IntermediateCatch { event } | ElementKind::BoundaryEvent { event, .. } => {
                Some(event)
            }
            _ => None,
        }
    }

    pub fn is_gateway(&self) -> bool {
        matches!(
            self,
            ElementKind::ExclusiveGateway
                | ElementKind::ParallelGateway
                | ElementKind::InclusiveGateway { .. }
                | ElementKind::EventBasedGateway
        )
    }
}

/// Condition language of a guard expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Expression,
    /// Natural-language-like dialect, rewritten into the expression grammar
    /// before evaluation (`and`/`or`/`not`/bare `=`).
    Friendly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub body: String,
    #[serde(default)]
    pub dialect: Dialect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceFlow {
    pub id: FlowId,
    pub source: ElementId,
    pub target: ElementId,
    pub condition: Option<Condition>,
    /// Marked default flow of the source gateway; taken only when no
    /// non-default flow is satisfied.
    pub is_default: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageFlow {
    pub id: FlowId,
    pub source: ElementId,
    pub target: ElementId,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Element {
    pub id: ElementId,
    pub name: Option<String>,
    pub kind: ElementKind,
    pub incoming: Vec<FlowId>,
    pub outgoing: Vec<FlowId>,
    /// Enclosing sub-process, if nested.
    pub parent: Option<ElementId>,
}

impl Element {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Read-only process topology supplied by the host. The engine never mutates
/// the graph; everything it learns about structure goes through this trait.
pub trait ProcessGraph: Send + Sync {
    fn element(&self, id: &str) -> Option<&Element>;

    fn flow(&self, id: &str) -> Option<&SequenceFlow>;

    /// All elements matching the predicate, in definition order.
    fn filter(&self, pred: &dyn Fn(&Element) -> bool) -> Vec<&Element>;

    fn message_flows_from(&self, source: &str) -> Vec<&MessageFlow>;

    fn boundary_events_of(&self, host: &str) -> Vec<&Element> {
        self.filter(&|e| {
            matches!(&e.kind, ElementKind::BoundaryEvent { attached_to, .. } if attached_to == host)
        })
    }

    /// Direct children of a sub-process.
    fn children_of(&self, parent: &str) -> Vec<&Element> {
        self.filter(&|e| e.parent.as_deref() == Some(parent))
    }

    /// Walks the `parent` chain to decide whether `id` sits inside `scope`.
    fn is_inside(&self, id: &str, scope: &str) -> bool {
        let mut cur = self.element(id).and_then(|e| e.parent.as_deref());
        while let Some(p) = cur {
            if p == scope {
                return true;
            }
            cur = self.element(p).and_then(|e| e.parent.as_deref());
        }
        false
    }
}

/// In-memory graph, the backing store for the builder and the YAML loader.
#[derive(Debug, Default, Clone)]
pub struct GraphStore {
    elements: HashMap<ElementId, Element>,
    flows: HashMap<FlowId, SequenceFlow>,
    message_flows: Vec<MessageFlow>,
    order: Vec<ElementId>,
}

impl GraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_element(&mut self, element: Element) {
        if !self.elements.contains_key(&element.id) {
            self.order.push(element.id.clone());
        }
        self.elements.insert(element.id.clone(), element);
    }

    pub fn insert_flow(&mut self, flow: SequenceFlow) {
        if let Some(src) = self.elements.get_mut(&flow.source) {
            src.outgoing.push(flow.id.clone());
        }
        if let Some(dst) = self.elements.get_mut(&flow.target) {
            dst.incoming.push(flow.id.clone());
        }
        self.flows.insert(flow.id.clone(), flow);
    }

    pub fn insert_message_flow(&mut self, flow: MessageFlow) {
        self.message_flows.push(flow);
    }

    pub fn element_count(&self) -> usize {
        self.elements.len()
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }
}

impl ProcessGraph for GraphStore {
    fn element(&self, id: &str) -> Option<&Element> {
        self.elements.get(id)
    }

    fn flow(&self, id: &str) -> Option<&SequenceFlow> {
        self.flows.get(id)
    }

    fn filter(&self, pred: &dyn Fn(&Element) -> bool) -> Vec<&Element> {
        self.order
            .iter()
            .filter_map(|id| self.elements.get(id))
            .filter(|e| pred(e))
            .collect()
    }

    fn message_flows_from(&self, source: &str) -> Vec<&MessageFlow> {
        self.message_flows
            .iter()
            .filter(|f| f.source == source)
            .collect()
    }
}
