use crate::graph::{
    Condition, Dialect, Element, ElementId, ElementKind, EventKind, GatewayDirection, GraphStore,
    MessageFlow, SequenceFlow, TaskKind,
};

/// Fluent construction of in-memory process graphs, used by tests and demos.
/// Elements added after `inside()` are nested in that sub-process until
/// `outside()` pops back to the top level.
pub struct GraphBuilder {
    store: GraphStore,
    scope: Option<ElementId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            store: GraphStore::new(),
            scope: None,
        }
    }

    fn push(mut self, id: &str, name: Option<&str>, kind: ElementKind) -> Self {
        self.store.insert_element(Element {
            id: id.to_string(),
            name: name.map(|s| s.to_string()),
            kind,
            incoming: Vec::new(),
            outgoing: Vec::new(),
            parent: self.scope.clone(),
        });
        self
    }

    pub fn start(self, id: &str) -> Self {
        self.push(id, None, ElementKind::StartEvent { event: None })
    }

    pub fn start_with(self, id: &str, event: EventKind) -> Self {
        self.push(id, None, ElementKind::StartEvent { event: Some(event) })
    }

    pub fn end(self, id: &str) -> Self {
        self.push(id, None, ElementKind::EndEvent)
    }

    pub fn task(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), ElementKind::Task { task: TaskKind::Plain })
    }

    pub fn manual_task(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), ElementKind::Task { task: TaskKind::Manual })
    }

    pub fn receive_task(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), ElementKind::Task { task: TaskKind::Receive })
    }

    pub fn exclusive(self, id: &str) -> Self {
        self.push(id, None, ElementKind::ExclusiveGateway)
    }

    pub fn parallel(self, id: &str) -> Self {
        self.push(id, None, ElementKind::ParallelGateway)
    }

    pub fn inclusive(self, id: &str, direction: Option<GatewayDirection>) -> Self {
        self.push(id, None, ElementKind::InclusiveGateway { direction })
    }

    pub fn event_gateway(self, id: &str) -> Self {
        self.push(id, None, ElementKind::EventBasedGateway)
    }

    pub fn catch(self, id: &str, event: EventKind) -> Self {
        self.push(id, None, ElementKind::IntermediateCatch { event })
    }

    pub fn throw(self, id: &str, event: Option<EventKind>) -> Self {
        self.push(id, None, ElementKind::IntermediateThrow { event })
    }

    pub fn participant(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), ElementKind::Participant)
    }

    pub fn sub_process(self, id: &str, name: &str) -> Self {
        self.push(id, Some(name), ElementKind::SubProcess)
    }

    pub fn boundary(self, id: &str, host: &str, event: EventKind, interrupting: bool) -> Self {
        self.push(
            id,
            None,
            ElementKind::BoundaryEvent {
                event,
                attached_to: host.to_string(),
                cancel_activity: interrupting,
            },
        )
    }

    /// Nest subsequently added elements inside the given sub-process.
    pub fn inside(mut self, sub_process: &str) -> Self {
        self.scope = Some(sub_process.to_string());
        self
    }

    pub fn outside(mut self) -> Self {
        self.scope = None;
        self
    }

    pub fn flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.store.insert_flow(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: false,
        });
        self
    }

    pub fn cond_flow(mut self, id: &str, source: &str, target: &str, condition: &str) -> Self {
        self.store.insert_flow(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(Condition {
                body: condition.to_string(),
                dialect: Dialect::Expression,
            }),
            is_default: false,
        });
        self
    }

    pub fn friendly_flow(mut self, id: &str, source: &str, target: &str, condition: &str) -> Self {
        self.store.insert_flow(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: Some(Condition {
                body: condition.to_string(),
                dialect: Dialect::Friendly,
            }),
            is_default: false,
        });
        self
    }

    pub fn default_flow(mut self, id: &str, source: &str, target: &str) -> Self {
        self.store.insert_flow(SequenceFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            condition: None,
            is_default: true,
        });
        self
    }

    pub fn message_flow(mut self, id: &str, source: &str, target: &str, message: &str) -> Self {
        self.store.insert_message_flow(MessageFlow {
            id: id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            message: Some(message.to_string()),
        });
        self
    }

    pub fn build(self) -> GraphStore {
        self.store
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}
