use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::expr::{self, ExprValue};
use crate::graph::{
    Element, ElementId, ElementKind, EventKind, FlowId, GatewayDirection, MessageFlow,
    ProcessGraph, SequenceFlow, TaskKind,
};
use crate::handlers::{Cleanup, Deferred, HandlerCx, HandlerOutcome, HandlerRegistry, NodeHandler};
use crate::runtime::log::{InMemoryLogStore, LogStore, RunLogEntry, now_millis};
use crate::runtime::token::{
    DecisionInput, EdgeCandidate, PendingDecision, SuspendKind, Suspension, Token, TokenId,
    TokenSnapshot,
};
use crate::runtime::{MarkerSink, MarkerTag, NullMarkerSink, RunState, SimConfig};

#[derive(Debug, Error)]
pub enum SimError {
    #[error("start node '{0}' not found in the process graph")]
    StartNodeNotFound(String),
    #[error("element '{0}' is not a start event")]
    NotAStartEvent(String),
    #[error("process has no blank top-level start event")]
    NoStartEvent,
    #[error("process has several blank start events; a start node id is required")]
    AmbiguousStartEvent,
}

struct JoinWait {
    expected: usize,
    arrived: Vec<TokenId>,
}

struct Core {
    state: RunState,
    /// The run was auto-stepping immediately before everything parked;
    /// resolving the decision re-arms the clock.
    was_running: bool,
    tokens: Vec<Token>,
    next_token_id: TokenId,
    context: HashMap<String, Value>,
    log: Vec<RunLogEntry>,
    dirty_log: bool,
    /// Single exposed "awaiting token". Other parked tokens queue for the slot.
    pending: Option<TokenId>,
    joins: HashMap<ElementId, JoinWait>,
    cleanups: Vec<(TokenId, Cleanup)>,
    /// Marker ids added per token, removed when the token moves or dies.
    marks: HashMap<TokenId, Vec<String>>,
    /// Bumping the epoch invalidates any armed auto-step clock.
    clock_epoch: u64,
}

impl Core {
    fn token(&self, id: TokenId) -> Option<&Token> {
        self.tokens.iter().find(|t| t.id == id)
    }

    fn token_mut(&mut self, id: TokenId) -> Option<&mut Token> {
        self.tokens.iter_mut().find(|t| t.id == id)
    }

    fn mint_id(&mut self) -> TokenId {
        let id = self.next_token_id;
        self.next_token_id += 1;
        id
    }
}

struct Shared {
    graph: Arc<dyn ProcessGraph>,
    markers: Arc<dyn MarkerSink>,
    registry: HandlerRegistry,
    log_store: Arc<dyn LogStore>,
    config: SimConfig,
    run_id: Uuid,
    core: Mutex<Core>,
    active_tx: watch::Sender<Vec<TokenSnapshot>>,
    log_tx: watch::Sender<Vec<RunLogEntry>>,
    decision_tx: watch::Sender<Option<PendingDecision>>,
}

/// The token scheduler. Cloneable handle; all run state sits behind one lock
/// and every step is synchronous and atomic.
#[derive(Clone)]
pub struct Simulator {
    shared: Arc<Shared>,
}

pub struct SimulatorBuilder {
    graph: Arc<dyn ProcessGraph>,
    markers: Arc<dyn MarkerSink>,
    log_store: Arc<dyn LogStore>,
    config: SimConfig,
    type_handlers: Vec<(String, Arc<dyn NodeHandler>)>,
    event_handlers: Vec<(String, Arc<dyn NodeHandler>)>,
}

impl SimulatorBuilder {
    pub fn new(graph: Arc<dyn ProcessGraph>) -> Self {
        Self {
            graph,
            markers: Arc::new(NullMarkerSink),
            log_store: Arc::new(InMemoryLogStore::new()),
            config: SimConfig::default(),
            type_handlers: Vec::new(),
            event_handlers: Vec::new(),
        }
    }

    pub fn markers(mut self, markers: Arc<dyn MarkerSink>) -> Self {
        self.markers = markers;
        self
    }

    pub fn log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.log_store = store;
        self
    }

    pub fn config(mut self, config: SimConfig) -> Self {
        self.config = config;
        self
    }

    /// Override or add the handler for a node type tag.
    pub fn handler_for_type(mut self, tag: &str, handler: Arc<dyn NodeHandler>) -> Self {
        self.type_handlers.push((tag.to_string(), handler));
        self
    }

    /// Override or add the handler for an event-definition kind.
    pub fn handler_for_event(mut self, tag: &str, handler: Arc<dyn NodeHandler>) -> Self {
        self.event_handlers.push((tag.to_string(), handler));
        self
    }

    pub fn build(self) -> Simulator {
        let mut registry =
            HandlerRegistry::with_defaults(self.config.timer_fallback, self.config.message_delay);
        for (tag, handler) in self.type_handlers {
            registry.register_type(&tag, handler);
        }
        for (tag, handler) in self.event_handlers {
            registry.register_event(&tag, handler);
        }

        let (active_tx, _) = watch::channel(Vec::new());
        let (log_tx, _) = watch::channel(Vec::new());
        let (decision_tx, _) = watch::channel(None);

        let seed = self.config.seed_context.clone();
        Simulator {
            shared: Arc::new(Shared {
                graph: self.graph,
                markers: self.markers,
                registry,
                log_store: self.log_store,
                config: self.config,
                run_id: Uuid::new_v4(),
                core: Mutex::new(Core {
                    state: RunState::Idle,
                    was_running: false,
                    tokens: Vec::new(),
                    next_token_id: 1,
                    context: seed,
                    log: Vec::new(),
                    dirty_log: false,
                    pending: None,
                    joins: HashMap::new(),
                    cleanups: Vec::new(),
                    marks: HashMap::new(),
                    clock_epoch: 0,
                }),
                active_tx,
                log_tx,
                decision_tx,
            }),
        }
    }
}

impl Simulator {
    pub fn builder(graph: Arc<dyn ProcessGraph>) -> SimulatorBuilder {
        SimulatorBuilder::new(graph)
    }

    fn core(&self) -> MutexGuard<'_, Core> {
        // Recover from a poisoned lock; run state stays coherent because
        // steps never hold it across suspension points.
        self.shared
            .core
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- observers ---

    pub fn state(&self) -> RunState {
        self.core().state
    }

    pub fn tokens(&self) -> Vec<TokenSnapshot> {
        self.core()
            .tokens
            .iter()
            .filter(|t| t.is_live())
            .map(TokenSnapshot::of)
            .collect()
    }

    pub fn run_log(&self) -> Vec<RunLogEntry> {
        self.core().log.clone()
    }

    pub fn pending_decision(&self) -> Option<PendingDecision> {
        let core = self.core();
        Self::decision_view(&core)
    }

    pub fn get_context(&self) -> HashMap<String, Value> {
        self.core().context.clone()
    }

    /// Merge keys into the shared execution context; keys not named in the
    /// patch survive. Visible to all live tokens immediately.
    pub fn set_context(&self, patch: HashMap<String, Value>) {
        let mut core = self.core();
        for (k, v) in patch {
            core.context.insert(k, v);
        }
    }

    pub fn subscribe_tokens(&self) -> watch::Receiver<Vec<TokenSnapshot>> {
        self.shared.active_tx.subscribe()
    }

    pub fn subscribe_log(&self) -> watch::Receiver<Vec<RunLogEntry>> {
        self.shared.log_tx.subscribe()
    }

    pub fn subscribe_decision(&self) -> watch::Receiver<Option<PendingDecision>> {
        self.shared.decision_tx.subscribe()
    }

    // --- lifecycle ---

    /// Clears prior run state and log, seeds the context, creates the initial
    /// token at the chosen or default start node and enters `Running`.
    pub fn start(&self, start_node: Option<&str>) -> Result<(), SimError> {
        {
            let mut core = self.core();
            let start_id = self.resolve_start_node(start_node).inspect_err(|e| {
                warn!(run_id = %self.shared.run_id, error = %e, "start aborted");
            })?;

            self.clear_run_state(&mut core);
            core.log.clear();
            core.dirty_log = true;
            core.context = self.shared.config.seed_context.clone();

            let id = core.mint_id();
            core.tokens.push(Token::new(id, start_id.clone()));
            self.place_token(&mut core, id, &start_id, None);

            info!(run_id = %self.shared.run_id, start = %start_id, "simulation started");
            core.state = RunState::Running;
            self.post_step(&mut core);
            self.publish(&core);
        }
        self.after_step(Vec::new());
        Ok(())
    }

    fn resolve_start_node(&self, start_node: Option<&str>) -> Result<ElementId, SimError> {
        let graph = &self.shared.graph;
        match start_node {
            Some(id) => {
                let element = graph
                    .element(id)
                    .ok_or_else(|| SimError::StartNodeNotFound(id.to_string()))?;
                match element.kind {
                    ElementKind::StartEvent { .. } => Ok(element.id.clone()),
                    _ => Err(SimError::NotAStartEvent(id.to_string())),
                }
            }
            None => {
                let candidates = graph.filter(&|e| {
                    matches!(e.kind, ElementKind::StartEvent { event: None }) && e.parent.is_none()
                });
                match candidates.len() {
                    0 => Err(SimError::NoStartEvent),
                    1 => Ok(candidates[0].id.clone()),
                    _ => Err(SimError::AmbiguousStartEvent),
                }
            }
        }
    }

    /// One unit of advancement. With a pending decision, and either a supplied
    /// input or a non-auto-running scheduler, only that decision is resolved;
    /// otherwise every live unparked token advances one hop.
    pub fn step(&self, decision: Option<DecisionInput>) {
        let deferred = {
            let mut core = self.core();
            if core.state == RunState::Idle {
                return;
            }
            let mut deferred = Vec::new();

            let resolving = core
                .pending
                .filter(|_| core.state != RunState::Running || decision.is_some());
            if let Some(pending_id) = resolving {
                self.resolve_pending(&mut core, pending_id, decision.as_ref(), &mut deferred);
            } else {
                let ids: Vec<TokenId> = core
                    .tokens
                    .iter()
                    .filter(|t| t.is_live() && t.suspension.is_none() && !t.held_at_join)
                    .map(|t| t.id)
                    .collect();
                for id in ids {
                    let still_movable = core
                        .token(id)
                        .map(|t| t.is_live() && t.suspension.is_none() && !t.held_at_join)
                        .unwrap_or(false);
                    if still_movable {
                        self.advance_token(&mut core, id, None, &mut deferred);
                    }
                }
            }

            self.post_step(&mut core);
            self.publish(&core);
            deferred
        };
        self.after_step(deferred);
    }

    /// Re-enters `Running`; a pending resume-only handler wait (manual task,
    /// timer) is skipped and its token re-stepped immediately.
    pub fn resume(&self) {
        let deferred = {
            let mut core = self.core();
            if core.state == RunState::Idle {
                return;
            }
            let mut deferred = Vec::new();

            let resumable = core.pending.filter(|id| {
                core.token(*id)
                    .and_then(|t| t.suspension.as_ref())
                    .map(|s| s.resume_only)
                    .unwrap_or(false)
            });
            if let Some(id) = resumable {
                core.pending = None;
                if let Some(token) = core.token_mut(id) {
                    token.suspension = None;
                    token.skip_once = true;
                }
                self.advance_token(&mut core, id, None, &mut deferred);
            }

            core.was_running = false;
            if !core.tokens.is_empty() {
                core.state = RunState::Running;
            }
            self.post_step(&mut core);
            self.publish(&core);
            deferred
        };
        self.after_step(deferred);
    }

    /// Stops the clock; tokens are retained.
    pub fn pause(&self) {
        let mut core = self.core();
        if core.state == RunState::Idle {
            return;
        }
        core.clock_epoch += 1;
        core.was_running = false;
        core.state = if core.pending.is_some() {
            RunState::AwaitingDecision
        } else {
            RunState::Paused
        };
        self.publish(&core);
    }

    /// Stops the clock and discards all tokens and pending state. The run log
    /// and context survive; `reset` clears those too.
    pub fn stop(&self) {
        {
            let mut core = self.core();
            self.finish_run(&mut core);
            self.publish(&core);
        }
        self.persist_log();
    }

    /// `stop` plus log clear and context re-seed.
    pub fn reset(&self) {
        {
            let mut core = self.core();
            self.finish_run(&mut core);
            core.log.clear();
            core.dirty_log = false;
            core.context = self.shared.config.seed_context.clone();
            self.publish(&core);
        }
        let store = self.shared.log_store.clone();
        let key = self.shared.config.log_key.clone();
        self.spawn(async move {
            if let Err(e) = store.clear(&key).await {
                warn!(error = %e, "failed to clear persisted run log");
            }
        });
    }

    /// Best-effort recovery from the persisted log: reconstructs one token at
    /// the last logged position and pauses there. Multi-token runs are not
    /// fully reconstructable from the log alone.
    pub async fn restore(&self) -> bool {
        let entries = self
            .shared
            .log_store
            .load(&self.shared.config.log_key)
            .await;
        let Some(last) = entries.last().cloned() else {
            return false;
        };

        let mut core = self.core();
        if core.state != RunState::Idle || !core.tokens.is_empty() {
            return false;
        }
        if self.shared.graph.element(&last.element_id).is_none() {
            warn!(element = %last.element_id, "persisted run log references an unknown element");
            return false;
        }

        core.next_token_id = entries.iter().map(|e| e.token_id).max().unwrap_or(0) + 1;
        core.log = entries;
        let id = core.mint_id();
        let mut token = Token::new(id, last.element_id.clone());
        token.via = last.edge_id.clone();
        core.tokens.push(token);
        self.add_mark(&mut core, id, &last.element_id);
        core.state = RunState::Paused;
        info!(run_id = %self.shared.run_id, element = %last.element_id, "run restored from persisted log");
        self.publish(&core);
        true
    }

    // --- internals ---

    fn clear_run_state(&self, core: &mut Core) {
        self.run_all_cleanups(core);
        let marked: Vec<TokenId> = core.marks.keys().copied().collect();
        for id in marked {
            self.clear_marks(core, id);
        }
        core.tokens.clear();
        core.joins.clear();
        core.pending = None;
        core.was_running = false;
        core.next_token_id = 1;
        core.clock_epoch += 1;
    }

    fn finish_run(&self, core: &mut Core) {
        self.clear_run_state(core);
        core.state = RunState::Idle;
    }

    fn decision_view(core: &Core) -> Option<PendingDecision> {
        let id = core.pending?;
        let token = core.token(id)?;
        let suspension = token.suspension.as_ref()?;
        Some(PendingDecision {
            token_id: id,
            element_id: token.at.clone()?,
            kind: suspension.kind.clone(),
            candidates: suspension.candidates.clone(),
        })
    }

    fn publish(&self, core: &Core) {
        self.shared.active_tx.send_replace(
            core.tokens
                .iter()
                .filter(|t| t.is_live())
                .map(TokenSnapshot::of)
                .collect(),
        );
        self.shared.log_tx.send_replace(core.log.clone());
        self.shared
            .decision_tx
            .send_replace(Self::decision_view(core));
    }

    fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(future);
            }
            Err(_) => warn!("no async runtime available; background work dropped"),
        }
    }

    fn arm_clock(&self, core: &mut Core) {
        core.clock_epoch += 1;
        let epoch = core.clock_epoch;
        let delay = self.shared.config.delay;
        let sim = self.clone();
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            sim.clock_tick(epoch);
        });
    }

    fn clock_tick(&self, epoch: u64) {
        {
            let core = self.core();
            if core.state != RunState::Running || core.clock_epoch != epoch {
                return;
            }
        }
        self.step(None);
    }

    /// Fires a handler-scheduled resume for one token. Other tokens and the
    /// scheduler state are untouched.
    fn timer_fired(&self, token_id: TokenId) {
        let deferred = {
            let mut core = self.core();
            let parked = core
                .token(token_id)
                .map(|t| t.is_live() && t.suspension.is_some())
                .unwrap_or(false);
            if !parked {
                return;
            }
            if core.pending == Some(token_id) {
                core.pending = None;
            }
            if let Some(token) = core.token_mut(token_id) {
                token.suspension = None;
                token.skip_once = true;
            }
            let mut deferred = Vec::new();
            self.advance_token(&mut core, token_id, None, &mut deferred);
            self.post_step(&mut core);
            self.publish(&core);
            deferred
        };
        self.after_step(deferred);
    }

    fn after_step(&self, deferred: Vec<Deferred>) {
        for action in deferred {
            match action {
                Deferred::ResumeAfter { token, delay } => {
                    let sim = self.clone();
                    match tokio::runtime::Handle::try_current() {
                        Ok(handle) => {
                            let join = handle.spawn(async move {
                                tokio::time::sleep(delay).await;
                                sim.timer_fired(token);
                            });
                            let mut core = self.core();
                            core.cleanups.push((token, Box::new(move || join.abort())));
                        }
                        Err(_) => {
                            warn!(token_id = token, "no async runtime; scheduled resume dropped")
                        }
                    }
                }
            }
        }
        self.persist_log();
    }

    fn persist_log(&self) {
        let snapshot = {
            let mut core = self.core();
            if !core.dirty_log {
                return;
            }
            core.dirty_log = false;
            core.log.clone()
        };
        let store = self.shared.log_store.clone();
        let key = self.shared.config.log_key.clone();
        self.spawn(async move {
            if let Err(e) = store.save(&key, &snapshot).await {
                warn!(error = %e, "failed to persist run log");
            }
        });
    }

    fn post_step(&self, core: &mut Core) {
        self.retire_orphan_boundaries(core);
        core.tokens.retain(|t| t.is_live());

        if core.tokens.is_empty() {
            if core.state != RunState::Idle {
                info!(run_id = %self.shared.run_id, "simulation finished");
                self.finish_run(core);
            }
            return;
        }

        if core.pending.is_none() {
            core.pending = core
                .tokens
                .iter()
                .find(|t| t.suspension.is_some())
                .map(|t| t.id);
        }

        let movable = core
            .tokens
            .iter()
            .any(|t| t.suspension.is_none() && !t.held_at_join);

        if movable {
            match core.state {
                RunState::Running => self.arm_clock(core),
                RunState::AwaitingDecision => {
                    if core.was_running {
                        core.was_running = false;
                        core.state = RunState::Running;
                        self.arm_clock(core);
                    } else {
                        core.state = RunState::Paused;
                    }
                }
                RunState::Paused | RunState::Idle => {}
            }
        } else {
            if core.state == RunState::Running {
                core.was_running = true;
                core.clock_epoch += 1;
            }
            core.state = if core.pending.is_some() {
                RunState::AwaitingDecision
            } else {
                // Every token held at an unbalanced join: nothing can move.
                RunState::Paused
            };
        }
    }

    /// Boundary tokens die once nothing occupies the host activity or its
    /// scope; their scheduled timers are cancelled with them.
    fn retire_orphan_boundaries(&self, core: &mut Core) {
        let graph = &self.shared.graph;
        let orphans: Vec<TokenId> = core
            .tokens
            .iter()
            .filter(|t| t.is_live() && t.host.is_some())
            .filter(|t| {
                let host = t.host.as_deref().unwrap_or_default();
                let occupied = core.tokens.iter().any(|o| {
                    o.id != t.id
                        && o.is_live()
                        && o.host.is_none()
                        && o.at
                            .as_deref()
                            .map(|at| at == host || graph.is_inside(at, host))
                            .unwrap_or(false)
                });
                !occupied
            })
            .map(|t| t.id)
            .collect();
        for id in orphans {
            debug!(token_id = id, "retiring boundary token, host no longer active");
            self.consume_token(core, id);
        }
    }

    fn run_cleanups_for(&self, core: &mut Core, token_id: TokenId) {
        let mut keep = Vec::new();
        let mut run = Vec::new();
        for (id, cleanup) in core.cleanups.drain(..) {
            if id == token_id {
                run.push(cleanup);
            } else {
                keep.push((id, cleanup));
            }
        }
        core.cleanups = keep;
        for cleanup in run {
            // Each cleanup runs isolated; one panicking must not stop the rest.
            let _ = std::panic::catch_unwind(AssertUnwindSafe(cleanup));
        }
    }

    fn run_all_cleanups(&self, core: &mut Core) {
        let cleanups: Vec<(TokenId, Cleanup)> = core.cleanups.drain(..).collect();
        for (_, cleanup) in cleanups {
            let _ = std::panic::catch_unwind(AssertUnwindSafe(cleanup));
        }
    }

    fn add_mark(&self, core: &mut Core, token_id: TokenId, id: &str) {
        self.shared.markers.add_marker(id, MarkerTag::Active);
        core.marks.entry(token_id).or_default().push(id.to_string());
    }

    fn clear_marks(&self, core: &mut Core, token_id: TokenId) {
        if let Some(marks) = core.marks.remove(&token_id) {
            for id in marks {
                self.shared.markers.remove_marker(&id, MarkerTag::Active);
            }
        }
    }

    fn consume_token(&self, core: &mut Core, token_id: TokenId) {
        self.run_cleanups_for(core, token_id);
        self.clear_marks(core, token_id);
        if core.pending == Some(token_id) {
            core.pending = None;
        }
        for wait in core.joins.values_mut() {
            wait.arrived.retain(|id| *id != token_id);
        }
        if let Some(token) = core.token_mut(token_id) {
            token.at = None;
            token.suspension = None;
            token.held_at_join = false;
        }
    }

    fn flow_satisfied(&self, context: &HashMap<String, Value>, flow: &SequenceFlow) -> bool {
        let Some(condition) = &flow.condition else {
            return true;
        };
        let fallback = self.shared.config.condition_fallback.map(ExprValue::Bool);
        match expr::evaluate_condition(condition, context, fallback.as_ref()) {
            Ok(satisfied) => satisfied,
            Err(e) => {
                warn!(flow = %flow.id, error = %e, "condition evaluation failed, treating as unsatisfied");
                false
            }
        }
    }

    fn outgoing_flows(&self, element: &Element) -> Vec<SequenceFlow> {
        element
            .outgoing
            .iter()
            .filter_map(|id| self.shared.graph.flow(id))
            .cloned()
            .collect()
    }

    fn park_token(
        &self,
        core: &mut Core,
        token_id: TokenId,
        kind: SuspendKind,
        candidates: Vec<EdgeCandidate>,
        resume_only: bool,
    ) {
        if let Some(token) = core.token_mut(token_id) {
            token.suspension = Some(Suspension {
                kind,
                candidates,
                resume_only,
            });
        }
        if core.pending.is_none() {
            core.pending = Some(token_id);
        }
    }

    /// Advance one token a single hop: handler activation first (unless
    /// skipped), then default routing by node kind.
    fn advance_token(
        &self,
        core: &mut Core,
        token_id: TokenId,
        decision: Option<&DecisionInput>,
        deferred: &mut Vec<Deferred>,
    ) {
        let Some(token) = core.token(token_id) else {
            return;
        };
        let Some(at) = token.at.clone() else {
            return;
        };
        let Some(element) = self.shared.graph.element(&at).cloned() else {
            warn!(token_id, element = %at, "token stranded on unknown element");
            self.consume_token(core, token_id);
            return;
        };

        let skip = token.skip_once;
        if skip {
            if let Some(token) = core.token_mut(token_id) {
                token.skip_once = false;
            }
        } else if let Some(handler) = self.shared.registry.for_element(&element) {
            // A fresh activation releases whatever the previous one acquired.
            self.run_cleanups_for(core, token_id);
            let token_view = core
                .token(token_id)
                .cloned()
                .unwrap_or_else(|| Token::new(token_id, at.clone()));
            let outcome = {
                let mut cx =
                    HandlerCx::new(token_id, &mut core.context, deferred, &mut core.cleanups);
                handler.activate(&mut cx, &token_view, &element, decision)
            };
            match outcome {
                HandlerOutcome::Park { resume_only } => {
                    debug!(token_id, element = %at, handler = handler.name(), "token parked by handler");
                    self.park_token(
                        core,
                        token_id,
                        SuspendKind::Handler {
                            name: handler.name().to_string(),
                        },
                        Vec::new(),
                        resume_only,
                    );
                    return;
                }
                HandlerOutcome::Continue(flows) => {
                    self.route(core, token_id, &flows);
                    return;
                }
            }
        }

        match &element.kind {
            ElementKind::ExclusiveGateway => {
                self.exclusive_route(core, token_id, &element)
            }
            ElementKind::ParallelGateway => {
                let flows: Vec<FlowId> = element.outgoing.clone();
                if flows.is_empty() {
                    self.consume_token(core, token_id);
                } else {
                    self.route(core, token_id, &flows);
                }
            }
            ElementKind::InclusiveGateway { direction } => {
                self.inclusive_route(core, token_id, &element, *direction)
            }
            ElementKind::EventBasedGateway => {
                let candidates: Vec<EdgeCandidate> = element
                    .outgoing
                    .iter()
                    .map(|id| EdgeCandidate {
                        flow_id: id.clone(),
                        satisfied: true,
                    })
                    .collect();
                self.park_token(core, token_id, SuspendKind::EventGateway, candidates, false);
            }
            ElementKind::EndEvent => self.complete_at_end(core, token_id, &element),
            ElementKind::SubProcess => self.enter_sub_process(core, token_id, &element),
            ElementKind::BoundaryEvent { .. } => {
                self.fire_boundary(core, token_id, &element)
            }
            ElementKind::Participant => self.consume_token(core, token_id),
            // Plain nodes take the first outgoing sequence flow; several
            // outgoing flows on a plain node are a modelling shortcut and
            // only the first is honored.
            _ => match element.outgoing.first().cloned() {
                Some(flow) => self.route(core, token_id, &[flow]),
                None => self.consume_token(core, token_id),
            },
        }
    }

    fn exclusive_route(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
    ) {
        let flows = self.outgoing_flows(element);
        if flows.is_empty() {
            self.consume_token(core, token_id);
            return;
        }

        let mut satisfied = Vec::new();
        let mut candidates = Vec::new();
        for flow in flows.iter().filter(|f| !f.is_default) {
            let ok = self.flow_satisfied(&core.context, flow);
            candidates.push(EdgeCandidate {
                flow_id: flow.id.clone(),
                satisfied: ok,
            });
            if ok {
                satisfied.push(flow.id.clone());
            }
        }
        let default = flows.iter().find(|f| f.is_default);
        if let Some(default) = default {
            candidates.push(EdgeCandidate {
                flow_id: default.id.clone(),
                satisfied: satisfied.is_empty(),
            });
        }

        if satisfied.len() == 1 {
            let choice = satisfied.remove(0);
            self.route(core, token_id, &[choice]);
        } else if satisfied.is_empty() && default.is_some() {
            let choice = default.map(|f| f.id.clone()).unwrap_or_default();
            self.route(core, token_id, &[choice]);
        } else {
            // Zero or several viable edges: ask the caller.
            self.park_token(
                core,
                token_id,
                SuspendKind::ExclusiveGateway,
                candidates,
                false,
            );
        }
    }

    fn inclusive_route(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
        direction: Option<GatewayDirection>,
    ) {
        let is_merge = direction == Some(GatewayDirection::Converging)
            || (direction.is_none() && element.incoming.len() > 1);
        if is_merge {
            // A converging inclusive gateway never branches by itself.
            match element.outgoing.first().cloned() {
                Some(flow) => self.route(core, token_id, &[flow]),
                None => self.consume_token(core, token_id),
            }
            return;
        }

        let flows = self.outgoing_flows(element);
        if flows.is_empty() {
            self.consume_token(core, token_id);
            return;
        }

        let mut chosen = Vec::new();
        let mut candidates = Vec::new();
        for flow in flows.iter().filter(|f| !f.is_default) {
            let ok = self.flow_satisfied(&core.context, flow);
            candidates.push(EdgeCandidate {
                flow_id: flow.id.clone(),
                satisfied: ok,
            });
            if ok {
                chosen.push(flow.id.clone());
            }
        }
        if let Some(default) = flows.iter().find(|f| f.is_default) {
            candidates.push(EdgeCandidate {
                flow_id: default.id.clone(),
                satisfied: chosen.is_empty(),
            });
            if chosen.is_empty() {
                chosen.push(default.id.clone());
            }
        }

        if chosen.is_empty() {
            self.park_token(
                core,
                token_id,
                SuspendKind::InclusiveGateway,
                candidates,
                false,
            );
            return;
        }
        self.inclusive_fan_out(core, token_id, chosen);
    }

    fn inclusive_fan_out(
        &self,
        core: &mut Core,
        token_id: TokenId,
        chosen: Vec<FlowId>,
    ) {
        if chosen.len() > 1 {
            // Tell the downstream merge how many branches to wait for.
            let merges = self.nearest_inclusive_merges(&chosen);
            if let Some(token) = core.token_mut(token_id) {
                for merge in &merges {
                    token.pending_joins.insert(merge.clone(), chosen.len());
                }
            }
        }
        self.route(core, token_id, &chosen);
    }

    /// Nearest common downstream inclusive-merge node(s) reachable from every
    /// chosen branch: minimize the maximum shortest-path distance across
    /// branches, keeping all nodes tied for the minimum.
    fn nearest_inclusive_merges(&self, branches: &[FlowId]) -> Vec<ElementId> {
        let graph = &self.shared.graph;
        let mut per_branch = Vec::new();
        for flow_id in branches {
            let Some(flow) = graph.flow(flow_id) else {
                continue;
            };
            per_branch.push(self.bfs_distances(&flow.target));
        }
        let Some(first) = per_branch.first() else {
            return Vec::new();
        };

        let mut reachable: Vec<(ElementId, usize)> = Vec::new();
        for (id, d0) in first {
            let Some(element) = graph.element(id) else {
                continue;
            };
            let is_merge = match &element.kind {
                ElementKind::InclusiveGateway { direction } => {
                    *direction == Some(GatewayDirection::Converging)
                        || (direction.is_none() && element.incoming.len() > 1)
                }
                _ => false,
            };
            if !is_merge {
                continue;
            }
            let mut max_dist = *d0;
            let mut common = true;
            for dist in &per_branch[1..] {
                match dist.get(id) {
                    Some(d) => max_dist = max_dist.max(*d),
                    None => {
                        common = false;
                        break;
                    }
                }
            }
            if common {
                reachable.push((id.clone(), max_dist));
            }
        }

        let Some(min) = reachable.iter().map(|(_, d)| *d).min() else {
            return Vec::new();
        };
        reachable
            .into_iter()
            .filter(|(_, d)| *d == min)
            .map(|(id, _)| id)
            .collect()
    }

    fn bfs_distances(&self, start: &str) -> HashMap<ElementId, usize> {
        let graph = &self.shared.graph;
        let mut distances = HashMap::new();
        let mut queue = VecDeque::new();
        distances.insert(start.to_string(), 0usize);
        queue.push_back(start.to_string());
        while let Some(id) = queue.pop_front() {
            let dist = distances[&id];
            let Some(element) = graph.element(&id) else {
                continue;
            };
            for flow_id in &element.outgoing {
                let Some(flow) = graph.flow(flow_id) else {
                    continue;
                };
                if !distances.contains_key(&flow.target) {
                    distances.insert(flow.target.clone(), dist + 1);
                    queue.push_back(flow.target.clone());
                }
            }
        }
        distances
    }

    fn complete_at_end(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
    ) {
        if let Some(parent) = element.parent.clone() {
            let others_inside = core.tokens.iter().any(|t| {
                t.id != token_id
                    && t.is_live()
                    && t.at
                        .as_deref()
                        .map(|at| self.shared.graph.is_inside(at, &parent))
                        .unwrap_or(false)
            });
            if others_inside {
                // Scope still busy: this branch simply ends.
                self.consume_token(core, token_id);
                return;
            }
            // Last token in the scope: the sub-process completes and the
            // token leaves along its outgoing flow.
            if let Some(parent_el) = self.shared.graph.element(&parent) {
                if let Some(exit) = parent_el.outgoing.first().cloned() {
                    self.route(core, token_id, &[exit]);
                    return;
                }
            }
        }
        self.consume_token(core, token_id);
    }

    fn enter_sub_process(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
    ) {
        let inner_start = self
            .shared
            .graph
            .children_of(&element.id)
            .into_iter()
            .find(|e| matches!(e.kind, ElementKind::StartEvent { event: None }))
            .map(|e| e.id.clone());
        match inner_start {
            Some(start) => {
                self.clear_marks(core, token_id);
                self.place_token(core, token_id, &start, None);
            }
            // Collapsed sub-process without an inner start: plain routing.
            None => match element.outgoing.first().cloned() {
                Some(flow) => self.route(core, token_id, &[flow]),
                None => self.consume_token(core, token_id),
            },
        }
    }

    /// A boundary token advancing past its event means the event fired. An
    /// interrupting one absorbs the host token and every other token tied to
    /// the host in the same step.
    fn fire_boundary(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
    ) {
        let (host, interrupting) = {
            let token = core.token(token_id);
            let host = token
                .and_then(|t| t.host.clone())
                .or_else(|| match &element.kind {
                    ElementKind::BoundaryEvent { attached_to, .. } => Some(attached_to.clone()),
                    _ => None,
                });
            (host, token.map(|t| t.interrupting).unwrap_or(false))
        };

        if let Some(host) = &host {
            if interrupting {
                let victims: Vec<TokenId> = core
                    .tokens
                    .iter()
                    .filter(|t| t.id != token_id && t.is_live())
                    .filter(|t| {
                        t.host.as_deref() == Some(host.as_str())
                            || t.at
                                .as_deref()
                                .map(|at| at == host || self.shared.graph.is_inside(at, host))
                                .unwrap_or(false)
                    })
                    .map(|t| t.id)
                    .collect();
                for victim in victims {
                    debug!(token_id = victim, host = %host, "token absorbed by interrupting boundary event");
                    self.consume_token(core, victim);
                }
            }
        }

        if let Some(token) = core.token_mut(token_id) {
            token.host = None;
            token.interrupting = false;
        }
        match element.outgoing.first().cloned() {
            Some(flow) => self.route(core, token_id, &[flow]),
            None => self.consume_token(core, token_id),
        }
    }

    /// Move the token along the first flow, minting fresh tokens for the rest.
    fn route(&self, core: &mut Core, token_id: TokenId, flows: &[FlowId]) {
        if flows.is_empty() {
            self.consume_token(core, token_id);
            return;
        }

        let inherited = core
            .token(token_id)
            .map(|t| t.pending_joins.clone())
            .unwrap_or_default();

        for (i, flow_id) in flows.iter().enumerate() {
            let Some(flow) = self.shared.graph.flow(flow_id).cloned() else {
                warn!(flow = %flow_id, "routing along unknown flow");
                if i == 0 {
                    self.consume_token(core, token_id);
                }
                continue;
            };
            if i == 0 {
                self.clear_marks(core, token_id);
                self.place_token(core, token_id, &flow.target, Some(flow.id.clone()));
            } else {
                let id = core.mint_id();
                let mut token = Token::new(id, flow.target.clone());
                token.pending_joins = inherited.clone();
                core.tokens.push(token);
                self.place_token(core, id, &flow.target, Some(flow.id.clone()));
            }
        }
    }

    /// Put a token onto an element: log the placement, mark it, then apply
    /// arrival effects (join grouping, boundary spawning, message fan-out).
    fn place_token(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element_id: &str,
        via: Option<FlowId>,
    ) {
        if !self.settle_token(core, token_id, element_id, via) {
            return;
        }

        // Message cascade as a worklist: each spawned catch target may send
        // messages of its own, but a target spawns at most once per cascade
        // so correlated flows that form a cycle terminate.
        let mut visited = HashSet::from([element_id.to_string()]);
        let mut worklist = vec![element_id.to_string()];
        while let Some(source_id) = worklist.pop() {
            let Some(source) = self.shared.graph.element(&source_id).cloned() else {
                continue;
            };
            for (flow_id, target_id, spawned_id) in
                self.fan_out_messages(core, &source, &mut visited)
            {
                if self.settle_token(core, spawned_id, &target_id, Some(flow_id)) {
                    worklist.push(target_id);
                }
            }
        }
    }

    /// Records a token's arrival on an element: position, log entry, markers,
    /// join arrival, boundary watchers. Returns false when the element is
    /// unknown and the token was consumed instead.
    fn settle_token(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element_id: &str,
        via: Option<FlowId>,
    ) -> bool {
        let Some(element) = self.shared.graph.element(element_id).cloned() else {
            warn!(token_id, element = %element_id, "placement on unknown element");
            self.consume_token(core, token_id);
            return false;
        };

        if let Some(token) = core.token_mut(token_id) {
            token.at = Some(element_id.to_string());
            token.via = via.clone();
        }
        self.append_log(core, token_id, &element, via.as_deref());
        if let Some(edge) = &via {
            self.add_mark(core, token_id, edge);
        }
        self.add_mark(core, token_id, element_id);
        debug!(run_id = %self.shared.run_id, token_id, element = %element_id, "token placed");

        self.handle_join_arrival(core, token_id, &element);
        self.spawn_boundary_tokens(core, token_id, &element);
        true
    }

    fn append_log(
        &self,
        core: &mut Core,
        token_id: TokenId,
        element: &Element,
        edge: Option<&str>,
    ) {
        core.log.push(RunLogEntry {
            token_id,
            element_id: element.id.clone(),
            element_name: element.name.clone(),
            edge_id: edge.map(|e| e.to_string()),
            timestamp: now_millis(),
        });
        core.dirty_log = true;
    }

    /// Join grouping at arrival. The join releases exactly once all expected
    /// arrivals are in; until then arrived tokens are held, visibly parked,
    /// without suspending the scheduler.
    fn handle_join_arrival(&self, core: &mut Core, token_id: TokenId, element: &Element) {
        let joinable = element.incoming.len() > 1
            && matches!(
                element.kind,
                ElementKind::ParallelGateway | ElementKind::InclusiveGateway { .. }
            );
        if !joinable {
            return;
        }

        let stamped = core
            .token_mut(token_id)
            .and_then(|t| t.pending_joins.remove(&element.id));
        let expected = match (stamped, &element.kind) {
            (Some(n), _) => n,
            // A parallel join waits for every incoming edge.
            (None, ElementKind::ParallelGateway) => element.incoming.len(),
            // An unstamped inclusive merge forwards without waiting.
            (None, _) => 1,
        };
        if expected <= 1 {
            return;
        }

        let released = {
            let wait = core
                .joins
                .entry(element.id.clone())
                .or_insert_with(|| JoinWait {
                    expected,
                    arrived: Vec::new(),
                });
            wait.arrived.push(token_id);
            wait.arrived.len() >= wait.expected
        };

        if !released {
            if let Some(token) = core.token_mut(token_id) {
                token.held_at_join = true;
            }
            debug!(token_id, join = %element.id, "token held at join");
            return;
        }

        let Some(wait) = core.joins.remove(&element.id) else {
            return;
        };
        let survivor = wait.arrived[0];
        let mut merged_joins = HashMap::new();
        for id in &wait.arrived {
            if let Some(token) = core.token(*id) {
                for (k, v) in &token.pending_joins {
                    merged_joins.insert(k.clone(), *v);
                }
            }
        }
        for id in wait.arrived.iter().skip(1) {
            self.consume_token(core, *id);
        }
        if let Some(token) = core.token_mut(survivor) {
            token.held_at_join = false;
            token.pending_joins = merged_joins;
        }
        // Synthetic entry marking the merged token's release at the join.
        self.append_log(core, survivor, element, None);
        debug!(token_id = survivor, join = %element.id, "join released");
    }

    /// First visit to an activity with attached boundary events spawns one
    /// watcher token per boundary event, without consuming the host's token.
    fn spawn_boundary_tokens(&self, core: &mut Core, token_id: TokenId, element: &Element) {
        if !matches!(
            element.kind,
            ElementKind::Task { .. } | ElementKind::SubProcess
        ) {
            return;
        }
        let is_boundary_token = core
            .token(token_id)
            .map(|t| t.host.is_some())
            .unwrap_or(false);
        if is_boundary_token {
            return;
        }
        let already_watched = core
            .tokens
            .iter()
            .any(|t| t.is_live() && t.host.as_deref() == Some(element.id.as_str()));
        if already_watched {
            return;
        }

        let boundaries: Vec<Element> = self
            .shared
            .graph
            .boundary_events_of(&element.id)
            .into_iter()
            .cloned()
            .collect();
        for boundary in boundaries {
            let interrupting = matches!(
                boundary.kind,
                ElementKind::BoundaryEvent {
                    cancel_activity: true,
                    ..
                }
            );
            let id = core.mint_id();
            let mut token = Token::new(id, boundary.id.clone());
            token.host = Some(element.id.clone());
            token.interrupting = interrupting;
            core.tokens.push(token);
            self.append_log(core, id, &boundary, None);
            self.add_mark(core, id, &boundary.id);
            debug!(token_id = id, boundary = %boundary.id, host = %element.id, "boundary token spawned");
        }
    }

    /// Outgoing message flows spawn independent tokens at correlatable catch
    /// targets; the source token is not consumed. Participants, uncorrelated
    /// targets and targets already visited in this cascade spawn nothing.
    /// The spawned tokens are returned unplaced so the caller drives the
    /// cascade iteratively.
    fn fan_out_messages(
        &self,
        core: &mut Core,
        element: &Element,
        visited: &mut HashSet<ElementId>,
    ) -> Vec<(FlowId, ElementId, TokenId)> {
        let flows: Vec<MessageFlow> = self
            .shared
            .graph
            .message_flows_from(&element.id)
            .into_iter()
            .cloned()
            .collect();
        let mut spawned = Vec::new();
        for flow in flows {
            let Some(target) = self.shared.graph.element(&flow.target) else {
                continue;
            };
            if !Self::correlates(&flow, target) {
                debug!(flow = %flow.id, target = %flow.target, "message not correlated, no token spawned");
                continue;
            }
            if !visited.insert(target.id.clone()) {
                debug!(flow = %flow.id, target = %flow.target, "message target already spawned in this cascade");
                continue;
            }
            let target_id = target.id.clone();
            let id = core.mint_id();
            let mut token = Token::new(id, target_id.clone());
            // The message this token represents has already arrived; it must
            // not wait at the catch element again.
            token.skip_once = true;
            core.tokens.push(token);
            debug!(token_id = id, target = %target_id, "message-spawned token");
            spawned.push((flow.id.clone(), target_id, id));
        }
        spawned
    }

    /// A message edge correlates when its target catches messages and the
    /// message names match on both sides.
    fn correlates(flow: &MessageFlow, target: &Element) -> bool {
        let target_message = match &target.kind {
            ElementKind::StartEvent {
                event: Some(EventKind::Message { name }),
            } => name.as_ref(),
            ElementKind::IntermediateCatch {
                event: EventKind::Message { name },
            } => name.as_ref(),
            ElementKind::BoundaryEvent {
                event: EventKind::Message { name },
                ..
            } => name.as_ref(),
            ElementKind::Task {
                task: TaskKind::Receive,
            } => return flow.message.is_some(),
            _ => return false,
        };
        match (&flow.message, target_message) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Resolve the exposed pending decision. Invalid input is a no-op: the
    /// decision stays pending and the caller can retry.
    fn resolve_pending(
        &self,
        core: &mut Core,
        token_id: TokenId,
        decision: Option<&DecisionInput>,
        deferred: &mut Vec<Deferred>,
    ) {
        let Some(suspension) = core.token(token_id).and_then(|t| t.suspension.clone()) else {
            core.pending = None;
            return;
        };
        let Some(decision) = decision else {
            return;
        };

        match (&suspension.kind, decision) {
            (SuspendKind::ExclusiveGateway, DecisionInput::Edges(ids))
            | (SuspendKind::EventGateway, DecisionInput::Edges(ids)) => {
                // Exactly one recognized edge id; an unsatisfied edge is a
                // legal choice, merely discouraged.
                if ids.len() != 1 || !suspension.candidates.iter().any(|c| c.flow_id == ids[0]) {
                    debug!(token_id, "decision input rejected, token stays parked");
                    return;
                }
                self.unpark(core, token_id);
                if suspension.kind == SuspendKind::EventGateway {
                    // The chosen edge's event already fired; do not re-trigger
                    // the catch handler behind it.
                    if let Some(token) = core.token_mut(token_id) {
                        token.skip_once = true;
                    }
                }
                self.route(core, token_id, &[ids[0].clone()]);
            }
            (SuspendKind::InclusiveGateway, DecisionInput::Edges(ids)) => {
                let mut chosen: Vec<FlowId> = Vec::new();
                for id in ids {
                    if !chosen.contains(id) {
                        chosen.push(id.clone());
                    }
                }
                let recognized = !chosen.is_empty()
                    && chosen
                        .iter()
                        .all(|id| suspension.candidates.iter().any(|c| &c.flow_id == id));
                if !recognized {
                    debug!(token_id, "decision input rejected, token stays parked");
                    return;
                }
                self.unpark(core, token_id);
                self.inclusive_fan_out(core, token_id, chosen);
            }
            (SuspendKind::Handler { .. }, DecisionInput::Resume) => {
                if !suspension.resume_only {
                    return;
                }
                self.unpark(core, token_id);
                if let Some(token) = core.token_mut(token_id) {
                    token.skip_once = true;
                }
                self.advance_token(core, token_id, None, deferred);
            }
            (SuspendKind::Handler { .. }, input) => {
                // Resume-only waits (timers, messages) must not be restarted
                // by stray input; only handlers that accept external values
                // get re-activated with the decision.
                if suspension.resume_only {
                    debug!(token_id, "decision input rejected, token stays parked");
                    return;
                }
                self.unpark(core, token_id);
                self.advance_token(core, token_id, Some(input), deferred);
            }
            _ => {
                debug!(token_id, "decision input rejected, token stays parked");
            }
        }
    }

    fn unpark(&self, core: &mut Core, token_id: TokenId) {
        if core.pending == Some(token_id) {
            core.pending = None;
        }
        if let Some(token) = core.token_mut(token_id) {
            token.suspension = None;
        }
    }
}
