use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::graph::{ElementId, FlowId};

/// Monotonically minted token identity, unique within a run.
pub type TokenId = u64;

/// A unit of control flow walking the process graph.
#[derive(Debug, Clone)]
pub struct Token {
    pub id: TokenId,
    /// Node currently holding the token. None once consumed.
    pub at: Option<ElementId>,
    /// Edge last traversed to reach `at`. None at the start node.
    pub via: Option<FlowId>,
    /// Expected arrival counts for downstream joins, stamped by inclusive
    /// splits. Keyed by the merge node's id.
    pub pending_joins: HashMap<ElementId, usize>,
    /// Host activity, set on boundary-event tokens only.
    pub host: Option<ElementId>,
    /// Whether this boundary token cancels its host when it fires.
    pub interrupting: bool,
    /// One-shot flag: a token resuming from suspension must not re-trigger
    /// the handler that parked it.
    pub skip_once: bool,
    /// Arrived at a join that has not released yet; visibly parked.
    pub held_at_join: bool,
    pub suspension: Option<Suspension>,
}

impl Token {
    pub fn new(id: TokenId, at: ElementId) -> Self {
        Self {
            id,
            at: Some(at),
            via: None,
            pending_joins: HashMap::new(),
            host: None,
            interrupting: false,
            skip_once: false,
            held_at_join: false,
            suspension: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.at.is_some()
    }
}

/// Why a token is parked and what it is waiting for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SuspendKind {
    ExclusiveGateway,
    InclusiveGateway,
    EventGateway,
    Handler { name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeCandidate {
    pub flow_id: FlowId,
    /// Whether the edge's guard held. An unsatisfied edge may still be chosen
    /// by the caller; unsatisfied means discouraged, not forbidden.
    pub satisfied: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Suspension {
    pub kind: SuspendKind,
    pub candidates: Vec<EdgeCandidate>,
    /// Parked by a handler that only needs a resume signal (manual task,
    /// timer wait) rather than an edge choice.
    pub resume_only: bool,
}

/// The single exposed "awaiting token" of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingDecision {
    pub token_id: TokenId,
    pub element_id: ElementId,
    pub kind: SuspendKind,
    pub candidates: Vec<EdgeCandidate>,
}

/// Externally supplied input consumed when resolving a pending decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionInput {
    /// Chosen outgoing edge ids. Exclusive and event-based gateways require
    /// exactly one; inclusive splits accept one or more.
    Edges(Vec<FlowId>),
    /// Bare resume signal for handler-parked tokens.
    Resume,
}

/// Observable per-token state, published on the active-token watch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TokenState {
    Moving,
    Suspended,
    HeldAtJoin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSnapshot {
    pub id: TokenId,
    pub at: Option<ElementId>,
    pub via: Option<FlowId>,
    pub state: TokenState,
}

impl TokenSnapshot {
    pub fn of(token: &Token) -> Self {
        let state = if token.suspension.is_some() {
            TokenState::Suspended
        } else if token.held_at_join {
            TokenState::HeldAtJoin
        } else {
            TokenState::Moving
        };
        Self {
            id: token.id,
            at: token.at.clone(),
            via: token.via.clone(),
            state,
        }
    }
}
