pub mod builtin;

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::graph::{Element, FlowId};
use crate::runtime::token::{DecisionInput, Token, TokenId};

pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Side effects a handler can request but the engine must perform outside the
/// core lock (spawning timers, mostly).
pub enum Deferred {
    ResumeAfter { token: TokenId, delay: Duration },
}

/// What a handler activation decided.
pub enum HandlerOutcome {
    /// Routing decided: continue immediately along these outgoing flows.
    /// An empty list consumes the token.
    Continue(Vec<FlowId>),
    /// Park the token as the pending decision. `resume_only` handlers are
    /// released by a bare `resume()` signal.
    Park { resume_only: bool },
}

/// Activation-scoped API handed to handlers: context access, cleanup
/// registration and delayed self-resume. Everything funnels back through the
/// scheduler; handlers never see engine internals.
pub struct HandlerCx<'a> {
    token_id: TokenId,
    context: &'a mut HashMap<String, Value>,
    deferred: &'a mut Vec<Deferred>,
    cleanups: &'a mut Vec<(TokenId, Cleanup)>,
}

impl<'a> HandlerCx<'a> {
    pub fn new(
        token_id: TokenId,
        context: &'a mut HashMap<String, Value>,
        deferred: &'a mut Vec<Deferred>,
        cleanups: &'a mut Vec<(TokenId, Cleanup)>,
    ) -> Self {
        Self {
            token_id,
            context,
            deferred,
            cleanups,
        }
    }

    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    pub fn get_context(&self, key: &str) -> Option<Value> {
        self.context.get(key).cloned()
    }

    /// Merge semantics: new keys are added, existing keys overwritten, nothing
    /// is ever deleted.
    pub fn set_context(&mut self, patch: HashMap<String, Value>) {
        for (k, v) in patch {
            self.context.insert(k, v);
        }
    }

    pub fn set_var(&mut self, key: &str, value: Value) {
        self.context.insert(key.to_string(), value);
    }

    /// Registered cleanups run when a new activation for this token begins,
    /// when the token is removed, and on stop/reset.
    pub fn add_cleanup(&mut self, cleanup: Cleanup) {
        self.cleanups.push((self.token_id, cleanup));
    }

    /// Schedule this token to resume after `delay`. The engine spawns the
    /// timer once the step completes and registers an abort cleanup for it.
    pub fn resume_after(&mut self, delay: Duration) {
        self.deferred.push(Deferred::ResumeAfter {
            token: self.token_id,
            delay,
        });
    }
}

/// Pluggable per-node-type behavior. Default routing applies when no handler
/// is registered for an element, or when a resumed token skips its handler.
pub trait NodeHandler: Send + Sync {
    fn name(&self) -> &str;

    fn activate(
        &self,
        cx: &mut HandlerCx<'_>,
        token: &Token,
        element: &Element,
        decision: Option<&DecisionInput>,
    ) -> HandlerOutcome;
}

/// Maps an element's type tag, or its event-definition kind for event nodes,
/// to a handler. Custom registrations override the defaults.
pub struct HandlerRegistry {
    by_type: HashMap<String, Arc<dyn NodeHandler>>,
    by_event: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            by_type: HashMap::new(),
            by_event: HashMap::new(),
        }
    }

    /// Registry with the stock handlers: manual/user tasks wait for an
    /// external resume, timer events self-resume after their parsed delay,
    /// message waits auto-resume after `message_delay` unless cancelled.
    pub fn with_defaults(timer_fallback: Duration, message_delay: Duration) -> Self {
        let mut registry = Self::empty();
        let manual = Arc::new(builtin::ManualTaskHandler);
        registry.register_type("manual", manual.clone());
        registry.register_type("user", manual);
        let message = Arc::new(builtin::MessageWaitHandler::new(message_delay));
        registry.register_type("receive", message.clone());
        registry.register_event("message", message);
        registry.register_event(
            "timer",
            Arc::new(builtin::TimerHandler::new(timer_fallback)),
        );
        registry
    }

    pub fn register_type(&mut self, type_tag: &str, handler: Arc<dyn NodeHandler>) {
        self.by_type.insert(type_tag.to_string(), handler);
    }

    pub fn register_event(&mut self, event_tag: &str, handler: Arc<dyn NodeHandler>) {
        self.by_event.insert(event_tag.to_string(), handler);
    }

    pub fn for_element(&self, element: &Element) -> Option<Arc<dyn NodeHandler>> {
        if let Some(event) = element.kind.event() {
            if let Some(handler) = self.by_event.get(event.tag()) {
                return Some(handler.clone());
            }
        }
        self.by_type.get(element.kind.type_tag()).cloned()
    }
}
