use std::time::Duration;
use tracing::debug;

use crate::graph::{Element, EventKind};
use crate::handlers::{HandlerCx, HandlerOutcome, NodeHandler};
use crate::runtime::token::{DecisionInput, Token};

/// Manual and user tasks park until an external `resume()`.
pub struct ManualTaskHandler;

impl NodeHandler for ManualTaskHandler {
    fn name(&self) -> &str {
        "manual"
    }

    fn activate(
        &self,
        _cx: &mut HandlerCx<'_>,
        token: &Token,
        element: &Element,
        _decision: Option<&DecisionInput>,
    ) -> HandlerOutcome {
        debug!(token_id = token.id, element = %element.id, "manual task waiting");
        HandlerOutcome::Park { resume_only: true }
    }
}

/// Timer events park, then self-resume once the parsed delay elapses. The
/// scheduled timer is registered as a cleanup so stop/reset cancels it.
pub struct TimerHandler {
    fallback: Duration,
}

impl TimerHandler {
    pub fn new(fallback: Duration) -> Self {
        Self { fallback }
    }
}

impl NodeHandler for TimerHandler {
    fn name(&self) -> &str {
        "timer"
    }

    fn activate(
        &self,
        cx: &mut HandlerCx<'_>,
        token: &Token,
        element: &Element,
        _decision: Option<&DecisionInput>,
    ) -> HandlerOutcome {
        let definition = match element.kind.event() {
            Some(EventKind::Timer { definition }) => definition.as_deref(),
            _ => None,
        };
        let delay = definition
            .and_then(parse_timer_definition)
            .unwrap_or(self.fallback);
        debug!(token_id = token.id, element = %element.id, ?delay, "timer armed");
        cx.resume_after(delay);
        HandlerOutcome::Park { resume_only: true }
    }
}

/// Message waits park and auto-resume after a fixed delay, standing in for a
/// correlated message arriving. Cancelled like any other scheduled resume.
pub struct MessageWaitHandler {
    delay: Duration,
}

impl MessageWaitHandler {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl NodeHandler for MessageWaitHandler {
    fn name(&self) -> &str {
        "message"
    }

    fn activate(
        &self,
        cx: &mut HandlerCx<'_>,
        token: &Token,
        element: &Element,
        _decision: Option<&DecisionInput>,
    ) -> HandlerOutcome {
        debug!(token_id = token.id, element = %element.id, "message wait");
        cx.resume_after(self.delay);
        HandlerOutcome::Park { resume_only: true }
    }
}

/// Parses an ISO-8601 duration ("PT5S", "P1DT2H30M") or cycle ("R3/PT10S",
/// only the period part matters here) into a delay. Calendar dates are not
/// supported and fall through to the caller's fallback.
pub fn parse_timer_definition(text: &str) -> Option<Duration> {
    let text = text.trim();
    // Cycle definitions repeat a period; the simulation only waits once.
    let text = text.rsplit('/').next().unwrap_or(text);
    let rest = text.strip_prefix('P')?;
    let (date_part, time_part) = match rest.split_once('T') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };

    let mut secs = 0f64;
    secs += parse_components(date_part, &[('W', 604_800.0), ('D', 86_400.0)])?;
    if let Some(time_part) = time_part {
        secs += parse_components(time_part, &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)])?;
    }
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(secs))
}

fn parse_components(part: &str, units: &[(char, f64)]) -> Option<f64> {
    let mut secs = 0f64;
    let mut number = String::new();
    for c in part.chars() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
        } else {
            let scale = units.iter().find(|(u, _)| *u == c).map(|(_, s)| *s)?;
            let n: f64 = number.parse().ok()?;
            secs += n * scale;
            number.clear();
        }
    }
    if !number.is_empty() {
        return None;
    }
    Some(secs)
}
