//! `AssertionEngine`: evaluates declarative checks over stored events.
//!
//! Execution is idempotent: it queries the store, evaluates the rule in
//! memory, persists one new result row, and emits an `assertion_result`
//! event — nothing in the source data is ever mutated, a read-only
//! query style throughout.

mod matcher;

pub use matcher::criteria_matches;

use crate::error::CoreResult;
use crate::events::{
    generate_event_id, Assertion, AssertionResult, AssertionType, Event, EventCategory, EventLevel, EventSource,
};
use crate::pipeline::EventPipeline;
use crate::store::query::EventQuery;
use crate::store::EventStore;
use regex::Regex;
use std::sync::Arc;
use tracing::warn;

pub struct AssertionEngine {
    store: Arc<EventStore>,
    pipeline: Arc<EventPipeline>,
}

impl AssertionEngine {
    pub fn new(store: Arc<EventStore>, pipeline: Arc<EventPipeline>) -> Self {
        AssertionEngine { store, pipeline }
    }

    /// Runs `assertion` against `session_id`'s events and persists the result.
    pub async fn execute(&self, assertion: &Assertion, session_id: &str) -> CoreResult<AssertionResult> {
        let started = std::time::Instant::now();

        let mut query = EventQuery::for_session(session_id);
        query.include_data = true;
        query.limit = 100_000;
        if let Some(start) = assertion.criteria.relative_time_start {
            query.relative_time_start = Some(start);
        }
        if let Some(end) = assertion.criteria.relative_time_end {
            query.relative_time_end = Some(end);
        }
        if !assertion.criteria.source.is_empty() {
            query.source = assertion.criteria.source.clone();
        }
        if !assertion.criteria.category.is_empty() {
            query.category = assertion.criteria.category.clone();
        }
        if !assertion.criteria.event_type.is_empty() {
            query.event_type = assertion.criteria.event_type.clone();
        }
        if !assertion.criteria.level.is_empty() {
            query.level = assertion.criteria.level.clone();
        }

        let page = self.store.query_events(query).await?;
        let mut events = page.events;
        events.sort_by_key(|e| (e.relative_time, e.id.clone()));

        let title_re = assertion
            .criteria
            .title_regex
            .as_deref()
            .and_then(|p| Regex::new(p).ok());

        let matched: Vec<Event> = events
            .into_iter()
            .filter(|e| criteria_matches(e, &assertion.criteria, title_re.as_ref()))
            .collect();

        let (passed, actual) = evaluate(&assertion.assertion_type, &matched);

        let result = AssertionResult {
            id: generate_event_id(),
            assertion_id: assertion.id.clone(),
            session_id: session_id.to_string(),
            passed,
            matched_event_ids: matched.iter().map(|e| e.id.clone()).collect(),
            actual: Some(actual),
            expected: assertion.expected.clone(),
            duration_ms: started.elapsed().as_millis() as i64,
            executed_at: chrono::Utc::now().timestamp_millis(),
        };

        self.store.write_assertion_result(result.clone()).await?;

        let mut event = Event::new(
            "",
            EventSource::Assertion,
            EventCategory::Diagnostic,
            "assertion_result",
            if passed { EventLevel::Info } else { EventLevel::Error },
            format!("assertion '{}' {}", assertion.name, if passed { "passed" } else { "failed" }),
        );
        event.session_id = session_id.to_string();
        event.data = Some(serde_json::json!({
            "assertion_id": assertion.id,
            "passed": passed,
            "matched_event_ids": result.matched_event_ids,
        }));
        if let Err(e) = self.pipeline.emit(event).await {
            warn!(assertion_id = %assertion.id, error = %e, "failed to emit assertion_result event");
        }

        Ok(result)
    }
}

fn evaluate(assertion_type: &AssertionType, matched: &[Event]) -> (bool, serde_json::Value) {
    match assertion_type {
        AssertionType::Exists => (!matched.is_empty(), serde_json::json!({"count": matched.len()})),
        AssertionType::NotExists => (matched.is_empty(), serde_json::json!({"count": matched.len()})),
        AssertionType::Count { min_count, max_count, count } => {
            let n = matched.len() as u32;
            let mut ok = true;
            if let Some(min) = min_count {
                ok &= n >= *min;
            }
            if let Some(max) = max_count {
                ok &= n <= *max;
            }
            if let Some(exact) = count {
                ok &= n == *exact;
            }
            (ok, serde_json::json!({"count": n}))
        }
        AssertionType::Sequence { sub_criteria } => evaluate_sequence(sub_criteria, matched),
        AssertionType::Timing { min_interval, max_interval } => evaluate_timing(matched, *min_interval, *max_interval),
        AssertionType::Condition { op, value } => {
            let n = matched.len() as i64;
            let ok = match op.as_str() {
                "<" => n < *value,
                "<=" => n <= *value,
                "=" => n == *value,
                ">=" => n >= *value,
                ">" => n > *value,
                _ => false,
            };
            (ok, serde_json::json!({"count": n}))
        }
    }
}

/// Events sorted by timestamp are scanned once; each sub-criterion is
/// satisfied by the earliest matching event after the previous match.
fn evaluate_sequence(sub_criteria: &[crate::events::EventCriteria], matched: &[Event]) -> (bool, serde_json::Value) {
    let mut cursor = 0usize;
    let mut matched_ids = Vec::new();
    for criteria in sub_criteria {
        let mut found = None;
        for (i, e) in matched.iter().enumerate().skip(cursor) {
            if criteria_matches(e, criteria, None) {
                found = Some(i);
                break;
            }
        }
        match found {
            Some(i) => {
                matched_ids.push(matched[i].id.clone());
                cursor = i + 1;
            }
            None => return (false, serde_json::json!({"matched": matched_ids})),
        }
    }
    (true, serde_json::json!({"matched": matched_ids}))
}

/// Between adjacent events in the matched set, every inter-event gap
/// must lie in `[min_interval, max_interval]`. Fewer than two matches fails.
fn evaluate_timing(matched: &[Event], min_interval: i64, max_interval: i64) -> (bool, serde_json::Value) {
    if matched.len() < 2 {
        return (false, serde_json::json!({"reason": "fewer than two matches"}));
    }
    let mut gaps = Vec::new();
    for pair in matched.windows(2) {
        gaps.push(pair[1].relative_time - pair[0].relative_time);
    }
    let ok = gaps.iter().all(|g| *g >= min_interval && *g <= max_interval);
    (ok, serde_json::json!({"gaps": gaps}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCriteria, EventLevel};

    fn ev(rel: i64, title: &str) -> Event {
        let mut e = Event::new("D1", EventSource::System, EventCategory::App, "t", EventLevel::Info, title);
        e.id = format!("e{rel}");
        e.relative_time = rel;
        e
    }

    #[test]
    fn sequence_passes_in_order() {
        let events = vec![ev(100, "launch"), ev(200, "render"), ev(900, "click"), ev(1200, "response")];
        let sub = vec![
            EventCriteria { title_regex: Some("launch".into()), ..Default::default() },
            EventCriteria { title_regex: Some("click".into()), ..Default::default() },
            EventCriteria { title_regex: Some("response".into()), ..Default::default() },
        ];
        let (passed, _) = evaluate_sequence(&sub, &events);
        assert!(passed);
    }

    #[test]
    fn sequence_fails_out_of_order() {
        let events = vec![ev(100, "launch"), ev(200, "render"), ev(900, "click"), ev(1200, "response")];
        let sub = vec![
            EventCriteria { title_regex: Some("response".into()), ..Default::default() },
            EventCriteria { title_regex: Some("click".into()), ..Default::default() },
        ];
        let (passed, _) = evaluate_sequence(&sub, &events);
        assert!(!passed);
    }

    #[test]
    fn timing_detects_out_of_range_gap() {
        let events = vec![ev(0, "a"), ev(100, "b"), ev(5000, "c")];
        let (passed, _) = evaluate_timing(&events, 0, 1000);
        assert!(!passed);
    }
}
