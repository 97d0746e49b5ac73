//! Conjunctive criteria matching shared by `AssertionEngine` and
//! `PluginManager` filters: source/category/type/level sets, relative-time
//! window, title regex, and `DataMatcher` JSON-path predicates.

use crate::events::{DataMatcher, Event, EventCriteria, MatchOp};
use regex::Regex;
use serde_json::Value;

pub fn criteria_matches(event: &Event, criteria: &EventCriteria, precompiled_title_re: Option<&Regex>) -> bool {
    if !criteria.source.is_empty() && !criteria.source.contains(&event.source) {
        return false;
    }
    if !criteria.category.is_empty() && !criteria.category.contains(&event.category) {
        return false;
    }
    if !criteria.event_type.is_empty() && !criteria.event_type.contains(&event.event_type) {
        return false;
    }
    if !criteria.level.is_empty() && !criteria.level.contains(&event.level) {
        return false;
    }
    if let Some(start) = criteria.relative_time_start {
        if event.relative_time < start {
            return false;
        }
    }
    if let Some(end) = criteria.relative_time_end {
        if event.relative_time > end {
            return false;
        }
    }
    if let Some(pattern) = &criteria.title_regex {
        let matches = match precompiled_title_re {
            Some(re) => re.is_match(&event.title),
            None => Regex::new(pattern).map(|re| re.is_match(&event.title)).unwrap_or(false),
        };
        if !matches {
            return false;
        }
    }
    for matcher in &criteria.data_matchers {
        if !data_matcher_satisfied(event, matcher) {
            return false;
        }
    }
    true
}

fn data_matcher_satisfied(event: &Event, matcher: &DataMatcher) -> bool {
    let Some(data) = &event.data else {
        return matcher.op == MatchOp::Exists && matcher.value.as_ref().map(|v| v == &Value::Bool(false)).unwrap_or(false);
    };
    let found = json_path_lookup(data, &matcher.path);

    match matcher.op {
        MatchOp::Exists => {
            let want = matcher.value.as_ref().and_then(|v| v.as_bool()).unwrap_or(true);
            found.is_some() == want
        }
        MatchOp::Eq => found.map(|v| Some(v) == matcher.value.as_ref()).unwrap_or(false),
        MatchOp::Ne => found.map(|v| Some(v) != matcher.value.as_ref()).unwrap_or(true),
        MatchOp::Contains => match (found, &matcher.value) {
            (Some(Value::String(s)), Some(Value::String(needle))) => s.contains(needle.as_str()),
            (Some(Value::Array(items)), Some(needle)) => items.contains(needle),
            _ => false,
        },
        MatchOp::Regex => match (found, &matcher.value) {
            (Some(Value::String(s)), Some(Value::String(pattern))) => {
                Regex::new(pattern).map(|re| re.is_match(s)).unwrap_or(false)
            }
            _ => false,
        },
        MatchOp::Gt | MatchOp::Gte | MatchOp::Lt | MatchOp::Lte => {
            let (Some(found_num), Some(want_num)) = (
                found.and_then(|v| v.as_f64()),
                matcher.value.as_ref().and_then(|v| v.as_f64()),
            ) else {
                return false;
            };
            match matcher.op {
                MatchOp::Gt => found_num > want_num,
                MatchOp::Gte => found_num >= want_num,
                MatchOp::Lt => found_num < want_num,
                MatchOp::Lte => found_num <= want_num,
                _ => unreachable!(),
            }
        }
    }
}

/// Minimal dotted-path lookup into a JSON value, e.g. `"a.b.c"`. Array
/// indices are not supported — the assertion criteria language only
/// needs object-field traversal for `DataMatcher{path,...}`.
fn json_path_lookup(root: &Value, path: &str) -> Option<Value> {
    if path.is_empty() {
        return Some(root.clone());
    }
    let mut current = root;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, EventLevel, EventSource};

    #[test]
    fn data_matcher_checks_nested_path() {
        let mut event = Event::new("D1", EventSource::Network, EventCategory::Network, "http_request", EventLevel::Info, "req");
        event.data = Some(serde_json::json!({"status": 500, "headers": {"retry": "true"}}));

        let matcher = DataMatcher { path: "status".into(), op: MatchOp::Gte, value: Some(serde_json::json!(500)) };
        assert!(data_matcher_satisfied(&event, &matcher));

        let matcher = DataMatcher { path: "headers.retry".into(), op: MatchOp::Eq, value: Some(serde_json::json!("true")) };
        assert!(data_matcher_satisfied(&event, &matcher));
    }
}
