//! Rolling-window aggregation: identical consecutive events (same
//! source+type+device within the window) are folded into one event
//! with `aggregate_count`/`aggregate_first`/`aggregate_last`. The last
//! of a run is flushed when the window closes or a non-matching event
//! arrives.

use crate::events::{Event, EventSource};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Clone)]
struct Run {
    key: (String, EventSource, String, String), // device_id, source, type, dedup title
    folded: Event,
    window_start: Instant,
}

pub struct Aggregator {
    window: Duration,
    open: HashMap<String, Run>, // keyed by device_id, one open run per device
}

impl Aggregator {
    pub fn new(window: Duration) -> Self {
        Aggregator {
            window,
            open: HashMap::new(),
        }
    }

    fn key_for(event: &Event) -> (String, EventSource, String, String) {
        let (source, event_type, title) = event.default_dedup_key();
        (event.device_id.clone(), source, event_type, title)
    }

    /// Offers `event` into the aggregator. Returns `Some(event)` when a
    /// previously-open run must be flushed now (window closed or a
    /// non-matching event arrived), or when the event starts a run that
    /// should be emitted immediately (non-aggregatable single event is
    /// represented as a 1-count run, flushed on the next offer or tick).
    pub fn offer(&mut self, event: Event) -> Option<Event> {
        let device = event.device_id.clone();
        let key = Self::key_for(&event);
        let now = Instant::now();

        match self.open.remove(&device) {
            Some(mut run) if run.key == key && now.duration_since(run.window_start) < self.window => {
                run.folded.aggregate_count = Some(run.folded.aggregate_count.unwrap_or(1) + 1);
                run.folded.aggregate_last = Some(event.relative_time);
                self.open.insert(device, run);
                None
            }
            Some(run) => {
                // Window closed or a different event arrived: flush the
                // old run, open a new one, return the flushed event.
                self.open.insert(
                    device,
                    Run {
                        key,
                        folded: Event {
                            aggregate_count: Some(1),
                            aggregate_first: Some(event.relative_time),
                            aggregate_last: Some(event.relative_time),
                            ..event.clone()
                        },
                        window_start: now,
                    },
                );
                Some(run.folded)
            }
            None => {
                self.open.insert(
                    device,
                    Run {
                        key,
                        folded: Event {
                            aggregate_count: Some(1),
                            aggregate_first: Some(event.relative_time),
                            aggregate_last: Some(event.relative_time),
                            ..event
                        },
                        window_start: now,
                    },
                );
                None
            }
        }
    }

    /// Flushes every still-open run through `sink`, used on shutdown.
    pub fn flush_all<F: FnMut(Event)>(&mut self, mut sink: F) {
        for (_, run) in self.open.drain() {
            sink(run.folded);
        }
    }

    /// Removes and returns every run whose window has elapsed as of
    /// `now`, independent of whether another event arrives for that
    /// device. Without this, a run sitting at the tail of a device's
    /// event stream would never be dispatched to the store.
    pub fn sweep_expired(&mut self, now: Instant) -> Vec<Event> {
        let expired: Vec<String> = self
            .open
            .iter()
            .filter(|(_, run)| now.duration_since(run.window_start) >= self.window)
            .map(|(device, _)| device.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|device| self.open.remove(&device))
            .map(|run| run.folded)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventCategory, EventLevel};

    fn touch(device: &str, title: &str, rel: i64) -> Event {
        let mut e = Event::new(device, EventSource::Touch, EventCategory::Interaction, "touch", EventLevel::Info, title);
        e.relative_time = rel;
        e
    }

    #[test]
    fn identical_consecutive_events_fold() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        assert!(agg.offer(touch("D1", "tap", 100)).is_none());
        assert!(agg.offer(touch("D1", "tap", 150)).is_none());
        let mut flushed = Vec::new();
        agg.flush_all(|e| flushed.push(e));
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].aggregate_count, Some(2));
        assert_eq!(flushed[0].aggregate_first, Some(100));
        assert_eq!(flushed[0].aggregate_last, Some(150));
    }

    #[test]
    fn non_matching_event_flushes_the_prior_run() {
        let mut agg = Aggregator::new(Duration::from_secs(1));
        assert!(agg.offer(touch("D1", "tap", 100)).is_none());
        let flushed = agg.offer(touch("D1", "swipe", 200));
        assert!(flushed.is_some());
        assert_eq!(flushed.unwrap().title, "tap");
    }

    #[test]
    fn sweep_expired_flushes_a_run_with_no_followup_event() {
        let mut agg = Aggregator::new(Duration::from_millis(10));
        assert!(agg.offer(touch("D1", "tap", 100)).is_none());

        // No third event ever arrives on D1; a sweep past the window
        // must still flush the run rather than leaving it open forever.
        assert!(agg.sweep_expired(Instant::now()).is_empty());
        std::thread::sleep(Duration::from_millis(15));
        let expired = agg.sweep_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].aggregate_count, Some(1));
        assert!(agg.open.is_empty());
    }
}
