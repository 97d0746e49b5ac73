//! Touch capture: discovers the touchscreen input device, parses the
//! raw kernel event stream, classifies strokes, and — in `precise`
//! mode — proposes UI selectors for each stroke's endpoint.
//!
//! Grounded in the event recorder's `getevent -lt` piping and
//! `find_touch_device`/`parse_getevent_value` scanning, generalized
//! from a print-what-you-see monitor into a real state machine that
//! produces a replayable `TouchScript`.

use crate::bridge::DeviceBridge;
use crate::config::TouchSection;
use crate::error::{CoreError, CoreResult};
use crate::events::{
    Event, EventCategory, EventLevel, EventSource, Selector, SelectorType, TouchEventType, TouchScript, TouchScriptEvent,
};
use crate::pipeline::EventPipeline;
use crate::ui::{self, ThrottledDumper};
use async_trait::async_trait;
use regex::Regex;
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordMode {
    Fast,
    Precise,
}

/// Lets the caller pick among ranked selector candidates for a stroke
/// captured in `precise` mode. The default (`FirstCandidate`) always
/// takes the top-ranked candidate, so recording never blocks waiting on
/// an interactive prompt unless the caller supplies one.
#[async_trait]
pub trait SelectorPrompt: Send + Sync {
    async fn choose(&self, candidates: &[Selector]) -> Selector;
}

pub struct FirstCandidate;

#[async_trait]
impl SelectorPrompt for FirstCandidate {
    async fn choose(&self, candidates: &[Selector]) -> Selector {
        candidates.first().cloned().unwrap_or(Selector { selector_type: SelectorType::Coordinates, value: "0,0".into(), index: None })
    }
}

pub struct TouchRecorder {
    bridge: Arc<dyn DeviceBridge>,
    pipeline: Arc<EventPipeline>,
    config: TouchSection,
}

pub struct RecorderHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    paused: Arc<std::sync::atomic::AtomicBool>,
    join: tokio::task::JoinHandle<CoreResult<TouchScript>>,
}

impl RecorderHandle {
    /// Signals the capture loop to drain (grace period ≤ 100 ms, per
    /// spec) and finish, returning the recorded script.
    pub async fn stop(mut self) -> CoreResult<TouchScript> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(CoreError::fatal(format!("recorder task panicked: {e}"))),
        }
    }

    /// Incoming raw events are dropped, not buffered, while paused — a
    /// resumed recording simply has a gap where no strokes were captured.
    pub fn pause(&self) {
        self.paused.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

impl TouchRecorder {
    pub fn new(bridge: Arc<dyn DeviceBridge>, pipeline: Arc<EventPipeline>, config: TouchSection) -> Self {
        TouchRecorder { bridge, pipeline, config }
    }

    pub async fn start(
        &self,
        device_id: &str,
        session_id: &str,
        mode: RecordMode,
        script_name: String,
        device_model: String,
        screen_w: i32,
        screen_h: i32,
        prompt: Arc<dyn SelectorPrompt>,
    ) -> CoreResult<RecorderHandle> {
        let (dev_path, x_range, y_range) = discover_touch_device(self.bridge.as_ref(), device_id, &self.config.device_keywords).await?;
        info!(device_id, dev_path, "touch device discovered");

        let stream = self.bridge.stream_lines(device_id, &["shell", "getevent", "-lt", &dev_path]).await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        let paused = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let dumper = (mode == RecordMode::Precise).then(|| {
            Arc::new(ThrottledDumper::new(
                self.bridge.clone(),
                Default::default(),
                Duration::from_millis(self.config.precise_dump_min_interval_ms),
                Duration::from_millis(self.config.precise_dump_cache_ms),
            ))
        });

        let task = CaptureTask {
            device_id: device_id.to_string(),
            session_id: session_id.to_string(),
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            mode,
            x_range,
            y_range,
            screen_w,
            screen_h,
            dumper,
            prompt,
            paused: paused.clone(),
        };

        let join = tokio::spawn(task.run(stream, stop_rx, script_name, device_model));

        Ok(RecorderHandle { stop_tx: Some(stop_tx), paused, join })
    }
}

struct CaptureTask {
    device_id: String,
    session_id: String,
    pipeline: Arc<EventPipeline>,
    config: TouchSection,
    mode: RecordMode,
    x_range: (i32, i32),
    y_range: (i32, i32),
    screen_w: i32,
    screen_h: i32,
    dumper: Option<Arc<ThrottledDumper>>,
    prompt: Arc<dyn SelectorPrompt>,
    paused: Arc<std::sync::atomic::AtomicBool>,
}

#[derive(Default)]
struct Stroke {
    start_time: Option<Instant>,
    start_x: Option<i32>,
    start_y: Option<i32>,
    cur_x: Option<i32>,
    cur_y: Option<i32>,
    active: bool,
}

impl CaptureTask {
    async fn run(
        self,
        mut stream: crate::bridge::LineStream,
        mut stop_rx: oneshot::Receiver<()>,
        script_name: String,
        device_model: String,
    ) -> CoreResult<TouchScript> {
        let script_start = Instant::now();
        let mut stroke = Stroke::default();
        let mut events = Vec::new();
        let mut last_event_end: Option<Instant> = None;
        let mut cumulative_adjustment_ms: i64 = 0;

        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                line = stream.rx.recv() => {
                    let Some(line) = line else { break };
                    if self.paused.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some(raw) = parse_raw_event(&line) {
                        self.apply_raw_event(raw, &mut stroke, script_start, &mut events, &mut last_event_end, &mut cumulative_adjustment_ms).await;
                    }
                }
            }
        }

        // Drain briefly so an in-flight UP isn't lost (≤ 100ms grace, per spec).
        let drain_deadline = Instant::now() + Duration::from_millis(100);
        while Instant::now() < drain_deadline {
            match tokio::time::timeout(drain_deadline.saturating_duration_since(Instant::now()), stream.rx.recv()).await {
                Ok(Some(line)) => {
                    if let Some(raw) = parse_raw_event(&line) {
                        self.apply_raw_event(raw, &mut stroke, script_start, &mut events, &mut last_event_end, &mut cumulative_adjustment_ms).await;
                    }
                }
                _ => break,
            }
        }
        stream.kill().await;

        Ok(TouchScript {
            name: script_name,
            device_model,
            resolution: format!("{}x{}", self.screen_w, self.screen_h),
            created_at: chrono::Utc::now(),
            events,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_raw_event(
        &self,
        raw: RawEvent,
        stroke: &mut Stroke,
        script_start: Instant,
        events: &mut Vec<TouchScriptEvent>,
        last_event_end: &mut Option<Instant>,
        cumulative_adjustment_ms: &mut i64,
    ) {
        match raw.kind {
            RawEventKind::TrackingId(id) => {
                if id != -1 && !stroke.active {
                    stroke.active = true;
                    stroke.start_time = Some(Instant::now());
                    stroke.start_x = stroke.cur_x;
                    stroke.start_y = stroke.cur_y;
                } else if id == -1 && stroke.active {
                    self.close_stroke(stroke, script_start, events, last_event_end, cumulative_adjustment_ms).await;
                }
            }
            RawEventKind::BtnTouch(down) => {
                if down && !stroke.active {
                    stroke.active = true;
                    stroke.start_time = Some(Instant::now());
                    stroke.start_x = stroke.cur_x;
                    stroke.start_y = stroke.cur_y;
                } else if !down && stroke.active {
                    self.close_stroke(stroke, script_start, events, last_event_end, cumulative_adjustment_ms).await;
                }
            }
            RawEventKind::PositionX(v) => {
                stroke.cur_x = Some(v);
                if stroke.active && stroke.start_x.is_none() {
                    stroke.start_x = Some(v);
                }
            }
            RawEventKind::PositionY(v) => {
                stroke.cur_y = Some(v);
                if stroke.active && stroke.start_y.is_none() {
                    stroke.start_y = Some(v);
                }
            }
        }
    }

    async fn close_stroke(
        &self,
        stroke: &mut Stroke,
        script_start: Instant,
        events: &mut Vec<TouchScriptEvent>,
        last_event_end: &mut Option<Instant>,
        cumulative_adjustment_ms: &mut i64,
    ) {
        let (Some(start_time), Some(start_x), Some(start_y)) = (stroke.start_time, stroke.start_x, stroke.start_y) else {
            *stroke = Stroke::default();
            return;
        };
        let end_x = stroke.cur_x.unwrap_or(start_x);
        let end_y = stroke.cur_y.unwrap_or(start_y);
        let duration_ms = start_time.elapsed().as_millis() as i64;

        let sx = scale(start_x, self.x_range, self.screen_w);
        let sy = scale(start_y, self.y_range, self.screen_h);
        let ex = scale(end_x, self.x_range, self.screen_w);
        let ey = scale(end_y, self.y_range, self.screen_h);

        let dx = (ex - sx) as i64;
        let dy = (ey - sy) as i64;
        let dist_sq = dx * dx + dy * dy;

        let (event_type, x2, y2, duration) = if duration_ms >= self.config.long_press_ms as i64 {
            (TouchEventType::LongPress, None, None, Some(duration_ms))
        } else if dist_sq < self.config.tap_distance_sq_px {
            (TouchEventType::Tap, None, None, None)
        } else {
            (TouchEventType::Swipe, Some(ex), Some(ey), Some(duration_ms))
        };

        let mut selector = None;
        if self.mode == RecordMode::Precise {
            if let Some(dumper) = &self.dumper {
                match dumper.get(&self.device_id).await {
                    Ok(nodes) => {
                        if let Some(node) = ui::node_at_point(&nodes, sx, sy) {
                            let candidates = ui::propose_selectors(node);
                            selector = Some(self.prompt.choose(&candidates).await);
                        }
                    }
                    Err(e) => warn!(error = %e, "precise-mode ui dump failed, recording coordinates only"),
                }
            }
        }

        let elapsed_ms = start_time.duration_since(script_start).as_millis() as i64;
        let timestamp = if self.mode == RecordMode::Precise {
            if let Some(prev) = last_event_end {
                let gap = start_time.duration_since(*prev).as_millis() as i64;
                if gap > self.config.gap_compress_threshold_ms {
                    *cumulative_adjustment_ms += gap - self.config.gap_compress_to_ms;
                }
            }
            elapsed_ms - *cumulative_adjustment_ms
        } else {
            elapsed_ms
        };
        *last_event_end = Some(Instant::now());

        events.push(TouchScriptEvent {
            timestamp,
            event_type,
            x: sx,
            y: sy,
            x2,
            y2,
            duration,
            selector: selector.clone(),
        });

        let title = match event_type {
            TouchEventType::Tap => "tap".to_string(),
            TouchEventType::LongPress => "long_press".to_string(),
            TouchEventType::Swipe => "swipe".to_string(),
            _ => "touch".to_string(),
        };
        let mut event = Event::new(self.device_id.clone(), EventSource::Touch, EventCategory::Interaction, title.clone(), EventLevel::Info, title);
        event.session_id = self.session_id.clone();
        event.data = Some(serde_json::json!({"x": sx, "y": sy, "x2": x2, "y2": y2, "duration_ms": duration}));
        let _ = self.pipeline.emit(event).await;

        *stroke = Stroke::default();
    }
}

fn scale(raw: i32, range: (i32, i32), screen: i32) -> i32 {
    let (min, max) = range;
    if max <= min {
        return raw;
    }
    (((raw - min) as f64) * screen as f64 / (max - min + 1) as f64).round() as i32
}

enum RawEventKind {
    TrackingId(i64),
    BtnTouch(bool),
    PositionX(i32),
    PositionY(i32),
}

struct RawEvent {
    kind: RawEventKind,
}

/// Parses a `[timestamp] EV_TYPE CODE VALUE` kernel event line. `VALUE`
/// is hex except for `BTN_TOUCH`, which carries the literal `DOWN`/`UP`.
fn parse_raw_event(line: &str) -> Option<RawEvent> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return None;
    }
    let code = parts[parts.len() - 2];
    let value = parts[parts.len() - 1];

    let kind = match code {
        "ABS_MT_TRACKING_ID" => RawEventKind::TrackingId(parse_hex_signed(value)?),
        "BTN_TOUCH" => RawEventKind::BtnTouch(value.eq_ignore_ascii_case("DOWN")),
        "ABS_MT_POSITION_X" => RawEventKind::PositionX(parse_hex_unsigned(value)?),
        "ABS_MT_POSITION_Y" => RawEventKind::PositionY(parse_hex_unsigned(value)?),
        _ => return None,
    };
    Some(RawEvent { kind })
}

fn parse_hex_unsigned(value: &str) -> Option<i32> {
    let v = value.trim_start_matches("0x");
    i64::from_str_radix(v, 16).ok().map(|n| n as i32)
}

/// `ABS_MT_TRACKING_ID`'s "no finger" value is the 32-bit `-1`, encoded
/// as `ffffffff` in getevent's hex output.
fn parse_hex_signed(value: &str) -> Option<i64> {
    let v = value.trim_start_matches("0x");
    let raw = u32::from_str_radix(v, 16).ok()?;
    Some(raw as i32 as i64)
}

fn position_range_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"min\s+(-?\d+),\s*max\s+(-?\d+)").unwrap())
}

/// Scans `getevent -pl` output for the highest-scoring touch input
/// device: +1 for multi-touch position capability, +10 for a name
/// matching any configured keyword. Ties keep discovery order.
async fn discover_touch_device(bridge: &dyn DeviceBridge, device_id: &str, keywords: &[String]) -> CoreResult<(String, (i32, i32), (i32, i32))> {
    let output = bridge.exec(device_id, &["shell", "getevent", "-pl"]).await?;
    let text = String::from_utf8_lossy(&output);

    let mut best: Option<(String, i32, (i32, i32), (i32, i32))> = None;
    let mut cur_path: Option<String> = None;
    let mut cur_name = String::new();
    let mut has_x = false;
    let mut has_y = false;
    let mut x_range = (0, 0);
    let mut y_range = (0, 0);

    let mut flush = |path: &Option<String>, name: &str, has_x: bool, has_y: bool, x_range: (i32, i32), y_range: (i32, i32), best: &mut Option<(String, i32, (i32, i32), (i32, i32))>| {
        let Some(path) = path else { return };
        if !has_x {
            return;
        }
        let mut score = 1;
        let lower = name.to_lowercase();
        if keywords.iter().any(|k| lower.contains(&k.to_lowercase())) {
            score += 10;
        }
        if best.as_ref().map(|(_, s, ..)| score > *s).unwrap_or(true) {
            *best = Some((path.clone(), score, x_range, y_range));
        }
    };

    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("add device") {
            flush(&cur_path, &cur_name, has_x, has_y, x_range, y_range, &mut best);
            cur_path = trimmed.find("/dev/input/").map(|i| trimmed[i..].trim().to_string());
            cur_name.clear();
            has_x = false;
            has_y = false;
        } else if trimmed.starts_with("name:") {
            cur_name = trimmed.trim_start_matches("name:").trim().trim_matches('"').to_string();
        } else if trimmed.contains("ABS_MT_POSITION_X") {
            has_x = true;
            if let Some(c) = position_range_re().captures(trimmed) {
                x_range = (c[1].parse().unwrap_or(0), c[2].parse().unwrap_or(0));
            }
        } else if trimmed.contains("ABS_MT_POSITION_Y") {
            has_y = true;
            if let Some(c) = position_range_re().captures(trimmed) {
                y_range = (c[1].parse().unwrap_or(0), c[2].parse().unwrap_or(0));
            }
        }
    }
    flush(&cur_path, &cur_name, has_x, has_y, x_range, y_range, &mut best);

    best.map(|(path, _, xr, yr)| (path, xr, yr)).ok_or_else(|| CoreError::not_found("no touch input device found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tracking_id_and_position_lines() {
        let a = parse_raw_event("[   12345.678901] EV_ABS       ABS_MT_TRACKING_ID   0000002a").unwrap();
        assert!(matches!(a.kind, RawEventKind::TrackingId(42)));

        let b = parse_raw_event("[   12345.678901] EV_ABS       ABS_MT_POSITION_X    00000190").unwrap();
        assert!(matches!(b.kind, RawEventKind::PositionX(400)));

        let c = parse_raw_event("[   12345.678901] EV_ABS       ABS_MT_TRACKING_ID   ffffffff").unwrap();
        assert!(matches!(c.kind, RawEventKind::TrackingId(-1)));

        let d = parse_raw_event("[   12345.678901] EV_KEY       BTN_TOUCH            DOWN").unwrap();
        assert!(matches!(d.kind, RawEventKind::BtnTouch(true)));
    }

    #[test]
    fn scale_maps_raw_range_to_screen() {
        assert_eq!(scale(0, (0, 1079), 1080), 0);
        assert_eq!(scale(1079, (0, 1079), 1080), 1080);
    }

    #[tokio::test]
    async fn discovers_highest_scoring_device_from_getevent_pl() {
        struct FakeBridge;
        #[async_trait]
        impl DeviceBridge for FakeBridge {
            async fn exec(&self, _device_id: &str, _args: &[&str]) -> CoreResult<Vec<u8>> {
                Ok(br#"add device 1: /dev/input/event3
  name:     "gpio-keys"
add device 2: /dev/input/event5
  name:     "goodix_ts"
  events:
    ABS (0003): ABS_MT_POSITION_X    : value 0, min 0, max 1079, fuzz 0, flat 0, resolution 0
                ABS_MT_POSITION_Y    : value 0, min 0, max 2279, fuzz 0, flat 0, resolution 0
"#.to_vec())
            }
            async fn stream_lines(&self, _device_id: &str, _args: &[&str]) -> CoreResult<crate::bridge::LineStream> {
                unimplemented!()
            }
            async fn push(&self, _device_id: &str, _local: &str, _remote: &str) -> CoreResult<()> {
                unimplemented!()
            }
            async fn pull(&self, _device_id: &str, _remote: &str, _local: &str) -> CoreResult<()> {
                unimplemented!()
            }
        }

        let keywords = vec!["touch".to_string()];
        let (path, xr, yr) = discover_touch_device(&FakeBridge, "D1", &keywords).await.unwrap();
        assert_eq!(path, "/dev/input/event5");
        assert_eq!(xr, (0, 1079));
        assert_eq!(yr, (0, 2279));
    }
}
