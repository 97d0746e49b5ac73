//! Replays a recorded `TouchScript` against a (possibly different)
//! device: rescales coordinates to the target resolution, re-resolves
//! selector-bearing taps against the live UI ("smart tap"), and honours
//! pause/resume/cancel at every step.

use crate::bridge::DeviceBridge;
use crate::config::{TouchSection, UiSection};
use crate::error::{CoreError, CoreResult};
use crate::events::{Selector, SelectorType, TouchEventType, TouchScript, TouchScriptEvent};
use crate::ui;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, warn};

/// Per-device pause signal: `Pause` replaces the channel and sets the
/// flag; `Resume` flips the flag and lets every waiter through.
struct PauseGate {
    paused: AtomicBool,
    tx: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        PauseGate { paused: AtomicBool::new(false), tx }
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        let _ = self.tx.send(true);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        let _ = self.tx.send(false);
    }

    async fn wait_if_paused(&self, cancel: &watch::Receiver<bool>) {
        if !self.paused.load(Ordering::SeqCst) {
            return;
        }
        let mut rx = self.tx.subscribe();
        let mut cancel = cancel.clone();
        loop {
            if *cancel.borrow() || !*rx.borrow() {
                return;
            }
            tokio::select! {
                _ = rx.changed() => {}
                _ = cancel.changed() => {}
            }
        }
    }
}

pub struct ScriptPlayer {
    bridge: Arc<dyn DeviceBridge>,
    touch_config: TouchSection,
    ui_config: UiSection,
}

pub struct PlaybackHandle {
    gate: Arc<PauseGate>,
    cancel_tx: watch::Sender<bool>,
    join: tokio::task::JoinHandle<CoreResult<()>>,
}

impl PlaybackHandle {
    pub fn pause(&self) {
        self.gate.pause();
    }

    pub fn resume(&self) {
        self.gate.resume();
    }

    pub async fn stop(self) -> CoreResult<()> {
        let _ = self.cancel_tx.send(true);
        self.gate.resume();
        match self.join.await {
            Ok(r) => r,
            Err(e) => Err(CoreError::fatal(format!("player task panicked: {e}"))),
        }
    }

    pub async fn join(self) -> CoreResult<()> {
        match self.join.await {
            Ok(r) => r,
            Err(e) => Err(CoreError::fatal(format!("player task panicked: {e}"))),
        }
    }
}

impl ScriptPlayer {
    pub fn new(bridge: Arc<dyn DeviceBridge>, touch_config: TouchSection, ui_config: UiSection) -> Self {
        ScriptPlayer { bridge, touch_config, ui_config }
    }

    pub async fn play(&self, script: TouchScript, device_id: &str, target_w: i32, target_h: i32) -> CoreResult<PlaybackHandle> {
        let (script_w, script_h) = script
            .resolution_wh()
            .ok_or_else(|| CoreError::validation(format!("script has unparseable resolution: {}", script.resolution)))?;
        let scale_x = target_w as f64 / script_w as f64;
        let scale_y = target_h as f64 / script_h as f64;

        let gate = Arc::new(PauseGate::new());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let task = PlaybackTask {
            bridge: self.bridge.clone(),
            touch_config: self.touch_config.clone(),
            ui_config: self.ui_config.clone(),
            device_id: device_id.to_string(),
            scale_x,
            scale_y,
            gate: gate.clone(),
            cancel_rx: cancel_rx.clone(),
        };

        let join = tokio::spawn(task.run(script));

        Ok(PlaybackHandle { gate, cancel_tx, join })
    }
}

struct PlaybackTask {
    bridge: Arc<dyn DeviceBridge>,
    touch_config: TouchSection,
    ui_config: UiSection,
    device_id: String,
    scale_x: f64,
    scale_y: f64,
    gate: Arc<PauseGate>,
    cancel_rx: watch::Receiver<bool>,
}

impl PlaybackTask {
    async fn run(self, script: TouchScript) -> CoreResult<()> {
        let start = Instant::now();

        for event in &script.events {
            if *self.cancel_rx.borrow() {
                return Ok(());
            }
            self.gate.wait_if_paused(&self.cancel_rx).await;
            if *self.cancel_rx.borrow() {
                return Ok(());
            }

            let target = start + Duration::from_millis(event.timestamp.max(0) as u64);
            let now = Instant::now();
            if target > now {
                self.sleep_cancellable(target - now).await;
            }
            if *self.cancel_rx.borrow() {
                return Ok(());
            }

            self.play_event(event).await?;
        }

        Ok(())
    }

    async fn sleep_cancellable(&self, dur: Duration) {
        let mut cancel = self.cancel_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = cancel.changed() => {}
        }
    }

    async fn play_event(&self, event: &TouchScriptEvent) -> CoreResult<()> {
        let x = self.scale(event.x, self.scale_x);
        let y = self.scale(event.y, self.scale_y);

        match event.event_type {
            TouchEventType::Tap => {
                let (rx, ry) = self.resolve_tap_point(event, x, y).await;
                self.bridge
                    .exec(&self.device_id, &["shell", "input", "tap", &rx.to_string(), &ry.to_string()])
                    .await?;
            }
            TouchEventType::LongPress => {
                let duration = event.duration.unwrap_or(500);
                self.bridge
                    .exec(
                        &self.device_id,
                        &["shell", "input", "swipe", &x.to_string(), &y.to_string(), &x.to_string(), &y.to_string(), &duration.to_string()],
                    )
                    .await?;
            }
            TouchEventType::Swipe => {
                let x2 = self.scale(event.x2.unwrap_or(event.x), self.scale_x);
                let y2 = self.scale(event.y2.unwrap_or(event.y), self.scale_y);
                let duration = event.duration.unwrap_or(300);
                self.bridge
                    .exec(
                        &self.device_id,
                        &["shell", "input", "swipe", &x.to_string(), &y.to_string(), &x2.to_string(), &y2.to_string(), &duration.to_string()],
                    )
                    .await?;
            }
            TouchEventType::Wait => {
                if let Some(ms) = event.duration {
                    self.sleep_cancellable(Duration::from_millis(ms.max(0) as u64)).await;
                }
            }
            TouchEventType::Input => {}
        }
        Ok(())
    }

    fn scale(&self, v: i32, factor: f64) -> i32 {
        (v as f64 * factor).round() as i32
    }

    /// Re-resolves a tap's selector against the live UI, retrying every
    /// `smart_resolve_retry_ms` up to `smart_resolve_timeout_ms`; falls
    /// back to the scaled coordinates if nothing matches in time.
    async fn resolve_tap_point(&self, event: &TouchScriptEvent, fallback_x: i32, fallback_y: i32) -> (i32, i32) {
        let Some(selector) = &event.selector else {
            return (fallback_x, fallback_y);
        };
        if selector.selector_type == SelectorType::Coordinates {
            return (fallback_x, fallback_y);
        }

        let deadline = Instant::now() + Duration::from_millis(self.touch_config.smart_resolve_timeout_ms);
        loop {
            match self.try_resolve(selector, fallback_x, fallback_y).await {
                Some(point) => return point,
                None => {
                    if Instant::now() >= deadline {
                        warn!(device_id = %self.device_id, "smart tap resolution timed out, falling back to recorded coordinates");
                        return (fallback_x, fallback_y);
                    }
                    self.gate.wait_if_paused(&self.cancel_rx).await;
                    self.sleep_cancellable(Duration::from_millis(self.touch_config.smart_resolve_retry_ms)).await;
                }
            }
        }
    }

    async fn try_resolve(&self, selector: &Selector, fallback_x: i32, fallback_y: i32) -> Option<(i32, i32)> {
        let nodes = ui::dump(self.bridge.as_ref(), &self.device_id, &self.ui_config).await.ok()?;
        let candidates = ui::resolve_selector(&nodes, selector);
        if candidates.is_empty() {
            return None;
        }
        let best = candidates.into_iter().min_by_key(|n| {
            let (cx, cy) = n.bounds.center();
            let dx = (cx - fallback_x) as i64;
            let dy = (cy - fallback_y) as i64;
            dx * dx + dy * dy
        })?;
        info!(device_id = %self.device_id, "smart tap resolved selector to live element");
        Some(best.bounds.center())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn script_with_events(events: Vec<TouchScriptEvent>) -> TouchScript {
        TouchScript { name: "t".into(), device_model: "pixel".into(), resolution: "1080x2280".into(), created_at: chrono::Utc::now(), events }
    }

    #[test]
    fn resolution_scale_is_identity_for_matching_resolution() {
        let script = script_with_events(vec![]);
        let (w, h) = script.resolution_wh().unwrap();
        assert_eq!((w, h), (1080, 2280));
    }

    #[tokio::test]
    async fn pause_gate_blocks_until_resumed() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let gate2 = gate.clone();
        let cancel_rx2 = cancel_rx.clone();
        let handle = tokio::spawn(async move {
            gate2.wait_if_paused(&cancel_rx2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        gate.resume();
        tokio::time::timeout(Duration::from_millis(200), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn cancel_unblocks_a_paused_wait() {
        let gate = Arc::new(PauseGate::new());
        gate.pause();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let gate2 = gate.clone();
        let cancel_rx2 = cancel_rx.clone();
        let handle = tokio::spawn(async move {
            gate2.wait_if_paused(&cancel_rx2).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_millis(200), handle).await.unwrap().unwrap();
    }
}
