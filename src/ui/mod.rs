//! UI hierarchy dump and search: invokes the on-device dumper, repairs
//! and parses the resulting XML, and answers point-containment and
//! selector queries over the resulting tree.

mod node;
mod parser;
mod search;

pub use node::{node_at_point, Bounds, UiNode};
pub use search::{find_by_attribute, find_by_expression, find_by_xpath, AttrMatch};

use crate::bridge::DeviceBridge;
use crate::config::UiSection;
use crate::error::{CoreError, CoreResult};
use crate::events::{Selector, SelectorType};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const REMOTE_DUMP_PATH: &str = "/sdcard/devbench_ui.xml";

/// Dumps the live UI hierarchy for `device_id`. Up to `config.dump_retries`
/// attempts; between attempts any stale dumper process is killed so it
/// doesn't hold the output file open.
pub async fn dump(bridge: &dyn DeviceBridge, device_id: &str, config: &UiSection) -> CoreResult<Vec<UiNode>> {
    let fut = dump_with_retries(bridge, device_id, config);
    tokio::time::timeout(Duration::from_millis(config.dump_timeout_ms), fut)
        .await
        .map_err(|_| CoreError::transient("ui hierarchy dump timed out", config.dump_retries))?
}

async fn dump_with_retries(bridge: &dyn DeviceBridge, device_id: &str, config: &UiSection) -> CoreResult<Vec<UiNode>> {
    let mut last_err = None;
    for attempt in 0..config.dump_retries.max(1) {
        match dump_once(bridge, device_id).await {
            Ok(nodes) => return Ok(nodes),
            Err(e) => {
                warn!(device_id, attempt, error = %e, "ui dump attempt failed");
                let _ = bridge.exec(device_id, &["shell", "pkill", "-f", "uiautomator"]).await;
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| CoreError::transient("ui dump failed with no attempts", 0)))
}

async fn dump_once(bridge: &dyn DeviceBridge, device_id: &str) -> CoreResult<Vec<UiNode>> {
    bridge.exec(device_id, &["shell", "uiautomator", "dump", REMOTE_DUMP_PATH]).await?;

    let local_path = std::env::temp_dir().join(format!("devbench-ui-{}.xml", sanitize(device_id)));
    bridge.pull(device_id, REMOTE_DUMP_PATH, local_path.to_string_lossy().as_ref()).await?;

    let xml = tokio::fs::read_to_string(&local_path)
        .await
        .map_err(|e| CoreError::transient(format!("failed to read pulled ui dump: {e}"), 1))?;

    parser::parse_hierarchy(&xml)
}

fn sanitize(s: &str) -> String {
    s.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

/// Resolves a `Selector` against a hierarchy; `Coordinates` selectors
/// aren't resolved here (the caller already has the raw point).
pub fn resolve_selector<'a>(roots: &'a [UiNode], selector: &Selector) -> Vec<&'a UiNode> {
    match selector.selector_type {
        SelectorType::Id => find_by_attribute(roots, "id", &selector.value, AttrMatch::Suffix),
        SelectorType::Text => find_by_attribute(roots, "text", &selector.value, AttrMatch::Eq),
        SelectorType::ContentDesc => find_by_attribute(roots, "desc", &selector.value, AttrMatch::Eq),
        SelectorType::Xpath => find_by_xpath(roots, &selector.value),
        SelectorType::Coordinates => Vec::new(),
    }
}

/// Proposes selectors for `node`, ranked `id > text > content-desc >
/// xpath > coordinates` — only candidates with a non-empty source value
/// are included ahead of the coordinates fallback.
pub fn propose_selectors(node: &UiNode) -> Vec<Selector> {
    let mut out = Vec::new();
    if !node.resource_id.is_empty() {
        out.push(Selector { selector_type: SelectorType::Id, value: node.resource_id.clone(), index: None });
    }
    if !node.text.is_empty() {
        out.push(Selector { selector_type: SelectorType::Text, value: node.text.clone(), index: None });
    }
    if !node.content_desc.is_empty() {
        out.push(Selector { selector_type: SelectorType::ContentDesc, value: node.content_desc.clone(), index: None });
    }
    if !node.class.is_empty() {
        out.push(Selector { selector_type: SelectorType::Xpath, value: format!("//{}", node.class), index: None });
    }
    let (cx, cy) = node.bounds.center();
    out.push(Selector { selector_type: SelectorType::Coordinates, value: format!("{cx},{cy}"), index: None });
    out
}

/// Throttled, cached dumper used by the touch recorder's precise mode:
/// refuses to re-dump within `min_interval`, serves a cached tree for up
/// to `cache_ttl` after that.
pub struct ThrottledDumper {
    bridge: Arc<dyn DeviceBridge>,
    config: UiSection,
    min_interval: Duration,
    cache_ttl: Duration,
    last_dump: tokio::sync::Mutex<Option<(std::time::Instant, Vec<UiNode>)>>,
}

impl ThrottledDumper {
    pub fn new(bridge: Arc<dyn DeviceBridge>, config: UiSection, min_interval: Duration, cache_ttl: Duration) -> Self {
        ThrottledDumper { bridge, config, min_interval, cache_ttl, last_dump: tokio::sync::Mutex::new(None) }
    }

    pub async fn get(&self, device_id: &str) -> CoreResult<Vec<UiNode>> {
        let mut guard = self.last_dump.lock().await;
        if let Some((at, cached)) = guard.as_ref() {
            if at.elapsed() < self.cache_ttl {
                return Ok(cached.clone());
            }
        }
        if let Some((at, _)) = guard.as_ref() {
            let wait = self.min_interval.saturating_sub(at.elapsed());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
        let nodes = dump(self.bridge.as_ref(), device_id, &self.config).await?;
        *guard = Some((std::time::Instant::now(), nodes.clone()));
        Ok(nodes)
    }
}
