//! Parses a UIAutomator hierarchy dump into a `UiNode` tree.
//!
//! The dumper's raw output sometimes carries a stray shell prompt line
//! before the `<?xml` prolog or a trailing newline-garbled entity from a
//! flaky adb pipe; `normalize` strips both before handing the bytes to
//! `quick_xml`.

use super::node::{Bounds, UiNode};
use crate::error::{CoreError, CoreResult};
use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Strips anything before the first `<` and after the last `>`, and
/// repairs bare `&` characters that aren't part of a recognised entity
/// (UIAutomator dumps occasionally emit un-escaped `&` in `text=`).
pub fn normalize(raw: &str) -> String {
    let start = raw.find('<').unwrap_or(0);
    let end = raw.rfind('>').map(|i| i + 1).unwrap_or(raw.len());
    let trimmed = &raw[start..end];

    let mut out = String::with_capacity(trimmed.len());
    let mut chars = trimmed.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '&' {
            let rest = &trimmed[i..];
            let is_entity = ["&amp;", "&lt;", "&gt;", "&quot;", "&apos;", "&#"]
                .iter()
                .any(|e| rest.starts_with(e));
            if is_entity {
                out.push('&');
            } else {
                out.push_str("&amp;");
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub fn parse_hierarchy(xml: &str) -> CoreResult<Vec<UiNode>> {
    let normalized = normalize(xml);
    let mut reader = Reader::from_str(&normalized);
    reader.config_mut().trim_text = true;

    let mut stack: Vec<UiNode> = Vec::new();
    let mut roots: Vec<UiNode> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.local_name().as_ref() == b"node" => {
                stack.push(node_from_attrs(e)?);
            }
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"node" => {
                let node = node_from_attrs(e)?;
                push_node(&mut stack, &mut roots, node);
            }
            Ok(Event::End(ref e)) if e.local_name().as_ref() == b"node" => {
                let node = stack.pop().ok_or_else(|| CoreError::validation("unbalanced node tag in ui dump"))?;
                push_node(&mut stack, &mut roots, node);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CoreError::validation(format!("ui hierarchy xml parse error: {e}"))),
        }
        buf.clear();
    }

    Ok(roots)
}

fn push_node(stack: &mut Vec<UiNode>, roots: &mut Vec<UiNode>, node: UiNode) {
    if let Some(parent) = stack.last_mut() {
        parent.children.push(node);
    } else {
        roots.push(node);
    }
}

fn node_from_attrs(e: &quick_xml::events::BytesStart) -> CoreResult<UiNode> {
    let mut node = UiNode::default();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CoreError::validation(format!("bad attribute in ui dump: {e}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| CoreError::validation(format!("bad attribute value in ui dump: {e}")))?
            .into_owned();
        match key.as_str() {
            "text" => node.text = value,
            "resource-id" => node.resource_id = value,
            "class" => node.class = value,
            "package" => node.package = value,
            "content-desc" => node.content_desc = value,
            "bounds" => node.bounds = Bounds::parse(&value).unwrap_or_default(),
            "checkable" => node.checkable = value == "true",
            "checked" => node.checked = value == "true",
            "clickable" => node.clickable = value == "true",
            "enabled" => node.enabled = value == "true",
            "focusable" => node.focusable = value == "true",
            "focused" => node.focused = value == "true",
            "scrollable" => node.scrollable = value == "true",
            "long-clickable" => node.long_clickable = value == "true",
            "selected" => node.selected = value == "true",
            _ => {}
        }
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.example" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" selected="false" bounds="[0,0][1080,2280]">
    <node index="0" text="Login" resource-id="com.example:id/login_btn" class="android.widget.Button" package="com.example" content-desc="" checkable="false" checked="false" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" selected="false" bounds="[100,200][400,300]" />
  </node>
</hierarchy>"#;

    #[test]
    fn parses_nested_nodes_with_bounds() {
        let roots = parse_hierarchy(SAMPLE).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].children.len(), 1);
        let btn = &roots[0].children[0];
        assert_eq!(btn.text, "Login");
        assert_eq!(btn.resource_id, "com.example:id/login_btn");
        assert!(btn.clickable);
        assert_eq!(btn.bounds, Bounds { left: 100, top: 200, right: 400, bottom: 300 });
    }

    #[test]
    fn normalize_strips_leading_garbage_and_escapes_bare_ampersand() {
        let raw = "garbage line\n<a text=\"Tom & Jerry\"/>\ntrailing";
        let normalized = normalize(raw);
        assert!(normalized.starts_with("<a"));
        assert!(normalized.contains("Tom &amp; Jerry"));
    }
}
