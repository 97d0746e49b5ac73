//! `UiNode` tree and the bounds rectangle search depends on.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Bounds {
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    pub fn area(&self) -> i64 {
        (self.right - self.left).max(0) as i64 * (self.bottom - self.top).max(0) as i64
    }

    pub fn center(&self) -> (i32, i32) {
        ((self.left + self.right) / 2, (self.top + self.bottom) / 2)
    }

    /// Parses UIAutomator's `[l,t][r,b]` bounds string.
    pub fn parse(s: &str) -> Option<Bounds> {
        let s = s.trim();
        let s = s.strip_prefix('[')?;
        let (first, rest) = s.split_once("][")?;
        let second = rest.strip_suffix(']')?;
        let (left, top) = first.split_once(',')?;
        let (right, bottom) = second.split_once(',')?;
        Some(Bounds {
            left: left.trim().parse().ok()?,
            top: top.trim().parse().ok()?,
            right: right.trim().parse().ok()?,
            bottom: bottom.trim().parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct UiNode {
    pub text: String,
    pub resource_id: String,
    pub class: String,
    pub package: String,
    pub content_desc: String,
    pub bounds: Bounds,
    pub checkable: bool,
    pub checked: bool,
    pub clickable: bool,
    pub enabled: bool,
    pub focusable: bool,
    pub focused: bool,
    pub scrollable: bool,
    pub long_clickable: bool,
    pub selected: bool,
    pub children: Vec<UiNode>,
}

impl UiNode {
    /// Depth-first iterator over this node and all descendants.
    pub fn iter_all(&self) -> Box<dyn Iterator<Item = &UiNode> + '_> {
        Box::new(std::iter::once(self).chain(self.children.iter().flat_map(|c| c.iter_all())))
    }

    /// A boolean attribute by name, for the generic expression matcher.
    pub fn bool_attr(&self, name: &str) -> Option<bool> {
        match name {
            "checkable" => Some(self.checkable),
            "checked" => Some(self.checked),
            "clickable" => Some(self.clickable),
            "enabled" => Some(self.enabled),
            "focusable" => Some(self.focusable),
            "focused" => Some(self.focused),
            "scrollable" => Some(self.scrollable),
            "long-clickable" | "long_clickable" => Some(self.long_clickable),
            "selected" => Some(self.selected),
            _ => None,
        }
    }

    /// A string attribute by name, for the generic expression matcher.
    pub fn string_attr(&self, name: &str) -> Option<&str> {
        match name {
            "text" => Some(&self.text),
            "id" | "resource-id" | "resource_id" => Some(&self.resource_id),
            "class" => Some(&self.class),
            "package" => Some(&self.package),
            "desc" | "content-desc" | "content_desc" => Some(&self.content_desc),
            _ => None,
        }
    }
}

/// Finds the deepest (smallest-area) node whose bounds contain `(x, y)`.
pub fn node_at_point<'a>(roots: &'a [UiNode], x: i32, y: i32) -> Option<&'a UiNode> {
    let mut best: Option<&UiNode> = None;
    let mut best_area = i64::MAX;
    for root in roots {
        for node in root.iter_all() {
            if node.bounds.contains(x, y) {
                let area = node.bounds.area();
                if area < best_area {
                    best_area = area;
                    best = Some(node);
                }
            }
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounds_parses_uiautomator_format() {
        let b = Bounds::parse("[10,20][110,220]").unwrap();
        assert_eq!(b, Bounds { left: 10, top: 20, right: 110, bottom: 220 });
        assert!(b.contains(50, 50));
        assert!(!b.contains(5, 5));
    }

    #[test]
    fn node_at_point_prefers_smallest_area() {
        let inner = UiNode {
            bounds: Bounds { left: 10, top: 10, right: 20, bottom: 20 },
            ..Default::default()
        };
        let outer = UiNode {
            bounds: Bounds { left: 0, top: 0, right: 100, bottom: 100 },
            children: vec![inner],
            ..Default::default()
        };
        let found = node_at_point(&[outer], 15, 15).unwrap();
        assert_eq!(found.bounds.right, 20);
    }
}
