//! Selector search over a parsed UI tree: single-attribute match, an
//! XPath subset, and a small boolean expression language.

use super::node::UiNode;
use regex::Regex;
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrMatch {
    Eq,
    Contains,
    Prefix,
    Suffix,
}

fn attr_matches(node: &UiNode, attr: &str, value: &str, op: AttrMatch) -> bool {
    let actual = match node.string_attr(attr) {
        Some(s) => s,
        None => return node.bool_attr(attr).map(|b| b.to_string() == value).unwrap_or(false),
    };
    match op {
        AttrMatch::Eq => actual == value,
        AttrMatch::Contains => actual.contains(value),
        AttrMatch::Prefix => actual.starts_with(value),
        AttrMatch::Suffix => actual.ends_with(value),
    }
}

/// Single attribute match over every node in the forest.
pub fn find_by_attribute<'a>(roots: &'a [UiNode], attr: &str, value: &str, op: AttrMatch) -> Vec<&'a UiNode> {
    roots
        .iter()
        .flat_map(|r| r.iter_all())
        .filter(|n| attr_matches(n, attr, value, op))
        .collect()
}

fn xpath_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^//([A-Za-z0-9_.]+)(?:\[(.+)\])?$").unwrap())
}

/// `//Class[@attr='v' and contains(@attr,'v') and @flag]` — class name
/// optionally followed by `and`-joined predicates.
pub fn find_by_xpath<'a>(roots: &'a [UiNode], expr: &str) -> Vec<&'a UiNode> {
    let Some(caps) = xpath_re().captures(expr.trim()) else {
        return Vec::new();
    };
    let class = &caps[1];
    let predicates: Vec<&str> = caps.get(2).map(|m| m.as_str().split(" and ").map(str::trim).collect()).unwrap_or_default();

    roots
        .iter()
        .flat_map(|r| r.iter_all())
        .filter(|n| (class == "*" || n.class.ends_with(class)) && predicates.iter().all(|p| eval_xpath_predicate(n, p)))
        .collect()
}

fn eval_xpath_predicate(node: &UiNode, predicate: &str) -> bool {
    let predicate = predicate.trim();
    if let Some(inner) = predicate.strip_prefix("contains(@").and_then(|s| s.strip_suffix(')')) {
        let Some((attr, value)) = inner.split_once(',') else { return false };
        let value = value.trim().trim_matches('\'').trim_matches('"');
        return attr_matches(node, attr.trim(), value, AttrMatch::Contains);
    }
    if let Some(rest) = predicate.strip_prefix('@') {
        if let Some((attr, value)) = rest.split_once('=') {
            let value = value.trim().trim_matches('\'').trim_matches('"');
            return attr_matches(node, attr.trim(), value, AttrMatch::Eq);
        }
        // bare `@flag` — boolean attribute must be true
        return node.bool_attr(rest.trim()).unwrap_or(false);
    }
    false
}

#[derive(Debug, Clone, Copy)]
enum ExprOp {
    Contains,
    Equal,
    Prefix,
    Suffix,
}

/// `a:v AND b=v OR c~v` — `:` and `~` are both "contains", `=` is
/// equality, `^` prefix, `$` suffix. `OR` is evaluated over
/// `AND`-joined conjunctions (no parentheses, left to right).
pub fn find_by_expression<'a>(roots: &'a [UiNode], expr: &str) -> Vec<&'a UiNode> {
    let disjuncts: Vec<&str> = expr.split(" OR ").collect();
    roots
        .iter()
        .flat_map(|r| r.iter_all())
        .filter(|n| disjuncts.iter().any(|d| d.split(" AND ").all(|term| eval_expr_term(n, term.trim()))))
        .collect()
}

fn eval_expr_term(node: &UiNode, term: &str) -> bool {
    for (token, op) in [("^", ExprOp::Prefix), ("$", ExprOp::Suffix), ("~", ExprOp::Contains), (":", ExprOp::Contains), ("=", ExprOp::Equal)] {
        if let Some((attr, value)) = term.split_once(token) {
            let match_op = match op {
                ExprOp::Contains => AttrMatch::Contains,
                ExprOp::Equal => AttrMatch::Eq,
                ExprOp::Prefix => AttrMatch::Prefix,
                ExprOp::Suffix => AttrMatch::Suffix,
            };
            return attr_matches(node, attr.trim(), value.trim(), match_op);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::super::node::Bounds;
    use super::*;

    fn make(class: &str, text: &str, resource_id: &str) -> UiNode {
        UiNode {
            class: class.to_string(),
            text: text.to_string(),
            resource_id: resource_id.to_string(),
            bounds: Bounds { left: 0, top: 0, right: 10, bottom: 10 },
            ..Default::default()
        }
    }

    #[test]
    fn attribute_search_matches_suffix() {
        let nodes = vec![make("android.widget.Button", "Login", "com.example:id/login_btn")];
        let found = find_by_attribute(&nodes, "id", "login_btn", AttrMatch::Suffix);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn xpath_subset_matches_class_and_predicate() {
        let nodes = vec![make("android.widget.Button", "Login", "com.example:id/login_btn")];
        let found = find_by_xpath(&nodes, "//Button[contains(@text,'Log')]");
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn expression_language_combines_and_or() {
        let nodes = vec![make("android.widget.Button", "Login", "com.example:id/login_btn")];
        let found = find_by_expression(&nodes, "text:Login AND class$Button");
        assert_eq!(found.len(), 1);
        let none = find_by_expression(&nodes, "text:Nope OR class$TextView");
        assert_eq!(none.len(), 0);
    }
}
