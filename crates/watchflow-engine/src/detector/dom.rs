//! Structural DOM snapshots and comparison
//!
//! The browser facade returns the body as a raw tree of
//! `{tag, attributes, text, children}`. This module filters it (ignore
//! selectors, attribute allowlist), flattens it by structural path, and
//! diffs two trees path by path.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Attributes compared when no allowlist is configured
pub const DEFAULT_ATTRIBUTE_ALLOWLIST: &[&str] = &["id", "class", "href", "src", "alt", "title"];

/// One element of the captured tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomNode {
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Text content, captured for leaves only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub children: Vec<DomNode>,
}

impl DomNode {
    /// Parse the raw value produced by the capture script
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Minimal selector grammar: `tag`, `.class`, `#id`, and `tag.class`/`tag#id`
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleSelector {
    pub tag: Option<String>,
    pub id: Option<String>,
    pub classes: Vec<String>,
}

impl SimpleSelector {
    pub fn parse(selector: &str) -> Self {
        let mut tag = None;
        let mut id = None;
        let mut classes = Vec::new();

        let mut rest = selector.trim();
        if !rest.starts_with('.') && !rest.starts_with('#') {
            let end = rest
                .find(|c| c == '.' || c == '#')
                .unwrap_or(rest.len());
            if end > 0 {
                tag = Some(rest[..end].to_ascii_lowercase());
            }
            rest = &rest[end..];
        }
        while !rest.is_empty() {
            let (marker, tail) = rest.split_at(1);
            let end = tail.find(|c| c == '.' || c == '#').unwrap_or(tail.len());
            let name = &tail[..end];
            match marker {
                "." if !name.is_empty() => classes.push(name.to_string()),
                "#" if !name.is_empty() => id = Some(name.to_string()),
                _ => {}
            }
            rest = &tail[end..];
        }

        Self { tag, id, classes }
    }

    pub fn matches(&self, node: &DomNode) -> bool {
        if let Some(tag) = &self.tag {
            if node.tag != *tag {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if node.attributes.get("id") != Some(id) {
                return false;
            }
        }
        if !self.classes.is_empty() {
            let class_attr = node.attributes.get("class").cloned().unwrap_or_default();
            let present: BTreeSet<&str> = class_attr.split_whitespace().collect();
            if !self.classes.iter().all(|c| present.contains(c.as_str())) {
                return false;
            }
        }
        self.tag.is_some() || self.id.is_some() || !self.classes.is_empty()
    }

    /// True when the selector's tag names the element of a structural
    /// path segment like `h1[0]`
    pub fn matches_path_segment(&self, segment: &str) -> bool {
        let seg_tag = segment.split('[').next().unwrap_or(segment);
        match (&self.tag, &self.id, self.classes.is_empty()) {
            (Some(tag), None, true) => seg_tag == tag,
            // Paths carry no attributes; fall back to a substring check
            _ => segment.contains(self.id.as_deref().unwrap_or(""))
                && self
                    .tag
                    .as_ref()
                    .map(|t| seg_tag == t)
                    .unwrap_or(true),
        }
    }
}

/// Drop ignored subtrees and non-allowlisted attributes
pub fn filter_tree(
    node: &DomNode,
    ignore: &[SimpleSelector],
    allowlist: &BTreeSet<String>,
) -> Option<DomNode> {
    if ignore.iter().any(|s| s.matches(node)) {
        return None;
    }
    let attributes = node
        .attributes
        .iter()
        .filter(|(k, _)| allowlist.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let children: Vec<DomNode> = node
        .children
        .iter()
        .filter_map(|c| filter_tree(c, ignore, allowlist))
        .collect();
    Some(DomNode {
        tag: node.tag.clone(),
        attributes,
        text: node.text.clone(),
        children,
    })
}

/// Concatenated leaf text of a (filtered) tree
pub fn tree_text(node: &DomNode) -> String {
    let mut out = Vec::new();
    collect_text(node, &mut out);
    out.join("\n")
}

fn collect_text(node: &DomNode, out: &mut Vec<String>) {
    if node.children.is_empty() {
        if let Some(text) = &node.text {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
    } else {
        for child in &node.children {
            collect_text(child, out);
        }
    }
}

/// Flat view of one element, keyed by structural path
#[derive(Debug, Clone, PartialEq)]
pub struct FlatNode {
    pub tag: String,
    pub text: Option<String>,
    pub attributes: BTreeMap<String, String>,
}

/// Flatten a tree by structural path
///
/// The root path is its tag; a child's path is
/// `{parent}/{tag}[{i}]` where `i` counts same-tag siblings.
pub fn flatten(node: &DomNode) -> HashMap<String, FlatNode> {
    let mut out = HashMap::new();
    flatten_into(node, node.tag.clone(), &mut out);
    out
}

fn flatten_into(node: &DomNode, path: String, out: &mut HashMap<String, FlatNode>) {
    out.insert(
        path.clone(),
        FlatNode {
            tag: node.tag.clone(),
            text: node.text.clone(),
            attributes: node.attributes.clone(),
        },
    );
    let mut tag_counts: HashMap<&str, usize> = HashMap::new();
    for child in &node.children {
        let index = tag_counts.entry(child.tag.as_str()).or_insert(0);
        let child_path = format!("{path}/{}[{index}]", child.tag);
        *index += 1;
        flatten_into(child, child_path, out);
    }
}

/// One per-path difference
#[derive(Debug, Clone, Serialize)]
pub struct DomModification {
    pub path: String,
    /// `text` or `attributes`
    pub field: String,
    pub before: Value,
    pub after: Value,
}

/// Result of comparing two trees
#[derive(Debug, Clone)]
pub struct DomComparison {
    pub similarity: f64,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<DomModification>,
}

impl DomComparison {
    pub fn diff_value(&self) -> Value {
        json!({
            "added": self.added,
            "removed": self.removed,
            "modified": self.modified,
        })
    }
}

/// Compare two trees by structural path
///
/// Similarity is the share of union paths present in both sides with equal
/// tag, text, and compared attributes, scaled to 0..=100.
pub fn compare_dom(previous: &DomNode, current: &DomNode) -> DomComparison {
    let prev = flatten(previous);
    let curr = flatten(current);

    let union: BTreeSet<&String> = prev.keys().chain(curr.keys()).collect();
    if union.is_empty() {
        return DomComparison {
            similarity: 100.0,
            added: vec![],
            removed: vec![],
            modified: vec![],
        };
    }

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();
    let mut matched = 0usize;

    for path in &union {
        match (prev.get(*path), curr.get(*path)) {
            (Some(p), Some(c)) => {
                let mut equal = true;
                if p.text != c.text {
                    equal = false;
                    modified.push(DomModification {
                        path: (*path).clone(),
                        field: "text".to_string(),
                        before: json!(p.text),
                        after: json!(c.text),
                    });
                }
                if p.attributes != c.attributes {
                    equal = false;
                    modified.push(DomModification {
                        path: (*path).clone(),
                        field: "attributes".to_string(),
                        before: json!(p.attributes),
                        after: json!(c.attributes),
                    });
                }
                if equal {
                    matched += 1;
                }
            }
            (None, Some(_)) => added.push((*path).clone()),
            (Some(_), None) => removed.push((*path).clone()),
            (None, None) => {}
        }
    }

    added.sort();
    removed.sort();

    DomComparison {
        similarity: matched as f64 / union.len() as f64 * 100.0,
        added,
        removed,
        modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: &str, text: &str) -> DomNode {
        DomNode {
            tag: tag.to_string(),
            attributes: BTreeMap::new(),
            text: Some(text.to_string()),
            children: vec![],
        }
    }

    fn body(children: Vec<DomNode>) -> DomNode {
        DomNode {
            tag: "body".to_string(),
            attributes: BTreeMap::new(),
            text: None,
            children,
        }
    }

    #[test]
    fn test_reflexivity() {
        let tree = body(vec![leaf("h1", "Hi"), leaf("p", "text")]);
        let cmp = compare_dom(&tree, &tree);
        assert!((cmp.similarity - 100.0).abs() < f64::EPSILON);
        assert!(cmp.added.is_empty());
        assert!(cmp.removed.is_empty());
        assert!(cmp.modified.is_empty());
    }

    #[test]
    fn test_text_modification_path() {
        let before = body(vec![leaf("h1", "Hi")]);
        let after = body(vec![leaf("h1", "Bye")]);
        let cmp = compare_dom(&before, &after);

        assert!(cmp.similarity < 100.0);
        assert_eq!(cmp.modified.len(), 1);
        assert_eq!(cmp.modified[0].path, "body/h1[0]");
        assert_eq!(cmp.modified[0].field, "text");
    }

    #[test]
    fn test_added_and_removed_paths() {
        let before = body(vec![leaf("h1", "Hi")]);
        let after = body(vec![leaf("h1", "Hi"), leaf("p", "new")]);
        let cmp = compare_dom(&before, &after);

        assert_eq!(cmp.added, vec!["body/p[0]".to_string()]);
        assert!(cmp.removed.is_empty());
        // body + h1 match out of 3 union paths
        assert!((cmp.similarity - 2.0 / 3.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_symmetry_on_common_paths() {
        let a = body(vec![leaf("h1", "one"), leaf("p", "x")]);
        let b = body(vec![leaf("h1", "two"), leaf("p", "x")]);
        let ab = compare_dom(&a, &b);
        let ba = compare_dom(&b, &a);
        assert!((ab.similarity - ba.similarity).abs() < f64::EPSILON);
    }

    #[test]
    fn test_same_tag_siblings_are_indexed() {
        let tree = body(vec![leaf("li", "a"), leaf("li", "b"), leaf("p", "c")]);
        let flat = flatten(&tree);
        assert!(flat.contains_key("body/li[0]"));
        assert!(flat.contains_key("body/li[1]"));
        assert!(flat.contains_key("body/p[0]"));
    }

    #[test]
    fn test_selector_parse_and_match() {
        let sel = SimpleSelector::parse("div.ad#banner");
        assert_eq!(sel.tag.as_deref(), Some("div"));
        assert_eq!(sel.id.as_deref(), Some("banner"));
        assert_eq!(sel.classes, vec!["ad".to_string()]);

        let mut node = leaf("div", "");
        node.attributes.insert("class".to_string(), "ad big".to_string());
        node.attributes.insert("id".to_string(), "banner".to_string());
        assert!(sel.matches(&node));

        node.attributes.insert("class".to_string(), "big".to_string());
        assert!(!sel.matches(&node));
    }

    #[test]
    fn test_filter_drops_ignored_subtree() {
        let mut ad = leaf("div", "buy now");
        ad.attributes.insert("class".to_string(), "ad".to_string());
        let tree = body(vec![leaf("h1", "Hi"), ad]);

        let allow: BTreeSet<String> = DEFAULT_ATTRIBUTE_ALLOWLIST
            .iter()
            .map(|s| s.to_string())
            .collect();
        let filtered =
            filter_tree(&tree, &[SimpleSelector::parse(".ad")], &allow).expect("body kept");
        assert_eq!(filtered.children.len(), 1);
        assert_eq!(filtered.children[0].tag, "h1");
    }

    #[test]
    fn test_filter_strips_unlisted_attributes() {
        let mut node = leaf("a", "link");
        node.attributes.insert("href".to_string(), "/x".to_string());
        node.attributes
            .insert("data-reactid".to_string(), "17".to_string());
        let tree = body(vec![node]);

        let allow: BTreeSet<String> = DEFAULT_ATTRIBUTE_ALLOWLIST
            .iter()
            .map(|s| s.to_string())
            .collect();
        let filtered = filter_tree(&tree, &[], &allow).expect("kept");
        let a = &filtered.children[0];
        assert!(a.attributes.contains_key("href"));
        assert!(!a.attributes.contains_key("data-reactid"));
    }

    #[test]
    fn test_tree_text_skips_empty_leaves() {
        let tree = body(vec![leaf("h1", "  Hi  "), leaf("p", "   ")]);
        assert_eq!(tree_text(&tree), "Hi");
    }
}
