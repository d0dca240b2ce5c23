//! Builds a rooted tree from the set of dot-delimited observed paths.
//! Components are deduplicated by name per parent; an
//! all-paths-start-with-"root." heuristic strips that common prefix
//! before the tree is built. Serialization is a preorder traversal
//! emitting `(name, parent_id)`; a second pass attaches `clock_id`,
//! `collection_id`, `offset`, and `widget_hint` from three caller-supplied
//! maps keyed by the path's original (unstripped) string.

use std::collections::HashMap;
use tracecap_error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ElementNode {
    pub id: u32,
    pub name: String,
    pub parent_id: Option<u32>,
    pub clock_id: Option<i64>,
    pub collection_id: Option<i64>,
    pub offset: Option<i64>,
    pub widget_hint: Option<String>,
}

/// A path component is a legal unquoted identifier: first char
/// alpha/underscore, rest alphanumeric/underscore.
pub fn validate_path_component(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A path is a non-empty dot-separated sequence of valid components.
pub fn validate_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(validate_path_component)
}

struct ArenaNode {
    name: String,
    full_path: Option<String>,
    children: Vec<usize>,
    child_lookup: HashMap<String, usize>,
}

#[derive(Default)]
pub struct ElementTree {
    paths: Vec<String>,
}

impl ElementTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `path`. Fails if it is malformed or has already been
    /// added.
    pub fn add_path(&mut self, path: &str) -> Result<()> {
        if !validate_path(path) {
            return Err(Error::configuration(format!(
                "invalid element path '{path}'"
            )));
        }
        if self.paths.iter().any(|p| p == path) {
            return Err(Error::configuration(format!(
                "element path '{path}' already registered"
            )));
        }
        self.paths.push(path.to_string());
        Ok(())
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// `collections` maps a path to `(collection_id, offset_in_collection)`.
    pub fn build(
        &self,
        clocks: &HashMap<String, i64>,
        collections: &HashMap<String, (i64, i64)>,
        widgets: &HashMap<String, String>,
    ) -> Vec<ElementNode> {
        let strip_root = !self.paths.is_empty()
            && self
                .paths
                .iter()
                .all(|p| p == "root" || p.starts_with("root."));

        let mut arena: Vec<ArenaNode> = Vec::new();
        let mut top_level: Vec<usize> = Vec::new();
        let mut top_lookup: HashMap<String, usize> = HashMap::new();

        for path in &self.paths {
            let effective: &str = if strip_root {
                path.strip_prefix("root.").unwrap_or(path.as_str())
            } else {
                path.as_str()
            };
            let components: Vec<&str> = effective.split('.').collect();
            let last = components.len() - 1;

            let mut parent: Option<usize> = None;
            for (i, component) in components.into_iter().enumerate() {
                let idx = match parent {
                    None => *top_lookup.entry(component.to_string()).or_insert_with(|| {
                        let idx = arena.len();
                        arena.push(ArenaNode {
                            name: component.to_string(),
                            full_path: None,
                            children: Vec::new(),
                            child_lookup: HashMap::new(),
                        });
                        top_level.push(idx);
                        idx
                    }),
                    Some(parent_idx) => {
                        if let Some(&existing) = arena[parent_idx].child_lookup.get(component) {
                            existing
                        } else {
                            let idx = arena.len();
                            arena.push(ArenaNode {
                                name: component.to_string(),
                                full_path: None,
                                children: Vec::new(),
                                child_lookup: HashMap::new(),
                            });
                            arena[parent_idx]
                                .child_lookup
                                .insert(component.to_string(), idx);
                            arena[parent_idx].children.push(idx);
                            idx
                        }
                    }
                };
                if i == last {
                    arena[idx].full_path = Some(path.clone());
                }
                parent = Some(idx);
            }
        }

        let mut nodes = Vec::with_capacity(arena.len());
        for &root_idx in &top_level {
            visit(
                root_idx,
                None,
                &arena,
                &mut nodes,
                clocks,
                collections,
                widgets,
            );
        }
        nodes
    }
}

#[allow(clippy::too_many_arguments)]
fn visit(
    idx: usize,
    parent_id: Option<u32>,
    arena: &[ArenaNode],
    nodes: &mut Vec<ElementNode>,
    clocks: &HashMap<String, i64>,
    collections: &HashMap<String, (i64, i64)>,
    widgets: &HashMap<String, String>,
) {
    let id = nodes.len() as u32;
    let full_path = arena[idx].full_path.as_deref();
    let (collection_id, offset) = full_path
        .and_then(|p| collections.get(p))
        .map(|(c, o)| (Some(*c), Some(*o)))
        .unwrap_or((None, None));

    nodes.push(ElementNode {
        id,
        name: arena[idx].name.clone(),
        parent_id,
        clock_id: full_path.and_then(|p| clocks.get(p).copied()),
        collection_id,
        offset,
        widget_hint: full_path.and_then(|p| widgets.get(p).cloned()),
    });

    for &child in &arena[idx].children {
        visit(child, Some(id), arena, nodes, clocks, collections, widgets);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_validation_rejects_bad_identifiers() {
        assert!(validate_path("stats.count"));
        assert!(validate_path("_a.b1"));
        assert!(!validate_path(""));
        assert!(!validate_path("1stats.count"));
        assert!(!validate_path("stats..count"));
        assert!(!validate_path("stats.co-unt"));
    }

    #[test]
    fn duplicate_paths_are_rejected() {
        let mut tree = ElementTree::new();
        tree.add_path("stats.count").unwrap();
        assert!(tree.add_path("stats.count").is_err());
    }

    #[test]
    fn shared_prefixes_collapse_into_one_subtree_and_root_is_stripped() {
        let mut tree = ElementTree::new();
        tree.add_path("root.stats.count").unwrap();
        tree.add_path("root.stats.total").unwrap();
        tree.add_path("root.decode.inst").unwrap();

        let nodes = tree.build(&HashMap::new(), &HashMap::new(), &HashMap::new());
        let names: Vec<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["stats", "count", "total", "decode", "inst"]);

        let stats = &nodes[0];
        assert_eq!(stats.parent_id, None);
        let count = &nodes[1];
        assert_eq!(count.parent_id, Some(stats.id));
        let total = &nodes[2];
        assert_eq!(total.parent_id, Some(stats.id));
    }

    #[test]
    fn metadata_maps_attach_by_original_full_path() {
        let mut tree = ElementTree::new();
        tree.add_path("stats.count").unwrap();

        let mut collections = HashMap::new();
        collections.insert("stats.count".to_string(), (1i64, 0i64));
        let mut clocks = HashMap::new();
        clocks.insert("stats.count".to_string(), 7i64);
        let mut widgets = HashMap::new();
        widgets.insert("stats.count".to_string(), "counter".to_string());

        let nodes = tree.build(&clocks, &collections, &widgets);
        let leaf = nodes.iter().find(|n| n.name == "count").unwrap();
        assert_eq!(leaf.collection_id, Some(1));
        assert_eq!(leaf.offset, Some(0));
        assert_eq!(leaf.clock_id, Some(7));
        assert_eq!(leaf.widget_hint.as_deref(), Some("counter"));

        let stats = nodes.iter().find(|n| n.name == "stats").unwrap();
        assert_eq!(stats.collection_id, None);
    }
}
