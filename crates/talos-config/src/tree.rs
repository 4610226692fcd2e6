//! The timestamped configuration tree.
//!
//! Interior nodes are named groupings; leaves carry a [`Value`] and the
//! timestamp of the write that produced it. For any given path, a newer
//! timestamp wins; an older write is discarded.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::value::Value;

/// A leaf of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Leaf {
    /// The stored value.
    pub value: Value,

    /// Milliseconds since epoch of the winning write.
    pub timestamp: i64,
}

/// A node of the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Node {
    /// Named grouping of children.
    Interior(BTreeMap<String, Node>),

    /// Timestamped value.
    Leaf(Leaf),
}

impl Node {
    /// Returns the leaf, if this node is one.
    #[must_use]
    pub const fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Self::Leaf(leaf) => Some(leaf),
            Self::Interior(_) => None,
        }
    }

    /// Returns the children, if this node is interior.
    #[must_use]
    pub const fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Self::Interior(children) => Some(children),
            Self::Leaf(_) => None,
        }
    }
}

/// Outcome of a timestamped write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value was stored.
    Written,

    /// The stored value already matched (same value, same or newer stamp).
    Unchanged,

    /// A newer write already owns the path; the value was discarded.
    IgnoredOlder,
}

/// The configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigTree {
    root: BTreeMap<String, Node>,
}

impl ConfigTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the tree holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Looks up a node by path.
    #[must_use]
    pub fn get(&self, path: &[&str]) -> Option<&Node> {
        let (first, rest) = path.split_first()?;
        let mut node = self.root.get(*first)?;
        for segment in rest {
            node = node.children()?.get(*segment)?;
        }
        Some(node)
    }

    /// Looks up a leaf value by path.
    #[must_use]
    pub fn get_value(&self, path: &[&str]) -> Option<&Value> {
        self.get(path).and_then(Node::as_leaf).map(|l| &l.value)
    }

    /// Writes a leaf, creating interior nodes along the way.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::PathConflict`] if a prefix of `path` is an
    /// existing leaf, or `path` itself is an interior node.
    pub fn set(&mut self, path: &[&str], value: Value, timestamp: i64) -> Result<WriteOutcome> {
        let (last, prefix) = path.split_last().ok_or_else(|| ConfigError::PathConflict {
            path: String::new(),
        })?;

        let mut children = &mut self.root;
        for (depth, segment) in prefix.iter().enumerate() {
            let node = children
                .entry((*segment).to_string())
                .or_insert_with(|| Node::Interior(BTreeMap::new()));
            match node {
                Node::Interior(map) => children = map,
                Node::Leaf(_) => {
                    return Err(ConfigError::PathConflict {
                        path: path[..=depth].join("/"),
                    })
                }
            }
        }

        match children.entry((*last).to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                Node::Interior(_) => Err(ConfigError::PathConflict {
                    path: path.join("/"),
                }),
                Node::Leaf(leaf) => {
                    if leaf.timestamp > timestamp {
                        return Ok(WriteOutcome::IgnoredOlder);
                    }
                    if leaf.value == value && leaf.timestamp == timestamp {
                        return Ok(WriteOutcome::Unchanged);
                    }
                    leaf.value = value;
                    leaf.timestamp = timestamp;
                    Ok(WriteOutcome::Written)
                }
            },
            Entry::Vacant(entry) => {
                entry.insert(Node::Leaf(Leaf { value, timestamp }));
                Ok(WriteOutcome::Written)
            }
        }
    }

    /// Removes the subtree at `path`. Returns true if something was removed.
    pub fn remove(&mut self, path: &[&str]) -> bool {
        let Some((last, prefix)) = path.split_last() else {
            return false;
        };

        let mut children = &mut self.root;
        for segment in prefix {
            match children.get_mut(*segment) {
                Some(Node::Interior(map)) => children = map,
                _ => return false,
            }
        }
        children.remove(*last).is_some()
    }

    /// Deep-merges a JSON document at `path`.
    ///
    /// Objects recurse into interior nodes; scalars and lists become leaf
    /// writes stamped with `timestamp`. Sibling keys absent from `json` are
    /// preserved. Returns the paths actually written.
    ///
    /// # Errors
    ///
    /// Returns an error on a leaf/interior path conflict.
    pub fn merge_json(
        &mut self,
        path: &[&str],
        json: &serde_json::Value,
        timestamp: i64,
    ) -> Result<Vec<Vec<String>>> {
        let mut written = Vec::new();
        self.merge_json_inner(path, json, timestamp, &mut written)?;
        Ok(written)
    }

    fn merge_json_inner(
        &mut self,
        path: &[&str],
        json: &serde_json::Value,
        timestamp: i64,
        written: &mut Vec<Vec<String>>,
    ) -> Result<()> {
        if let serde_json::Value::Object(map) = json {
            for (key, child) in map {
                let mut child_path: Vec<&str> = path.to_vec();
                child_path.push(key.as_str());
                self.merge_json_inner(&child_path, child, timestamp, written)?;
            }
            return Ok(());
        }

        let value = Value::from_json(json).ok_or_else(|| ConfigError::PathConflict {
            path: path.join("/"),
        })?;
        // Replacing an interior subtree with a scalar is a legal merge: the
        // update owns the path wholesale.
        if matches!(self.get(path), Some(Node::Interior(_))) {
            self.remove(path);
        }
        if self.set(path, value, timestamp)? == WriteOutcome::Written {
            written.push(path.iter().map(ToString::to_string).collect());
        }
        Ok(())
    }

    /// Replaces the subtree at `path` with a JSON document.
    ///
    /// # Errors
    ///
    /// Returns an error on a leaf/interior path conflict above `path`.
    pub fn replace_json(
        &mut self,
        path: &[&str],
        json: &serde_json::Value,
        timestamp: i64,
    ) -> Result<()> {
        self.remove(path);
        if json.is_null() {
            return Ok(());
        }
        self.merge_json(path, json, timestamp).map(|_| ())
    }

    /// Renders the subtree at `path` (or the whole tree for an empty path)
    /// as JSON, dropping timestamps.
    #[must_use]
    pub fn to_json(&self, path: &[&str]) -> Option<serde_json::Value> {
        if path.is_empty() {
            return Some(Self::children_to_json(&self.root));
        }
        self.get(path).map(|node| match node {
            Node::Interior(children) => Self::children_to_json(children),
            Node::Leaf(leaf) => leaf.value.to_json(),
        })
    }

    fn children_to_json(children: &BTreeMap<String, Node>) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = children
            .iter()
            .map(|(key, node)| {
                let json = match node {
                    Node::Interior(c) => Self::children_to_json(c),
                    Node::Leaf(leaf) => leaf.value.to_json(),
                };
                (key.clone(), json)
            })
            .collect();
        serde_json::Value::Object(map)
    }

    /// Walks every leaf, invoking `visit` with its path and leaf.
    pub fn for_each_leaf<'a>(&'a self, mut visit: impl FnMut(&[&'a str], &'a Leaf)) {
        fn walk<'a>(
            children: &'a BTreeMap<String, Node>,
            path: &mut Vec<&'a str>,
            visit: &mut impl FnMut(&[&'a str], &'a Leaf),
        ) {
            for (key, node) in children {
                path.push(key);
                match node {
                    Node::Interior(c) => walk(c, path, visit),
                    Node::Leaf(leaf) => visit(path, leaf),
                }
                path.pop();
            }
        }
        let mut path = Vec::new();
        walk(&self.root, &mut path, &mut visit);
    }
}
