/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Document tree boundary.
//!
//! [`MemoryDom`] is a flat arena keyed by [`NodeId`]. Nodes that are not
//! reachable from the root still exist (like detached elements) but are
//! never returned by selector queries.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomError {
    NotFound(NodeId),
    NotAChild { parent: NodeId, child: NodeId },
    HierarchyRequest { parent: NodeId, child: NodeId },
    MutationRejected(String),
}

impl std::fmt::Display for DomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(node) => write!(f, "{node} does not exist"),
            Self::NotAChild { parent, child } => write!(f, "{child} is not a child of {parent}"),
            Self::HierarchyRequest { parent, child } => {
                write!(f, "appending {child} to {parent} would create a cycle")
            }
            Self::MutationRejected(message) => write!(f, "mutation rejected: {message}"),
        }
    }
}

impl std::error::Error for DomError {}

pub trait DomTree: Send + Sync {
    fn root(&self) -> NodeId;
    fn create_element(&self, tag: &str) -> NodeId;
    /// Detached shallow copy: tag, attributes and text, no children.
    fn clone_node(&self, node: NodeId) -> Result<NodeId, DomError>;
    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError>;
    fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError>;
    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError>;
    fn attribute(&self, node: NodeId, name: &str) -> Option<String>;
    fn set_text(&self, node: NodeId, text: &str) -> Result<(), DomError>;
    fn text(&self, node: NodeId) -> Option<String>;
    fn tag(&self, node: NodeId) -> Option<String>;
    fn children(&self, node: NodeId) -> Result<Vec<NodeId>, DomError>;
    /// Connected nodes matching `tag`, `#id` or `.class`, in document order.
    fn query_selector_all(&self, selector: &str) -> Vec<NodeId>;
}

#[derive(Debug, Clone, Default)]
struct Node {
    tag: String,
    attributes: BTreeMap<String, String>,
    text: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

#[derive(Debug)]
pub struct MemoryDom {
    root: NodeId,
    next_id: AtomicU64,
    nodes: RwLock<HashMap<NodeId, Node>>,
}

impl Default for MemoryDom {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDom {
    pub fn new() -> Self {
        let root = NodeId(0);
        let mut nodes = HashMap::new();
        nodes.insert(
            root,
            Node {
                tag: "body".to_string(),
                ..Node::default()
            },
        );
        Self {
            root,
            next_id: AtomicU64::new(1),
            nodes: RwLock::new(nodes),
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    fn matches(node: &Node, selector: &str) -> bool {
        if let Some(id) = selector.strip_prefix('#') {
            node.attributes.get("id").is_some_and(|value| value == id)
        } else if let Some(class) = selector.strip_prefix('.') {
            node.attributes
                .get("class")
                .is_some_and(|value| value.split_whitespace().any(|c| c == class))
        } else {
            node.tag.eq_ignore_ascii_case(selector)
        }
    }
}

fn is_ancestor(nodes: &HashMap<NodeId, Node>, candidate: NodeId, of: NodeId) -> bool {
    let mut cursor = Some(of);
    while let Some(current) = cursor {
        if current == candidate {
            return true;
        }
        cursor = nodes.get(&current).and_then(|node| node.parent);
    }
    false
}

impl DomTree for MemoryDom {
    fn root(&self) -> NodeId {
        self.root
    }

    fn create_element(&self, tag: &str) -> NodeId {
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.nodes.write().insert(
            id,
            Node {
                tag: tag.to_ascii_lowercase(),
                ..Node::default()
            },
        );
        id
    }

    fn clone_node(&self, node: NodeId) -> Result<NodeId, DomError> {
        let mut nodes = self.nodes.write();
        let source = nodes.get(&node).ok_or(DomError::NotFound(node))?;
        let copy = Node {
            tag: source.tag.clone(),
            attributes: source.attributes.clone(),
            text: source.text.clone(),
            parent: None,
            children: Vec::new(),
        };
        let id = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        nodes.insert(id, copy);
        Ok(id)
    }

    fn append_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let mut nodes = self.nodes.write();
        if !nodes.contains_key(&parent) {
            return Err(DomError::NotFound(parent));
        }
        if !nodes.contains_key(&child) {
            return Err(DomError::NotFound(child));
        }
        if is_ancestor(&nodes, child, parent) {
            return Err(DomError::HierarchyRequest { parent, child });
        }
        let previous = nodes.get(&child).and_then(|node| node.parent);
        if let Some(previous) = previous.and_then(|id| nodes.get_mut(&id)) {
            previous.children.retain(|existing| *existing != child);
        }
        if let Some(node) = nodes.get_mut(&child) {
            node.parent = Some(parent);
        }
        if let Some(node) = nodes.get_mut(&parent) {
            node.children.push(child);
        }
        Ok(())
    }

    fn remove_child(&self, parent: NodeId, child: NodeId) -> Result<(), DomError> {
        let mut nodes = self.nodes.write();
        let parent_node = nodes.get_mut(&parent).ok_or(DomError::NotFound(parent))?;
        let before = parent_node.children.len();
        parent_node.children.retain(|existing| *existing != child);
        if parent_node.children.len() == before {
            return Err(DomError::NotAChild { parent, child });
        }
        if let Some(node) = nodes.get_mut(&child) {
            node.parent = None;
        }
        Ok(())
    }

    fn set_attribute(&self, node: NodeId, name: &str, value: &str) -> Result<(), DomError> {
        let mut nodes = self.nodes.write();
        let entry = nodes.get_mut(&node).ok_or(DomError::NotFound(node))?;
        entry.attributes.insert(name.to_string(), value.to_string());
        Ok(())
    }

    fn attribute(&self, node: NodeId, name: &str) -> Option<String> {
        self.nodes.read().get(&node)?.attributes.get(name).cloned()
    }

    fn set_text(&self, node: NodeId, text: &str) -> Result<(), DomError> {
        let mut nodes = self.nodes.write();
        let entry = nodes.get_mut(&node).ok_or(DomError::NotFound(node))?;
        entry.text = text.to_string();
        Ok(())
    }

    fn text(&self, node: NodeId) -> Option<String> {
        self.nodes.read().get(&node).map(|entry| entry.text.clone())
    }

    fn tag(&self, node: NodeId) -> Option<String> {
        self.nodes.read().get(&node).map(|entry| entry.tag.clone())
    }

    fn children(&self, node: NodeId) -> Result<Vec<NodeId>, DomError> {
        self.nodes
            .read()
            .get(&node)
            .map(|entry| entry.children.clone())
            .ok_or(DomError::NotFound(node))
    }

    fn query_selector_all(&self, selector: &str) -> Vec<NodeId> {
        let selector = selector.trim();
        let nodes = self.nodes.read();
        let mut found = Vec::new();
        let mut stack = vec![self.root];
        while let Some(current) = stack.pop() {
            let Some(node) = nodes.get(&current) else {
                continue;
            };
            if Self::matches(node, selector) {
                found.push(current);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> (MemoryDom, NodeId, NodeId, NodeId) {
        let dom = MemoryDom::new();
        let list = dom.create_element("UL");
        let first = dom.create_element("li");
        let second = dom.create_element("li");
        dom.append_child(dom.root(), list).unwrap();
        dom.append_child(list, first).unwrap();
        dom.append_child(list, second).unwrap();
        (dom, list, first, second)
    }

    #[test]
    fn selectors_return_connected_nodes_in_document_order() {
        let (dom, list, first, second) = sample();
        dom.set_attribute(list, "id", "menu").unwrap();
        dom.set_attribute(second, "class", "item active").unwrap();
        let detached = dom.create_element("li");

        assert_eq!(dom.query_selector_all("li"), vec![first, second]);
        assert_eq!(dom.query_selector_all("#menu"), vec![list]);
        assert_eq!(dom.query_selector_all(".active"), vec![second]);
        assert!(!dom.query_selector_all("li").contains(&detached));
    }

    #[test]
    fn append_moves_nodes_between_parents() {
        let (dom, list, first, _) = sample();
        dom.append_child(dom.root(), first).unwrap();
        assert_eq!(dom.children(list).unwrap().len(), 1);
        assert_eq!(dom.children(dom.root()).unwrap(), vec![list, first]);
    }

    #[test]
    fn clone_node_is_shallow_and_detached() {
        let (dom, list, _, _) = sample();
        dom.set_attribute(list, "id", "menu").unwrap();
        let copy = dom.clone_node(list).unwrap();
        assert_eq!(dom.attribute(copy, "id").as_deref(), Some("menu"));
        assert!(dom.children(copy).unwrap().is_empty());
        assert_eq!(dom.query_selector_all("#menu"), vec![list]);
    }

    #[test]
    fn cycles_and_strangers_are_rejected() {
        let (dom, list, first, second) = sample();
        assert_eq!(
            dom.append_child(first, list),
            Err(DomError::HierarchyRequest { parent: first, child: list })
        );
        assert_eq!(
            dom.remove_child(first, second),
            Err(DomError::NotAChild { parent: first, child: second })
        );
        assert_eq!(dom.set_text(NodeId(999), "x"), Err(DomError::NotFound(NodeId(999))));
    }
}
