//! Collections stored as a flat arena of folder and request nodes.
//!
//! Nodes refer to each other by [`NodeId`]; the tree shape lives in
//! `parent`/`children` links so moves never have to clone subtrees.

use crate::model::HttpRequest;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::warn;

pub type NodeId = String;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CollectionError {
    #[error("node not found: {0}")]
    NotFound(NodeId),
    #[error("node {0} is not a folder")]
    NotAFolder(NodeId),
    #[error("moving {node} under {target} would create a cycle")]
    Cycle { node: NodeId, target: NodeId },
    #[error("duplicate node id: {0}")]
    Duplicate(NodeId),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    Folder { name: String },
    Request(HttpRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    #[serde(default)]
    pub children: Vec<NodeId>,
    pub kind: NodeKind,
}

impl Node {
    pub fn name(&self) -> &str {
        match &self.kind {
            NodeKind::Folder { name } => name,
            NodeKind::Request(request) => &request.name,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self.kind, NodeKind::Folder { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: HashMap<NodeId, Node>,
    /// Top-level node IDs in declaration order.
    #[serde(default)]
    pub root: Vec<NodeId>,
}

/// Nested authoring shape used by workspace files.
///
/// Anything with a `url` is a request, everything else a folder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CollectionItem {
    Request(HttpRequest),
    Folder {
        name: String,
        #[serde(default)]
        items: Vec<CollectionItem>,
    },
}

impl Collection {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            nodes: HashMap::new(),
            root: Vec::new(),
        }
    }

    /// Build an arena from the nested authoring shape.
    pub fn from_items(
        id: impl Into<String>,
        name: impl Into<String>,
        items: &[CollectionItem],
    ) -> Result<Self, CollectionError> {
        let mut collection = Self {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        };
        collection.insert_items(None, items)?;
        Ok(collection)
    }

    fn insert_items(
        &mut self,
        parent: Option<&str>,
        items: &[CollectionItem],
    ) -> Result<(), CollectionError> {
        for item in items {
            match item {
                CollectionItem::Folder { name, items } => {
                    let id = self.add_folder(parent, name.clone())?;
                    self.insert_items(Some(&id), items)?;
                }
                CollectionItem::Request(request) => {
                    let mut request = request.clone();
                    if request.id.is_empty() {
                        request.id = uuid::Uuid::new_v4().to_string();
                    }
                    self.add_request(parent, request)?;
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn request(&self, id: &str) -> Option<&HttpRequest> {
        match self.nodes.get(id).map(|n| &n.kind) {
            Some(NodeKind::Request(request)) => Some(request),
            _ => None,
        }
    }

    pub fn request_mut(&mut self, id: &str) -> Option<&mut HttpRequest> {
        match self.nodes.get_mut(id).map(|n| &mut n.kind) {
            Some(NodeKind::Request(request)) => Some(request),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_folder(
        &mut self,
        parent: Option<&str>,
        name: impl Into<String>,
    ) -> Result<NodeId, CollectionError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.attach(
            parent,
            id.clone(),
            NodeKind::Folder { name: name.into() },
        )?;
        Ok(id)
    }

    /// Insert a request; its own `id` becomes the node ID.
    pub fn add_request(
        &mut self,
        parent: Option<&str>,
        request: HttpRequest,
    ) -> Result<NodeId, CollectionError> {
        let id = request.id.clone();
        self.attach(parent, id.clone(), NodeKind::Request(request))?;
        Ok(id)
    }

    fn attach(
        &mut self,
        parent: Option<&str>,
        id: NodeId,
        kind: NodeKind,
    ) -> Result<(), CollectionError> {
        if self.nodes.contains_key(&id) {
            return Err(CollectionError::Duplicate(id));
        }
        self.check_folder(parent)?;
        self.link(parent, &id, None);
        self.nodes.insert(
            id.clone(),
            Node {
                id,
                parent: parent.map(str::to_string),
                children: Vec::new(),
                kind,
            },
        );
        Ok(())
    }

    fn check_folder(&self, id: Option<&str>) -> Result<(), CollectionError> {
        let Some(id) = id else { return Ok(()) };
        match self.nodes.get(id) {
            None => Err(CollectionError::NotFound(id.to_string())),
            Some(node) if !node.is_folder() => {
                Err(CollectionError::NotAFolder(id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    fn link(&mut self, parent: Option<&str>, id: &str, index: Option<usize>) {
        let siblings = match parent {
            Some(p) => match self.nodes.get_mut(p) {
                Some(node) => &mut node.children,
                None => return,
            },
            None => &mut self.root,
        };
        let at = index.unwrap_or(siblings.len()).min(siblings.len());
        siblings.insert(at, id.to_string());
    }

    fn unlink(&mut self, id: &str) {
        let parent = self.nodes.get(id).and_then(|n| n.parent.clone());
        let siblings = match parent {
            Some(p) => match self.nodes.get_mut(&p) {
                Some(node) => &mut node.children,
                None => return,
            },
            None => &mut self.root,
        };
        siblings.retain(|c| c != id);
    }

    /// True when `ancestor` is `id` or one of its ancestors.
    fn is_ancestor(&self, ancestor: &str, id: &str) -> bool {
        let mut seen = HashSet::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            if current == ancestor {
                return true;
            }
            if !seen.insert(current.clone()) {
                return false;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent.clone());
        }
        false
    }

    /// Move `id` under `target` (root when `None`) at `index`.
    ///
    /// Refuses moves that would place a folder inside itself.
    pub fn move_node(
        &mut self,
        id: &str,
        target: Option<&str>,
        index: Option<usize>,
    ) -> Result<(), CollectionError> {
        if !self.nodes.contains_key(id) {
            return Err(CollectionError::NotFound(id.to_string()));
        }
        self.check_folder(target)?;
        if let Some(target) = target {
            if self.is_ancestor(id, target) {
                return Err(CollectionError::Cycle {
                    node: id.to_string(),
                    target: target.to_string(),
                });
            }
        }

        self.unlink(id);
        self.link(target, id, index);
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = target.map(str::to_string);
        }
        Ok(())
    }

    /// Remove a node and its whole subtree.
    pub fn remove(&mut self, id: &str) -> Result<Node, CollectionError> {
        if !self.nodes.contains_key(id) {
            return Err(CollectionError::NotFound(id.to_string()));
        }
        self.unlink(id);

        let mut stack = vec![id.to_string()];
        let mut removed = None;
        while let Some(current) = stack.pop() {
            if let Some(node) = self.nodes.remove(&current) {
                stack.extend(node.children.iter().cloned());
                if current == id {
                    removed = Some(node);
                }
            }
        }
        removed.ok_or_else(|| CollectionError::NotFound(id.to_string()))
    }

    /// Requests in depth-first declaration order.
    ///
    /// IDs already visited are skipped, so a corrupted arena cannot loop.
    pub fn flatten_requests(&self) -> Vec<&HttpRequest> {
        let mut out = Vec::new();
        let mut visited = HashSet::new();
        let mut stack: Vec<&NodeId> = self.root.iter().rev().collect();

        while let Some(id) = stack.pop() {
            if !visited.insert(id.as_str()) {
                warn!(node = %id, "node reachable twice in collection, skipping");
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                warn!(node = %id, "dangling node reference in collection");
                continue;
            };
            match &node.kind {
                NodeKind::Request(request) => out.push(request),
                NodeKind::Folder { .. } => {
                    stack.extend(node.children.iter().rev());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HttpMethod;

    fn req(name: &str) -> HttpRequest {
        let mut r = HttpRequest::new(name, HttpMethod::Get, "http://x");
        r.id = name.to_string();
        r
    }

    fn names(c: &Collection) -> Vec<String> {
        c.flatten_requests().iter().map(|r| r.name.clone()).collect()
    }

    #[test]
    fn test_flatten_depth_first() {
        let mut c = Collection::new("api");
        c.add_request(None, req("a")).unwrap();
        let folder = c.add_folder(None, "users").unwrap();
        c.add_request(Some(&folder), req("b")).unwrap();
        let inner = c.add_folder(Some(&folder), "admin").unwrap();
        c.add_request(Some(&inner), req("c")).unwrap();
        c.add_request(Some(&folder), req("d")).unwrap();
        c.add_request(None, req("e")).unwrap();

        assert_eq!(names(&c), vec!["a", "b", "c", "d", "e"]);
    }

    #[test]
    fn test_move_refuses_cycle() {
        let mut c = Collection::new("api");
        let outer = c.add_folder(None, "outer").unwrap();
        let inner = c.add_folder(Some(&outer), "inner").unwrap();

        let err = c.move_node(&outer, Some(&inner), None).unwrap_err();
        assert!(matches!(err, CollectionError::Cycle { .. }));
        let err = c.move_node(&outer, Some(&outer), None).unwrap_err();
        assert!(matches!(err, CollectionError::Cycle { .. }));
    }

    #[test]
    fn test_move_reorders() {
        let mut c = Collection::new("api");
        c.add_request(None, req("a")).unwrap();
        let folder = c.add_folder(None, "f").unwrap();
        c.add_request(Some(&folder), req("b")).unwrap();

        c.move_node("b", None, Some(0)).unwrap();
        assert_eq!(names(&c), vec!["b", "a"]);
        assert_eq!(c.get("b").unwrap().parent, None);
        assert!(c.get(&folder).unwrap().children.is_empty());

        let err = c.move_node("a", Some("b"), None).unwrap_err();
        assert_eq!(err, CollectionError::NotAFolder("b".into()));
    }

    #[test]
    fn test_remove_subtree() {
        let mut c = Collection::new("api");
        let folder = c.add_folder(None, "f").unwrap();
        c.add_request(Some(&folder), req("a")).unwrap();
        c.add_request(None, req("b")).unwrap();

        c.remove(&folder).unwrap();
        assert_eq!(c.len(), 1);
        assert_eq!(names(&c), vec!["b"]);
    }

    #[test]
    fn test_flatten_survives_corrupted_links() {
        let mut c = Collection::new("api");
        let folder = c.add_folder(None, "f").unwrap();
        c.add_request(Some(&folder), req("a")).unwrap();
        // Hand-corrupt the arena into a self-loop.
        c.nodes.get_mut(&folder).unwrap().children.push(folder.clone());
        c.root.push("ghost".into());

        assert_eq!(names(&c), vec!["a"]);
    }

    #[test]
    fn test_from_items() {
        let yaml = r#"
- name: first
  url: http://x/1
- name: group
  items:
    - name: second
      url: http://x/2
"#;
        let items: Vec<CollectionItem> = serde_yaml::from_str(yaml).unwrap();
        let c = Collection::from_items("c1", "demo", &items).unwrap();
        assert_eq!(names(&c), vec!["first", "second"]);
        assert_eq!(c.len(), 3);
    }
}
