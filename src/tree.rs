//! Hierarchical path-tree forest built from slash-delimited paths, with
//! synthesized containers, index-file canonicalization and breadcrumbs.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write;

/// Forest construction options.
#[derive(Clone, Debug, PartialEq)]
pub struct ForestOptions {
    pub path_delim: char,
    /// Create empty parent nodes so every path hangs off a container chain.
    pub synthesize_containers: bool,
    /// Sort container children before leaf children.
    pub folder_first: bool,
    /// Basenames that make a child the index of its container.
    pub index_basenames: Vec<String>,
    /// Prefix non-absolute paths with the delimiter.
    pub force_absolute: bool,
}

impl Default for ForestOptions {
    fn default() -> Self {
        Self {
            path_delim: '/',
            synthesize_containers: true,
            folder_first: true,
            index_basenames: ["index", "index.sql", "index.md", "index.html"]
                .map(String::from)
                .to_vec(),
            force_absolute: true,
        }
    }
}

impl ForestOptions {
    /// Collapses repeated delimiters, strips a trailing delimiter (except on
    /// the root itself) and optionally forces a leading delimiter.
    /// Normalization is idempotent.
    pub fn normalize(&self, path: &str) -> String {
        let delim = self.path_delim;
        let mut out = String::with_capacity(path.len() + 1);
        let mut prev_delim = false;
        for c in path.chars() {
            if c == delim {
                if !prev_delim {
                    out.push(c);
                }
                prev_delim = true;
            } else {
                out.push(c);
                prev_delim = false;
            }
        }
        while out.len() > 1 && out.ends_with(delim) {
            out.pop();
        }
        if self.force_absolute && !out.starts_with(delim) {
            out.insert(0, delim);
        }
        out
    }

    fn parent_of(&self, path: &str) -> Option<String> {
        let idx = path.rfind(self.path_delim)?;
        if idx == 0 {
            // children of the delimiter-only root have no container node
            return None;
        }
        Some(path[..idx].to_string())
    }

    fn name_of<'a>(&self, path: &'a str) -> &'a str {
        path.rsplit(self.path_delim).next().unwrap_or(path)
    }
}

pub type NodeId = usize;

/// One node of a path tree. A node is virtual when it was synthesized to
/// hold children and carries no payload.
#[derive(Debug)]
pub struct TreeNode<P> {
    pub path: String,
    pub name: String,
    pub children: Vec<NodeId>,
    pub payloads: Vec<P>,
    pub is_virtual: bool,
    parent: Option<NodeId>,
}

impl<P> TreeNode<P> {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }
}

/// A flattened, table-shaped view of one node.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlatRow {
    pub name: String,
    pub path: String,
    /// Canonical path of the node's breadcrumb parent, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breadcrumb_path: Option<String>,
    /// Canonical path of the parent container, when it has one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_index_path: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub is_virtual: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

/// An ordered set of path trees; each normalized path belongs to exactly one
/// tree. Rebuilding from identical inputs yields identical structure and
/// serialization.
#[derive(Debug)]
pub struct PathForest<P> {
    opts: ForestOptions,
    nodes: Vec<TreeNode<P>>,
    roots: Vec<NodeId>,
    index: BTreeMap<String, NodeId>,
}

impl<P> PathForest<P> {
    /// Builds the forest from any iterable of payloads and their path
    /// function.
    pub fn build<I, F>(payloads: I, path_of: F, opts: ForestOptions) -> Self
    where
        I: IntoIterator<Item = P>,
        F: Fn(&P) -> String,
    {
        // normalize and bucket
        let mut buckets: BTreeMap<String, Vec<P>> = BTreeMap::new();
        for payload in payloads {
            let path = opts.normalize(&path_of(&payload));
            buckets.entry(path).or_default().push(payload);
        }

        // synthesize missing containers
        if opts.synthesize_containers {
            let paths: Vec<String> = buckets.keys().cloned().collect();
            for path in paths {
                let mut cursor = opts.parent_of(&path);
                while let Some(parent) = cursor {
                    if buckets.contains_key(&parent) {
                        break;
                    }
                    cursor = opts.parent_of(&parent);
                    buckets.insert(parent, Vec::new());
                }
            }
        }

        // one node per bucket
        let mut nodes = Vec::with_capacity(buckets.len());
        let mut index = BTreeMap::new();
        for (path, payloads) in buckets {
            let id = nodes.len();
            let is_virtual = payloads.is_empty();
            nodes.push(TreeNode {
                name: opts.name_of(&path).to_string(),
                path: path.clone(),
                children: Vec::new(),
                payloads,
                is_virtual,
                parent: None,
            });
            index.insert(path, id);
        }

        // link children to existing parents; the rest are roots
        let mut roots = Vec::new();
        for id in 0..nodes.len() {
            match opts.parent_of(&nodes[id].path).and_then(|p| index.get(&p).copied()) {
                Some(parent) => {
                    nodes[id].parent = Some(parent);
                    nodes[parent].children.push(id);
                }
                None => roots.push(id),
            }
        }

        let mut forest = Self { opts, nodes, roots, index };
        forest.sort();
        forest
    }

    /// Deterministic child order: containers first (when configured), then
    /// name, then full path.
    fn sort(&mut self) {
        let keys: Vec<(bool, String, String)> = self
            .nodes
            .iter()
            .map(|n| (!n.children.is_empty(), n.name.clone(), n.path.clone()))
            .collect();
        let folder_first = self.opts.folder_first;
        let sort_ids = |ids: &mut Vec<NodeId>| {
            ids.sort_by(|&a, &b| {
                let (a_folder, a_name, a_path) = &keys[a];
                let (b_folder, b_name, b_path) = &keys[b];
                let folder_key = if folder_first {
                    b_folder.cmp(a_folder)
                } else {
                    std::cmp::Ordering::Equal
                };
                folder_key.then_with(|| a_name.cmp(b_name)).then_with(|| a_path.cmp(b_path))
            });
        };
        sort_ids(&mut self.roots);
        for node in &mut self.nodes {
            sort_ids(&mut node.children);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> impl Iterator<Item = &TreeNode<P>> {
        self.roots.iter().map(|&id| &self.nodes[id])
    }

    pub fn node(&self, path: &str) -> Option<&TreeNode<P>> {
        self.index.get(&self.opts.normalize(path)).map(|&id| &self.nodes[id])
    }

    pub fn node_id(&self, path: &str) -> Option<NodeId> {
        self.index.get(&self.opts.normalize(path)).copied()
    }

    pub fn get(&self, id: NodeId) -> &TreeNode<P> {
        &self.nodes[id]
    }

    fn index_child(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id]
            .children
            .iter()
            .copied()
            .find(|&c| self.opts.index_basenames.iter().any(|b| *b == self.nodes[c].name))
    }

    /// The canonical path of a container: its index child when present, the
    /// container's own path otherwise.
    pub fn canonical_path(&self, id: NodeId) -> &str {
        match self.index_child(id) {
            Some(child) => &self.nodes[child].path,
            None => &self.nodes[id].path,
        }
    }

    /// The root-level index node, standing in as the canonical path of the
    /// implicit top-level container.
    fn root_index(&self) -> Option<NodeId> {
        self.roots
            .iter()
            .copied()
            .find(|&id| self.opts.index_basenames.iter().any(|b| *b == self.nodes[id].name))
    }

    /// The breadcrumb parent of `path`: the canonical path of the enclosing
    /// container, or of the grandparent when `path` is itself the
    /// container's index. Nodes at the top level chain to the root-level
    /// index node, when one exists.
    pub fn breadcrumb_parent(&self, path: &str) -> Option<&str> {
        let id = self.node_id(path)?;
        let root_index = self.root_index().filter(|&r| r != id);
        let Some(container) = self.nodes[id].parent else {
            return root_index.map(|r| self.nodes[r].path.as_str());
        };
        if self.canonical_path(container) == self.nodes[id].path {
            return match self.nodes[container].parent {
                Some(grandparent) => Some(self.canonical_path(grandparent)),
                None => root_index.map(|r| self.nodes[r].path.as_str()),
            };
        }
        Some(self.canonical_path(container))
    }

    /// The breadcrumb trail of `path`, root-first and ending at `path`.
    pub fn ancestry(&self, path: &str) -> Vec<String> {
        let Some(id) = self.node_id(path) else { return Vec::new() };
        let mut trail = vec![self.nodes[id].path.clone()];
        let mut cursor = self.nodes[id].path.clone();
        while let Some(parent) = self.breadcrumb_parent(&cursor) {
            trail.push(parent.to_string());
            cursor = parent.to_string();
        }
        trail.reverse();
        trail
    }

    /// All `(parent, child)` edges in deterministic order.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            for &child in &self.nodes[id].children {
                edges.push((self.nodes[id].path.clone(), self.nodes[child].path.clone()));
            }
            stack.extend(self.nodes[id].children.iter().rev());
        }
        edges
    }

    /// Renders the forest as an ASCII tree, one root per top-level entry.
    pub fn to_ascii(&self) -> String {
        let mut out = String::new();
        for &root in &self.roots {
            let _ = writeln!(out, "{}", self.nodes[root].name);
            self.ascii_children(root, "", &mut out);
        }
        out
    }

    fn ascii_children(&self, id: NodeId, indent: &str, out: &mut String) {
        let children = &self.nodes[id].children;
        for (i, &child) in children.iter().enumerate() {
            let last = i + 1 == children.len();
            let branch = if last { "└── " } else { "├── " };
            let _ = writeln!(out, "{indent}{branch}{}", self.nodes[child].name);
            let next_indent =
                if last { format!("{indent}    ") } else { format!("{indent}│   ") };
            self.ascii_children(child, &next_indent, out);
        }
    }
}

impl<P: Serialize> PathForest<P> {
    /// Serializes the forest as nested JSON, roots at the top level.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Array(self.roots.iter().map(|&id| self.node_json(id)).collect())
    }

    fn node_json(&self, id: NodeId) -> serde_json::Value {
        let node = &self.nodes[id];
        let mut obj = serde_json::Map::new();
        obj.insert("path".into(), node.path.clone().into());
        obj.insert("name".into(), node.name.clone().into());
        if node.is_virtual {
            obj.insert("virtual".into(), true.into());
        }
        if !node.payloads.is_empty() {
            obj.insert(
                "payloads".into(),
                serde_json::to_value(&node.payloads).unwrap_or(serde_json::Value::Null),
            );
        }
        if !node.children.is_empty() {
            obj.insert(
                "children".into(),
                serde_json::Value::Array(
                    node.children.iter().map(|&c| self.node_json(c)).collect(),
                ),
            );
        }
        serde_json::Value::Object(obj)
    }

    /// Flattens the forest into table rows, depth-first in display order.
    pub fn flatten(&self) -> Vec<FlatRow> {
        let mut rows = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            rows.push(FlatRow {
                name: node.name.clone(),
                path: node.path.clone(),
                breadcrumb_path: self.breadcrumb_parent(&node.path).map(str::to_string),
                container_index_path: node
                    .parent
                    .map(|p| self.canonical_path(p).to_string()),
                is_virtual: node.is_virtual,
                payload: node
                    .payloads
                    .first()
                    .and_then(|p| serde_json::to_value(p).ok()),
            });
            stack.extend(node.children.iter().rev());
        }
        rows
    }
}
