use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use glam::DVec2;

use crate::catalog::TileRecord;
use crate::types::{floor_div, NodeSignals, TileAsset, TileError, TileKey};

/// Handle to a node in the tree arena.
///
/// Parent/child links are arena indices rather than owning references, so
/// the bidirectional tree carries no ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

/// One quadtree node: spatial identity plus the per-tick LOD policy state.
///
/// Static attributes (`size`, `origin`, `min_distance`, `record`) are set
/// once during tree construction; the boolean flags and `distance` are
/// rewritten every tick by the LOD passes.
#[derive(Debug)]
pub struct TreeNode {
    pub key: TileKey,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: [Option<NodeId>; 4],

    pub(crate) required: bool,
    pub(crate) redundant: bool,
    pub(crate) loaded: bool,
    pub(crate) updating: bool,
    pub(crate) distance: f64,

    pub(crate) size: f64,
    pub(crate) origin: DVec2,
    pub(crate) min_distance: f64,

    pub(crate) record: Option<TileRecord>,
    pub(crate) tile_handle: Option<TileAsset>,
    pub(crate) signals: Arc<NodeSignals>,
}

impl TreeNode {
    fn new(key: TileKey, parent: Option<NodeId>) -> Self {
        Self {
            key,
            parent,
            children: [None; 4],
            required: false,
            redundant: false,
            loaded: false,
            updating: false,
            distance: 0.0,
            size: 0.0,
            origin: DVec2::ZERO,
            min_distance: 0.0,
            record: None,
            tile_handle: None,
            signals: Arc::new(NodeSignals::default()),
        }
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn is_updating(&self) -> bool {
        self.updating
    }

    pub fn is_redundant(&self) -> bool {
        self.redundant
    }

    /// Whether the eviction policy allows destroying this node's assets
    /// right now. Trusts the flags from the current tick's passes rather
    /// than re-deriving from parent/children state.
    pub fn is_unloadable(&self) -> bool {
        self.redundant && !self.required
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn min_distance(&self) -> f64 {
        self.min_distance
    }

    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn origin(&self) -> DVec2 {
        self.origin
    }

    pub fn center(&self) -> DVec2 {
        self.origin + DVec2::splat(0.5 * self.size)
    }

    pub fn record(&self) -> Option<&TileRecord> {
        self.record.as_ref()
    }

    pub fn tile_handle(&self) -> Option<&TileAsset> {
        self.tile_handle.as_ref()
    }

    pub fn signals(&self) -> &Arc<NodeSignals> {
        &self.signals
    }
}

/// Arena-backed quadtree of streaming tiles.
#[derive(Debug, Default)]
pub struct TileTree {
    nodes: Vec<TreeNode>,
    roots: Vec<NodeId>,
    by_key: HashMap<TileKey, NodeId>,
}

impl TileTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn get(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut TreeNode {
        &mut self.nodes[id.0 as usize]
    }

    /// Look up a node by its tile key
    pub fn find(&self, key: TileKey) -> Option<NodeId> {
        self.by_key.get(&key).copied()
    }

    /// Iterate over every node id in creation (breadth-first) order
    pub fn ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len() as u32).map(NodeId)
    }

    /// Create a parentless root node
    pub fn insert_root(&mut self, key: TileKey) -> Result<NodeId, TileError> {
        if self.by_key.contains_key(&key) {
            return Err(TileError::Structural(format!("node {key} already exists")));
        }
        let id = self.push(TreeNode::new(key, None));
        self.roots.push(id);
        Ok(id)
    }

    /// Create a node and wire it into the parent's slot computed from the
    /// child coordinates' parity. Fails if the child key does not belong
    /// under the parent.
    pub fn insert_child(&mut self, parent: NodeId, key: TileKey) -> Result<NodeId, TileError> {
        if self.by_key.contains_key(&key) {
            return Err(TileError::Structural(format!("node {key} already exists")));
        }

        let parent_key = self.get(parent).key;
        if key.level != parent_key.level + 1 {
            return Err(TileError::Structural(format!(
                "child level {} does not match parent's {}",
                key.level, parent_key.level
            )));
        }
        if floor_div(key.x, 2) != parent_key.x || floor_div(key.y, 2) != parent_key.y {
            return Err(TileError::Structural(format!(
                "child x/y pair ({}, {}) does not match parent's ({}, {})",
                key.x, key.y, parent_key.x, parent_key.y
            )));
        }

        let id = self.push(TreeNode::new(key, Some(parent)));
        self.get_mut(parent).children[key.child_slot()] = Some(id);
        Ok(id)
    }

    /// Child slot lookup; `x` and `y` are coordinate parities. Larger
    /// values are reduced to their parity rather than indexing out of range.
    pub fn get_child(&self, parent: NodeId, x: usize, y: usize) -> Option<NodeId> {
        self.get(parent).children[(y & 1) * 2 + (x & 1)]
    }

    /// All four child slots of a node, in `y * 2 + x` order
    pub fn children_of(&self, id: NodeId) -> [Option<NodeId>; 4] {
        self.get(id).children
    }

    /// Walk parent links upward until a node at `level` is found. Asking
    /// for a level no ancestor has is an implementer error and reported as
    /// a structural error.
    pub fn find_ancestor(&self, id: NodeId, level: u32) -> Result<NodeId, TileError> {
        let mut current = id;
        loop {
            let node = self.get(current);
            if node.key.level == level {
                return Ok(current);
            }
            match node.parent {
                Some(parent) => current = parent,
                None => {
                    return Err(TileError::Structural(format!(
                        "no ancestor of {} at level {level}",
                        self.get(id).key
                    )))
                }
            }
        }
    }

    /// Indented listing of every subtree, one node per line. Diagnostic
    /// only; gated behind the `tile_debug` feature at the call site.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for &root in &self.roots {
            self.dump_node(root, &mut out);
        }
        out
    }

    fn dump_node(&self, id: NodeId, out: &mut String) {
        let node = self.get(id);
        let indent = (1 + node.key.level as usize) * 2;
        let _ = writeln!(out, "{:indent$}{}", "", node.key);
        for child in node.children.into_iter().flatten() {
            self.dump_node(child, out);
        }
    }

    fn push(&mut self, node: TreeNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.by_key.insert(node.key, id);
        self.nodes.push(node);
        id
    }
}
