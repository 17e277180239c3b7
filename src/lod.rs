//! Viewer-distance policy passes over the tile tree.
//!
//! Three whole-tree passes run in fixed order each tick: requirement
//! (top-down, marks which nodes must be resident), redundancy (marks which
//! are safe to evict, with crossfade semantics), then dispatch (in the
//! manager). Each pass runs to completion for the whole tree before the
//! next starts; later passes read the earlier passes' flags.

use glam::DVec2;

use crate::quadtree::{NodeId, TileTree};

impl TileTree {
    /// Requirement pass for one subtree.
    ///
    /// A node is required when no ancestor already satisfies its area
    /// (`satisfied == false`) and the viewer is farther away than the
    /// node's `min_distance`, meaning this resolution suffices. Once a
    /// node is required its whole subtree sees `satisfied == true`, so LOD
    /// selects exactly one resolution per viewer ray.
    pub fn update_requirement(&mut self, id: NodeId, pos: DVec2, satisfied: bool) {
        let node = self.get_mut(id);
        let center = node.origin + DVec2::splat(0.5 * node.size);
        node.distance = center.distance(pos);
        node.required = !satisfied && node.distance > node.min_distance;
        node.signals.set_required(node.required);
        let required = node.required;

        for child in self.children_of(id).into_iter().flatten() {
            self.update_requirement(child, pos, satisfied || required);
        }
    }

    /// Redundancy pass for one subtree. Must run after the requirement
    /// pass has completed for the whole tree; reads `required`, never
    /// writes it.
    ///
    /// For a required node the entire subtree is marked with the node's
    /// own `loaded` state: while the required tile is still loading, its
    /// not-yet-superseded descendants stay resident (`redundant == false`)
    /// so no gap opens; the moment the required tile is in, the whole
    /// descendant subtree becomes evictable in one step.
    ///
    /// A non-required node is evictable only when all of its children are;
    /// otherwise it keeps contributing to an ancestor's coverage and only
    /// reports its own `loaded` state upward.
    pub fn update_redundancy(&mut self, id: NodeId) -> bool {
        if self.get(id).required {
            let loaded = self.get(id).loaded;
            self.set_subtree_redundancy(id, loaded);
            return loaded;
        }

        let mut all_evictable = true;
        for child in self.children_of(id).into_iter().flatten() {
            all_evictable &= self.update_redundancy(child);
        }

        let node = self.get_mut(id);
        node.redundant = all_evictable;
        node.signals.set_unloadable(node.redundant && !node.required);
        if all_evictable {
            true
        } else {
            node.loaded
        }
    }

    fn set_subtree_redundancy(&mut self, id: NodeId, redundant: bool) {
        let node = self.get_mut(id);
        node.redundant = redundant;
        node.signals.set_unloadable(node.redundant && !node.required);
        for child in self.children_of(id).into_iter().flatten() {
            self.set_subtree_redundancy(child, redundant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TileKey;

    /// Single root expanded to `max_level`, with static attributes set the
    /// way the manager sets them (base tile size 100).
    fn build_tree(max_level: u32) -> TileTree {
        let mut tree = TileTree::new();
        let root = tree.insert_root(TileKey::new(0, 0, 0)).unwrap();
        expand(&mut tree, root, max_level);
        for id in tree.ids().collect::<Vec<_>>() {
            let node = tree.get_mut(id);
            let size = 100.0 / (1 << node.key.level) as f64;
            node.size = size;
            node.origin = DVec2::new(size * node.key.x as f64, size * node.key.y as f64);
            node.min_distance = if node.key.level == max_level {
                0.0
            } else {
                size * 2.0_f64.sqrt()
            };
        }
        tree
    }

    fn expand(tree: &mut TileTree, id: NodeId, max_level: u32) {
        let key = tree.get(id).key;
        if key.level >= max_level {
            return;
        }
        for child_key in key.children() {
            let child = tree.insert_child(id, child_key).unwrap();
            expand(tree, child, max_level);
        }
    }

    fn root(tree: &TileTree) -> NodeId {
        tree.roots()[0]
    }

    #[test]
    fn satisfied_suppresses_whole_subtree() {
        let mut tree = build_tree(2);
        tree.update_requirement(root(&tree), DVec2::new(1e6, 1e6), true);
        for id in tree.ids() {
            assert!(!tree.get(id).is_required());
        }
    }

    #[test]
    fn distant_viewer_requires_only_the_root() {
        let mut tree = build_tree(2);
        // far outside the root's min_distance: the coarsest tile suffices
        tree.update_requirement(root(&tree), DVec2::new(10_000.0, 10_000.0), false);
        assert!(tree.get(root(&tree)).is_required());
        for id in tree.ids().skip(1) {
            assert!(!tree.get(id).is_required());
        }
    }

    #[test]
    fn crossfade_holds_descendants_until_required_tile_loads() {
        let mut tree = build_tree(2);
        let r = root(&tree);
        tree.update_requirement(r, DVec2::new(10_000.0, 10_000.0), false);
        assert!(tree.get(r).is_required());

        // pretend the previous working set is still resident
        for id in tree.ids().skip(1).collect::<Vec<_>>() {
            tree.get_mut(id).loaded = true;
        }

        // required tile not loaded yet: nothing below it may be evicted
        tree.update_redundancy(r);
        for id in tree.ids() {
            assert!(!tree.get(id).is_redundant());
            assert!(!tree.get(id).is_unloadable());
        }

        // required tile finished loading: the whole subtree is released
        tree.get_mut(r).loaded = true;
        tree.update_redundancy(r);
        for id in tree.ids().skip(1) {
            assert!(tree.get(id).is_redundant());
            assert!(tree.get(id).is_unloadable());
        }
    }

    #[test]
    fn eviction_is_never_allowed_for_required_nodes() {
        let mut tree = build_tree(2);
        let r = root(&tree);
        for &pos in &[
            DVec2::new(10_000.0, 10_000.0),
            DVec2::new(50.0, 50.0),
            DVec2::new(12.5, 12.5),
        ] {
            for loaded in [false, true] {
                for id in tree.ids().collect::<Vec<_>>() {
                    tree.get_mut(id).loaded = loaded;
                }
                tree.update_requirement(r, pos, false);
                tree.update_redundancy(r);
                for id in tree.ids() {
                    let node = tree.get(id);
                    assert!(
                        !(node.is_unloadable() && node.is_required()),
                        "{} unloadable while required",
                        node.key
                    );
                }
            }
        }
    }

    #[test]
    fn unready_child_blocks_parent_eviction() {
        let mut tree = build_tree(1);
        let r = root(&tree);
        // viewer close to the root center: root not required, leaves are
        tree.update_requirement(r, DVec2::new(50.0, 40.0), false);
        assert!(!tree.get(r).is_required());

        // required leaves that have not finished loading report themselves
        // non-evictable, which keeps the covering root resident
        let child = tree.get_child(r, 0, 0).unwrap();
        tree.get_mut(child).loaded = true;
        tree.get_mut(r).loaded = true;
        tree.update_redundancy(r);
        assert!(!tree.get(r).is_redundant());
        assert!(!tree.get(r).is_unloadable());
    }
}
