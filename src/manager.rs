use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::DVec2;
use tokio::sync::oneshot::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::catalog::TileCatalog;
use crate::loader::{Completion, LoadOutcome, TileJob, TileLoader, UnloadOutcome};
use crate::quadtree::{NodeId, TileTree};
use crate::types::{TileAsset, TileError, TilePlacement};

/// Default per-tick budget for amortized tree construction: one 60 Hz frame
pub const DEFAULT_BUILD_BUDGET: Duration = Duration::from_micros(16_667);

enum PendingOp {
    Load(Completion<LoadOutcome>),
    Unload(Completion<UnloadOutcome>),
}

enum Finished {
    Load(LoadOutcome),
    Unload(UnloadOutcome),
    /// The loader dropped the completion channel without firing it; the
    /// contract forbids this, so treat the assets as gone
    Lost,
}

/// Owner of the LOD tree and driver of the per-tick streaming algorithm.
///
/// Construction expands the catalog into a complete quadtree breadth-first,
/// amortized across ticks under a small time budget. Once built, every tick
/// runs the passes in fixed order (requirement, redundancy, dispatch) after
/// applying any load/unload completions that arrived since the previous
/// tick.
pub struct TileManager {
    catalog: TileCatalog,
    tree: TileTree,
    loader: Option<Arc<dyn TileLoader>>,
    build_queue: VecDeque<NodeId>,
    build_budget: Duration,
    setup_complete: bool,
    inflight: HashMap<NodeId, PendingOp>,
}

impl TileManager {
    /// Create the manager and seed the tree with one root per level-0
    /// catalog record. The rest of the tree is expanded by `tick`.
    pub fn new(catalog: TileCatalog) -> Result<Self, TileError> {
        let mut tree = TileTree::new();
        let mut build_queue = VecDeque::new();
        for record in catalog.tiles.iter().filter(|r| r.level == 0) {
            let id = tree.insert_root(record.key())?;
            build_queue.push_back(id);
        }

        Ok(Self {
            catalog,
            tree,
            loader: None,
            build_queue,
            build_budget: DEFAULT_BUILD_BUDGET,
            setup_complete: false,
            inflight: HashMap::new(),
        })
    }

    /// Inject the loader every dispatched operation will go through.
    /// Dispatching without one is a configuration error.
    pub fn set_loader(&mut self, loader: Arc<dyn TileLoader>) {
        self.loader = Some(loader);
    }

    /// Override the per-tick construction budget
    pub fn set_build_budget(&mut self, budget: Duration) {
        self.build_budget = budget;
    }

    pub fn tree(&self) -> &TileTree {
        &self.tree
    }

    pub fn catalog(&self) -> &TileCatalog {
        &self.catalog
    }

    /// Whether the catalog has been fully expanded into the tree
    pub fn setup_complete(&self) -> bool {
        self.setup_complete
    }

    /// Operations currently in flight at the loader
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// Number of nodes with resident assets
    pub fn loaded_count(&self) -> usize {
        self.tree.ids().filter(|&id| self.tree.get(id).is_loaded()).count()
    }

    /// Advance the engine by one tick.
    ///
    /// `viewer` is the viewer's position in the same plane as the tile
    /// grid, relative to the world origin; the catalog's tree position is
    /// added on top, mirroring how the tiles themselves are placed.
    pub fn tick(&mut self, viewer: DVec2) -> Result<(), TileError> {
        self.drain_completions();

        if !self.setup_complete {
            self.continue_build()?;
            if !self.setup_complete {
                return Ok(());
            }
            info!(nodes = self.tree.len(), "tile tree construction complete");
        }

        let pos = self.catalog.position() + viewer;
        let roots = self.tree.roots().to_vec();

        // pass ordering matters: redundancy reads every node's requirement,
        // dispatch reads redundancy through the eviction signals
        for &root in &roots {
            self.tree.update_requirement(root, pos, false);
        }
        for &root in &roots {
            self.tree.update_redundancy(root);
        }

        if let Some(loader) = &self.loader {
            loader.pump();
        }

        #[cfg(feature = "tile_debug")]
        debug!("tile tree state:\n{}", self.tree.dump());

        for root in roots {
            self.dispatch(root)?;
        }
        Ok(())
    }

    /// Resume breadth-first catalog expansion until the queue drains or
    /// the tick budget is spent.
    fn continue_build(&mut self) -> Result<(), TileError> {
        let start = Instant::now();
        while let Some(id) = self.build_queue.pop_front() {
            self.init_node(id);

            let key = self.tree.get(id).key;
            if key.level < self.catalog.max_level {
                for child_key in key.children() {
                    let child = self.tree.insert_child(id, child_key)?;
                    self.build_queue.push_back(child);
                }
            }

            if start.elapsed() > self.build_budget {
                debug!(
                    remaining = self.build_queue.len(),
                    "construction budget spent, resuming next tick"
                );
                return Ok(());
            }
        }
        self.setup_complete = true;
        Ok(())
    }

    /// Compute a node's static attributes from the catalog. Runs once per
    /// node during construction.
    fn init_node(&mut self, id: NodeId) {
        let key = self.tree.get(id).key;
        let record = self.catalog.find_tile(key.level, key.x, key.y).cloned();

        let size = self.catalog.base_tile_size / 2f64.powi(key.level as i32);
        let origin =
            self.catalog.position() + DVec2::new(size * key.x as f64, size * key.y as f64);
        let min_distance = if key.level == self.catalog.max_level {
            0.0
        } else {
            size * 2f64.sqrt()
        };

        let node = self.tree.get_mut(id);
        node.record = record;
        node.size = size;
        node.origin = origin;
        node.min_distance = min_distance;
    }

    /// Apply every completion that fired since the last tick: store or
    /// drop assets, update `loaded`, release the per-node `updating` guard.
    fn drain_completions(&mut self) {
        let mut finished = Vec::new();
        for (&id, op) in self.inflight.iter_mut() {
            let done = match op {
                PendingOp::Load(rx) => match rx.try_recv() {
                    Ok(outcome) => Some(Finished::Load(outcome)),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Closed) => Some(Finished::Lost),
                },
                PendingOp::Unload(rx) => match rx.try_recv() {
                    Ok(outcome) => Some(Finished::Unload(outcome)),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Closed) => Some(Finished::Lost),
                },
            };
            if let Some(done) = done {
                finished.push((id, done));
            }
        }

        for (id, done) in finished {
            self.inflight.remove(&id);
            let node = self.tree.get_mut(id);
            node.updating = false;
            match done {
                Finished::Load(outcome) => {
                    node.loaded = outcome.success;
                    node.tile_handle = if outcome.success { outcome.asset } else { None };
                    debug!(key = %node.key, success = outcome.success, "load completed");
                }
                Finished::Unload(outcome) => {
                    node.loaded = !outcome.success;
                    if !outcome.success {
                        node.tile_handle = outcome.asset;
                    }
                    debug!(key = %node.key, success = outcome.success, "unload completed");
                }
                Finished::Lost => {
                    warn!(key = %node.key, "loader dropped a completion channel");
                    node.loaded = false;
                    node.tile_handle = None;
                }
            }
        }
    }

    /// Dispatch pass: issue a load for required-but-absent nodes and an
    /// unload for resident-but-unrequired ones, guarded per node by the
    /// `updating` flag. A node mid-update never blocks its descendants.
    fn dispatch(&mut self, id: NodeId) -> Result<(), TileError> {
        let node = self.tree.get(id);
        if !node.updating {
            if node.required && !node.loaded {
                let loader = self.require_loader()?;
                let job = self.make_job(id, None);
                let rx = loader.load(job);
                self.tree.get_mut(id).updating = true;
                self.inflight.insert(id, PendingOp::Load(rx));
            } else if !node.required && node.loaded {
                let loader = self.require_loader()?;
                let asset = self.tree.get_mut(id).tile_handle.take();
                let job = self.make_job(id, asset);
                let rx = loader.unload(job);
                self.tree.get_mut(id).updating = true;
                self.inflight.insert(id, PendingOp::Unload(rx));
            }
        }

        for child in self.tree.children_of(id).into_iter().flatten() {
            self.dispatch(child)?;
        }
        Ok(())
    }

    fn require_loader(&self) -> Result<Arc<dyn TileLoader>, TileError> {
        self.loader.clone().ok_or_else(|| {
            TileError::Configuration("a tile loader must be assigned before dispatch".into())
        })
    }

    fn make_job(&self, id: NodeId, asset: Option<TileAsset>) -> TileJob {
        let node = self.tree.get(id);
        TileJob {
            key: node.key,
            record: node.record.clone(),
            signals: Arc::clone(node.signals()),
            placement: TilePlacement {
                size: node.size(),
                origin: node.origin(),
                rotation: self.catalog.rotation,
                anchor_offset: self.catalog.anchor_offset(),
            },
            asset,
        }
    }
}
