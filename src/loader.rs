use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::catalog::TileRecord;
use crate::types::{NodeSignals, TileAsset, TileKey, TilePlacement};

/// Work item handed to a tile loader for a single load or unload.
#[derive(Debug)]
pub struct TileJob {
    pub key: TileKey,
    /// Catalog record, absent for tiles that exist only structurally
    pub record: Option<TileRecord>,
    /// Shared flags for cooperative cancellation checks
    pub signals: Arc<NodeSignals>,
    /// World-space placement, for backends that position the mesh
    pub placement: TilePlacement,
    /// The node's resident asset; present on unload jobs only
    pub asset: Option<TileAsset>,
}

/// Result of a load operation. `asset` is present iff the load succeeded.
#[derive(Debug)]
pub struct LoadOutcome {
    pub success: bool,
    pub asset: Option<TileAsset>,
}

impl LoadOutcome {
    pub fn success(asset: TileAsset) -> Self {
        Self {
            success: true,
            asset: Some(asset),
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            asset: None,
        }
    }
}

/// Result of an unload operation. On failure the resident asset travels
/// back to the node untouched.
#[derive(Debug)]
pub struct UnloadOutcome {
    pub success: bool,
    pub asset: Option<TileAsset>,
}

/// One-shot completion channel: the loader side fires exactly once,
/// eventually, for every issued operation.
pub type Completion<T> = oneshot::Receiver<T>;

/// Asynchronous load/unload of one tile's assets; pluggable backend.
///
/// The caller guarantees at most one operation in flight per node (the
/// node's `updating` flag); the loader guarantees every returned
/// completion eventually fires.
pub trait TileLoader: Send + Sync {
    fn load(&self, job: TileJob) -> Completion<LoadOutcome>;
    fn unload(&self, job: TileJob) -> Completion<UnloadOutcome>;

    /// Re-kick deferred work. The manager calls this once per tick, after
    /// the redundancy pass has refreshed the eviction signals.
    fn pump(&self) {}
}

/// Kind of operation a mock loader observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    Load,
    Unload,
}

struct MockPending {
    remaining: usize,
    op: MockOp,
    key: TileKey,
    load_tx: Option<oneshot::Sender<LoadOutcome>>,
    unload_tx: Option<oneshot::Sender<UnloadOutcome>>,
}

/// Test loader that succeeds unconditionally, after an optional number of
/// pump ticks, and records every call it sees.
#[derive(Default)]
pub struct MockTileLoader {
    /// Pump calls before a queued operation completes; 0 completes at issue
    pub latency: usize,
    calls: Mutex<Vec<(TileKey, MockOp)>>,
    placements: Mutex<Vec<(TileKey, TilePlacement)>>,
    pending: Mutex<Vec<MockPending>>,
}

impl MockTileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: usize) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Every (key, op) pair observed, in call order
    pub fn calls(&self) -> Vec<(TileKey, MockOp)> {
        self.calls.lock().clone()
    }

    /// Placement carried by every load job observed, in call order
    pub fn placements(&self) -> Vec<(TileKey, TilePlacement)> {
        self.placements.lock().clone()
    }

    pub fn count(&self, op: MockOp) -> usize {
        self.calls.lock().iter().filter(|(_, o)| *o == op).count()
    }

    fn complete(pending: MockPending) {
        match pending.op {
            MockOp::Load => {
                if let Some(tx) = pending.load_tx {
                    let _ = tx.send(LoadOutcome::success(TileAsset::empty(pending.key)));
                }
            }
            MockOp::Unload => {
                if let Some(tx) = pending.unload_tx {
                    let _ = tx.send(UnloadOutcome {
                        success: true,
                        asset: None,
                    });
                }
            }
        }
    }
}

impl TileLoader for MockTileLoader {
    fn load(&self, job: TileJob) -> Completion<LoadOutcome> {
        self.calls.lock().push((job.key, MockOp::Load));
        self.placements.lock().push((job.key, job.placement));
        let (tx, rx) = oneshot::channel();
        let pending = MockPending {
            remaining: self.latency,
            op: MockOp::Load,
            key: job.key,
            load_tx: Some(tx),
            unload_tx: None,
        };
        if pending.remaining == 0 {
            Self::complete(pending);
        } else {
            self.pending.lock().push(pending);
        }
        rx
    }

    fn unload(&self, job: TileJob) -> Completion<UnloadOutcome> {
        self.calls.lock().push((job.key, MockOp::Unload));
        let (tx, rx) = oneshot::channel();
        let pending = MockPending {
            remaining: self.latency,
            op: MockOp::Unload,
            key: job.key,
            load_tx: None,
            unload_tx: Some(tx),
        };
        if pending.remaining == 0 {
            drop(job.asset);
            Self::complete(pending);
        } else {
            self.pending.lock().push(pending);
        }
        rx
    }

    fn pump(&self) {
        let mut pending = self.pending.lock();
        let mut still_pending = Vec::new();
        for mut item in pending.drain(..) {
            item.remaining -= 1;
            if item.remaining == 0 {
                Self::complete(item);
            } else {
                still_pending.push(item);
            }
        }
        *pending = still_pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(key: TileKey) -> TileJob {
        TileJob {
            key,
            record: None,
            signals: Arc::new(NodeSignals::default()),
            placement: TilePlacement::axis_aligned(100.0, glam::DVec2::ZERO),
            asset: None,
        }
    }

    #[test]
    fn mock_completes_immediately_without_latency() {
        let loader = MockTileLoader::new();
        let mut rx = loader.load(job(TileKey::new(0, 0, 0)));
        let outcome = rx.try_recv().expect("completion must have fired");
        assert!(outcome.success);
        assert_eq!(outcome.asset.unwrap().key, TileKey::new(0, 0, 0));
        assert_eq!(loader.count(MockOp::Load), 1);
    }

    #[test]
    fn mock_latency_defers_completion_until_pump() {
        let loader = MockTileLoader::with_latency(2);
        let mut rx = loader.load(job(TileKey::new(1, 1, 0)));

        assert!(rx.try_recv().is_err());
        loader.pump();
        assert!(rx.try_recv().is_err());
        loader.pump();
        assert!(rx.try_recv().expect("fired after second pump").success);
    }

    #[test]
    fn mock_unload_fires_exactly_once() {
        let loader = MockTileLoader::new();
        let mut rx = loader.unload(TileJob {
            asset: Some(TileAsset::empty(TileKey::new(0, 0, 0))),
            ..job(TileKey::new(0, 0, 0))
        });
        let outcome = rx.try_recv().unwrap();
        assert!(outcome.success);
        assert!(outcome.asset.is_none());
        // channel is one-shot: a second receive reports closed, not a value
        assert!(rx.try_recv().is_err());
    }
}
