use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::cache::BundleCache;
use crate::downloader::{bundle_url, AssetBackend};
use crate::loader::{Completion, LoadOutcome, TileJob, TileLoader, UnloadOutcome};
use crate::types::{TileAsset, TileError, TileKey};

/// Workers per queue in the reference configuration
pub const DEFAULT_WORKERS: usize = 5;
/// Bound on each work queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
/// Pump cycles before a parked eviction is flagged as a starvation risk
const STARVATION_WARN_AFTER: u32 = 240;

/// Configuration for [`QueuedBundleLoader`].
#[derive(Debug, Clone)]
pub struct QueuedLoaderConfig {
    /// Root URL of the tile server; bundles live under `bundles/{platform}/`
    pub base_url: String,
    /// Platform segment of the bundle path, supplied by the embedder
    pub platform: String,
    pub load_workers: usize,
    pub unload_workers: usize,
    pub queue_capacity: usize,
}

impl QueuedLoaderConfig {
    pub fn new(base_url: impl Into<String>, platform: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            platform: platform.into(),
            load_workers: DEFAULT_WORKERS,
            unload_workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

struct LoadTask {
    job: TileJob,
    done: oneshot::Sender<LoadOutcome>,
}

struct UnloadTask {
    job: TileJob,
    done: oneshot::Sender<UnloadOutcome>,
    retries: u32,
}

struct Shared {
    backend: Arc<dyn AssetBackend>,
    cache: Mutex<BundleCache>,
    base_url: String,
    platform: String,
    /// Evictions waiting for the redundancy pass to clear them; re-kicked
    /// once per tick by `pump` instead of hot-requeueing
    parked: Mutex<Vec<UnloadTask>>,
}

/// Concrete loader backend: bounded load/unload queues drained by fixed
/// worker pools on a loader-owned runtime, with a shared bundle cache.
///
/// Cancellation is cooperative by polling: workers check the node's
/// requirement signal between pipeline stages and roll completed work back
/// when it went stale. An in-flight fetch or decode always runs to its
/// end; wasted work is accepted, not prevented.
pub struct QueuedBundleLoader {
    shared: Arc<Shared>,
    load_tx: mpsc::Sender<LoadTask>,
    unload_tx: mpsc::Sender<UnloadTask>,
    runtime: Option<Runtime>,
}

impl QueuedBundleLoader {
    pub fn new(
        config: QueuedLoaderConfig,
        backend: Arc<dyn AssetBackend>,
    ) -> Result<Self, TileError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("quadmap-loader")
            .enable_all()
            .build()
            .map_err(|e| TileError::Configuration(format!("loader runtime: {e}")))?;

        let shared = Arc::new(Shared {
            backend,
            cache: Mutex::new(BundleCache::new()),
            base_url: config.base_url,
            platform: config.platform,
            parked: Mutex::new(Vec::new()),
        });

        let (load_tx, load_rx) = mpsc::channel(config.queue_capacity);
        let (unload_tx, unload_rx) = mpsc::channel(config.queue_capacity);

        let load_rx = Arc::new(tokio::sync::Mutex::new(load_rx));
        for _ in 0..config.load_workers.max(1) {
            runtime.spawn(load_worker(Arc::clone(&shared), Arc::clone(&load_rx)));
        }
        let unload_rx = Arc::new(tokio::sync::Mutex::new(unload_rx));
        for _ in 0..config.unload_workers.max(1) {
            runtime.spawn(unload_worker(Arc::clone(&shared), Arc::clone(&unload_rx)));
        }

        info!(
            load_workers = config.load_workers.max(1),
            unload_workers = config.unload_workers.max(1),
            base_url = %shared.base_url,
            "queued bundle loader started"
        );

        Ok(Self {
            shared,
            load_tx,
            unload_tx,
            runtime: Some(runtime),
        })
    }

    /// Number of bundles currently held by the cache
    pub fn cached_bundle_count(&self) -> usize {
        self.shared.cache.lock().len()
    }

    /// Number of evictions parked until a later redundancy pass
    pub fn pending_eviction_count(&self) -> usize {
        self.shared.parked.lock().len()
    }
}

impl TileLoader for QueuedBundleLoader {
    fn load(&self, job: TileJob) -> Completion<LoadOutcome> {
        let (tx, rx) = oneshot::channel();
        match self.load_tx.try_send(LoadTask { job, done: tx }) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) => {
                warn!(key = %task.job.key, "load queue full, dropping request");
                let _ = task.done.send(LoadOutcome::failure());
            }
            Err(TrySendError::Closed(task)) => {
                let _ = task.done.send(LoadOutcome::failure());
            }
        }
        rx
    }

    fn unload(&self, job: TileJob) -> Completion<UnloadOutcome> {
        let (tx, rx) = oneshot::channel();
        match self.unload_tx.try_send(UnloadTask {
            job,
            done: tx,
            retries: 0,
        }) {
            Ok(()) => {}
            Err(TrySendError::Full(mut task)) | Err(TrySendError::Closed(mut task)) => {
                // hand the asset back so the node stays consistent
                let asset = task.job.asset.take();
                let _ = task.done.send(UnloadOutcome {
                    success: false,
                    asset,
                });
            }
        }
        rx
    }

    /// Re-enqueue parked evictions. Called once per tick, after the
    /// redundancy pass has refreshed every node's eviction signal.
    fn pump(&self) {
        let mut parked = self.shared.parked.lock();
        if parked.is_empty() {
            return;
        }
        let mut keep = Vec::new();
        for task in parked.drain(..) {
            match self.unload_tx.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) => keep.push(task),
                Err(TrySendError::Closed(mut task)) => {
                    let asset = task.job.asset.take();
                    let _ = task.done.send(UnloadOutcome {
                        success: false,
                        asset,
                    });
                }
            }
        }
        *parked = keep;
    }
}

impl Drop for QueuedBundleLoader {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

async fn load_worker(shared: Arc<Shared>, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<LoadTask>>>) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else { break };
        let outcome = process_load(&shared, task.job).await;
        let _ = task.done.send(outcome);
    }
}

/// Load pipeline for one tile. Requirement is re-polled after every stage;
/// a stale result is rolled back rather than delivered.
async fn process_load(shared: &Shared, job: TileJob) -> LoadOutcome {
    let key = job.key;

    // cheap pre-check before any work happens
    if !job.signals.required() {
        return LoadOutcome::failure();
    }

    // tiles that exist only structurally resolve to a no-op load
    let Some(record) = job.record.as_ref() else {
        return LoadOutcome::success(TileAsset::empty(key));
    };
    let Some(bundle_file) = record.bundle_file.as_deref() else {
        return LoadOutcome::success(TileAsset::empty(key));
    };

    // fetch unless cached; a failed fetch is not remembered
    let cached = shared.cache.lock().get(&key);
    let bundle = match cached {
        Some(bundle) => bundle,
        None => {
            let url = bundle_url(&shared.base_url, &shared.platform, bundle_file);
            match shared.backend.fetch_bundle(&url).await {
                Ok(bundle) => shared.cache.lock().insert(key, bundle),
                Err(e) => {
                    warn!(key = %key, url = %url, error = %e, "bundle fetch failed");
                    return LoadOutcome::failure();
                }
            }
        }
    };

    if !job.signals.required() {
        rollback(shared, key, None).await;
        return LoadOutcome::failure();
    }

    let mesh = match record.mesh_file.as_deref() {
        Some(name) => match shared
            .backend
            .instantiate_mesh(&bundle, name, &job.placement)
            .await
        {
            Ok(mesh) => Some(mesh),
            Err(e) => {
                warn!(key = %key, error = %e, "mesh instantiation failed");
                rollback(shared, key, None).await;
                return LoadOutcome::failure();
            }
        },
        None => None,
    };

    if !job.signals.required() {
        let partial = TileAsset {
            key,
            mesh,
            texture: None,
        };
        rollback(shared, key, Some(partial)).await;
        return LoadOutcome::failure();
    }

    let texture = match record.texture_file.as_deref() {
        Some(name) => match shared.backend.instantiate_texture(&bundle, name).await {
            Ok(texture) => Some(texture),
            Err(e) => {
                warn!(key = %key, error = %e, "texture instantiation failed");
                let partial = TileAsset {
                    key,
                    mesh,
                    texture: None,
                };
                rollback(shared, key, Some(partial)).await;
                return LoadOutcome::failure();
            }
        },
        None => None,
    };

    if !job.signals.required() {
        let partial = TileAsset { key, mesh, texture };
        rollback(shared, key, Some(partial)).await;
        return LoadOutcome::failure();
    }

    LoadOutcome::success(TileAsset { key, mesh, texture })
}

/// Release whatever a stale or failed load created: the partially built
/// tile and the cached bundle.
async fn rollback(shared: &Shared, key: TileKey, partial: Option<TileAsset>) {
    if let Some(asset) = partial {
        shared.backend.destroy_tile(asset).await;
    }
    shared.cache.lock().evict(&key);
    debug!(key = %key, "rolled back stale load");
}

async fn unload_worker(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<UnloadTask>>>,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(mut task) = task else { break };

        // dispatch ordering should make this impossible
        if task.job.signals.required() {
            warn!(key = %task.job.key, "unload dispatched for a required tile");
            let asset = task.job.asset.take();
            let _ = task.done.send(UnloadOutcome {
                success: false,
                asset,
            });
            continue;
        }

        // crossfade still in progress; try again after a later
        // redundancy pass
        if !task.job.signals.unloadable() {
            task.retries += 1;
            if task.retries == STARVATION_WARN_AFTER {
                warn!(
                    key = %task.job.key,
                    retries = task.retries,
                    "eviction pending for many ticks, tile may never unload"
                );
            }
            shared.parked.lock().push(task);
            continue;
        }

        if let Some(asset) = task.job.asset.take() {
            shared.backend.destroy_tile(asset).await;
        }
        shared.cache.lock().evict(&task.job.key);
        debug!(key = %task.job.key, "tile unloaded");
        let _ = task.done.send(UnloadOutcome {
            success: true,
            asset: None,
        });
    }
}
