//! Quadtree LOD streaming engine for tiled terrain surfaces.
//!
//! A terrain surface is partitioned into a quadtree of tiles described by a
//! [`catalog::TileCatalog`]. The [`manager::TileManager`] expands the
//! catalog into an arena-backed tree and, each tick, decides from the
//! viewer position which tiles must be resident (requirement pass), which
//! are safe to evict without opening visual gaps (redundancy pass, with
//! crossfade semantics), and dispatches asynchronous load/unload work to a
//! pluggable [`loader::TileLoader`]. The reference backend,
//! [`scheduler::QueuedBundleLoader`], drains bounded work queues with fixed
//! worker pools, caches fetched asset bundles, and cancels stale work
//! cooperatively by polling between pipeline stages.
//!
//! Rendering is out of scope: "instantiate a mesh with a texture" is an
//! opaque capability behind [`downloader::AssetBackend`].

pub mod cache;
pub mod catalog;
pub mod downloader;
pub mod loader;
pub mod lod;
pub mod manager;
pub mod quadtree;
pub mod scheduler;
pub mod types;

pub use cache::{AssetBundle, BundleCache};
pub use catalog::{fetch_catalog, Projection, TileCatalog, TileRecord};
pub use downloader::{bundle_url, AssetBackend, HttpAssetBackend};
pub use loader::{
    Completion, LoadOutcome, MockOp, MockTileLoader, TileJob, TileLoader, UnloadOutcome,
};
pub use manager::{TileManager, DEFAULT_BUILD_BUDGET};
pub use quadtree::{NodeId, TileTree, TreeNode};
pub use scheduler::{
    QueuedBundleLoader, QueuedLoaderConfig, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS,
};
pub use types::{
    floor_div, MeshHandle, NodeSignals, TextureHandle, TileAsset, TileError, TileKey,
    TilePlacement,
};
