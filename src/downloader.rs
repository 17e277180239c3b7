use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::cache::AssetBundle;
use crate::types::{MeshHandle, TextureHandle, TileAsset, TilePlacement};

/// Build the fetch URL for a tile bundle:
/// `base_url / "bundles" / platform / bundle_file`.
pub fn bundle_url(base_url: &str, platform: &str, bundle_file: &str) -> String {
    let mut url = base_url.trim_end_matches('/').to_string();
    url.push_str("/bundles");
    if !platform.is_empty() {
        url.push('/');
        url.push_str(platform.trim_matches('/'));
    }
    url.push('/');
    url.push_str(bundle_file.trim_start_matches('/'));
    url
}

/// External asset capability: fetching bundles and turning them into live
/// scene objects. The engine never interprets bundles or renders anything
/// itself; it drives this trait.
#[async_trait]
pub trait AssetBackend: Send + Sync + 'static {
    /// Fetch one bundle as a unit.
    async fn fetch_bundle(&self, url: &str) -> Result<AssetBundle>;

    /// Instantiate the tile's mesh from a fetched bundle, positioned at
    /// the given placement.
    async fn instantiate_mesh(
        &self,
        bundle: &AssetBundle,
        mesh_file: &str,
        placement: &TilePlacement,
    ) -> Result<MeshHandle>;

    /// Instantiate the tile's texture from a fetched bundle.
    async fn instantiate_texture(
        &self,
        bundle: &AssetBundle,
        texture_file: &str,
    ) -> Result<TextureHandle>;

    /// Destroy an instantiated tile. Used for eviction and for rolling
    /// back a load that went stale mid-pipeline.
    async fn destroy_tile(&self, asset: TileAsset);
}

/// Backend that fetches bundles over HTTP and hands out opaque handles.
///
/// Mesh instantiation is deliberately thin (the real geometry lives with
/// the embedding renderer); texture payloads are decode-validated with the
/// `image` crate when the bundle carries a plain encoded image.
pub struct HttpAssetBackend {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpAssetBackend {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HttpAssetBackend {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl AssetBackend for HttpAssetBackend {
    async fn fetch_bundle(&self, url: &str) -> Result<AssetBundle> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?
            .error_for_status()
            .with_context(|| format!("bad status from {url}"))?;

        let data = response
            .bytes()
            .await
            .with_context(|| format!("body read from {url} failed"))?
            .to_vec();

        debug!(url, bytes = data.len(), "fetched bundle");
        Ok(AssetBundle {
            url: url.to_string(),
            data,
        })
    }

    async fn instantiate_mesh(
        &self,
        bundle: &AssetBundle,
        mesh_file: &str,
        placement: &TilePlacement,
    ) -> Result<MeshHandle> {
        if bundle.is_empty() {
            bail!("bundle {} is empty, cannot instantiate {mesh_file}", bundle.url);
        }
        debug!(
            mesh = mesh_file,
            size = placement.size,
            x = placement.origin.x,
            y = placement.origin.y,
            "instantiated mesh"
        );
        Ok(MeshHandle(self.next_id()))
    }

    async fn instantiate_texture(
        &self,
        bundle: &AssetBundle,
        texture_file: &str,
    ) -> Result<TextureHandle> {
        if bundle.is_empty() {
            bail!(
                "bundle {} is empty, cannot instantiate {texture_file}",
                bundle.url
            );
        }

        // Tile imagery bundles are commonly a single encoded image; record
        // dimensions when that holds, otherwise leave them to the renderer.
        let dimensions = match image::load_from_memory(&bundle.data) {
            Ok(img) => Some((img.width(), img.height())),
            Err(_) => None,
        };

        Ok(TextureHandle {
            id: self.next_id(),
            dimensions,
        })
    }

    async fn destroy_tile(&self, asset: TileAsset) {
        debug!(key = %asset.key, "destroyed tile assets");
    }
}
