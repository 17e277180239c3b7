use std::collections::HashMap;

use glam::DVec2;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{TileError, TileKey};

/// One tile record in the catalog.
///
/// Asset file names are optional: a tile can exist in the grid without any
/// assets behind it, in which case loading it is a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct TileRecord {
    pub level: u32,
    pub x: i32,
    pub y: i32,
    #[serde(default)]
    pub mesh_file: Option<String>,
    #[serde(default)]
    pub texture_file: Option<String>,
    #[serde(default)]
    pub bundle_file: Option<String>,
}

impl TileRecord {
    pub fn key(&self) -> TileKey {
        TileKey::new(self.level, self.x, self.y)
    }
}

/// Projection descriptor, passed through to the external coordinate
/// transform collaborator. The streaming engine never interprets it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Projection {
    pub utm_zone: u8,
    pub hemisphere: String,
}

/// Read-only description of which tiles exist and where their assets live.
///
/// The manager consumes this to build the LOD tree; it never mutates it.
/// Field names mirror the tiling pipeline's metadata document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TileCatalog {
    /// World-space position of the tile tree origin
    #[serde(default)]
    pub position: [f64; 2],
    /// World-space rotation of the whole tree, in degrees
    #[serde(default)]
    pub rotation: [f64; 3],
    /// Offset from the tree origin to the placement anchor
    #[serde(default)]
    pub anchor_offset: [f64; 2],
    /// Deepest level the quadtree expands to
    pub max_level: u32,
    /// Edge length of a level-0 tile in world units
    pub base_tile_size: f64,
    #[serde(default)]
    pub projection: Option<Projection>,
    pub tiles: Vec<TileRecord>,

    #[serde(skip)]
    index: HashMap<TileKey, usize>,
}

impl TileCatalog {
    /// Parse a catalog from its JSON metadata document and index it.
    pub fn from_json(json: &str) -> Result<Self, TileError> {
        let mut catalog: TileCatalog =
            serde_json::from_str(json).map_err(|e| TileError::Configuration(e.to_string()))?;
        catalog.create_index();
        Ok(catalog)
    }

    /// Serialize the catalog back to its JSON metadata document.
    pub fn to_json(&self) -> Result<String, TileError> {
        serde_json::to_string_pretty(self).map_err(|e| TileError::Configuration(e.to_string()))
    }

    /// Build the key -> record index. Called by the constructors; callers
    /// that assemble a catalog by hand must call it before lookups.
    pub fn create_index(&mut self) {
        self.index = self
            .tiles
            .iter()
            .enumerate()
            .map(|(i, record)| (record.key(), i))
            .collect();
    }

    /// Look up the record for a tile, if the catalog has one.
    pub fn find_tile(&self, level: u32, x: i32, y: i32) -> Option<&TileRecord> {
        self.index
            .get(&TileKey::new(level, x, y))
            .map(|&i| &self.tiles[i])
    }

    /// Tree origin as a vector
    pub fn position(&self) -> DVec2 {
        DVec2::new(self.position[0], self.position[1])
    }

    /// Placement anchor offset as a vector
    pub fn anchor_offset(&self) -> DVec2 {
        DVec2::new(self.anchor_offset[0], self.anchor_offset[1])
    }

    /// Generate a synthetic catalog: a square of `(2 * radius + 1)^2`
    /// level-0 roots, each fully expanded down to `max_level`. Useful for
    /// tests and for exercising the engine without a tile server.
    pub fn mock(radius: i32, max_level: u32) -> Self {
        let mut tiles = Vec::new();
        for i in -radius..=radius {
            for j in -radius..=radius {
                push_subtree(&mut tiles, 0, i, j, max_level);
            }
        }
        debug!(tiles = tiles.len(), "generated mock catalog");

        let mut catalog = Self {
            position: [0.0, 0.0],
            rotation: [0.0, 0.0, 0.0],
            anchor_offset: [0.0, 0.0],
            max_level,
            base_tile_size: 100.0,
            projection: None,
            tiles,
            index: HashMap::new(),
        };
        catalog.create_index();
        catalog
    }
}

fn push_subtree(tiles: &mut Vec<TileRecord>, level: u32, x: i32, y: i32, max_level: u32) {
    tiles.push(TileRecord {
        level,
        x,
        y,
        mesh_file: Some(format!("L{level}_{x}_{y}.obj")),
        texture_file: Some(format!("L{level}_{x}_{y}.png")),
        bundle_file: Some(format!("L{level}_{x}_{y}.bundle")),
    });

    if level == max_level {
        return;
    }

    for row in 0..2 {
        for col in 0..2 {
            push_subtree(tiles, level + 1, x * 2 + col, y * 2 + row, max_level);
        }
    }
}

/// Fetch and parse the catalog document from `{base_url}/metadata.json`.
pub async fn fetch_catalog(
    client: &reqwest::Client,
    base_url: &str,
) -> Result<TileCatalog, TileError> {
    let url = format!("{}/metadata.json", base_url.trim_end_matches('/'));
    let fetch_err = |reason: String| TileError::TransientFetch {
        url: url.clone(),
        reason,
    };

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| fetch_err(e.to_string()))?
        .error_for_status()
        .map_err(|e| fetch_err(e.to_string()))?;

    let mut catalog: TileCatalog = response
        .json()
        .await
        .map_err(|e| fetch_err(e.to_string()))?;
    catalog.create_index();
    Ok(catalog)
}
