use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use glam::DVec2;
use thiserror::Error;

/// Identity of a tile in the quadtree: a zoom level plus grid coordinates.
///
/// Coordinates may be negative; the grid is anchored at the catalog origin,
/// not at a corner, so parent/child arithmetic must round toward negative
/// infinity (see [`floor_div`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    /// Zoom level, 0 at the coarsest tiles
    pub level: u32,
    /// X coordinate within the level
    pub x: i32,
    /// Y coordinate within the level
    pub y: i32,
}

impl TileKey {
    /// Create a new tile key
    pub fn new(level: u32, x: i32, y: i32) -> Self {
        Self { level, x, y }
    }

    /// Key of the parent tile, or `None` for a level-0 tile
    pub fn parent(&self) -> Option<TileKey> {
        if self.level == 0 {
            return None;
        }
        Some(TileKey::new(
            self.level - 1,
            floor_div(self.x, 2),
            floor_div(self.y, 2),
        ))
    }

    /// Child slot index within the parent's four slots, `y * 2 + x`
    /// with both parities taken modulo 2 in floor-division semantics.
    pub fn child_slot(&self) -> usize {
        let x = self.x.rem_euclid(2) as usize;
        let y = self.y.rem_euclid(2) as usize;
        y * 2 + x
    }

    /// Keys of the four children, in slot order
    pub fn children(&self) -> [TileKey; 4] {
        let level = self.level + 1;
        let x = self.x * 2;
        let y = self.y * 2;
        [
            TileKey::new(level, x, y),
            TileKey::new(level, x + 1, y),
            TileKey::new(level, x, y + 1),
            TileKey::new(level, x + 1, y + 1),
        ]
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.level, self.x, self.y)
    }
}

/// Integer division rounding toward negative infinity (as opposed to
/// rounding toward zero). `floor_div(-1, 2) == -1` while `-1 / 2 == 0`.
pub fn floor_div(a: i32, b: i32) -> i32 {
    let q = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Error type for tile-related operations
#[derive(Debug, Error)]
pub enum TileError {
    /// Invalid tree mutation or ancestor query
    #[error("structural error: {0}")]
    Structural(String),
    /// A required collaborator is missing or could not be set up
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Network or decode failure while fetching tile assets
    #[error("fetch failed for {url}: {reason}")]
    TransientFetch { url: String, reason: String },
}

/// Opaque handle to an instantiated tile mesh, owned by the embedding
/// renderer. The engine only tracks its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshHandle(pub u64);

/// Opaque handle to an instantiated tile texture. Dimensions are recorded
/// when the backend was able to decode the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle {
    pub id: u64,
    pub dimensions: Option<(u32, u32)>,
}

/// Resident assets of one tile. Present on a node iff the node is loaded.
///
/// A tile backed by no catalog record still gets an asset instance with
/// empty mesh/texture slots; it renders as absent.
#[derive(Debug)]
pub struct TileAsset {
    pub key: TileKey,
    pub mesh: Option<MeshHandle>,
    pub texture: Option<TextureHandle>,
}

impl TileAsset {
    /// Asset placeholder for a tile with no catalog record
    pub fn empty(key: TileKey) -> Self {
        Self {
            key,
            mesh: None,
            texture: None,
        }
    }
}

/// World-space placement of one tile, fixed at node initialization from
/// the catalog. Handed to the backend with each load so the embedding
/// renderer can position the instantiated mesh.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TilePlacement {
    /// Edge length of the tile in world units
    pub size: f64,
    /// World-space position of the tile's minimum corner
    pub origin: DVec2,
    /// Rotation of the whole tile tree, in degrees
    pub rotation: [f64; 3],
    /// Offset from the tile origin to the placement anchor
    pub anchor_offset: DVec2,
}

impl TilePlacement {
    /// Placement with no tree rotation and no anchor offset
    pub fn axis_aligned(size: f64, origin: DVec2) -> Self {
        Self {
            size,
            origin,
            rotation: [0.0; 3],
            anchor_offset: DVec2::ZERO,
        }
    }
}

/// Per-node flags shared with loader workers.
///
/// The manager publishes `required` and `unloadable` here after the
/// requirement and redundancy passes; workers poll them at each pipeline
/// stage for cooperative cancellation. Workers never write.
#[derive(Debug, Default)]
pub struct NodeSignals {
    required: AtomicBool,
    unloadable: AtomicBool,
}

impl NodeSignals {
    pub fn required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    pub fn unloadable(&self) -> bool {
        self.unloadable.load(Ordering::Acquire)
    }

    pub(crate) fn set_required(&self, value: bool) {
        self.required.store(value, Ordering::Release);
    }

    pub(crate) fn set_unloadable(&self, value: bool) {
        self.unloadable.store(value, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn floor_div_rounds_toward_negative_infinity() {
        assert_eq!(floor_div(4, 2), 2);
        assert_eq!(floor_div(5, 2), 2);
        assert_eq!(floor_div(-1, 2), -1);
        assert_eq!(floor_div(-2, 2), -1);
        assert_eq!(floor_div(-3, 2), -2);
        assert_eq!(floor_div(-4, 2), -2);
    }

    #[test]
    fn parent_key_uses_floor_division() {
        assert_eq!(TileKey::new(2, -1, -1).parent(), Some(TileKey::new(1, -1, -1)));
        assert_eq!(TileKey::new(2, -2, 3).parent(), Some(TileKey::new(1, -1, 1)));
        assert_eq!(TileKey::new(0, 0, 0).parent(), None);
    }

    #[test]
    fn child_slot_handles_negative_coordinates() {
        assert_eq!(TileKey::new(1, 0, 0).child_slot(), 0);
        assert_eq!(TileKey::new(1, 1, 0).child_slot(), 1);
        assert_eq!(TileKey::new(1, 0, 1).child_slot(), 2);
        assert_eq!(TileKey::new(1, 1, 1).child_slot(), 3);
        assert_eq!(TileKey::new(1, -1, -1).child_slot(), 3);
        assert_eq!(TileKey::new(1, -2, -1).child_slot(), 2);
    }

    #[test]
    fn children_round_trip_through_parent() {
        for &parent in &[TileKey::new(0, 0, 0), TileKey::new(3, -5, 7)] {
            for child in parent.children() {
                assert_eq!(child.parent(), Some(parent));
            }
        }
    }

    #[test]
    fn key_display_matches_index_format() {
        assert_eq!(TileKey::new(2, -1, 3).to_string(), "2_-1_3");
    }
}
