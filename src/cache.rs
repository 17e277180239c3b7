use std::collections::HashMap;
use std::sync::Arc;

use crate::types::TileKey;

/// A fetched asset bundle: one tile's packaged mesh/texture payload,
/// pulled as a single unit. The engine treats the contents as opaque;
/// only the backend interprets them.
#[derive(Debug)]
pub struct AssetBundle {
    /// URL the bundle was fetched from
    pub url: String,
    pub data: Vec<u8>,
}

impl AssetBundle {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Cache of fetched bundles, keyed by the owning node's tile key.
///
/// Unbounded, no eviction policy and no negative caching: a failed fetch
/// leaves no entry and will be re-attempted the next time the tile is
/// required. Entries are removed explicitly when a tile is unloaded or a
/// stale load is rolled back.
#[derive(Debug, Default)]
pub struct BundleCache {
    bundles: HashMap<TileKey, Arc<AssetBundle>>,
}

impl BundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: TileKey, bundle: AssetBundle) -> Arc<AssetBundle> {
        let bundle = Arc::new(bundle);
        self.bundles.insert(key, Arc::clone(&bundle));
        bundle
    }

    pub fn get(&self, key: &TileKey) -> Option<Arc<AssetBundle>> {
        self.bundles.get(key).cloned()
    }

    pub fn contains(&self, key: &TileKey) -> bool {
        self.bundles.contains_key(key)
    }

    /// Drop the cached bundle for a node, if any. Reference counting is
    /// not tracked; presence is the only state.
    pub fn evict(&mut self, key: &TileKey) -> Option<Arc<AssetBundle>> {
        self.bundles.remove(key)
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(url: &str) -> AssetBundle {
        AssetBundle {
            url: url.to_string(),
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn insert_get_evict_round_trip() {
        let mut cache = BundleCache::new();
        let key = TileKey::new(1, 0, 1);
        assert!(cache.get(&key).is_none());

        cache.insert(key, bundle("http://tiles/b"));
        assert!(cache.contains(&key));
        assert_eq!(cache.get(&key).unwrap().len(), 3);

        assert!(cache.evict(&key).is_some());
        assert!(cache.get(&key).is_none());
        assert!(cache.evict(&key).is_none());
        assert!(cache.is_empty());
    }
}
