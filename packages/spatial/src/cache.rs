//! Radius query result cache with cell-scoped invalidation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use h3o::CellIndex;

use crate::{Coordinates, Neighbor};

/// Entries kept before the cache is flushed wholesale.
const MAX_ENTRIES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    latitude: u64,
    longitude: u64,
    radius: u64,
}

impl CacheKey {
    fn new(center: Coordinates, radius_m: f64) -> Self {
        Self {
            latitude: center.latitude().to_bits(),
            longitude: center.longitude().to_bits(),
            radius: radius_m.to_bits(),
        }
    }
}

/// Cells a cached result was computed from.
pub enum Coverage {
    /// A bounded disk of cells.
    Cells(HashSet<CellIndex>),
    /// Every shard was scanned; any mutation invalidates.
    Everything,
}

impl Coverage {
    fn overlaps(&self, cells: &[CellIndex]) -> bool {
        match self {
            Self::Everything => true,
            Self::Cells(covered) => cells.iter().any(|c| covered.contains(c)),
        }
    }
}

struct CachedQuery {
    coverage: Coverage,
    hits: Arc<[Neighbor]>,
}

/// Caches unfiltered radius query results keyed by exact center and radius.
///
/// Writers bump [`QueryCache::epoch`] after mutating the index and before
/// evicting. A reader only stores a result if the epoch it observed before
/// reading the index is still current, so a result that raced a mutation is
/// never cached.
#[derive(Default)]
pub struct QueryCache {
    entries: Mutex<HashMap<CacheKey, CachedQuery>>,
    epoch: AtomicU64,
}

impl QueryCache {
    fn entries(&self) -> MutexGuard<'_, HashMap<CacheKey, CachedQuery>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current mutation epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn get(&self, center: Coordinates, radius_m: f64) -> Option<Arc<[Neighbor]>> {
        self.entries()
            .get(&CacheKey::new(center, radius_m))
            .map(|cached| Arc::clone(&cached.hits))
    }

    /// Stores a result unless the index changed since `observed_epoch`.
    pub fn insert(
        &self,
        center: Coordinates,
        radius_m: f64,
        coverage: Coverage,
        hits: Arc<[Neighbor]>,
        observed_epoch: u64,
    ) {
        let mut entries = self.entries();
        if self.epoch() != observed_epoch {
            return;
        }
        if entries.len() >= MAX_ENTRIES {
            entries.clear();
        }
        entries.insert(CacheKey::new(center, radius_m), CachedQuery { coverage, hits });
    }

    /// Records a mutation touching `cells` and evicts every overlapping
    /// result.
    pub fn invalidate(&self, cells: &[CellIndex]) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, cached| !cached.coverage.overlaps(cells));
        let evicted = before - entries.len();
        if evicted > 0 {
            log::trace!("Evicted {evicted} cached queries");
        }
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }
}
