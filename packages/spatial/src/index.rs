//! Cell-sharded donor index.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bloodlink_blood_models::DonationStatus;
use chrono::{DateTime, Duration, Utc};
use h3o::{CellIndex, LatLng, Resolution};
use uuid::Uuid;

use crate::cache::{Coverage, QueryCache};
use crate::{
    Coordinates, IndexedDonor, LocationUpdate, Neighbor, SpatialError, UpsertOutcome,
    haversine_meters,
};

/// Cell size used for bucketing (average edge ~3.7 km).
const RESOLUTION: Resolution = Resolution::Six;

const CELL_SHARDS: usize = 64;
const DIRECTORY_SHARDS: usize = 16;

/// Disks wider than this many rings fall back to scanning every shard.
const MAX_DISK_RINGS: u32 = 64;

/// A donor's presence in one cell bucket.
#[derive(Debug, Clone, Copy)]
struct CellEntry {
    seq: u64,
    coordinates: Coordinates,
    status: DonationStatus,
    last_active: DateTime<Utc>,
}

type CellBuckets = HashMap<CellIndex, HashMap<Uuid, CellEntry>>;

/// Authoritative per-donor record. `cell` is `None` while invisible.
#[derive(Debug, Clone, Copy)]
struct DirectoryEntry {
    seq: u64,
    cell: Option<CellIndex>,
    coordinates: Coordinates,
    status: DonationStatus,
    is_visible: bool,
    last_active: DateTime<Utc>,
}

impl DirectoryEntry {
    fn same_report(&self, update: &LocationUpdate, coordinates: Coordinates) -> bool {
        self.last_active == update.timestamp
            && self.coordinates == coordinates
            && self.status == update.status
            && self.is_visible == update.is_visible
    }
}

#[allow(clippy::cast_possible_truncation)]
fn shard_of<T: Hash>(value: &T, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Buckets `cells` by the shard that owns them.
fn group_by_shard(cells: &[CellIndex]) -> BTreeMap<usize, Vec<CellIndex>> {
    let mut grouped: BTreeMap<usize, Vec<CellIndex>> = BTreeMap::new();
    for cell in cells {
        grouped
            .entry(shard_of(cell, CELL_SHARDS))
            .or_default()
            .push(*cell);
    }
    grouped
}

fn cell_of(coordinates: Coordinates) -> Result<CellIndex, SpatialError> {
    LatLng::new(coordinates.latitude(), coordinates.longitude())
        .map(|ll| ll.to_cell(RESOLUTION))
        .map_err(|_| SpatialError::InvalidCoordinates {
            latitude: coordinates.latitude(),
            longitude: coordinates.longitude(),
        })
}

/// Number of rings needed so the disk covers every cell that can hold a
/// point within `radius_m`, or `None` if the disk would be too large.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn rings_for(radius_m: f64) -> Option<u32> {
    let rings = (2.0 * radius_m / RESOLUTION.edge_length_m()).ceil() + 1.0;
    (rings <= f64::from(MAX_DISK_RINGS)).then_some(rings as u32)
}

/// Spatial index of donor locations.
///
/// Updates for one donor are serialized by that donor's directory shard and
/// applied last-writer-wins by report timestamp. A move inserts the donor's
/// new cell entry before deleting the old one; every entry carries a
/// sequence number and queries keep the highest one they see per donor, so
/// a concurrent query never returns a donor twice or a half-applied report.
pub struct GeoIndex {
    cells: Vec<RwLock<CellBuckets>>,
    directory: Vec<Mutex<HashMap<Uuid, DirectoryEntry>>>,
    seq: AtomicU64,
    cache: QueryCache,
}

impl Default for GeoIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl GeoIndex {
    #[must_use]
    pub fn new() -> Self {
        Self {
            cells: (0..CELL_SHARDS).map(|_| RwLock::default()).collect(),
            directory: (0..DIRECTORY_SHARDS).map(|_| Mutex::default()).collect(),
            seq: AtomicU64::new(1),
            cache: QueryCache::default(),
        }
    }

    fn directory_shard(&self, donor_id: Uuid) -> MutexGuard<'_, HashMap<Uuid, DirectoryEntry>> {
        self.directory[shard_of(&donor_id, DIRECTORY_SHARDS)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn cell_shard(&self, cell: CellIndex) -> &RwLock<CellBuckets> {
        &self.cells[shard_of(&cell, CELL_SHARDS)]
    }

    fn insert_into_cell(&self, cell: CellIndex, donor_id: Uuid, entry: CellEntry) {
        let mut shard = self
            .cell_shard(cell)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        shard.entry(cell).or_default().insert(donor_id, entry);
    }

    fn remove_from_cell(&self, cell: CellIndex, donor_id: Uuid, seq: u64) {
        let mut shard = self
            .cell_shard(cell)
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = shard.get_mut(&cell) {
            if bucket.get(&donor_id).is_some_and(|e| e.seq == seq) {
                bucket.remove(&donor_id);
            }
            if bucket.is_empty() {
                shard.remove(&cell);
            }
        }
    }

    /// Applies a location report.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::InvalidCoordinates`] if the report's position
    /// is not a valid WGS84 coordinate. The index is left unchanged.
    pub fn upsert(&self, update: &LocationUpdate) -> Result<UpsertOutcome, SpatialError> {
        let coordinates = Coordinates::new(update.latitude, update.longitude)?;
        let new_cell = cell_of(coordinates)?;

        let mut directory = self.directory_shard(update.donor_id);
        let previous = directory.get(&update.donor_id).copied();

        if let Some(previous) = previous {
            if update.timestamp < previous.last_active {
                log::debug!(
                    "Ignoring stale location for donor {} ({} < {})",
                    update.donor_id,
                    update.timestamp,
                    previous.last_active
                );
                return Ok(UpsertOutcome::Stale);
            }
            if previous.same_report(update, coordinates) {
                return Ok(UpsertOutcome::Unchanged);
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::AcqRel);
        let cell = update.is_visible.then_some(new_cell);

        if let Some(cell) = cell {
            self.insert_into_cell(
                cell,
                update.donor_id,
                CellEntry {
                    seq,
                    coordinates,
                    status: update.status,
                    last_active: update.timestamp,
                },
            );
        }
        // Same-cell updates already overwrote the entry in place.
        if let Some((old_cell, old_seq)) = previous.and_then(|p| p.cell.map(|c| (c, p.seq)))
            && cell != Some(old_cell)
        {
            self.remove_from_cell(old_cell, update.donor_id, old_seq);
        }

        directory.insert(
            update.donor_id,
            DirectoryEntry {
                seq,
                cell,
                coordinates,
                status: update.status,
                is_visible: update.is_visible,
                last_active: update.timestamp,
            },
        );

        let touched: Vec<CellIndex> = previous
            .and_then(|p| p.cell)
            .into_iter()
            .chain(Some(new_cell))
            .collect();
        self.cache.invalidate(&touched);
        drop(directory);

        Ok(UpsertOutcome::Applied)
    }

    /// Forgets a donor entirely. Returns whether the donor was known.
    pub fn remove(&self, donor_id: Uuid) -> bool {
        let mut directory = self.directory_shard(donor_id);
        let Some(previous) = directory.remove(&donor_id) else {
            return false;
        };
        if let Some(cell) = previous.cell {
            self.remove_from_cell(cell, donor_id, previous.seq);
            self.cache.invalidate(&[cell]);
        }
        drop(directory);
        true
    }

    /// The index's current record for a donor, visible or not.
    #[must_use]
    pub fn get(&self, donor_id: Uuid) -> Option<IndexedDonor> {
        self.directory_shard(donor_id)
            .get(&donor_id)
            .map(|entry| IndexedDonor {
                donor_id,
                coordinates: entry.coordinates,
                status: entry.status,
                is_visible: entry.is_visible,
                last_active: entry.last_active,
            })
    }

    /// Visible donors within `radius_m` of `center`, nearest first.
    ///
    /// Ties in distance are broken by donor id. A negative or non-finite
    /// radius matches nothing.
    #[must_use]
    pub fn query(&self, center: Coordinates, radius_m: f64) -> Vec<Neighbor> {
        if !radius_m.is_finite() || radius_m < 0.0 {
            return vec![];
        }
        if let Some(hits) = self.cache.get(center, radius_m) {
            return hits.to_vec();
        }

        let observed_epoch = self.cache.epoch();
        let (hits, coverage) = match rings_for(radius_m).zip(cell_of(center).ok()) {
            Some((rings, origin)) => {
                let disk: Vec<CellIndex> = origin.grid_disk(rings);
                let by_shard = group_by_shard(&disk);
                let hits = self.collect(center, radius_m, by_shard.keys().copied(), |index, shard, found| {
                    for cell in by_shard.get(&index).into_iter().flatten() {
                        if let Some(bucket) = shard.get(cell) {
                            found(bucket);
                        }
                    }
                });
                (hits, Coverage::Cells(disk.into_iter().collect::<HashSet<_>>()))
            }
            None => {
                log::debug!("Radius {radius_m}m too wide for a cell disk, scanning every shard");
                let hits = self.collect(center, radius_m, 0..self.cells.len(), |_, shard, found| {
                    for bucket in shard.values() {
                        found(bucket);
                    }
                });
                (hits, Coverage::Everything)
            }
        };

        let hits: Arc<[Neighbor]> = hits.into();
        self.cache
            .insert(center, radius_m, coverage, Arc::clone(&hits), observed_epoch);
        hits.to_vec()
    }

    /// Read-locks each listed cell shard once and runs `visit` on it, which
    /// hands matching buckets to the collector. Keeps the newest entry per
    /// donor.
    fn collect<F>(
        &self,
        center: Coordinates,
        radius_m: f64,
        shards: impl IntoIterator<Item = usize>,
        visit: F,
    ) -> Vec<Neighbor>
    where
        F: Fn(usize, &CellBuckets, &mut dyn FnMut(&HashMap<Uuid, CellEntry>)),
    {
        let mut newest: HashMap<Uuid, CellEntry> = HashMap::new();

        for index in shards {
            let shard = self.cells[index]
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            visit(index, &shard, &mut |bucket: &HashMap<Uuid, CellEntry>| {
                for (donor_id, entry) in bucket {
                    newest
                        .entry(*donor_id)
                        .and_modify(|kept| {
                            if entry.seq > kept.seq {
                                *kept = *entry;
                            }
                        })
                        .or_insert(*entry);
                }
            });
        }

        let mut hits: Vec<Neighbor> = newest
            .into_iter()
            .filter_map(|(donor_id, entry)| {
                let distance_meters = haversine_meters(center, entry.coordinates);
                (distance_meters <= radius_m).then_some(Neighbor {
                    donor_id,
                    coordinates: entry.coordinates,
                    distance_meters,
                    status: entry.status,
                    last_active: entry.last_active,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance_meters
                .total_cmp(&b.distance_meters)
                .then_with(|| a.donor_id.cmp(&b.donor_id))
        });
        hits
    }

    /// Like [`GeoIndex::query`] but only donors who accept alerts and
    /// reported within `staleness` of `now`.
    #[must_use]
    pub fn query_active(
        &self,
        center: Coordinates,
        radius_m: f64,
        now: DateTime<Utc>,
        staleness: Duration,
    ) -> Vec<Neighbor> {
        let cutoff = now - staleness;
        self.query(center, radius_m)
            .into_iter()
            .filter(|n| n.status.accepts_alerts() && n.last_active >= cutoff)
            .collect()
    }

    /// Up to `k` visible donors nearest to `center`, searching no further
    /// than `max_radius_m`.
    #[must_use]
    pub fn nearest(&self, center: Coordinates, k: usize, max_radius_m: f64) -> Vec<Neighbor> {
        if k == 0 {
            return vec![];
        }
        let mut radius = RESOLUTION.edge_length_m().min(max_radius_m);
        loop {
            let mut hits = self.query(center, radius);
            if hits.len() >= k || radius >= max_radius_m {
                hits.truncate(k);
                return hits;
            }
            radius = (radius * 2.0).min(max_radius_m);
        }
    }

    /// Number of donors known to the index, visible or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.directory
            .iter()
            .map(|shard| shard.lock().unwrap_or_else(PoisonError::into_inner).len())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of donors currently placed in a cell.
    #[must_use]
    pub fn visible_count(&self) -> usize {
        self.cells
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .values()
                    .map(HashMap::len)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Number of cached query results.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }
}
