//! The hash table proper: construction, the four scanner-facing operations,
//! the dirty/missing extent protocol, and the two background threads.
//!
//! ## Locking
//!
//! - `buckets` serialises every cell read-of-range and mutation. Critical
//!   sections are one bucket long, so a single mutex is enough.
//! - `extents` guards the dirty and missing sets and pairs with
//!   `extent_wake` to wake the writeback thread.
//! - `extent_locks` hands out one exclusive fetch lock per extent during
//!   page-in. Never acquired while holding `buckets`.
//!
//! ## Durability
//!
//! Mutations mark their extent dirty; the writeback thread snapshots the
//! dirty set, copies each extent *without* taking the bucket mutex, and
//! writes the copy to the backing file under a rate limit. A mutation racing
//! with the copy may tear a cell in the on-disk image, but it also re-dirties
//! the extent, so a coherent image follows; a torn image that survives a
//! crash is zeroed by the next startup verification pass.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, instrument, warn};

use nectar_util::{Counters, LockSet, RateLimiter, StatsFile};

use crate::addr::BlockAddr;
use crate::layout::{Cell, Geometry, Layout, SUM_BLOCK_BYTES};
use crate::region::Region;
use crate::stats::{self, OccupancySurvey};
use crate::verify;
use crate::Result;

/// Backing file name under the home directory.
pub const DEFAULT_FILENAME: &str = "nectar.hash";

/// Report file name under the home directory.
pub const STATS_FILENAME: &str = "nectar-stats.txt";

/// Byte budget per second for both the flush and prefetch limiters.
pub const DEFAULT_FLUSH_RATE: f64 = (128 * 1024 * 1024) as f64;

/// Pause between occupancy rescans.
pub const DEFAULT_ANALYZE_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How long the writeback thread dozes when the dirty set is empty.
const WRITEBACK_IDLE_WAIT: Duration = Duration::from_millis(250);

/// Granularity at which sleeping threads notice shutdown.
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Construction parameters. `size` shapes newly created files only; an
/// existing backing file keeps its size.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub home: PathBuf,
    pub filename: String,
    pub size: u64,
    pub geometry: Geometry,
    pub flush_rate: f64,
    pub analyze_interval: Duration,
    /// Counter sink; pass the engine-wide one to fold these counters into
    /// the process totals.
    pub counters: Arc<Counters>,
}

impl IndexConfig {
    pub fn new<P: Into<PathBuf>>(home: P, size: u64) -> Self {
        Self {
            home: home.into(),
            filename: DEFAULT_FILENAME.to_string(),
            size,
            geometry: Geometry::default(),
            flush_rate: DEFAULT_FLUSH_RATE,
            analyze_interval: DEFAULT_ANALYZE_INTERVAL,
            counters: Arc::new(Counters::new()),
        }
    }
}

#[derive(Debug)]
struct ExtentSets {
    /// Mutated since last successful flush. Ordered so writeback proceeds
    /// in file order.
    dirty: BTreeSet<u64>,
    /// Not yet read from the backing file since startup.
    missing: HashSet<u64>,
}

struct Core {
    layout: Layout,
    file: File,
    region: Region,
    counters: Arc<Counters>,
    stats_file: StatsFile,
    buckets: Mutex<()>,
    extents: Mutex<ExtentSets>,
    extent_wake: Condvar,
    extent_locks: LockSet<u64>,
    flush_rate: RateLimiter,
    prefetch_rate: RateLimiter,
    toxic: HashSet<u64>,
    shutdown: AtomicBool,
    started: Instant,
    analyze_interval: Duration,
}

/// The persistent fingerprint index.
///
/// Cheap operations (`find` on a toxic hash) never block; everything else
/// may briefly contend on the bucket mutex or, on first touch of an extent,
/// wait for its page-in.
pub struct HashIndex {
    core: Arc<Core>,
    writeback: Option<thread::JoinHandle<()>>,
    analyzer: Option<thread::JoinHandle<()>>,
}

impl HashIndex {
    /// Open or create the backing file, map the table, and start the
    /// writeback and analyzer threads.
    ///
    /// `digest` is the engine's block fingerprint function; it is invoked
    /// 255 times here to precompute the toxic-hash blacklist (one
    /// single-byte-run block per non-zero byte value) and not retained.
    pub fn open<F>(cfg: IndexConfig, digest: F) -> Result<Self>
    where
        F: Fn(&[u8]) -> u64,
    {
        // Validate the requested size before it can shape a new file
        Layout::new(cfg.geometry, cfg.size)?;
        let file = open_backing_file(&cfg)?;

        // An existing file's size wins over the requested size
        let size = file.metadata()?.len();
        let layout = Layout::new(cfg.geometry, size)?;
        let region = Region::anonymous(size as usize)?;

        // Zero-filled blocks are weeded out before fingerprinting, so the
        // blacklist starts at byte value 1
        let mut toxic = HashSet::with_capacity(255);
        for v in 1..=255u8 {
            let block = vec![v; SUM_BLOCK_BYTES];
            toxic.insert(digest(&block));
        }

        let core = Arc::new(Core {
            layout,
            file,
            region,
            counters: cfg.counters.clone(),
            stats_file: StatsFile::new(&cfg.home, STATS_FILENAME),
            buckets: Mutex::new(()),
            extents: Mutex::new(ExtentSets {
                dirty: BTreeSet::new(),
                missing: (0..layout.extents()).collect(),
            }),
            extent_wake: Condvar::new(),
            extent_locks: LockSet::new(),
            flush_rate: RateLimiter::new(cfg.flush_rate),
            prefetch_rate: RateLimiter::new(cfg.flush_rate),
            toxic,
            shutdown: AtomicBool::new(false),
            started: Instant::now(),
            analyze_interval: cfg.analyze_interval,
        });

        info!(
            size = layout.size(),
            buckets = layout.buckets(),
            cells = layout.cells(),
            extents = layout.extents(),
            flush_rate = cfg.flush_rate,
            "hash table ready"
        );

        let writeback = {
            let core = core.clone();
            thread::Builder::new()
                .name("hash-writeback".into())
                .spawn(move || core.writeback_loop())?
        };
        let analyzer = {
            let core = core.clone();
            thread::Builder::new()
                .name("hash-analyze".into())
                .spawn(move || core.analyzer_loop())?
        };

        Ok(Self {
            core,
            writeback: Some(writeback),
            analyzer: Some(analyzer),
        })
    }

    /// All cells whose fingerprint equals `hash` and whose address is
    /// valid, in bucket (MRU) order.
    ///
    /// Toxic fingerprints short-circuit to a single synthetic cell with the
    /// toxic flag set, without touching the store.
    #[instrument(skip(self), level = "trace")]
    pub fn find(&self, hash: u64) -> Vec<Cell> {
        self.core.find(hash)
    }

    /// Make `(hash, addr)` the bucket's MRU entry, inserting it if absent
    /// (evicting the LRU entry from a full bucket). Returns whether the
    /// entry was already present.
    #[instrument(skip(self), level = "trace")]
    pub fn push_front(&self, hash: u64, addr: BlockAddr) -> bool {
        self.core.push_front(hash, addr)
    }

    /// Insert `(hash, addr)` at a random position, preserving a mix of
    /// entry ages in the bucket. Returns whether the entry was already
    /// present (in which case the bucket is modified only when the entry
    /// sat behind the sampled position).
    pub fn push_random(&self, hash: u64, addr: BlockAddr) -> bool {
        let pos = rand::thread_rng().gen_range(0..self.core.layout.cells_per_bucket());
        self.core.push_random_at(hash, addr, pos)
    }

    /// `push_random` with an explicit position instead of a sampled one.
    /// The randomised entry point is the production interface; this one
    /// exists for deterministic tests and replay.
    pub fn push_random_at(&self, hash: u64, addr: BlockAddr, pos: usize) -> bool {
        self.core.push_random_at(hash, addr, pos)
    }

    /// Remove the exact cell `(hash, addr)`, leaving a hole. No-op when
    /// absent. Used when a candidate's address turned out stale.
    pub fn erase(&self, hash: u64, addr: BlockAddr) {
        self.core.erase(hash, addr)
    }

    /// Copy out the entire bucket for `hash`, in MRU order. Diagnostic
    /// interface; does not count as a lookup.
    pub fn dump_bucket(&self, hash: u64) -> Vec<Cell> {
        self.core.dump_bucket(hash)
    }

    /// The index's event counters.
    pub fn counters(&self) -> Arc<Counters> {
        self.core.counters.clone()
    }
}

impl Drop for HashIndex {
    fn drop(&mut self) {
        self.core.shutdown.store(true, Ordering::SeqCst);
        self.core.extent_wake.notify_all();
        if let Some(handle) = self.writeback.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.analyzer.take() {
            let _ = handle.join();
        }
        // Threads are gone; one final synchronous flush settles the file
        self.core.flush_dirty_extents(false);
        debug!("hash table closed");
    }
}

impl Core {
    /// Cell view of one bucket. The guard parameter is proof the bucket
    /// mutex is held.
    fn bucket_cells<'a>(&'a self, _guard: &MutexGuard<'a, ()>, bucket: u64) -> &'a mut [Cell] {
        unsafe {
            self.region.cells_mut(
                self.layout.bucket_offset(bucket),
                self.layout.cells_per_bucket(),
            )
        }
    }

    /// Page in the extent holding `hash`'s bucket; false means the extent
    /// could not be read (already logged and counted).
    fn load_for(&self, hash: u64) -> bool {
        self.ensure_loaded(self.layout.extent_of_hash(hash)).is_ok()
    }

    fn find(&self, hash: u64) -> Vec<Cell> {
        if self.toxic.contains(&hash) {
            // Pathological content; keep it out of the store entirely
            self.counters.count("hash_toxic");
            let mut addr = BlockAddr::new(BlockAddr::MAGIC_LIMIT);
            addr.set_toxic();
            return vec![Cell::new(hash, addr)];
        }
        if !self.load_for(hash) {
            return Vec::new();
        }
        let bucket = self.layout.bucket_of(hash);
        let guard = self.buckets.lock().unwrap();
        let cells = self.bucket_cells(&guard, bucket);
        let matches: Vec<Cell> = cells
            .iter()
            .filter(|c| c.hash == hash && c.addr.is_valid())
            .copied()
            .collect();
        drop(guard);
        self.counters.count("hash_lookup");
        matches
    }

    fn erase(&self, hash: u64, addr: BlockAddr) {
        if !self.load_for(hash) {
            return;
        }
        let target = Cell::new(hash, addr);
        let bucket = self.layout.bucket_of(hash);
        let guard = self.buckets.lock().unwrap();
        let cells = self.bucket_cells(&guard, bucket);
        if let Some(cell) = cells.iter_mut().find(|c| **c == target) {
            // Leave a hole; siblings keep their MRU positions
            *cell = Cell::EMPTY;
            self.set_extent_dirty(self.layout.extent_of_bucket(bucket));
            self.counters.count("hash_erase");
        }
    }

    fn push_front(&self, hash: u64, addr: BlockAddr) -> bool {
        if !self.load_for(hash) {
            return false;
        }
        let target = Cell::new(hash, addr);
        let bucket = self.layout.bucket_of(hash);
        let guard = self.buckets.lock().unwrap();
        let cells = self.bucket_cells(&guard, bucket);

        // Rotation source: the matching cell, else the first hole, else the
        // LRU cell (an eviction)
        let matched = cells.iter().position(|c| *c == target);
        let source = match matched.or_else(|| cells.iter().position(|c| c.is_empty())) {
            Some(i) => i,
            None => {
                self.counters.count("hash_evict");
                cells.len() - 1
            }
        };
        let previous_front = cells[0];
        cells[..=source].rotate_right(1);
        if previous_front != target {
            cells[0] = target;
            self.set_extent_dirty(self.layout.extent_of_bucket(bucket));
            self.counters.count("hash_front");
        }
        matched.is_some()
    }

    fn push_random_at(&self, hash: u64, addr: BlockAddr, pos: usize) -> bool {
        assert!(pos < self.layout.cells_per_bucket());
        if !self.load_for(hash) {
            return false;
        }
        let target = Cell::new(hash, addr);
        let bucket = self.layout.bucket_of(hash);
        let guard = self.buckets.lock().unwrap();
        let cells = self.bucket_cells(&guard, bucket);

        let matched = cells.iter().position(|c| *c == target);
        let dirtied = match matched {
            Some(i) if i > pos => {
                // Bump the entry forward to the sampled position
                cells[pos..=i].rotate_right(1);
                self.counters.count("hash_bump");
                true
            }
            Some(_) => {
                // Already at or ahead of the sampled position
                self.counters.count("hash_already");
                false
            }
            None => {
                if let Some(i) = (pos..cells.len()).find(|&i| cells[i].is_empty()) {
                    cells[i] = target;
                } else if let Some(i) = (0..pos).rev().find(|&i| cells[i].is_empty()) {
                    cells[i] = target;
                } else {
                    // Full bucket: push [pos, end) back one, dropping the
                    // LRU cell, and claim the sampled slot
                    cells[pos..].rotate_right(1);
                    cells[pos] = target;
                    self.counters.count("hash_evict");
                }
                true
            }
        };
        if dirtied {
            self.counters.count("hash_insert");
            self.set_extent_dirty(self.layout.extent_of_bucket(bucket));
        }
        matched.is_some()
    }

    fn dump_bucket(&self, hash: u64) -> Vec<Cell> {
        if !self.load_for(hash) {
            return Vec::new();
        }
        let bucket = self.layout.bucket_of(hash);
        let guard = self.buckets.lock().unwrap();
        self.bucket_cells(&guard, bucket).to_vec()
    }

    /// Make sure `extent`'s in-memory contents reflect the backing file.
    fn ensure_loaded(&self, extent: u64) -> io::Result<()> {
        {
            let sets = self.extents.lock().unwrap();
            if !sets.missing.contains(&extent) {
                return Ok(());
            }
        }

        // Exclusive fetch lock for this extent only. May block behind
        // another thread reading the same extent.
        let _fetch = self.extent_locks.lock(extent);

        {
            let sets = self.extents.lock().unwrap();
            if !sets.missing.contains(&extent) {
                // Someone else fetched it while we waited
                self.counters.count("hash_extent_in_twice");
                return Ok(());
            }
        }

        let len = self.layout.extent_bytes();
        let offset = self.layout.extent_offset(extent);
        // The extent is missing and we hold its fetch lock, so nothing else
        // touches this range
        let dst = unsafe { self.region.bytes_mut(offset, len) };
        if let Err(e) = self.file.read_exact_at(dst, offset as u64) {
            self.counters.count("hash_extent_in_err");
            error!(extent, error = %e, "extent read failed; extent stays missing");
            return Err(e);
        }

        self.counters.count("hash_extent_in");
        // Charge the prefetcher, not the caller
        self.prefetch_rate.borrow(len as u64);

        let mut sets = self.extents.lock().unwrap();
        sets.missing.remove(&extent);
        debug!(extent, still_missing = sets.missing.len(), "extent loaded");
        Ok(())
    }

    fn set_extent_dirty(&self, extent: u64) {
        let mut sets = self.extents.lock().unwrap();
        debug_assert!(
            !sets.missing.contains(&extent),
            "dirtying an unloaded extent"
        );
        sets.dirty.insert(extent);
        self.extent_wake.notify_one();
    }

    /// One writeback cycle: snapshot the dirty set and persist every extent
    /// in it. With `wait_when_idle`, an empty set parks on the condvar
    /// until a mutation (or shutdown) wakes us.
    fn flush_dirty_extents(&self, wait_when_idle: bool) {
        let snapshot: Vec<u64> = {
            let mut sets = self.extents.lock().unwrap();
            if sets.dirty.is_empty() {
                if wait_when_idle {
                    let _ = self
                        .extent_wake
                        .wait_timeout(sets, WRITEBACK_IDLE_WAIT)
                        .unwrap();
                }
                return;
            }
            let snapshot = sets.dirty.iter().copied().collect();
            sets.dirty.clear();
            snapshot
        };

        for extent in snapshot {
            match self.write_extent(extent) {
                Ok(()) => {
                    self.counters.count("hash_extent_out");
                    debug!(extent, "extent flushed");
                }
                Err(e) => {
                    self.counters.count("hash_extent_out_err");
                    warn!(extent, error = %e, "extent flush failed; queued for retry");
                    self.extents.lock().unwrap().dirty.insert(extent);
                }
            }
            self.flush_rate.sleep_for(self.layout.extent_bytes() as u64);
        }
    }

    fn write_extent(&self, extent: u64) -> io::Result<()> {
        let len = self.layout.extent_bytes();
        let offset = self.layout.extent_offset(extent);
        // Copying beats holding the bucket mutex for the whole write; see
        // the module docs for the torn-cell reasoning
        let mut copy = vec![0u8; len];
        self.region.read_into(offset, &mut copy);
        self.file.write_all_at(&copy, offset as u64)
    }

    fn writeback_loop(&self) {
        debug!("writeback thread running");
        while !self.shutdown.load(Ordering::Relaxed) {
            self.flush_dirty_extents(true);
        }
        debug!("writeback thread exiting");
    }

    fn analyzer_loop(&self) {
        // Lookups against a paged-out table are pathological; pin it
        if let Err(e) = self.region.mlock() {
            warn!(error = %e, "mlock failed; table may page out under memory pressure");
        }

        let mut repair = true;
        while !self.shutdown.load(Ordering::Relaxed) {
            let survey = self.scan_extents(repair);
            // Only the startup pass repairs; later passes observe and count
            repair = false;

            info!(
                occupied = survey.occupied_cells,
                total = survey.total_cells,
                "hash table occupancy scan complete"
            );
            let report =
                stats::render_report(&survey, &self.counters.snapshot(), self.started.elapsed());
            if let Err(e) = self.stats_file.write(&report) {
                warn!(error = %e, path = %self.stats_file.path().display(), "stats report write failed");
            }

            self.idle_sleep(self.analyze_interval);
        }
        debug!("analyzer thread exiting");
    }

    /// Walk the whole table: page in, verify, and survey each extent. Each
    /// extent is its own failure domain.
    fn scan_extents(&self, repair: bool) -> OccupancySurvey {
        let mut survey = OccupancySurvey::new(self.layout.cells_per_bucket());
        for extent in 0..self.layout.extents() {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }
            if self.ensure_loaded(extent).is_err() {
                // Logged and counted there; retried next pass
                continue;
            }
            let mut corrected = false;
            {
                let guard = self.buckets.lock().unwrap();
                for bucket in self.layout.extent_buckets(extent) {
                    let cells = self.bucket_cells(&guard, bucket);
                    if verify::verify_cells(cells, repair, &self.counters) && repair {
                        corrected = true;
                    }
                    let mut occupied = 0;
                    for cell in cells.iter() {
                        survey.total_cells += 1;
                        if cell.addr.raw() != 0 {
                            occupied += 1;
                            survey.note_cell(cell.addr);
                        }
                    }
                    survey.note_bucket(occupied);
                }
            }
            if corrected {
                self.set_extent_dirty(extent);
            }
        }
        survey
    }

    fn idle_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(SHUTDOWN_POLL.min(deadline - now));
        }
    }
}

/// Open the backing file, creating it via a temp sibling when absent.
fn open_backing_file(cfg: &IndexConfig) -> Result<File> {
    let path = cfg.home.join(&cfg.filename);
    match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => {
            info!(path = %path.display(), "opened existing hash table file");
            Ok(file)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            // Build under a temp name and rename into place, so a crash
            // never leaves a half-sized table under the real name
            let tmp = cfg.home.join(format!("{}.tmp", cfg.filename));
            let _ = fs::remove_file(&tmp); // stale leftover from a crashed run
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(0o700)
                .open(&tmp)?;
            // Sparse is fine: unwritten pages read back as empty cells
            file.set_len(cfg.size)?;
            fs::rename(&tmp, &path)?;
            info!(path = %path.display(), size = cfg.size, "created hash table file");
            Ok(file)
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::CELL_BYTES;
    use tempfile::TempDir;

    // Distinct per byte value, clear of the small hashes the tests use
    fn test_digest(block: &[u8]) -> u64 {
        0xfeed_0000_0000 | block[0] as u64
    }

    fn addr(raw: u64) -> BlockAddr {
        BlockAddr::new(raw)
    }

    /// An index with `cells` cells per bucket, `buckets` buckets, one
    /// bucket per extent.
    fn tiny_index(cells: usize, buckets: usize) -> (TempDir, HashIndex) {
        let dir = TempDir::new().unwrap();
        let bucket_bytes = cells * CELL_BYTES;
        let mut cfg = IndexConfig::new(dir.path(), (bucket_bytes * buckets) as u64);
        cfg.geometry = Geometry::new(bucket_bytes, bucket_bytes).unwrap();
        let idx = HashIndex::open(cfg, test_digest).unwrap();
        (dir, idx)
    }

    #[test]
    fn test_push_front_into_empty_bucket() {
        let (_dir, idx) = tiny_index(4, 1);
        assert!(!idx.push_front(0x11, addr(0x2000)));
        assert_eq!(
            idx.dump_bucket(0x11),
            vec![
                Cell::new(0x11, addr(0x2000)),
                Cell::EMPTY,
                Cell::EMPTY,
                Cell::EMPTY
            ]
        );
        assert_eq!(idx.counters().get("hash_front"), 1);
    }

    #[test]
    fn test_push_front_promotes_existing() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0xa, addr(0xa000));
        idx.push_front(0xb, addr(0xb000));
        idx.push_front(0xc, addr(0xc000));
        // Bucket is now [C, B, A, -]; promote A
        assert!(idx.push_front(0xa, addr(0xa000)));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(0xa, addr(0xa000)),
                Cell::new(0xc, addr(0xc000)),
                Cell::new(0xb, addr(0xb000)),
                Cell::EMPTY
            ]
        );
    }

    #[test]
    fn test_push_front_idempotent_at_front() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0x11, addr(0x2000));
        let before = idx.counters().get("hash_front");
        assert!(idx.push_front(0x11, addr(0x2000)));
        assert_eq!(idx.counters().get("hash_front"), before);
        assert_eq!(idx.dump_bucket(0)[0], Cell::new(0x11, addr(0x2000)));
    }

    #[test]
    fn test_push_front_full_bucket_evicts_last() {
        let (_dir, idx) = tiny_index(4, 1);
        for (h, a) in [(1u64, 0x1000u64), (2, 0x2000), (3, 0x3000), (4, 0x4000)] {
            idx.push_front(h, addr(a));
        }
        // Bucket: [4, 3, 2, 1]; pushing a new entry drops 1
        assert!(!idx.push_front(5, addr(0x5000)));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(5, addr(0x5000)),
                Cell::new(4, addr(0x4000)),
                Cell::new(3, addr(0x3000)),
                Cell::new(2, addr(0x2000))
            ]
        );
        assert_eq!(idx.counters().get("hash_evict"), 1);
        assert!(idx.find(1).is_empty());
    }

    #[test]
    fn test_erase_leaves_hole() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0xb, addr(0xb000));
        idx.push_front(0xa, addr(0xa000));
        // [A, B, -, -]
        idx.erase(0xb, addr(0xb000));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(0xa, addr(0xa000)),
                Cell::EMPTY,
                Cell::EMPTY,
                Cell::EMPTY
            ]
        );
        assert!(idx.find(0xb).is_empty());
        assert_eq!(idx.counters().get("hash_erase"), 1);
    }

    #[test]
    fn test_erase_missing_is_noop() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0xa, addr(0xa000));
        idx.erase(0xa, addr(0xdead_a000)); // same hash, different addr
        assert_eq!(idx.find(0xa).len(), 1);
        assert_eq!(idx.counters().get("hash_erase"), 0);
    }

    #[test]
    fn test_push_random_bump_from_behind() {
        let (_dir, idx) = tiny_index(4, 1);
        for (h, a) in [(4u64, 0x4000u64), (3, 0x3000), (2, 0x2000), (1, 0x1000)] {
            idx.push_front(h, addr(a));
        }
        // [1, 2, 3, 4]; entry 4 sits at index 3 > pos 1
        assert!(idx.push_random_at(4, addr(0x4000), 1));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(1, addr(0x1000)),
                Cell::new(4, addr(0x4000)),
                Cell::new(2, addr(0x2000)),
                Cell::new(3, addr(0x3000))
            ]
        );
        assert_eq!(idx.counters().get("hash_bump"), 1);
    }

    #[test]
    fn test_push_random_already_ahead() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0x7, addr(0x7000));
        let snapshot = idx.dump_bucket(0);
        // Entry at index 0 <= pos 2: untouched
        assert!(idx.push_random_at(0x7, addr(0x7000), 2));
        assert_eq!(idx.dump_bucket(0), snapshot);
        assert_eq!(idx.counters().get("hash_already"), 1);
        assert_eq!(idx.counters().get("hash_insert"), 0);
    }

    #[test]
    fn test_push_random_takes_empty_after_pos() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0x1, addr(0x1000));
        // [1, -, -, -], pos 1: first hole at or after 1 is index 1
        assert!(!idx.push_random_at(0x9, addr(0x9000), 1));
        assert_eq!(idx.dump_bucket(0)[1], Cell::new(0x9, addr(0x9000)));
    }

    #[test]
    fn test_push_random_falls_back_before_pos() {
        let (_dir, idx) = tiny_index(4, 1);
        // Fill indexes 2 and 3, leave 0 and 1 empty
        idx.push_random_at(0x2, addr(0x2000), 2);
        idx.push_random_at(0x3, addr(0x3000), 3);
        // pos 3: no hole at or after 3, first hole scanning down is 1
        assert!(!idx.push_random_at(0x9, addr(0x9000), 3));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::EMPTY,
                Cell::new(0x9, addr(0x9000)),
                Cell::new(0x2, addr(0x2000)),
                Cell::new(0x3, addr(0x3000))
            ]
        );
    }

    #[test]
    fn test_push_random_full_bucket_evicts() {
        let (_dir, idx) = tiny_index(4, 1);
        for (h, a) in [(4u64, 0x4000u64), (3, 0x3000), (2, 0x2000), (1, 0x1000)] {
            idx.push_front(h, addr(a));
        }
        // [1, 2, 3, 4], pos 1, new entry: 4 falls off the end
        assert!(!idx.push_random_at(9, addr(0x9000), 1));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(1, addr(0x1000)),
                Cell::new(9, addr(0x9000)),
                Cell::new(2, addr(0x2000)),
                Cell::new(3, addr(0x3000))
            ]
        );
        assert_eq!(idx.counters().get("hash_evict"), 1);
        assert!(idx.find(4).is_empty());
    }

    #[test]
    fn test_push_random_full_bucket_at_last_position() {
        let (_dir, idx) = tiny_index(4, 1);
        for (h, a) in [(4u64, 0x4000u64), (3, 0x3000), (2, 0x2000), (1, 0x1000)] {
            idx.push_front(h, addr(a));
        }
        // pos C-1 on a full bucket replaces the LRU cell in place
        assert!(!idx.push_random_at(9, addr(0x9000), 3));
        assert_eq!(
            idx.dump_bucket(0),
            vec![
                Cell::new(1, addr(0x1000)),
                Cell::new(2, addr(0x2000)),
                Cell::new(3, addr(0x3000)),
                Cell::new(9, addr(0x9000))
            ]
        );
    }

    #[test]
    fn test_find_filters_other_hashes() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_front(0x1, addr(0x1000));
        idx.push_front(0x2, addr(0x2000));
        let found = idx.find(0x1);
        assert_eq!(found, vec![Cell::new(0x1, addr(0x1000))]);
    }

    #[test]
    fn test_find_returns_same_hash_entries_in_bucket_order() {
        let (_dir, idx) = tiny_index(4, 1);
        idx.push_random_at(0x5, addr(0x1000), 3);
        idx.push_random_at(0x5, addr(0x2000), 2);
        let found = idx.find(0x5);
        assert_eq!(
            found,
            vec![Cell::new(0x5, addr(0x2000)), Cell::new(0x5, addr(0x1000))]
        );
    }

    #[test]
    fn test_toxic_hash_short_circuits() {
        let (_dir, idx) = tiny_index(4, 1);
        let toxic_hash = test_digest(&[0x17u8; SUM_BLOCK_BYTES]);
        let found = idx.find(toxic_hash);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].hash, toxic_hash);
        assert!(found[0].addr.is_toxic());
        assert_eq!(found[0].addr.raw() & 0xffff, BlockAddr::MAGIC_LIMIT);
        assert_eq!(idx.counters().get("hash_toxic"), 1);
        // The synthetic cell is never stored
        assert!(idx.dump_bucket(toxic_hash).iter().all(|c| c.is_empty()));
    }

    #[test]
    fn test_multi_bucket_isolation() {
        let (_dir, idx) = tiny_index(4, 4);
        // Four hashes landing in four distinct buckets (modulo 4)
        for h in 0u64..4 {
            idx.push_front(h + 4, addr(0x1000 * (h + 1)));
        }
        for h in 0u64..4 {
            assert_eq!(idx.find(h + 4).len(), 1);
        }
    }

    #[test]
    fn test_rejects_stray_file_size() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(DEFAULT_FILENAME), b"not a table").unwrap();
        let mut cfg = IndexConfig::new(dir.path(), 128);
        cfg.geometry = Geometry::new(64, 64).unwrap();
        assert!(HashIndex::open(cfg, test_digest).is_err());
    }

    #[test]
    fn test_rejects_bad_requested_size() {
        let dir = TempDir::new().unwrap();
        let mut cfg = IndexConfig::new(dir.path(), 100); // not a multiple of 64
        cfg.geometry = Geometry::new(64, 64).unwrap();
        assert!(HashIndex::open(cfg, test_digest).is_err());
    }

    #[test]
    fn test_missing_home_directory_fails_fast() {
        let dir = TempDir::new().unwrap();
        let mut cfg = IndexConfig::new(dir.path().join("nope"), 128);
        cfg.geometry = Geometry::new(64, 64).unwrap();
        assert!(HashIndex::open(cfg, test_digest).is_err());
    }

    #[test]
    fn test_creation_is_sparse_and_sized() {
        let dir = TempDir::new().unwrap();
        let mut cfg = IndexConfig::new(dir.path(), 4096);
        cfg.geometry = Geometry::new(64, 128).unwrap();
        let idx = HashIndex::open(cfg, test_digest).unwrap();
        drop(idx);
        let meta = std::fs::metadata(dir.path().join(DEFAULT_FILENAME)).unwrap();
        assert_eq!(meta.len(), 4096);
        // No temp sibling left behind
        assert!(!dir.path().join(format!("{DEFAULT_FILENAME}.tmp")).exists());
    }
}
