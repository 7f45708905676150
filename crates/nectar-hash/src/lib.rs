//! # nectar-hash
//!
//! The persistent fingerprint index at the heart of the nectar dedup engine.
//!
//! The index is a fixed-size, memory-resident hash table mirrored to a
//! backing file. The scanner looks up the 64-bit fingerprint of every block
//! it reads; a hit names a prior block with (probably) the same contents,
//! which the engine then asks the filesystem to share. The table is lossy by
//! design: each fingerprint maps to one fixed-size bucket, buckets evict
//! their least-recently-used entries under pressure, and nothing ever
//! rehashes or resizes.
//!
//! ## Layout
//!
//! ```text
//! region (S bytes, anonymous mapping, mirrored to the backing file)
//! └── extent   (16 MiB default)   — unit of file I/O, dirtiness, page-in
//!     └── bucket (4 KiB default)  — unit of association, an MRU list
//!         └── cell (16 bytes)     — (fingerprint, address) pair
//! ```
//!
//! ## Activities
//!
//! Three concerns share the region: scanner threads calling
//! [`HashIndex::find`] / [`HashIndex::push_front`] /
//! [`HashIndex::push_random`] / [`HashIndex::erase`], a writeback thread
//! that persists dirty extents under a rate limit, and an analyzer thread
//! that pages the table in at startup, repairs corrupt cells, and publishes
//! an occupancy report on an interval.

mod addr;
mod layout;
mod region;
mod stats;
mod table;
mod verify;

pub use addr::BlockAddr;
pub use layout::{
    Cell, Geometry, CELL_BYTES, DEFAULT_BUCKET_BYTES, DEFAULT_EXTENT_BYTES, SUM_BLOCK_BYTES,
};
pub use table::{
    HashIndex, IndexConfig, DEFAULT_ANALYZE_INTERVAL, DEFAULT_FILENAME, DEFAULT_FLUSH_RATE,
    STATS_FILENAME,
};

use std::io;

use thiserror::Error;

/// Errors surfaced at construction time. Established indexes degrade
/// per-extent instead of erroring (see the module docs on `table`).
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bucket size {0} must be a power of two no smaller than one cell")]
    BadBucketSize(usize),

    #[error("extent size {extent} must be a positive multiple of bucket size {bucket}")]
    BadExtentSize { extent: usize, bucket: usize },

    #[error("index size {size} must be a positive multiple of extent size {extent}")]
    BadIndexSize { size: u64, extent: usize },
}

pub type Result<T> = std::result::Result<T, IndexError>;
