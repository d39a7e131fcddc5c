//! Spill-to-disk buffer cache.
//!
//! Serialized objects live in a fixed memory tier of blocks grouped into
//! inodes and are demoted to size bucketed storage files under memory
//! pressure. [`buffer::BufferManager`] layers quota accounting and tuple
//! buffers on top of the [`cache::TieredCache`].

pub mod bitset;
pub mod blocks;
pub mod buffer;
pub mod cache;
pub mod config;
pub mod directory;
pub mod eviction;
pub mod inode;
pub mod schema;
pub mod storage;

pub use buffer::{BatchCodec, BufferError, BufferManager, BufferReserveMode, TupleBuffer};
pub use cache::{CacheEntry, CacheError, GroupId, ObjectId, Serializer, TieredCache};
pub use config::Config;

/// Routes `tracing` output of a test run through the test harness. Filter
/// with `RUST_LOG`, e.g. `RUST_LOG=spillway=debug`.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
