mod store;

pub use store::{BlockByteStore, BlockRef, BlockRefMut};

/// A block number; always below 2^31 so that it fits a signed pointer slot.
pub type BlockNo = u32;

/// Sentinel stored in unused pointer slots.
pub const EMPTY: i32 = -1;
