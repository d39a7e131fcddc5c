use crate::eviction::EvictionKey;
use crate::inode::InodeId;

use parking_lot::Mutex;

/// Where the bytes of an object live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Location {
    /// Registered in its group but never written.
    Absent,
    Memory { inode: InodeId },
    Storage { slot: u32, bucket: usize },
}

/// Bookkeeping of one cached object.
///
/// `pinned` counts readers of the current location, `evicting` and
/// `loading` mark the single relocation that may be in flight. A removed
/// entry keeps its location until the last of them lets go; whoever sees
/// [`PhysicalState::reclaimable`] first frees it.
#[derive(Debug)]
pub(crate) struct PhysicalState {
    pub location: Location,
    /// Length of the framed object.
    pub size: usize,
    pub memory_blocks: usize,
    pub eviction_key: EvictionKey,
    pub pinned: usize,
    pub evicting: bool,
    pub loading: bool,
    pub removed: bool,
}

impl PhysicalState {
    pub fn reclaimable(&self) -> bool {
        self.removed && self.pinned == 0 && !self.evicting && !self.loading
    }

    /// Takes the location of a reclaimable entry, so that it is freed once.
    pub fn take_reclaimable(&mut self) -> Option<Location> {
        if !self.reclaimable() || self.location == Location::Absent {
            return None;
        }
        self.memory_blocks = 0;
        Some(std::mem::replace(&mut self.location, Location::Absent))
    }
}

pub(crate) struct PhysicalInfo {
    pub state: Mutex<PhysicalState>,
}

impl PhysicalInfo {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PhysicalState {
                location: Location::Absent,
                size: 0,
                memory_blocks: 0,
                eviction_key: EvictionKey::UNTOUCHED,
                pinned: 0,
                evicting: false,
                loading: false,
                removed: false,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reclaim_waits_for_readers() {
        let info = PhysicalInfo::new();
        let mut state = info.state.lock();
        state.location = Location::Memory { inode: 3 };
        state.pinned = 1;
        state.removed = true;
        assert_eq!(state.take_reclaimable(), None);

        state.pinned = 0;
        assert_eq!(state.take_reclaimable(), Some(Location::Memory { inode: 3 }));
        // only once
        assert_eq!(state.take_reclaimable(), None);
    }

    #[test]
    fn live_entries_are_kept() {
        let info = PhysicalInfo::new();
        let mut state = info.state.lock();
        state.location = Location::Storage { slot: 1, bucket: 0 };
        assert_eq!(state.take_reclaimable(), None);
        state.removed = true;
        state.evicting = true;
        assert_eq!(state.take_reclaimable(), None);
    }
}
