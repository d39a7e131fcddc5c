use crate::cache::entry::PhysicalInfo;
use crate::cache::{GroupId, ObjectId};
use crate::directory::BlockHashDirectory;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Directory value of members whose bytes are not in memory.
pub(crate) const NO_INODE: i32 = -1;

/// A namespace of cached objects.
///
/// The block directory is the authoritative member list, mapping each
/// object id to its inode (or [`NO_INODE`]); `entries` holds the
/// bookkeeping of the same members.
pub(crate) struct CacheGroup {
    pub id: GroupId,
    pub state: Mutex<GroupState>,
}

pub(crate) struct GroupState {
    pub directory: Option<BlockHashDirectory>,
    pub entries: HashMap<ObjectId, Arc<PhysicalInfo>>,
}

impl CacheGroup {
    pub fn new(id: GroupId, directory: BlockHashDirectory) -> Self {
        Self {
            id,
            state: Mutex::new(GroupState {
                directory: Some(directory),
                entries: HashMap::new(),
            }),
        }
    }
}

impl GroupState {
    /// Whether the group was torn down.
    pub fn is_removed(&self) -> bool {
        self.directory.is_none()
    }

    /// The entry of `id` if the group still claims it.
    pub fn member(&self, id: ObjectId) -> Option<Arc<PhysicalInfo>> {
        let directory = self.directory.as_ref()?;
        directory.get(id)?;
        self.entries.get(&id).cloned()
    }
}
