//! Shared duty roster: which person covers which schedule slot.

use shared::{AssigneeName, SlotKey};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Map from schedule slot to assignee, guarded by a single lock.
///
/// The working set is small and both operations are O(1), so one
/// exclusive lock is enough; it is never held together with the client
/// registry's lock, which rules out lock-ordering deadlocks.
pub struct DutyRoster {
    slots: Mutex<HashMap<SlotKey, AssigneeName>>,
}

impl DutyRoster {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the assignee for `key`, or the empty name if the slot was
    /// never set. Reading an unseen slot does not create an entry.
    pub async fn get(&self, key: &SlotKey) -> AssigneeName {
        self.slots.lock().await.get(key).cloned().unwrap_or_default()
    }

    /// Assigns `name` to `key`, replacing any previous assignee.
    pub async fn set(&self, key: SlotKey, name: AssigneeName) {
        self.slots.lock().await.insert(key, name);
    }

    /// Number of slots that have been assigned at least once.
    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}

impl Default for DutyRoster {
    fn default() -> Self {
        Self::new()
    }
}
