//! Bounded map of per-user journal files.

use journal_file::WritableJournal;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Hard bound on simultaneously open user shards.
pub const USER_JOURNALS_MAX: usize = 1024;

/// Ordered uid → journal map with least-recently-used eviction.
#[derive(Default)]
pub struct UserJournals {
    files: BTreeMap<u32, WritableJournal>,
    recency: VecDeque<u32>,
}

impl UserJournals {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn touch(&mut self, uid: u32) {
        if let Some(position) = self.recency.iter().position(|&u| u == uid) {
            self.recency.remove(position);
        }
        self.recency.push_back(uid);
    }

    pub fn get(&mut self, uid: u32) -> Option<&mut WritableJournal> {
        if self.files.contains_key(&uid) {
            self.touch(uid);
        }
        self.files.get_mut(&uid)
    }

    /// Insert a freshly opened shard, evicting the least recently used
    /// one if the bound would be exceeded.
    pub fn insert(&mut self, uid: u32, journal: WritableJournal) -> &mut WritableJournal {
        if !self.files.contains_key(&uid) && self.files.len() >= USER_JOURNALS_MAX {
            if let Some(evicted_uid) = self.recency.pop_front() {
                if let Some(evicted) = self.files.remove(&evicted_uid) {
                    debug!(uid = evicted_uid, "evicting user journal shard");
                    if let Err(err) = evicted.close() {
                        warn!(uid = evicted_uid, error = %err, "closing evicted shard failed");
                    }
                }
            }
        }

        self.files.insert(uid, journal);
        self.touch(uid);
        self.files.get_mut(&uid).unwrap()
    }

    pub fn remove(&mut self, uid: u32) -> Option<WritableJournal> {
        self.recency.retain(|&u| u != uid);
        self.files.remove(&uid)
    }

    /// Replace a shard in place (after a rotation).
    pub fn replace(&mut self, uid: u32, journal: WritableJournal) {
        self.files.insert(uid, journal);
    }

    /// Take all shards out, oldest first, for rotation or shutdown.
    pub fn drain(&mut self) -> Vec<(u32, WritableJournal)> {
        self.recency.clear();
        std::mem::take(&mut self.files).into_iter().collect()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&u32, &mut WritableJournal)> {
        self.files.iter_mut()
    }
}
