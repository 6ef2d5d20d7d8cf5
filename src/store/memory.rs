//! In-memory message store.
//!
//! Entries live in a vec kept sorted by id; inserts are merge-dedup-sort
//! passes that evict the lowest ids once `maxlen` is exceeded. The UUID
//! map is bounded to the same `maxlen` by first-insertion order.

use std::collections::{BTreeMap, HashSet, VecDeque};

use super::{Bounds, LogEntry, LogStore, MsgId, StoreError};

pub struct MemoryStore {
    maxlen: Option<usize>,
    data: Vec<LogEntry>,
    uuids: BTreeMap<MsgId, String>,
    /// First-insertion order of uids, for eviction.
    uuid_order: VecDeque<MsgId>,
}

impl MemoryStore {
    pub fn new(maxlen: Option<usize>) -> Self {
        MemoryStore {
            maxlen,
            data: Vec::new(),
            uuids: BTreeMap::new(),
            uuid_order: VecDeque::new(),
        }
    }

    fn position(&self, id: MsgId) -> Result<usize, usize> {
        self.data.binary_search_by_key(&id, |e| e.id)
    }

    /// Index of the first entry with `id >= bound`.
    fn lower_bound(&self, bound: MsgId) -> usize {
        self.data.partition_point(|e| e.id < bound)
    }

    /// Index just past the last entry with `id <= bound`.
    fn upper_bound(&self, bound: MsgId) -> usize {
        self.data.partition_point(|e| e.id <= bound)
    }
}

impl LogStore for MemoryStore {
    fn init(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn capacity(&self) -> Option<usize> {
        self.maxlen
    }

    fn bounds(&self) -> Result<Bounds, StoreError> {
        Ok(match (self.data.first(), self.data.last()) {
            (Some(first), Some(last)) => Some((first.id, last.id, self.data.len())),
            _ => None,
        })
    }

    fn get(&self, index: i64) -> Result<Option<LogEntry>, StoreError> {
        let len = self.data.len() as i64;
        let idx = if index < 0 { len + index } else { index };
        if (0..len).contains(&idx) {
            Ok(Some(self.data[idx as usize].clone()))
        } else {
            Ok(None)
        }
    }

    fn query(
        &self,
        from: Option<MsgId>,
        to: Option<MsgId>,
        amount: Option<usize>,
    ) -> Result<Vec<LogEntry>, StoreError> {
        let slice = match (from, to, amount) {
            (Some(f), Some(t), _) => {
                let lo = self.lower_bound(f);
                let hi = self.upper_bound(t);
                &self.data[lo..hi.max(lo)]
            }
            (Some(f), None, amount) => {
                let lo = self.lower_bound(f);
                let hi = match amount {
                    Some(n) => (lo + n).min(self.data.len()),
                    None => self.data.len(),
                };
                &self.data[lo..hi]
            }
            (None, Some(t), amount) => {
                let hi = self.upper_bound(t);
                let lo = match amount {
                    Some(n) => hi.saturating_sub(n),
                    None => 0,
                };
                &self.data[lo..hi]
            }
            (None, None, Some(n)) => {
                let lo = self.data.len().saturating_sub(n);
                &self.data[lo..]
            }
            (None, None, None) => &self.data[..],
        };
        Ok(slice.to_vec())
    }

    fn extend(&mut self, entries: Vec<LogEntry>) -> Result<Vec<MsgId>, StoreError> {
        let mut added = Vec::new();
        for entry in entries {
            match self.position(entry.id) {
                Ok(_) => {} // first writer wins
                Err(idx) => {
                    added.push(entry.id);
                    self.data.insert(idx, entry);
                }
            }
        }
        if let Some(maxlen) = self.maxlen {
            if self.data.len() > maxlen {
                let cut = self.data.len() - maxlen;
                self.data.drain(..cut);
            }
        }
        added.sort_unstable();
        Ok(added)
    }

    fn delete(&mut self, ids: &[MsgId]) -> Result<Vec<LogEntry>, StoreError> {
        let idset: HashSet<MsgId> = ids.iter().copied().collect();
        let mut removed = Vec::new();
        self.data.retain(|entry| {
            if idset.contains(&entry.id) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    fn append_uuid(&mut self, uid: MsgId, uuid: &str) -> Result<bool, StoreError> {
        let fresh = self.uuids.insert(uid, uuid.to_string()).is_none();
        if fresh {
            self.uuid_order.push_back(uid);
            if let Some(maxlen) = self.maxlen {
                while self.uuid_order.len() > maxlen {
                    if let Some(old) = self.uuid_order.pop_front() {
                        self.uuids.remove(&old);
                    }
                }
            }
        }
        Ok(fresh)
    }

    fn get_uuid(&self, uid: MsgId) -> Result<Option<String>, StoreError> {
        Ok(self.uuids.get(&uid).cloned())
    }

    fn query_uuid(
        &self,
        ids: Option<&[MsgId]>,
    ) -> Result<BTreeMap<MsgId, String>, StoreError> {
        Ok(match ids {
            None => self.uuids.clone(),
            Some(ids) => ids
                .iter()
                .filter_map(|uid| self.uuids.get(uid).map(|u| (*uid, u.clone())))
                .collect(),
        })
    }

    fn close(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}
