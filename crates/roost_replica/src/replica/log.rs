//! In-memory log cursors for a single replica.
//!
//! The durable log lives with the storage collaborator; this module tracks
//! the unstable tail plus the cursor set (`last ≥ storaged ≥ committed-ish`)
//! that gates storage and apply dispatch. It is intentionally separate from
//! the consensus logic so the cursor arithmetic stays testable on its own.

use std::collections::VecDeque;

use super::types::{Entry, ReplicaError};

#[derive(Debug, Default)]
pub(super) struct ReplicaLog {
    /// Highest appended index (unstable tail included).
    pub(super) last_log_index: u64,
    /// Term of the entry at `last_log_index`.
    pub(super) last_log_term: u32,
    /// Highest index known durably stored.
    pub(super) storaged_index: u64,
    /// A `StoreAppend` is in flight.
    pub(super) storaging: bool,
    pub(super) committed_index: u64,
    /// Highest index dispatched for apply.
    pub(super) applying_index: u64,
    /// Highest index acknowledged applied by the collaborator.
    pub(super) applied_index: u64,
    /// An `ApplyLogs` is in flight.
    pub(super) applying: bool,
    /// Entries above `storaged_index`, oldest first.
    pub(super) unstable: VecDeque<Entry>,
}

impl ReplicaLog {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Seed cursors from durable state at init time.
    pub(super) fn restore(&mut self, last_index: u64, last_term: u32, applied_index: u64) {
        self.last_log_index = last_index;
        self.last_log_term = last_term;
        self.storaged_index = last_index;
        self.committed_index = applied_index;
        self.applied_index = applied_index;
        self.applying_index = applied_index;
        self.unstable.clear();
        self.storaging = false;
        self.applying = false;
    }

    /// Append entries to the unstable tail. Indexes must stay dense.
    pub(super) fn append(&mut self, entries: &[Entry]) -> Result<(), ReplicaError> {
        for entry in entries {
            let expected = self.last_log_index + 1;
            if entry.index != expected {
                return Err(ReplicaError::OutOfOrderAppend {
                    expected,
                    got: entry.index,
                });
            }
            self.last_log_index = entry.index;
            self.last_log_term = entry.term;
            self.unstable.push_back(entry.clone());
        }
        Ok(())
    }

    pub(super) fn has_storage(&self) -> bool {
        !self.storaging && self.storaged_index < self.last_log_index
    }

    /// Unstable entries pending durable append.
    pub(super) fn next_storage_entries(&self) -> Vec<Entry> {
        self.unstable.iter().cloned().collect()
    }

    /// Acknowledge a durable append up to `index`.
    pub(super) fn storage_appended(&mut self, index: u64) {
        self.storaging = false;
        if index <= self.storaged_index {
            return;
        }
        self.storaged_index = index.min(self.last_log_index);
        while let Some(front) = self.unstable.front() {
            if front.index <= self.storaged_index {
                self.unstable.pop_front();
            } else {
                break;
            }
        }
    }

    /// Apply is gated on both commit and durability.
    pub(super) fn has_apply(&self) -> bool {
        !self.applying && self.applied_index < self.committed_index.min(self.storaged_index)
    }

    pub(super) fn applied_to(&mut self, index: u64) {
        self.applying = false;
        if index > self.applied_index {
            self.applied_index = index.min(self.committed_index);
        }
        if self.applying_index < self.applied_index {
            self.applying_index = self.applied_index;
        }
    }

    pub(super) fn commit_to(&mut self, index: u64) {
        let capped = index.min(self.last_log_index);
        if capped > self.committed_index {
            self.committed_index = capped;
        }
    }

    /// Unstable entries starting at `from`, bounded by `max_size` bytes.
    /// Returns `None` when `from` is below the unstable tail and the caller
    /// must consult storage instead.
    pub(super) fn unstable_entries_from(&self, from: u64, max_size: u64) -> Option<Vec<Entry>> {
        if from > self.last_log_index {
            return Some(Vec::new());
        }
        let front_index = self.unstable.front().map(|e| e.index)?;
        if from < front_index {
            return None;
        }
        let mut out = Vec::new();
        let mut size = 0u64;
        for entry in self.unstable.iter() {
            if entry.index < from {
                continue;
            }
            size += entry.encoded_size();
            if !out.is_empty() && size > max_size {
                break;
            }
            out.push(entry.clone());
        }
        Some(out)
    }

    /// Drop every entry above `index`. Returns true when stored state must be
    /// truncated as well.
    pub(super) fn truncate_after(&mut self, index: u64) -> bool {
        if index >= self.last_log_index {
            return false;
        }
        while let Some(back) = self.unstable.back() {
            if back.index > index {
                self.unstable.pop_back();
            } else {
                break;
            }
        }
        let needs_store_truncate = self.storaged_index > index;
        self.last_log_index = index;
        if let Some(back) = self.unstable.back() {
            self.last_log_term = back.term;
        }
        if self.storaged_index > index {
            self.storaged_index = index;
        }
        if self.committed_index > index {
            self.committed_index = index;
        }
        needs_store_truncate
    }

    pub(super) fn last_index_and_term(&self) -> (u64, u32) {
        (self.last_log_index, self.last_log_term)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u32) -> Entry {
        Entry {
            index,
            term,
            data: vec![0u8; 8],
        }
    }

    #[test]
    fn append_requires_dense_indexes() {
        let mut log = ReplicaLog::new();
        log.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        assert_eq!(log.last_log_index, 2);
        let err = log.append(&[entry(4, 1)]).unwrap_err();
        assert_eq!(err, ReplicaError::OutOfOrderAppend { expected: 3, got: 4 });
    }

    #[test]
    fn storage_ack_drains_unstable_prefix() {
        let mut log = ReplicaLog::new();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        assert!(log.has_storage());
        log.storaging = true;
        log.storage_appended(2);
        assert_eq!(log.storaged_index, 2);
        assert_eq!(log.unstable.len(), 1);
        assert!(log.has_storage());
    }

    #[test]
    fn apply_gated_on_commit_and_durability() {
        let mut log = ReplicaLog::new();
        log.append(&[entry(1, 1), entry(2, 1)]).unwrap();
        log.commit_to(2);
        assert!(!log.has_apply());
        log.storage_appended(2);
        assert!(log.has_apply());
        log.applied_to(2);
        assert!(!log.has_apply());
        assert_eq!(log.applied_index, 2);
    }

    #[test]
    fn truncate_drops_divergent_tail() {
        let mut log = ReplicaLog::new();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]).unwrap();
        log.storage_appended(3);
        assert!(log.truncate_after(1));
        assert_eq!(log.last_log_index, 1);
        assert_eq!(log.storaged_index, 1);
    }

    #[test]
    fn unstable_slice_respects_size_bound() {
        let mut log = ReplicaLog::new();
        log.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]).unwrap();
        let got = log.unstable_entries_from(1, 1).unwrap();
        assert_eq!(got.len(), 1);
        let all = log.unstable_entries_from(2, u64::MAX).unwrap();
        assert_eq!(all.len(), 2);
        log.storage_appended(3);
        // Below the unstable tail: caller must go to storage.
        assert!(log.unstable_entries_from(1, u64::MAX).is_none());
    }
}
