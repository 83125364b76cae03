//! In-memory change detection for descriptor batches.
//!
//! Baselines are kept per key and compared by value, in order.  Nothing is persisted: a fresh
//! process treats the first batch for every key as a change.

use crate::descriptor::UpstreamDescriptor;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct DescriptorStore {
    // Key -> last batch seen for that key
    baselines: HashMap<String, Vec<UpstreamDescriptor>>,
}

impl DescriptorStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Records `value` as the baseline for `key` and returns whether it differs from the
    /// previous baseline.  The first call for a key always returns true.
    pub fn changed<S: AsRef<str>>(&mut self, key: S, value: &[UpstreamDescriptor]) -> bool {
        let key = key.as_ref();
        match self.baselines.get_mut(key) {
            Some(baseline) if baseline.as_slice() == value => false,
            Some(baseline) => {
                *baseline = value.to_vec();
                true
            }
            None => {
                self.baselines.insert(key.to_owned(), value.to_vec());
                true
            }
        }
    }

    /// Drops the baseline for `key` so the next batch is always seen as a change.
    pub fn forget<S: AsRef<str>>(&mut self, key: S) -> bool {
        self.baselines.remove(key.as_ref()).is_some()
    }

    pub fn baseline<S: AsRef<str>>(&self, key: S) -> Option<&[UpstreamDescriptor]> {
        self.baselines.get(key.as_ref()).map(Vec::as_slice)
    }
}
