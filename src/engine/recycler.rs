// Slot table for the disk image cache — maps content keys to small reusable file numbers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One registered cache file: a content key pinned to a numeric slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotEntry {
    pub key: String,
    pub slot: usize,
    pub file_name: String,
}

/// Pure key→slot bookkeeping. Slots are handed out as the smallest unused
/// positive integer so numbers stay dense as keys are evicted and re-inserted.
pub struct SlotRecycler {
    capacity: usize,
    entries: HashMap<String, SlotEntry>,
}

impl SlotRecycler {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&SlotEntry> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: &str, slot: usize, file_name: String) {
        self.entries.insert(
            key.to_string(),
            SlotEntry {
                key: key.to_string(),
                slot,
                file_name,
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<SlotEntry> {
        self.entries.remove(key)
    }

    /// The slot the next new key would receive.
    pub fn next_slot(&self) -> usize {
        first_missing_positive(self.slot_numbers())
    }

    pub fn slot_numbers(&self) -> Vec<usize> {
        self.entries.values().map(|entry| entry.slot).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops a random subset of entries. Chaos-testing hook.
    pub fn clear_randomly(&mut self) {
        self.entries.retain(|_, _| rand::random::<bool>());
    }

    pub fn entry_list(&self) -> Vec<SlotEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn load_entries(&mut self, entries: Vec<SlotEntry>) {
        self.entries.clear();
        for entry in entries {
            self.entries.insert(entry.key.clone(), entry);
        }
    }
}

/// Smallest positive integer absent from `nums`, in O(n) time and O(1) extra
/// space: values in `1..=n` are swapped into their matching position, then the
/// first position that disagrees is the answer.
pub fn first_missing_positive(mut nums: Vec<usize>) -> usize {
    let n = nums.len();
    let mut i = 0;
    while i < n {
        let v = nums[i];
        if v >= 1 && v <= n && nums[v - 1] != v {
            nums.swap(i, v - 1);
        } else {
            i += 1;
        }
    }
    for (i, &v) in nums.iter().enumerate() {
        if v != i + 1 {
            return i + 1;
        }
    }
    n + 1
}
