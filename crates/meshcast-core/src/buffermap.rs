//! BufferMap — the set of chunk ids a peer is known to hold.
//!
//! Backed by a `BTreeSet`, so earliest/latest/membership are O(log n) and
//! iteration is always in ascending id order.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferMap {
    ids: BTreeSet<u32>,
}

impl BufferMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn earliest(&self) -> Option<u32> {
        self.ids.first().copied()
    }

    pub fn latest(&self) -> Option<u32> {
        self.ids.last().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    /// Returns false if the id was already present.
    pub fn insert(&mut self, id: u32) -> bool {
        self.ids.insert(id)
    }

    pub fn remove(&mut self, id: u32) -> bool {
        self.ids.remove(&id)
    }

    /// Wholesale replacement with another peer-reported set. No diff is applied.
    pub fn replace(&mut self, other: BufferMap) {
        self.ids = other.ids;
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    /// Ascending iteration.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }
}

impl FromIterator<u32> for BufferMap {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl Extend<u32> for BufferMap {
    fn extend<I: IntoIterator<Item = u32>>(&mut self, iter: I) {
        self.ids.extend(iter);
    }
}
