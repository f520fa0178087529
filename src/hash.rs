//! Hashing for the crate's internal maps.
//!
//! Group keys and queued listener addresses never come from an adversary, so
//! the maps use foldhash with a fixed seed instead of SipHash.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};
use indexmap::IndexMap;

/// Zero-sized `BuildHasher` over foldhash with a constant seed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517c_c1b7_2722_0a95).build_hasher()
    }
}

/// Insertion-ordered map used for groups and the microtask queue.
pub(crate) type FastIndexMap<K, V> = IndexMap<K, V, FastHashBuilder>;

pub(crate) fn fast_index_map<K, V>() -> FastIndexMap<K, V> {
    IndexMap::with_hasher(FastHashBuilder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_carries_no_state() {
        assert_eq!(std::mem::size_of::<FastHashBuilder>(), 0);
        assert_eq!(FastHashBuilder.hash_one("group"), FastHashBuilder.hash_one("group"));
    }

    #[test]
    fn index_map_keeps_insertion_order() {
        let mut map = fast_index_map();
        map.insert("b", 1);
        map.insert("a", 2);
        assert_eq!(map.keys().copied().collect::<Vec<_>>(), ["b", "a"]);
    }
}
