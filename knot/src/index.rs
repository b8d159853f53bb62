use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a known object inside a table.
///
/// Index `0` is the null object and `UNKNOWN` marks an object that has no
/// slot in the table. Real indices are handed out in increasing order and
/// never rebound.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(transparent)]
pub struct Index(u32);

impl Index {
    pub const NULL: Index = Index(0);
    pub const UNKNOWN: Index = Index(u32::MAX);

    #[inline(always)]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline(always)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn is_unknown(self) -> bool {
        self.0 == u32::MAX
    }

    #[inline(always)]
    pub(crate) const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            f.write_str("UNKNOWN")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Growable bit set keyed by [`Index`].
///
/// Used for the constant-elements tag and for the reachable/visited marks of
/// the graph dump. `UNKNOWN` is never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSet {
    words: Vec<u64>,
}

impl IndexSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(end: Index) -> Self {
        Self {
            words: vec![0; end.as_usize().div_ceil(64)],
        }
    }

    /// Returns `true` if `index` was not yet in the set.
    pub fn insert(&mut self, index: Index) -> bool {
        debug_assert!(!index.is_unknown(), "UNKNOWN cannot be tracked");
        let (word, bit) = Self::position(index);
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        let fresh = self.words[word] & bit == 0;
        self.words[word] |= bit;
        fresh
    }

    pub fn contains(&self, index: Index) -> bool {
        let (word, bit) = Self::position(index);
        self.words.get(word).is_some_and(|w| w & bit != 0)
    }

    pub(crate) fn len(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    #[inline(always)]
    fn position(index: Index) -> (usize, u64) {
        (index.as_usize() / 64, 1 << (index.raw() % 64))
    }
}
