use core::fmt::Debug;
use core::hash::BuildHasher;
use core::hash::Hash;

use crate::DefaultHashBuilder;
use crate::hash_table::Entry as TableEntry;
use crate::hash_table::HashTable;
use crate::hash_table::TryReserveError;

/// A hash set implemented on top of the chained-displacement [`HashTable`].
///
/// `HashSet<T, S>` stores values implementing `Hash + Eq` and uses a
/// configurable hasher builder `S` to hash them. It inherits the underlying
/// table's behavior: lookups that stay fast at high load, insertions and
/// removals that move at most one existing value, and tombstone-free
/// deletion.
#[derive(Clone)]
pub struct HashSet<T, S = DefaultHashBuilder> {
    table: HashTable<T>,
    hash_builder: S,
}

impl<T, S> Debug for HashSet<T, S>
where
    T: Debug + Hash + Eq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<T, S> HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher,
{
    /// Creates a new hash set with the given hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::DefaultHashBuilder;
    /// use chain_hash::HashSet;
    ///
    /// let set: HashSet<i32> = HashSet::with_hasher(DefaultHashBuilder::default());
    /// assert!(set.is_empty());
    /// ```
    pub fn with_hasher(hash_builder: S) -> Self {
        Self {
            table: HashTable::new(),
            hash_builder,
        }
    }

    /// Creates a new hash set able to hold `capacity` values without
    /// reallocating, with the given hasher builder.
    pub fn with_capacity_and_hasher(capacity: usize, hash_builder: S) -> Self {
        Self {
            table: HashTable::with_capacity(capacity),
            hash_builder,
        }
    }

    /// Returns the number of values in the set.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = HashSet::new();
    /// assert_eq!(set.len(), 0);
    /// set.insert(1);
    /// assert_eq!(set.len(), 1);
    /// ```
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Returns `true` if the set contains no values.
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Returns the number of values the set can hold before growing.
    pub fn capacity(&self) -> usize {
        self.table.capacity()
    }

    /// Returns the number of buckets currently allocated.
    pub fn bucket_count(&self) -> usize {
        self.table.bucket_count()
    }

    /// Removes all values from the set, keeping the allocated capacity.
    pub fn clear(&mut self) {
        self.table.clear();
    }

    /// Shrinks the set's storage to the smallest size accommodating the
    /// current number of values. An empty set releases its storage entirely.
    pub fn shrink_to_fit(&mut self) {
        self.table.shrink_to_fit(|v| self.hash_builder.hash_one(v));
    }

    /// Reserves capacity for at least `additional` more values.
    pub fn reserve(&mut self, additional: usize) {
        let required = self.table.len().saturating_add(additional);
        self.table
            .reserve(required, |v| self.hash_builder.hash_one(v));
    }

    /// Fallible variant of [`reserve`]: surfaces allocation failure instead
    /// of aborting. The set is unchanged when `Err` is returned.
    ///
    /// [`reserve`]: HashSet::reserve
    pub fn try_reserve(&mut self, additional: usize) -> Result<(), TryReserveError> {
        let required = self.table.len().saturating_add(additional);
        self.table
            .try_reserve(required, |v| self.hash_builder.hash_one(v))
    }

    /// Adds a value to the set, returning `true` if it was not already
    /// present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = HashSet::new();
    /// assert!(set.insert(2));
    /// assert!(!set.insert(2));
    /// assert_eq!(set.len(), 1);
    /// ```
    pub fn insert(&mut self, value: T) -> bool {
        let hash = self.hash_builder.hash_one(&value);
        match self
            .table
            .entry(hash, |v| v == &value, |v| self.hash_builder.hash_one(v))
        {
            TableEntry::Occupied(_) => false,
            TableEntry::Vacant(entry) => {
                entry.insert(value);
                true
            }
        }
    }

    /// Returns `true` if the set contains `value`.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = HashSet::new();
    /// set.insert(1);
    /// assert!(set.contains(&1));
    /// assert!(!set.contains(&2));
    /// ```
    pub fn contains(&self, value: &T) -> bool {
        self.get(value).is_some()
    }

    /// Returns a reference to the stored value equal to `value`, if any.
    pub fn get(&self, value: &T) -> Option<&T> {
        let hash = self.hash_builder.hash_one(value);
        self.table.find(hash, |v| v == value)
    }

    /// Removes `value` from the set, returning `true` if it was present.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = HashSet::new();
    /// set.insert(2);
    /// assert!(set.remove(&2));
    /// assert!(!set.remove(&2));
    /// ```
    pub fn remove(&mut self, value: &T) -> bool {
        self.take(value).is_some()
    }

    /// Removes and returns the stored value equal to `value`, if any.
    pub fn take(&mut self, value: &T) -> Option<T> {
        let hash = self.hash_builder.hash_one(value);
        self.table.remove(hash, |v| v == value)
    }

    /// Retains only the values for which `f` returns `true`, removing the
    /// rest in a single pass.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = (0..8).collect();
    /// set.retain(|&v| v % 2 == 0);
    /// assert_eq!(set.len(), 4);
    /// ```
    pub fn retain(&mut self, mut f: impl FnMut(&T) -> bool) {
        self.table
            .retain(|v| f(v), |v| self.hash_builder.hash_one(v));
    }

    /// Returns an iterator over the values of the set.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let mut set: HashSet<i32> = HashSet::new();
    /// set.insert(1);
    /// set.insert(2);
    /// assert_eq!(set.iter().count(), 2);
    /// ```
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            inner: self.table.iter(),
        }
    }

    /// Returns an iterator that removes and yields all values.
    ///
    /// The set is emptied up front; unyielded values are dropped with the
    /// iterator.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain {
            inner: self.table.drain(),
        }
    }
}

impl<T, S> HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher + Default,
{
    /// Creates a new hash set using the default hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let set: HashSet<i32> = HashSet::new();
    /// assert!(set.is_empty());
    /// ```
    pub fn new() -> Self {
        Self::with_hasher(S::default())
    }

    /// Creates a new hash set able to hold `capacity` values without
    /// reallocating, using the default hasher builder.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use chain_hash::HashSet;
    ///
    /// let set: HashSet<i32> = HashSet::with_capacity(100);
    /// assert!(set.capacity() >= 100);
    /// ```
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, S::default())
    }
}

impl<T, S> Default for HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, S> FromIterator<T> for HashSet<T, S>
where
    T: Hash + Eq,
    S: BuildHasher + Default,
{
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let iter = iter.into_iter();
        let mut set = Self::with_capacity(iter.size_hint().0);
        for value in iter {
            set.insert(value);
        }
        set
    }
}

/// An iterator over the values of a `HashSet`.
pub struct Iter<'a, T> {
    inner: crate::hash_table::Iter<'a, T>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

/// A draining iterator over the values of a `HashSet`.
pub struct Drain<'a, T> {
    inner: crate::hash_table::Drain<'a, T>,
}

impl<'a, T> Iterator for Drain<'a, T> {
    type Item = T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;
    use alloc::vec::Vec;
    use core::hash::BuildHasher;

    use rand::TryRngCore;
    use rand::rngs::OsRng;
    use siphasher::sip::SipHasher;

    use super::*;

    #[derive(Clone)]
    struct SipHashBuilder {
        k1: u64,
        k2: u64,
    }

    impl BuildHasher for SipHashBuilder {
        type Hasher = SipHasher;

        fn build_hasher(&self) -> Self::Hasher {
            SipHasher::new_with_keys(self.k1, self.k2)
        }
    }

    impl Default for SipHashBuilder {
        fn default() -> Self {
            let mut rng = OsRng;
            Self {
                k1: rng.try_next_u64().unwrap_or(0),
                k2: rng.try_next_u64().unwrap_or(0),
            }
        }
    }

    #[test]
    fn test_new_and_default() {
        let set: HashSet<i32, SipHashBuilder> = HashSet::new();
        assert!(set.is_empty());
        assert_eq!(set.len(), 0);

        let set2: HashSet<i32, SipHashBuilder> = HashSet::default();
        assert!(set2.is_empty());
    }

    #[test]
    fn test_insert_and_contains() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());

        assert!(set.insert(1));
        assert!(set.insert(2));
        assert!(!set.insert(1));

        assert_eq!(set.len(), 2);
        assert!(set.contains(&1));
        assert!(set.contains(&2));
        assert!(!set.contains(&3));
    }

    #[test]
    fn test_basic_erase_pattern() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..10 {
            assert!(set.insert(i));
        }
        for i in [0, 3, 6, 9] {
            assert!(set.remove(&i));
        }

        assert_eq!(set.len(), 6);
        for i in 0..10 {
            assert_eq!(set.contains(&i), !matches!(i, 0 | 3 | 6 | 9));
        }
    }

    #[test]
    fn test_get_and_take() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        set.insert("hello".to_string());

        assert_eq!(set.get(&"hello".to_string()), Some(&"hello".to_string()));
        assert_eq!(set.get(&"world".to_string()), None);

        assert_eq!(set.take(&"hello".to_string()), Some("hello".to_string()));
        assert_eq!(set.take(&"hello".to_string()), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_clear_and_reuse() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..20 {
            set.insert(i);
        }
        set.clear();
        assert!(set.is_empty());

        assert!(set.insert(5));
        assert!(set.contains(&5));
    }

    #[test]
    fn test_reserve_then_fill_without_regrowth() {
        let mut set = HashSet::<u64, _>::with_hasher(SipHashBuilder::default());
        set.reserve(60);
        let bucket_count = set.bucket_count();
        assert!(bucket_count > 0);

        for i in 0..60 {
            assert!(set.insert(i));
        }
        assert_eq!(set.len(), 60);
        assert_eq!(set.bucket_count(), bucket_count);
    }

    #[test]
    fn test_shrink_to_zero_and_reuse() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..30 {
            set.insert(i);
        }
        set.clear();
        set.shrink_to_fit();
        assert_eq!(set.bucket_count(), 0);

        assert!(set.insert(1));
        assert!(set.contains(&1));
    }

    #[test]
    fn test_iter() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 10..20 {
            set.insert(i);
        }

        let mut values: Vec<i32> = set.iter().copied().collect();
        values.sort_unstable();
        assert_eq!(values, (10..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..10 {
            set.insert(i);
        }

        let mut drained: Vec<i32> = set.drain().collect();
        drained.sort_unstable();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(set.is_empty());
    }

    #[test]
    fn test_retain() {
        let mut set: HashSet<i32, SipHashBuilder> = (0..120).collect();
        assert_eq!(set.len(), 120);

        set.retain(|&v| v % 2 != 0);
        assert_eq!(set.len(), 60);
        for i in 0..120 {
            assert_eq!(set.contains(&i), i % 2 != 0);
        }
    }

    #[test]
    fn test_clone_is_independent() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..25 {
            set.insert(i);
        }

        let mut clone = set.clone();
        clone.remove(&0);
        assert!(set.contains(&0));
        assert!(!clone.contains(&0));
        assert_eq!(set.len(), 25);
        assert_eq!(clone.len(), 24);
    }

    #[test]
    fn test_string_values() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        set.insert("apple".to_string());
        set.insert("banana".to_string());

        assert!(set.contains(&"apple".to_string()));
        assert!(set.remove(&"banana".to_string()));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_many_values_with_churn() {
        let mut set = HashSet::with_hasher(SipHashBuilder::default());
        for i in 0..5_000u64 {
            set.insert(i);
        }
        for i in (0..5_000).step_by(2) {
            assert!(set.remove(&i));
        }
        for i in 5_000..7_500 {
            set.insert(i);
        }

        assert_eq!(set.len(), 5_000);
        for i in 0..5_000 {
            assert_eq!(set.contains(&i), i % 2 == 1);
        }
    }
}
