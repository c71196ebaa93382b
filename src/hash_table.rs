//! A hash table that chains colliding keys through displacement links packed
//! into per-bucket metadata.
//!
//! Every key maps to a *home bucket* computed from the low bits of its hash.
//! All keys sharing a home bucket form a chain threaded through otherwise
//! unused buckets of the same array: each bucket's metadata word stores an
//! 11-bit link giving the quadratic probe step, relative to the home bucket,
//! of the next key in the chain. A chain, if it exists, always begins in the
//! home bucket itself. To keep that guarantee, a one-bit flag records whether
//! the key occupying a bucket actually belongs there; when a new key's home
//! bucket is held by a key that belongs elsewhere, the squatter is evicted
//! into its own chain and the new key takes the bucket.
//!
//! One way to picture the scheme is as a chained hash table whose overflow
//! nodes live in spare buckets instead of separate allocations. It combines
//! the cache behavior of open addressing with the probe behavior of chaining:
//!
//! - Lookups are impervious to load factor. Only the home bucket and the
//!   buckets holding keys that belong to it are ever examined, no matter how
//!   full the table is. A 4-bit fragment of each key's hash is stored in the
//!   metadata word and checked first, so most non-matching chain members are
//!   skipped without touching the bucket array or calling the comparator.
//!   This matters when comparisons are expensive (strings, composite keys).
//! - Insertions move at most one existing key (the evicted squatter), unlike
//!   Robin Hood style schemes that can shift long runs.
//! - Deletions are tombstone-free. Erasing a chain member swaps the chain's
//!   tail down into the vacated bucket and shortens the chain, so deletions
//!   also move at most one key and never degrade future probes.
//! - Iteration scans the metadata array eight bytes (four buckets) at a time
//!   and only touches the bucket array for occupied slots, which keeps
//!   sparse-table iteration cheap.
//!
//! ## Layout
//!
//! The table owns two allocations: a bucket array of `bucket_count` slots
//! holding values, and a `u16` metadata array of `bucket_count + 4` words.
//! Each metadata word is packed as `XXXXYZZZZZZZZZZZ`, where `X` is the hash
//! fragment (the top four bits of the 64-bit hash, chosen so that keys
//! sharing a home bucket still get distinct fragments), `Y` is the
//! in-home-bucket flag, and `Z` is the displacement link. An all-zero word
//! marks an empty bucket; a link of all ones marks the end of a chain. The
//! four trailing metadata words are permanently all ones so the chunked scan
//! used by iteration can read past the logical end without a bounds check per
//! word. A zero-capacity table points its metadata at a static all-ones
//! buffer and owns no heap memory at all, which makes the empty constructor
//! free and infallible.
//!
//! Bucket counts are always zero or a power of two of at least eight, so the
//! home bucket is a mask of the hash rather than a modulo.
//!
//! The 11-bit link width caps chains at 2047 quadratic steps. An insertion
//! that cannot find an empty bucket within that range forces a rehash at
//! twice the capacity, and the rehash itself retries at doubled capacity if
//! re-placement hits the same wall. The cap is a consequence of the chosen
//! bit split, not of the algorithm; in practice it is only approached at
//! load factors near 1.0.
//!
//! ## Safety Invariants
//!
//! The implementation relies on the following key invariants:
//!
//! 1. **Occupancy**: a bucket holds an initialized value if and only if its
//!    metadata word is non-zero. All drops and moves are driven by the
//!    metadata array alone.
//! 2. **Home anchoring**: if any key belonging to home bucket `h` is present,
//!    the bucket at `h` holds such a key and its metadata has the
//!    in-home-bucket flag set. No other bucket sets the flag for `h`.
//! 3. **Chain integrity**: every occupied bucket is reachable from exactly
//!    one home anchor by following displacement links, links along a chain
//!    strictly increase, and the last link is the all-ones end marker.
//!    Chain-walking loops terminate because of this.
//! 4. **Bounds**: all bucket indices are reduced by `bucket_count - 1` masks
//!    and `bucket_count` is a power of two, so unchecked indexing into either
//!    array is in bounds. The metadata array is 4 words longer than the
//!    bucket array and those words are never zero, so an 8-byte scan starting
//!    at any index `<= bucket_count` stays in bounds and terminates.

use alloc::alloc::handle_alloc_error;
use alloc::boxed::Box;
use core::alloc::Layout;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::mem::MaybeUninit;
use core::ptr::NonNull;

use cfg_if::cfg_if;
use thiserror::Error;

cfg_if! {
    if #[cfg(feature = "load-ninety-five")] {
        const DEFAULT_MAX_LOAD: f64 = 0.95;
    } else {
        const DEFAULT_MAX_LOAD: f64 = 0.9;
    }
}

/// Metadata word of an empty bucket.
const EMPTY: u16 = 0x0000;

/// Top four bits of a metadata word: the stored hash fragment.
///
/// Fragments are taken from the top of the hash because the bottom bits pick
/// the home bucket; keys colliding on a bucket would otherwise collide on the
/// fragment too, defeating its purpose as a comparison prefilter.
const HASH_FRAG_MASK: u16 = 0xF000;

/// Flag bit marking a key that sits in its own home bucket, i.e. the start of
/// that bucket's chain.
const IN_HOME_BUCKET: u16 = 0x0800;

/// Bottom eleven bits: the quadratic displacement of the next chain member.
/// The all-ones value doubles as the end-of-chain marker, making it also the
/// exclusive upper bound on usable displacements.
const DISPLACEMENT_MASK: u16 = 0x07FF;

/// Smallest non-zero bucket count. Must be a power of two.
const MIN_NONZERO_BUCKET_COUNT: usize = 8;

/// Number of trailing all-ones metadata words behind the last real bucket.
const METADATA_SENTINEL_LEN: usize = 4;

/// Shared metadata for zero-capacity tables. The all-ones words double as a
/// sentinel tail, so iteration over an empty table terminates on the first
/// chunk read. Never written through.
static PLACEHOLDER_METADATA: [u16; METADATA_SENTINEL_LEN] = [u16::MAX; METADATA_SENTINEL_LEN];

#[inline(always)]
fn placeholder_metadata() -> NonNull<u16> {
    // SAFETY: A static is never null.
    unsafe { NonNull::new_unchecked(PLACEHOLDER_METADATA.as_ptr().cast_mut()) }
}

#[inline(always)]
fn hash_fragment(hash: u64) -> u16 {
    ((hash >> 48) as u16) & HASH_FRAG_MASK
}

/// Standard quadratic probe offset. With a power-of-two bucket count the
/// triangular sequence visits every bucket, so a free bucket is always found
/// eventually (the displacement limit permitting).
#[inline(always)]
fn quadratic(displacement: u16) -> usize {
    let d = displacement as usize;
    (d * d + d) / 2
}

/// Position of the first non-zero metadata word within an 8-byte chunk, in
/// memory order starting from the load address.
///
/// "First" depends on byte order: on little-endian targets the word nearest
/// the load address occupies the low bits of the chunk, on big-endian targets
/// the high bits. Both arms compile to a single count-zeros instruction.
#[inline(always)]
fn first_occupied_in_chunk(chunk: u64) -> usize {
    if cfg!(target_endian = "little") {
        chunk.trailing_zeros() as usize / 16
    } else {
        chunk.leading_zeros() as usize / 16
    }
}

/// Error returned by the `try_` allocation paths when the table cannot grow.
///
/// The failed operation leaves the table exactly as it was; no keys are lost
/// and no partial allocation is retained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryReserveError {
    /// The required allocation size does not fit in `usize`.
    #[error("required allocation size overflows usize")]
    CapacityOverflow,
    /// The allocator declined the request.
    #[error("memory allocation of {} bytes failed", .layout.size())]
    AllocError {
        /// The layout of the allocation request that failed.
        layout: Layout,
    },
}

impl TryReserveError {
    /// Failure policy of the non-`try` API surface, matching the standard
    /// collections: capacity overflow panics, allocation failure goes to the
    /// global allocation error handler.
    #[cold]
    fn handle(self) -> ! {
        match self {
            TryReserveError::CapacityOverflow => panic!("hash table capacity overflow"),
            TryReserveError::AllocError { layout } => handle_alloc_error(layout),
        }
    }
}

/// How a prepared insertion attaches to the metadata graph.
#[derive(Clone, Copy)]
enum Link {
    /// The key anchors a fresh chain in its own home bucket.
    Anchor,
    /// The key joins the home bucket's chain after `prev`, at quadratic step
    /// `displacement`; it inherits `prev`'s old link so the chain stays
    /// sorted by displacement.
    Chained { prev: usize, displacement: u16 },
}

/// A hash table chaining colliding keys through displacement links.
///
/// `HashTable<V>` stores values of type `V` and provides fast insertion,
/// lookup, and removal operations. This is a fairly low-level structure that
/// requires you to provide the hash value and an equality predicate for each
/// operation. Prefer the [`HashMap<K, V>`] or [`HashSet<T>`] wrappers for a
/// conventional keyed interface unless you are implementing your own map or
/// set structure.
///
/// ## Performance Characteristics
///
/// - **Memory**: 2 bytes per bucket of overhead, plus the size of `V`.
/// - **Load**: buckets fill to 90% by default before the table grows;
///   tunable per table up to 100% via [`with_max_load_factor`].
///
/// [`HashMap<K, V>`]: crate::hash_map::HashMap
/// [`HashSet<T>`]: crate::hash_set::HashSet
/// [`with_max_load_factor`]: HashTable::with_max_load_factor
pub struct HashTable<V> {
    key_count: usize,
    bucket_count: usize,
    metadata: NonNull<u16>,
    buckets: NonNull<MaybeUninit<V>>,
    max_load: f64,
    _phantom: PhantomData<V>,
}

// SAFETY: The table owns its values; the raw pointers are never shared
// outside the borrow discipline of the public API.
unsafe impl<V: Send> Send for HashTable<V> {}
// SAFETY: Shared references only permit reads.
unsafe impl<V: Sync> Sync for HashTable<V> {}

impl<V> Debug for HashTable<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        use alloc::format;
        use alloc::string::ToString;
        use alloc::vec::Vec;

        let metadata = (0..self.bucket_count)
            .map(|bucket| {
                // SAFETY: `bucket` is below `bucket_count`.
                let metadatum = unsafe { self.metadatum(bucket) };
                if metadatum == EMPTY {
                    ".....".to_string()
                } else {
                    format!(
                        "{:X}{}{:03X}",
                        metadatum >> 12,
                        if metadatum & IN_HOME_BUCKET != 0 { "*" } else { "." },
                        metadatum & DISPLACEMENT_MASK
                    )
                }
            })
            .collect::<Vec<_>>();

        f.debug_struct("HashTable")
            .field("metadata", &metadata)
            .field("key_count", &self.key_count)
            .field("bucket_count", &self.bucket_count)
            .finish()
    }
}

impl<V> Default for HashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HashTable<V> {
    /// Creates an empty table.
    ///
    /// This does not allocate; zero-capacity tables share a static metadata
    /// buffer. The first insertion allocates.
    pub fn new() -> Self {
        Self::with_max_load_factor(DEFAULT_MAX_LOAD)
    }

    /// Creates an empty table that will grow once its bucket array is more
    /// than `max_load` full.
    ///
    /// Values close to 1.0 trade insertion speed for memory: exhaustion of
    /// the displacement limit becomes more likely, forcing more rehashes,
    /// but the table remains correct all the way to 1.0.
    ///
    /// # Panics
    ///
    /// Panics unless `0.0 < max_load <= 1.0`.
    pub fn with_max_load_factor(max_load: f64) -> Self {
        assert!(
            max_load > 0.0 && max_load <= 1.0,
            "max load factor must be in (0.0, 1.0]"
        );
        Self {
            key_count: 0,
            bucket_count: 0,
            metadata: placeholder_metadata(),
            buckets: NonNull::dangling(),
            max_load,
            _phantom: PhantomData,
        }
    }

    /// Creates a table able to hold `capacity` keys without reallocating.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_max_load_factor(capacity, DEFAULT_MAX_LOAD)
    }

    /// Creates a table able to hold `capacity` keys without reallocating,
    /// with the given maximum load factor.
    ///
    /// # Panics
    ///
    /// Panics unless `0.0 < max_load <= 1.0`.
    pub fn with_capacity_and_max_load_factor(capacity: usize, max_load: f64) -> Self {
        let mut table = Self::with_max_load_factor(max_load);
        if capacity > 0 {
            let result = table
                .min_bucket_count_for(capacity)
                .and_then(|bucket_count| table.install_fresh_arrays(bucket_count));
            if let Err(err) = result {
                err.handle();
            }
        }
        table
    }

    /// Returns the number of keys in the table.
    pub fn len(&self) -> usize {
        self.key_count
    }

    /// Returns `true` if the table contains no keys.
    pub fn is_empty(&self) -> bool {
        self.key_count == 0
    }

    /// Returns the number of buckets currently allocated.
    ///
    /// Always zero or a power of two of at least eight.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Returns the number of keys the table can hold before growing.
    pub fn capacity(&self) -> usize {
        (self.bucket_count as f64 * self.max_load) as usize
    }

    /// Returns the configured maximum load factor.
    pub fn max_load_factor(&self) -> f64 {
        self.max_load
    }

    #[inline(always)]
    fn home_bucket(&self, hash: u64) -> usize {
        debug_assert!(self.bucket_count > 0);
        (hash as usize) & (self.bucket_count - 1)
    }

    /// Reads the metadata word of `bucket`.
    ///
    /// # Safety
    ///
    /// `bucket` must be below `bucket_count` plus the sentinel tail.
    #[inline(always)]
    unsafe fn metadatum(&self, bucket: usize) -> u16 {
        // SAFETY: Caller keeps `bucket` within the metadata array.
        unsafe { *self.metadata.as_ptr().add(bucket) }
    }

    /// Writes the metadata word of `bucket`.
    ///
    /// # Safety
    ///
    /// `bucket` must be below `bucket_count`; the sentinel tail is never
    /// written.
    #[inline(always)]
    unsafe fn set_metadatum(&mut self, bucket: usize, metadatum: u16) {
        // SAFETY: Caller keeps `bucket` within the real buckets.
        unsafe {
            *self.metadata.as_ptr().add(bucket) = metadatum;
        }
    }

    /// Returns a raw pointer to the bucket at `bucket`.
    ///
    /// # Safety
    ///
    /// `bucket` must be below `bucket_count`.
    #[inline(always)]
    unsafe fn bucket_ptr(&self, bucket: usize) -> *mut MaybeUninit<V> {
        // SAFETY: Caller keeps `bucket` within the bucket array.
        unsafe { self.buckets.as_ptr().add(bucket) }
    }

    /// Returns a shared reference to the value in `bucket`.
    ///
    /// # Safety
    ///
    /// `bucket` must be occupied (metadata word non-zero).
    #[inline(always)]
    unsafe fn value_ref(&self, bucket: usize) -> &V {
        // SAFETY: Occupied buckets hold initialized values.
        unsafe { (*self.bucket_ptr(bucket)).assume_init_ref() }
    }

    /// Returns an exclusive reference to the value in `bucket`.
    ///
    /// # Safety
    ///
    /// `bucket` must be occupied (metadata word non-zero).
    #[inline(always)]
    unsafe fn value_mut(&mut self, bucket: usize) -> &mut V {
        // SAFETY: Occupied buckets hold initialized values.
        unsafe { (*self.bucket_ptr(bucket)).assume_init_mut() }
    }

    /// Smallest valid bucket count whose load ceiling admits `size` keys.
    fn min_bucket_count_for(&self, size: usize) -> Result<usize, TryReserveError> {
        if size == 0 {
            return Ok(0);
        }

        let mut bucket_count = MIN_NONZERO_BUCKET_COUNT;
        while size as f64 > bucket_count as f64 * self.max_load {
            bucket_count = bucket_count
                .checked_mul(2)
                .ok_or(TryReserveError::CapacityOverflow)?;
        }

        Ok(bucket_count)
    }

    #[inline(always)]
    fn insert_would_overload(&self) -> bool {
        (self.key_count + 1) as f64 > self.bucket_count as f64 * self.max_load
    }

    /// Allocates a metadata array (zeroed, with the all-ones sentinel tail)
    /// and a bucket array for `bucket_count` buckets.
    ///
    /// On failure nothing is retained; the metadata array is released again
    /// if the bucket array cannot be allocated after it.
    fn allocate_arrays(
        bucket_count: usize,
    ) -> Result<(NonNull<u16>, NonNull<MaybeUninit<V>>), TryReserveError> {
        debug_assert!(bucket_count.is_power_of_two() && bucket_count >= MIN_NONZERO_BUCKET_COUNT);

        let metadata_len = bucket_count
            .checked_add(METADATA_SENTINEL_LEN)
            .ok_or(TryReserveError::CapacityOverflow)?;
        let metadata_layout =
            Layout::array::<u16>(metadata_len).map_err(|_| TryReserveError::CapacityOverflow)?;
        let buckets_layout = Layout::array::<MaybeUninit<V>>(bucket_count)
            .map_err(|_| TryReserveError::CapacityOverflow)?;

        // SAFETY: `metadata_layout` has non-zero size. Allocation failure is
        // handled, and the writes initialize exactly the `metadata_len` words
        // the layout covers.
        let metadata = unsafe {
            let Some(metadata) = NonNull::new(alloc::alloc::alloc(metadata_layout).cast::<u16>())
            else {
                return Err(TryReserveError::AllocError {
                    layout: metadata_layout,
                });
            };
            core::ptr::write_bytes(metadata.as_ptr(), 0x00, bucket_count);
            core::ptr::write_bytes(
                metadata.as_ptr().add(bucket_count),
                0xFF,
                METADATA_SENTINEL_LEN,
            );
            metadata
        };

        let buckets = if buckets_layout.size() == 0 {
            NonNull::dangling()
        } else {
            // SAFETY: `buckets_layout` was just checked to be non-zero-sized.
            match NonNull::new(unsafe { alloc::alloc::alloc(buckets_layout) }) {
                Some(raw) => raw.cast(),
                None => {
                    // SAFETY: `metadata` came from the matching layout above.
                    unsafe {
                        alloc::alloc::dealloc(metadata.as_ptr().cast(), metadata_layout);
                    }
                    return Err(TryReserveError::AllocError {
                        layout: buckets_layout,
                    });
                }
            }
        };

        Ok((metadata, buckets))
    }

    fn install_fresh_arrays(&mut self, bucket_count: usize) -> Result<(), TryReserveError> {
        debug_assert_eq!(self.bucket_count, 0);
        let (metadata, buckets) = Self::allocate_arrays(bucket_count)?;
        self.metadata = metadata;
        self.buckets = buckets;
        self.bucket_count = bucket_count;
        Ok(())
    }

    /// Frees both arrays without touching the values stored in them.
    ///
    /// # Safety
    ///
    /// Every live value must have been dropped or moved out already, and the
    /// array pointers must not be used again before being replaced.
    unsafe fn dealloc_arrays(&mut self) {
        if self.bucket_count == 0 {
            return;
        }

        let metadata_layout = Layout::array::<u16>(self.bucket_count + METADATA_SENTINEL_LEN)
            .expect("allocation size overflow");
        let buckets_layout =
            Layout::array::<MaybeUninit<V>>(self.bucket_count).expect("allocation size overflow");

        // SAFETY: Both pointers came from `allocate_arrays` with these exact
        // layouts.
        unsafe {
            alloc::alloc::dealloc(self.metadata.as_ptr().cast(), metadata_layout);
            if buckets_layout.size() != 0 {
                alloc::alloc::dealloc(self.buckets.as_ptr().cast(), buckets_layout);
            }
        }
    }

    /// Finds the earliest empty bucket able to hold a key belonging to
    /// `home_bucket`, assuming `home_bucket` itself is occupied. Returns the
    /// bucket index and its quadratic displacement, or `None` when no empty
    /// bucket lies within the displacement limit.
    ///
    /// The search restarts from the home bucket rather than the chain tail
    /// because erasures from other chains may have freed buckets at smaller
    /// displacements than the keys already linked.
    #[inline]
    fn find_first_empty(&self, home_bucket: usize) -> Option<(usize, u16)> {
        let mut displacement: u16 = 1;
        let mut linear_displacement = 1usize;

        loop {
            let bucket = (home_bucket + linear_displacement) & (self.bucket_count - 1);
            // SAFETY: The index is masked by `bucket_count - 1`.
            if unsafe { self.metadatum(bucket) } == EMPTY {
                return Some((bucket, displacement));
            }

            displacement += 1;
            if displacement == DISPLACEMENT_MASK {
                return None;
            }

            linear_displacement += displacement as usize;
        }
    }

    /// Finds the chain member after which a key at quadratic displacement
    /// `displacement_to_empty` should be linked, keeping the chain sorted by
    /// displacement. Sorted chains walk monotonically away from the home
    /// bucket, which helps cache locality during lookups.
    #[inline]
    fn find_insert_location_in_chain(
        &self,
        home_bucket: usize,
        displacement_to_empty: u16,
    ) -> usize {
        let mut candidate = home_bucket;
        loop {
            // SAFETY: `candidate` starts at a masked index and every
            // successor is masked below.
            let displacement = unsafe { self.metadatum(candidate) } & DISPLACEMENT_MASK;

            if displacement > displacement_to_empty {
                return candidate;
            }

            candidate = (home_bucket + quadratic(displacement)) & (self.bucket_count - 1);
        }
    }

    /// Moves the key occupying `bucket` — which belongs to some other home
    /// bucket — out into its own chain, leaving `bucket` empty.
    ///
    /// Returns `false` when no empty bucket is reachable within the
    /// displacement limit. The occupant has been unlinked from its chain by
    /// then; the caller must rebuild the table via rehash, which re-places
    /// every key from scratch and never consults the disturbed chain.
    ///
    /// # Safety
    ///
    /// `bucket` must be occupied and its in-home-bucket flag must be clear.
    unsafe fn evict(&mut self, bucket: usize, rehash: &dyn Fn(&V) -> u64) -> bool {
        // SAFETY (throughout): `bucket` is occupied per the contract, every
        // other index is masked, and chain walks terminate per the chain
        // integrity invariant.
        unsafe {
            debug_assert!(self.metadatum(bucket) != EMPTY);
            debug_assert!(self.metadatum(bucket) & IN_HOME_BUCKET == 0);

            // Find the occupant's predecessor by rehashing it and walking its
            // chain from its home bucket.
            let home_bucket = (rehash(self.value_ref(bucket)) as usize) & (self.bucket_count - 1);
            let mut prev = home_bucket;
            loop {
                let next = (home_bucket + quadratic(self.metadatum(prev) & DISPLACEMENT_MASK))
                    & (self.bucket_count - 1);
                if next == bucket {
                    break;
                }
                prev = next;
            }

            // Disconnect the occupant from its chain.
            self.set_metadatum(
                prev,
                (self.metadatum(prev) & !DISPLACEMENT_MASK)
                    | (self.metadatum(bucket) & DISPLACEMENT_MASK),
            );

            let Some((empty, displacement)) = self.find_first_empty(home_bucket) else {
                return false;
            };

            // Find the key after which to re-link the occupant.
            let prev = self.find_insert_location_in_chain(home_bucket, displacement);

            // Move the value and splice its new bucket into the chain.
            core::ptr::copy_nonoverlapping(self.bucket_ptr(bucket), self.bucket_ptr(empty), 1);
            self.set_metadatum(
                empty,
                (self.metadatum(bucket) & HASH_FRAG_MASK)
                    | (self.metadatum(prev) & DISPLACEMENT_MASK),
            );
            self.set_metadatum(
                prev,
                (self.metadatum(prev) & !DISPLACEMENT_MASK) | displacement,
            );

            self.set_metadatum(bucket, EMPTY);
        }

        true
    }

    /// Locates and fully prepares the bucket where a new key hashing to
    /// `hash` will be stored, evicting any foreign occupant of the home
    /// bucket. The table stays consistent whether or not the insertion is
    /// completed; `commit_insert` finishes the transaction after the value
    /// has been written.
    ///
    /// Returns `None` when the load ceiling or the displacement limit demands
    /// a rehash first, or when the table has no buckets yet.
    ///
    /// The caller must have established that the key is absent; this routine
    /// does not search.
    fn prepare_insert(&mut self, hash: u64, rehash: &dyn Fn(&V) -> u64) -> Option<(usize, Link)> {
        if self.bucket_count == 0 {
            return None;
        }

        let home_bucket = self.home_bucket(hash);
        // SAFETY: `home_bucket` is masked.
        let metadatum = unsafe { self.metadatum(home_bucket) };

        // Case 1: the home bucket is empty or held by a key belonging
        // elsewhere. The new key will anchor a fresh chain there.
        if metadatum & IN_HOME_BUCKET == 0 {
            if self.insert_would_overload() {
                return None;
            }

            // The load ceiling is checked first so a table at its limit
            // never pays for a pointless move.
            if metadatum != EMPTY {
                // SAFETY: Occupied with the flag clear, as just read.
                if !unsafe { self.evict(home_bucket, rehash) } {
                    return None;
                }
            }

            return Some((home_bucket, Link::Anchor));
        }

        // Case 2: the home bucket anchors a chain. Link the new key into it
        // at the earliest empty bucket.
        if self.insert_would_overload() {
            return None;
        }

        let (empty, displacement) = self.find_first_empty(home_bucket)?;
        let prev = self.find_insert_location_in_chain(home_bucket, displacement);

        Some((empty, Link::Chained { prev, displacement }))
    }

    /// Writes the metadata completing a prepared insertion and bumps the key
    /// count.
    ///
    /// # Safety
    ///
    /// `bucket` and `link` must come from a `prepare_insert` call on this
    /// table with no intervening mutation, and the value must already have
    /// been written into `bucket`.
    unsafe fn commit_insert(&mut self, bucket: usize, link: Link, fragment: u16) {
        // SAFETY: The indices were produced by `prepare_insert` and are still
        // valid per the contract.
        unsafe {
            match link {
                Link::Anchor => {
                    self.set_metadatum(bucket, fragment | IN_HOME_BUCKET | DISPLACEMENT_MASK);
                }
                Link::Chained { prev, displacement } => {
                    let prev_metadatum = self.metadatum(prev);
                    self.set_metadatum(bucket, fragment | (prev_metadatum & DISPLACEMENT_MASK));
                    self.set_metadatum(prev, (prev_metadatum & !DISPLACEMENT_MASK) | displacement);
                }
            }
        }
        self.key_count += 1;
    }

    /// Walks the chain anchored in the key's home bucket, comparing stored
    /// hash fragments before invoking the comparator. Returns the matching
    /// bucket and the home bucket.
    #[inline]
    fn find_in_chain(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<(usize, usize)> {
        if self.key_count == 0 {
            return None;
        }

        let home_bucket = self.home_bucket(hash);
        let fragment = hash_fragment(hash);

        // SAFETY: All indices are masked, chain members are occupied, and the
        // walk terminates per the chain integrity invariant.
        unsafe {
            // No chain starts here, so the key cannot be present.
            if self.metadatum(home_bucket) & IN_HOME_BUCKET == 0 {
                return None;
            }

            let mut bucket = home_bucket;
            loop {
                let metadatum = self.metadatum(bucket);
                if metadatum & HASH_FRAG_MASK == fragment && eq(self.value_ref(bucket)) {
                    return Some((bucket, home_bucket));
                }

                let displacement = metadatum & DISPLACEMENT_MASK;
                if displacement == DISPLACEMENT_MASK {
                    return None;
                }

                bucket = (home_bucket + quadratic(displacement)) & (self.bucket_count - 1);
            }
        }
    }

    /// Returns a reference to the value matching `hash` and `eq`, if any.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value of the key to find
    /// * `eq` - A predicate returning `true` for the value to find
    pub fn find(&self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&V> {
        let (bucket, _) = self.find_in_chain(hash, eq)?;
        // SAFETY: `find_in_chain` only returns occupied buckets.
        Some(unsafe { self.value_ref(bucket) })
    }

    /// Returns a mutable reference to the value matching `hash` and `eq`, if
    /// any.
    ///
    /// The hash of the value must not be changed through the returned
    /// reference.
    pub fn find_mut(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<&mut V> {
        let (bucket, _) = self.find_in_chain(hash, eq)?;
        // SAFETY: `find_in_chain` only returns occupied buckets.
        Some(unsafe { self.value_mut(bucket) })
    }

    /// Gets an entry for the given hash and equality predicate, growing the
    /// table as needed.
    ///
    /// The returned [`Entry`] allows insertion or in-place modification
    /// without repeating the lookup. Aborts the process if growing fails to
    /// allocate; use [`try_entry`] to handle that case instead.
    ///
    /// # Arguments
    ///
    /// * `hash` - The hash value for the entry
    /// * `eq` - A predicate returning `true` for matching values
    /// * `rehash` - Recomputes the hash of a stored value; used when existing
    ///   keys must move
    ///
    /// [`try_entry`]: HashTable::try_entry
    #[inline]
    pub fn entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Entry<'_, V> {
        match self.try_entry(hash, eq, rehash) {
            Ok(entry) => entry,
            Err(err) => err.handle(),
        }
    }

    /// Fallible variant of [`entry`]: surfaces allocation failure instead of
    /// aborting. The table is unchanged when `Err` is returned.
    ///
    /// [`entry`]: HashTable::entry
    pub fn try_entry(
        &mut self,
        hash: u64,
        eq: impl Fn(&V) -> bool,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<Entry<'_, V>, TryReserveError> {
        if let Some((bucket, home_bucket)) = self.find_in_chain(hash, &eq) {
            return Ok(Entry::Occupied(OccupiedEntry {
                table: self,
                bucket,
                home_bucket,
            }));
        }

        // Grow until the key can be placed. A placement that fails at one
        // size can succeed at the next because rehashing redistributes every
        // chain.
        let (bucket, link) = loop {
            if let Some(placement) = self.prepare_insert(hash, &rehash) {
                break placement;
            }
            self.grow(&rehash)?;
        };

        Ok(Entry::Vacant(VacantEntry {
            table: self,
            hash,
            bucket,
            link,
        }))
    }

    /// Removes and returns the value matching `hash` and `eq`, if any.
    ///
    /// The removal is tombstone-free: if the removed key was an interior
    /// chain member, the chain's tail key is swapped down into its bucket.
    pub fn remove(&mut self, hash: u64, eq: impl Fn(&V) -> bool) -> Option<V> {
        let (bucket, home_bucket) = self.find_in_chain(hash, eq)?;
        // SAFETY: `find_in_chain` returned an occupied member of the chain
        // anchored at `home_bucket`.
        let (value, _) = unsafe { self.remove_bucket(bucket, home_bucket) };
        Some(value)
    }

    /// Unlinks and reads out the key in `bucket`, repairing its chain.
    ///
    /// The erasure always happens at the end of the chain: if the erased key
    /// is an interior member, the tail key is moved down into its bucket,
    /// which keeps chains close to their home bucket.
    ///
    /// The second return value reports whether a forward scan positioned at
    /// `bucket` should advance: `false` means a key the scan has not yet
    /// visited was swapped into `bucket` and the position must be
    /// re-examined.
    ///
    /// # Safety
    ///
    /// `bucket` must be occupied and `home_bucket` must be the home bucket of
    /// the key it holds.
    unsafe fn remove_bucket(&mut self, bucket: usize, home_bucket: usize) -> (V, bool) {
        self.key_count -= 1;

        // SAFETY (throughout): `bucket` is occupied per the contract, chain
        // walks stay masked and terminate per the chain integrity invariant,
        // and the value is read out exactly once.
        unsafe {
            let metadatum = self.metadatum(bucket);
            let value = (*self.bucket_ptr(bucket)).assume_init_read();

            // Case 1: the sole member of its chain.
            if metadatum & IN_HOME_BUCKET != 0 && metadatum & DISPLACEMENT_MASK == DISPLACEMENT_MASK
            {
                self.set_metadatum(bucket, EMPTY);
                return (value, true);
            }

            // Case 2: the last member of a multi-key chain. Walk from the
            // home bucket to the penultimate member and disconnect.
            if metadatum & DISPLACEMENT_MASK == DISPLACEMENT_MASK {
                let mut prev = home_bucket;
                loop {
                    let next = (home_bucket + quadratic(self.metadatum(prev) & DISPLACEMENT_MASK))
                        & (self.bucket_count - 1);
                    if next == bucket {
                        break;
                    }
                    prev = next;
                }

                self.set_metadatum(prev, self.metadatum(prev) | DISPLACEMENT_MASK);
                self.set_metadatum(bucket, EMPTY);
                return (value, true);
            }

            // Case 3: an interior member. Walk to the chain's last member and
            // swap it down into the vacated bucket.
            let mut prev = bucket;
            let mut tail =
                (home_bucket + quadratic(metadatum & DISPLACEMENT_MASK)) & (self.bucket_count - 1);
            loop {
                let tail_metadatum = self.metadatum(tail);
                if tail_metadatum & DISPLACEMENT_MASK == DISPLACEMENT_MASK {
                    break;
                }
                prev = tail;
                tail = (home_bucket + quadratic(tail_metadatum & DISPLACEMENT_MASK))
                    & (self.bucket_count - 1);
            }

            core::ptr::copy_nonoverlapping(self.bucket_ptr(tail), self.bucket_ptr(bucket), 1);
            // The moved key keeps the vacated bucket's flag and link but
            // brings its own hash fragment.
            self.set_metadatum(
                bucket,
                (self.metadatum(bucket) & !HASH_FRAG_MASK)
                    | (self.metadatum(tail) & HASH_FRAG_MASK),
            );
            self.set_metadatum(prev, self.metadatum(prev) | DISPLACEMENT_MASK);
            self.set_metadatum(tail, EMPTY);

            // A tail moved up from an earlier index was already visited by a
            // forward scan; one moved down from a later index was not.
            (value, tail < bucket)
        }
    }

    /// Home bucket of the key stored in `bucket`, recomputing the hash only
    /// when the flag cannot answer directly.
    ///
    /// # Safety
    ///
    /// `bucket` must be occupied.
    #[inline]
    unsafe fn home_of_bucket(&self, bucket: usize, rehash: &dyn Fn(&V) -> u64) -> usize {
        // SAFETY: `bucket` is occupied per the contract.
        unsafe {
            if self.metadatum(bucket) & IN_HOME_BUCKET != 0 {
                bucket
            } else {
                (rehash(self.value_ref(bucket)) as usize) & (self.bucket_count - 1)
            }
        }
    }

    /// Index of the first occupied bucket at or after `bucket`, or
    /// `bucket_count` when none remains.
    ///
    /// Scans four metadata words per 8-byte load; the all-ones sentinel tail
    /// guarantees the loop stops at the end of the array without a bounds
    /// check per word.
    ///
    /// # Safety
    ///
    /// `bucket` must be at most `bucket_count`.
    #[inline]
    unsafe fn fast_forward(&self, mut bucket: usize) -> usize {
        loop {
            // SAFETY: `bucket <= bucket_count` holds on entry and is
            // preserved below, and the array extends 4 words past
            // `bucket_count`, so the 8-byte load stays in bounds.
            let chunk = unsafe {
                core::ptr::read_unaligned(self.metadata.as_ptr().add(bucket) as *const u64)
            };
            if chunk != 0 {
                let next = bucket + first_occupied_in_chunk(chunk);
                debug_assert!(next <= self.bucket_count);
                return next;
            }

            // A zero chunk means four empty buckets, none of which can be a
            // sentinel word, so the next read still starts at or before
            // `bucket_count`.
            bucket += 4;
        }
    }

    /// Retains only the values for which `keep` returns `true`, removing the
    /// rest in a single pass.
    ///
    /// This is the supported way to erase while traversing: the scan
    /// compensates for the tail swaps that removal performs, so every value
    /// is visited exactly once.
    ///
    /// # Arguments
    ///
    /// * `keep` - Decides which values survive; may mutate them, but must not
    ///   change any hash
    /// * `rehash` - Recomputes the hash of a stored value
    pub fn retain(&mut self, mut keep: impl FnMut(&mut V) -> bool, rehash: impl Fn(&V) -> u64) {
        if self.key_count == 0 {
            return;
        }

        // SAFETY: `fast_forward` only stops below `bucket_count` on occupied
        // buckets, and `remove_bucket` is handed the occupant's true home
        // bucket.
        unsafe {
            let mut bucket = self.fast_forward(0);
            while bucket < self.bucket_count {
                if keep(self.value_mut(bucket)) {
                    bucket = self.fast_forward(bucket + 1);
                    continue;
                }

                let home_bucket = self.home_of_bucket(bucket, &rehash);
                let (value, advance) = self.remove_bucket(bucket, home_bucket);
                drop(value);
                if advance {
                    bucket = self.fast_forward(bucket + 1);
                }
                // Otherwise an unvisited key was swapped into `bucket`;
                // re-examine the same position.
            }
        }
    }

    /// Returns an iterator over all values in the table, in bucket order.
    ///
    /// The order depends on the hash function and the table's history and is
    /// not otherwise specified.
    pub fn iter(&self) -> Iter<'_, V> {
        let mut iter = Iter {
            bucket: self.buckets,
            // SAFETY: One-past-the-end of the real buckets, still inside the
            // metadata allocation (the sentinel tail follows).
            metadata_end: unsafe {
                NonNull::new_unchecked(self.metadata.as_ptr().add(self.bucket_count))
            },
            metadatum: self.metadata,
            _marker: PhantomData,
        };
        iter.fast_forward();
        iter
    }

    /// Returns an iterator that removes and yields all values in the table.
    ///
    /// The table is emptied up front; dropping the iterator drops any values
    /// not yet yielded. Leaking the iterator (via `mem::forget`) leaks those
    /// values but leaves the table valid and empty.
    pub fn drain(&mut self) -> Drain<'_, V> {
        // Snapshot the occupancy and reset the table immediately so that a
        // leaked `Drain` can never cause a double drop.
        let occupancy: Box<[u16]> = if self.bucket_count == 0 {
            Box::new([])
        } else {
            // SAFETY: The first `bucket_count` metadata words are initialized.
            unsafe { core::slice::from_raw_parts(self.metadata.as_ptr(), self.bucket_count) }
                .into()
        };

        if self.bucket_count > 0 {
            // SAFETY: Zeroing the real metadata words empties the table; the
            // values are now owned by the snapshot-driven iterator.
            unsafe {
                core::ptr::write_bytes(self.metadata.as_ptr(), 0x00, self.bucket_count);
            }
        }
        self.key_count = 0;

        Drain {
            table: self,
            occupancy,
            bucket: 0,
        }
    }

    /// Removes all values from the table, keeping the allocated capacity.
    pub fn clear(&mut self) {
        // SAFETY: Occupied buckets hold initialized values; zeroing the
        // metadata afterwards marks every bucket empty.
        unsafe {
            if core::mem::needs_drop::<V>() && self.key_count > 0 {
                for bucket in 0..self.bucket_count {
                    if self.metadatum(bucket) != EMPTY {
                        (*self.bucket_ptr(bucket)).assume_init_drop();
                    }
                }
            }

            if self.bucket_count > 0 {
                core::ptr::write_bytes(self.metadata.as_ptr(), 0x00, self.bucket_count);
            }
        }

        self.key_count = 0;
    }

    fn grow(&mut self, rehash: &dyn Fn(&V) -> u64) -> Result<(), TryReserveError> {
        let target = if self.bucket_count == 0 {
            MIN_NONZERO_BUCKET_COUNT
        } else {
            self.bucket_count
                .checked_mul(2)
                .ok_or(TryReserveError::CapacityOverflow)?
        };
        self.rehash_to(target, rehash)
    }

    /// Replaces both arrays with freshly allocated ones of
    /// `target_bucket_count` buckets and re-places every key.
    ///
    /// Re-placement can hit the displacement limit even when the load ceiling
    /// is respected, so the whole attempt runs in a loop that doubles the
    /// target and starts over from the still-intact old arrays. Values are
    /// moved by bit copy; relocation is not a destruction event.
    fn rehash_to(
        &mut self,
        mut target_bucket_count: usize,
        rehash: &dyn Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        'retry: loop {
            let (metadata, buckets) = Self::allocate_arrays(target_bucket_count)?;
            // The new table must not drop values on any exit path: until the
            // old arrays are freed, it holds bit copies that the old table
            // still owns.
            let mut new_table = ManuallyDrop::new(HashTable {
                key_count: 0,
                bucket_count: target_bucket_count,
                metadata,
                buckets,
                max_load: self.max_load,
                _phantom: PhantomData,
            });

            for bucket in 0..self.bucket_count {
                // SAFETY: `bucket` is in bounds; occupied buckets hold
                // initialized values.
                if unsafe { self.metadatum(bucket) } == EMPTY {
                    continue;
                }
                let hash = rehash(unsafe { self.value_ref(bucket) });

                // The key is known to be absent from the new table, so no
                // pre-insertion search is needed.
                match new_table.prepare_insert(hash, rehash) {
                    Some((new_bucket, link)) => {
                        // SAFETY: `prepare_insert` left `new_bucket` empty;
                        // source and destination are distinct allocations.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                self.bucket_ptr(bucket),
                                new_table.bucket_ptr(new_bucket),
                                1,
                            );
                            new_table.commit_insert(new_bucket, link, hash_fragment(hash));
                        }
                    }
                    None => {
                        // The displacement limit was exhausted at this size.
                        // Every value still lives in the old arrays, so only
                        // the new arrays are released before retrying.
                        // SAFETY: `new_table` owns no values of its own.
                        unsafe {
                            new_table.dealloc_arrays();
                        }
                        target_bucket_count = target_bucket_count
                            .checked_mul(2)
                            .ok_or(TryReserveError::CapacityOverflow)?;
                        continue 'retry;
                    }
                }
            }

            debug_assert_eq!(new_table.key_count, self.key_count);

            // SAFETY: Every value has been moved into the new arrays; the old
            // arrays are freed without dropping the moved-out bit patterns.
            unsafe {
                self.dealloc_arrays();
            }
            self.key_count = new_table.key_count;
            self.bucket_count = new_table.bucket_count;
            self.metadata = new_table.metadata;
            self.buckets = new_table.buckets;

            return Ok(());
        }
    }

    /// Ensures the table can hold `size` keys in total without further
    /// allocation. Never shrinks. Aborts the process on allocation failure;
    /// use [`try_reserve`] to handle that case instead.
    ///
    /// [`try_reserve`]: HashTable::try_reserve
    pub fn reserve(&mut self, size: usize, rehash: impl Fn(&V) -> u64) {
        if let Err(err) = self.try_reserve(size, rehash) {
            err.handle();
        }
    }

    /// Fallible variant of [`reserve`]: surfaces allocation failure instead
    /// of aborting. The table is unchanged when `Err` is returned.
    ///
    /// [`reserve`]: HashTable::reserve
    pub fn try_reserve(
        &mut self,
        size: usize,
        rehash: impl Fn(&V) -> u64,
    ) -> Result<(), TryReserveError> {
        let bucket_count = self.min_bucket_count_for(size)?;
        if bucket_count <= self.bucket_count {
            return Ok(());
        }

        self.rehash_to(bucket_count, &rehash)
    }

    /// Shrinks the bucket array to the smallest size accommodating the
    /// current number of keys. An empty table returns to the allocation-free
    /// zero-capacity state. Aborts the process on allocation failure; use
    /// [`try_shrink_to_fit`] to handle that case instead.
    ///
    /// [`try_shrink_to_fit`]: HashTable::try_shrink_to_fit
    pub fn shrink_to_fit(&mut self, rehash: impl Fn(&V) -> u64) {
        if let Err(err) = self.try_shrink_to_fit(rehash) {
            err.handle();
        }
    }

    /// Fallible variant of [`shrink_to_fit`]: surfaces allocation failure
    /// instead of aborting. The table is unchanged when `Err` is returned.
    ///
    /// [`shrink_to_fit`]: HashTable::shrink_to_fit
    pub fn try_shrink_to_fit(&mut self, rehash: impl Fn(&V) -> u64) -> Result<(), TryReserveError> {
        let bucket_count = self.min_bucket_count_for(self.key_count)?;
        if bucket_count == self.bucket_count {
            return Ok(());
        }

        if bucket_count == 0 {
            // SAFETY: `key_count` is zero here, so no live values remain in
            // the arrays being freed.
            unsafe {
                self.dealloc_arrays();
            }
            self.bucket_count = 0;
            self.metadata = placeholder_metadata();
            self.buckets = NonNull::dangling();
            return Ok(());
        }

        self.rehash_to(bucket_count, &rehash)
    }
}

impl<V> HashTable<V>
where
    V: Clone,
{
    /// Returns a copy of the table, or an error if allocation fails.
    ///
    /// The copy shares nothing with the original: both arrays are freshly
    /// allocated and every value is cloned. The bucket layout is reproduced
    /// exactly, so no rehashing happens.
    pub fn try_clone(&self) -> Result<Self, TryReserveError> {
        let mut clone = Self::with_max_load_factor(self.max_load);
        if self.bucket_count == 0 {
            return Ok(clone);
        }

        clone.install_fresh_arrays(self.bucket_count)?;

        // Each metadata word is copied only after its value clone has landed,
        // so a panicking `V::clone` leaves a clone that drops exactly the
        // values actually written.
        for bucket in 0..self.bucket_count {
            // SAFETY: `bucket` is in bounds for both tables; occupied source
            // buckets hold initialized values and the target bucket is still
            // uninitialized.
            unsafe {
                let metadatum = self.metadatum(bucket);
                if metadatum == EMPTY {
                    continue;
                }
                (*clone.bucket_ptr(bucket)).write(self.value_ref(bucket).clone());
                clone.set_metadatum(bucket, metadatum);
                clone.key_count += 1;
            }
        }

        debug_assert_eq!(clone.key_count, self.key_count);
        Ok(clone)
    }
}

impl<V> Clone for HashTable<V>
where
    V: Clone,
{
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(clone) => clone,
            Err(err) => err.handle(),
        }
    }
}

impl<V> Drop for HashTable<V> {
    fn drop(&mut self) {
        // SAFETY: Occupied buckets hold initialized values; after dropping
        // them, freeing the arrays is the last use of the pointers.
        unsafe {
            if core::mem::needs_drop::<V>() && self.key_count > 0 {
                for bucket in 0..self.bucket_count {
                    if self.metadatum(bucket) != EMPTY {
                        (*self.bucket_ptr(bucket)).assume_init_drop();
                    }
                }
            }

            self.dealloc_arrays();
        }
    }
}

/// A view into a single entry in the hash table, which may be vacant or
/// occupied.
///
/// This enum is constructed from the [`entry`] method on [`HashTable`].
///
/// [`entry`]: HashTable::entry
pub enum Entry<'a, V> {
    /// A vacant entry - the key is not present in the table
    Vacant(VacantEntry<'a, V>),
    /// An occupied entry - the key is present in the table
    Occupied(OccupiedEntry<'a, V>),
}

impl<'a, V> Entry<'a, V> {
    /// Inserts `default` if the entry is vacant and returns a mutable
    /// reference to the entry's value.
    pub fn or_insert(self, default: V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default),
        }
    }

    /// Inserts a value computed from a closure if the entry is vacant and
    /// returns a mutable reference to the entry's value.
    pub fn or_insert_with(self, default: impl FnOnce() -> V) -> &'a mut V {
        match self {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(default()),
        }
    }

    /// Provides in-place mutable access to an occupied entry, returning
    /// `None` without inserting anything if the entry is vacant.
    pub fn and_modify(self, f: impl FnOnce(&mut V)) -> Option<&'a mut V> {
        match self {
            Entry::Occupied(entry) => {
                let value = entry.into_mut();
                f(value);
                Some(value)
            }
            Entry::Vacant(_) => None,
        }
    }

    /// Inserts `V::default()` if the entry is vacant and returns a mutable
    /// reference to the entry's value.
    pub fn or_default(self) -> &'a mut V
    where
        V: Default,
    {
        self.or_insert_with(Default::default)
    }
}

/// A view into a vacant entry in the hash table.
///
/// This struct is created by the [`entry`] method on [`HashTable`] when the
/// requested key is not present. The destination bucket has already been
/// prepared, including any eviction; [`insert`] completes the transaction.
///
/// [`entry`]: HashTable::entry
/// [`insert`]: VacantEntry::insert
pub struct VacantEntry<'a, V> {
    table: &'a mut HashTable<V>,
    hash: u64,
    bucket: usize,
    link: Link,
}

impl<'a, V> VacantEntry<'a, V> {
    /// Inserts a value into the vacant entry and returns a mutable reference
    /// to it.
    pub fn insert(self, value: V) -> &'a mut V {
        let VacantEntry {
            table,
            hash,
            bucket,
            link,
        } = self;

        // SAFETY: `prepare_insert` left `bucket` empty and `link` valid, and
        // the exclusive borrow rules out any intervening mutation.
        unsafe {
            (*table.bucket_ptr(bucket)).write(value);
            table.commit_insert(bucket, link, hash_fragment(hash));
            table.value_mut(bucket)
        }
    }
}

/// A view into an occupied entry in the hash table.
///
/// This struct is created by the [`entry`] method on [`HashTable`] when the
/// requested key is present.
///
/// [`entry`]: HashTable::entry
pub struct OccupiedEntry<'a, V> {
    table: &'a mut HashTable<V>,
    bucket: usize,
    home_bucket: usize,
}

impl<'a, V> OccupiedEntry<'a, V> {
    /// Gets a reference to the value in the entry.
    pub fn get(&self) -> &V {
        // SAFETY: The entry's bucket is occupied.
        unsafe { self.table.value_ref(self.bucket) }
    }

    /// Gets a mutable reference to the value in the entry.
    ///
    /// The hash of the value must not be changed through the returned
    /// reference.
    pub fn get_mut(&mut self) -> &mut V {
        // SAFETY: The entry's bucket is occupied.
        unsafe { self.table.value_mut(self.bucket) }
    }

    /// Converts the entry into a mutable reference to its value.
    pub fn into_mut(self) -> &'a mut V {
        let OccupiedEntry { table, bucket, .. } = self;
        // SAFETY: The entry's bucket is occupied.
        unsafe { table.value_mut(bucket) }
    }

    /// Replaces the entry's value, returning the old one.
    ///
    /// The new value must be equal to the old under the table's comparator
    /// and hash to the same 64-bit value.
    pub fn insert(&mut self, value: V) -> V {
        core::mem::replace(self.get_mut(), value)
    }

    /// Removes the entry from the table and returns its value.
    pub fn remove(self) -> V {
        let OccupiedEntry {
            table,
            bucket,
            home_bucket,
        } = self;
        // SAFETY: The entry's bucket is occupied and `home_bucket` was
        // derived from the stored key's hash when the entry was created.
        let (value, _) = unsafe { table.remove_bucket(bucket, home_bucket) };
        value
    }
}

/// An iterator over the values of a [`HashTable`].
///
/// This struct is created by the [`iter`] method on [`HashTable`].
///
/// The iterator carries its own end pointer, so detecting the end requires
/// no access to the table. It advances through the metadata array four
/// buckets per 8-byte load, relying on the sentinel tail to terminate.
///
/// [`iter`]: HashTable::iter
pub struct Iter<'a, V> {
    bucket: NonNull<MaybeUninit<V>>,
    metadatum: NonNull<u16>,
    metadata_end: NonNull<u16>,
    _marker: PhantomData<&'a V>,
}

impl<'a, V> Iter<'a, V> {
    /// Advances both pointers to the next occupied bucket, stopping at
    /// `metadata_end` when none remains.
    fn fast_forward(&mut self) {
        // SAFETY: The metadata allocation extends 4 all-ones words past
        // `metadata_end`, so every 8-byte load up to and including the one at
        // `metadata_end` is in bounds and the loop stops there at the latest.
        // The bucket pointer moves in lockstep and stops at or before its
        // one-past-the-end position.
        unsafe {
            loop {
                let chunk = core::ptr::read_unaligned(self.metadatum.as_ptr() as *const u64);
                if chunk != 0 {
                    let offset = first_occupied_in_chunk(chunk);
                    self.metadatum = NonNull::new_unchecked(self.metadatum.as_ptr().add(offset));
                    self.bucket = NonNull::new_unchecked(self.bucket.as_ptr().add(offset));
                    return;
                }

                self.metadatum = NonNull::new_unchecked(self.metadatum.as_ptr().add(4));
                self.bucket = NonNull::new_unchecked(self.bucket.as_ptr().add(4));
            }
        }
    }
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = &'a V;

    fn next(&mut self) -> Option<Self::Item> {
        if self.metadatum == self.metadata_end {
            return None;
        }

        // SAFETY: A position short of the end pointer is an occupied bucket
        // holding an initialized value, and stepping both pointers by one
        // keeps them inside their arrays (the end positions included).
        unsafe {
            let value = (*self.bucket.as_ptr()).assume_init_ref();
            self.metadatum = NonNull::new_unchecked(self.metadatum.as_ptr().add(1));
            self.bucket = NonNull::new_unchecked(self.bucket.as_ptr().add(1));
            self.fast_forward();
            Some(value)
        }
    }
}

impl<'a, V> IntoIterator for &'a HashTable<V> {
    type Item = &'a V;
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// A draining iterator over the values of a [`HashTable`].
///
/// This struct is created by the [`drain`] method on [`HashTable`].
///
/// [`drain`]: HashTable::drain
pub struct Drain<'a, V> {
    table: &'a mut HashTable<V>,
    occupancy: Box<[u16]>,
    bucket: usize,
}

impl<'a, V> Iterator for Drain<'a, V> {
    type Item = V;

    fn next(&mut self) -> Option<Self::Item> {
        while self.bucket < self.occupancy.len() {
            let bucket = self.bucket;
            self.bucket += 1;

            if self.occupancy[bucket] != EMPTY {
                // SAFETY: The snapshot marks this bucket occupied and the
                // table's own metadata was zeroed when the snapshot was
                // taken, so this read is the value's only remaining owner.
                return Some(unsafe { (*self.table.bucket_ptr(bucket)).assume_init_read() });
            }
        }

        None
    }
}

impl<'a, V> Drop for Drain<'a, V> {
    fn drop(&mut self) {
        for _ in self {}
    }
}

/// Health statistics for the chain structure of a [`HashTable`].
///
/// Produced by [`chain_stats`]; useful for judging hash quality and load
/// factor choices.
///
/// [`chain_stats`]: HashTable::chain_stats
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct ChainStats {
    /// Number of keys currently in the table.
    pub populated: usize,
    /// Number of buckets allocated.
    pub bucket_count: usize,
    /// Number of home buckets anchoring a chain.
    pub chains: usize,
    /// Length of the longest chain.
    pub max_chain_length: usize,
    /// Histogram of chain lengths; the last bin collects everything longer.
    pub chain_length_histogram: [usize; 16],
    /// Keys stored outside their home bucket.
    pub displaced_keys: usize,
}

#[cfg(feature = "stats")]
impl ChainStats {
    /// Pretty-print the statistics.
    #[cfg(feature = "std")]
    pub fn print(&self) {
        println!(
            "chains: {} over {} keys in {} buckets ({} displaced)",
            self.chains, self.populated, self.bucket_count, self.displaced_keys
        );
        println!("longest chain: {}", self.max_chain_length);
        for (length, &count) in self.chain_length_histogram.iter().enumerate() {
            if count != 0 {
                let label = if length + 1 == self.chain_length_histogram.len() {
                    "+"
                } else {
                    " "
                };
                println!("{:>3}{} | {}", length + 1, label, count);
            }
        }
    }
}

#[cfg(feature = "stats")]
impl<V> HashTable<V> {
    /// Computes chain statistics for the current table state.
    pub fn chain_stats(&self) -> ChainStats {
        let mut stats = ChainStats {
            populated: self.key_count,
            bucket_count: self.bucket_count,
            chains: 0,
            max_chain_length: 0,
            chain_length_histogram: [0; 16],
            displaced_keys: 0,
        };

        // SAFETY: All indices are masked and chain walks terminate per the
        // chain integrity invariant.
        unsafe {
            for home_bucket in 0..self.bucket_count {
                let metadatum = self.metadatum(home_bucket);
                if metadatum == EMPTY {
                    continue;
                }
                if metadatum & IN_HOME_BUCKET == 0 {
                    stats.displaced_keys += 1;
                    continue;
                }

                stats.chains += 1;
                let mut length = 1;
                let mut bucket = home_bucket;
                loop {
                    let displacement = self.metadatum(bucket) & DISPLACEMENT_MASK;
                    if displacement == DISPLACEMENT_MASK {
                        break;
                    }
                    length += 1;
                    bucket = (home_bucket + quadratic(displacement)) & (self.bucket_count - 1);
                }

                stats.max_chain_length = stats.max_chain_length.max(length);
                let bin = (length - 1).min(stats.chain_length_histogram.len() - 1);
                stats.chain_length_histogram[bin] += 1;
            }
        }

        stats
    }
}
