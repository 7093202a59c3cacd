//! An open-addressed Robin Hood dictionary keyed by opaque byte strings.
//!
//! [`Dictionary<V>`] maps caller-hashed byte keys to values of type `V`.
//! It is the workhorse container of a network-security analyzer, so it is
//! tuned for the access patterns such a system produces: huge numbers of
//! small dictionaries that are created and dropped constantly, occasional
//! very large tables that must keep absorbing inserts while they grow, and
//! traversals that need to survive the table being mutated underneath them.
//!
//! ## Design
//!
//! The table is a single contiguous array of `2^k + k` slots. The first
//! `2^k` positions are buckets; the trailing `k` slots are overflow slack
//! that lets a cluster extend past the last bucket without modular
//! wrap-around, which keeps every probe a plain forward scan.
//!
//! An entry's bucket is the low `k` bits of its hash after Fibonacci
//! mixing (multiplication by 2^64 divided by the golden ratio). The mixing
//! step diffuses the low bits of weak source hashes; callers with already
//! uniform hashes can disable it with the `no-fib-hash` feature.
//!
//! Placement is Robin Hood: an insert that lands on an occupant closer to
//! its own bucket displaces it, and the displaced entry is appended to the
//! end of its own cluster. Deletion is backward-shift, pulling later
//! cluster tails down so no tombstones are ever needed. Together these
//! keep all entries of a bucket contiguous and probe distances short; a
//! probe distance reaching [`TOO_FAR_TO_REACH`] means the table is
//! corrupt and is reported as fatal.
//!
//! Growth never stalls the caller. `size_up` doubles the slot array in
//! place and moves nothing; entries are relocated to their new buckets
//! incrementally, a bounded batch after each subsequent insert, walking a
//! `remap_end` watermark downward until the whole table is under the new
//! hashing. Until then lookups retry under each still-live previous table
//! size. Remapping is suppressed entirely while any iterator is live.
//!
//! Three traversal modes are offered:
//!
//! - [`Dictionary::iter`] borrows the table and is checked by the
//!   compiler: no mutation can happen while it exists.
//! - [`Dictionary::begin_cursor`] returns a detached [`DictCursor`] that
//!   permits interleaved mutation. A structural change (new key inserted
//!   or an entry removed) invalidates every live cursor; the mutating call
//!   reports this through its invalidation flag, or through the
//!   dictionary's [`Reporter`] when no flag was supplied. In-place value
//!   replacement invalidates nothing.
//! - [`Dictionary::make_robust_iter`] returns a [`RobustDictIterator`]
//!   that survives arbitrary inserts, removes, and replacements. Each
//!   robust iterator is registered with the dictionary, which patches its
//!   state on every structural change, using per-iterator shadow lists of
//!   entries that still must be delivered ("inserted") and entries that
//!   would otherwise be seen twice ("visited").

use std::cell::Cell;
use std::fmt;
use std::mem;
use std::rc::Rc;

use cfg_if::cfg_if;
use slotmap::{DefaultKey, SlotMap};

use crate::key::HashKey;
use crate::reporter::{LogReporter, Reporter};

/// Tables with `log2_buckets` at or below this only grow when completely
/// full. With the `k` slack slots that is 20 entries.
const DICT_THRESHOLD_BITS: usize = 4;

/// Load-factor shift for larger tables: grow at `capacity - capacity >> 2`,
/// i.e. 75% full.
const DICT_LOAD_FACTOR_BITS: usize = 2;

/// Upper bound on relocations performed per incremental remap batch.
const DICT_REMAP_ENTRIES: usize = 16;

/// Number of buckets in the probe-distance histogram; the last bucket
/// aggregates everything at or beyond it.
#[cfg(feature = "stats")]
const DICT_NUM_DISTANCES: usize = 5;

/// Hard ceiling on probe distance. A healthy Robin Hood table stays far
/// below this; reaching it indicates corruption or a catastrophically bad
/// hash and is reported as fatal.
pub const TOO_FAR_TO_REACH: u16 = 128;

/// Portion of the caller's hash that participates in bucket selection.
const HASH_MASK: u64 = u64::MAX;

cfg_if! {
    if #[cfg(feature = "no-fib-hash")] {
        #[inline(always)]
        fn mix_hash(h: u64) -> u64 {
            h & HASH_MASK
        }
    } else {
        // 2^64 / phi. Golden-ratio multiplication spreads consecutive
        // inputs maximally far apart in the high and low bits alike.
        #[inline(always)]
        fn mix_hash(h: u64) -> u64 {
            (h & HASH_MASK).wrapping_mul(11400714819323198485)
        }
    }
}

/// Whether a dictionary tracks insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DictOrder {
    /// Insertion order is recorded; [`Dictionary::nth_entry`] works.
    Ordered,
    /// No order tracking; iteration order is implementation-defined.
    Unordered,
}

/// One occupied table slot.
struct DictEntry<V> {
    key: HashKey,
    /// Slot index minus the entry's bucket; the number of Robin Hood
    /// displacements it has absorbed.
    distance: u16,
    value: V,
}

impl<V> DictEntry<V> {
    #[inline]
    fn matches(&self, key: &[u8], hash: u64) -> bool {
        self.key.hash() == hash && self.key.bytes() == key
    }
}

/// Where a failed lookup says the key would have to be inserted.
struct InsertSpot {
    position: usize,
    distance: u16,
}

/// Internal copy-vs-consume distinction for the two insert entry points.
enum KeyArg<'a> {
    Copied(&'a [u8], u64),
    Owned(HashKey),
}

impl KeyArg<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            KeyArg::Copied(bytes, _) => bytes,
            KeyArg::Owned(key) => key.bytes(),
        }
    }

    fn hash(&self) -> u64 {
        match self {
            KeyArg::Copied(_, hash) => *hash,
            KeyArg::Owned(key) => key.hash(),
        }
    }

    fn into_hash_key(self) -> HashKey {
        match self {
            KeyArg::Copied(bytes, hash) => HashKey::with_hash(bytes.into(), hash),
            KeyArg::Owned(key) => key,
        }
    }
}

/// Bookkeeping for one registered robust iterator.
#[derive(Default)]
struct RobustIterState {
    /// Shared with the owning handle's token; once the handle is gone
    /// the strong count falls to one and the state is reaped.
    handle: Rc<()>,
    /// Identity of the most recently delivered entry.
    curr: Option<HashKey>,
    /// Next slot the forward scan will examine. `None` until the first
    /// advance.
    next_slot: Option<usize>,
    /// Entries inserted behind the cursor that still must be delivered.
    inserted: Vec<HashKey>,
    /// Entries the cursor would otherwise deliver twice.
    visited: Vec<HashKey>,
}

/// Handle to a robust iteration in progress.
///
/// Created by [`Dictionary::make_robust_iter`] and stepped with
/// [`Dictionary::robust_next`]. The iteration state itself lives inside
/// the dictionary so that every insert and remove can adjust it; the
/// handle only names it. A handle deregisters itself when the iteration
/// runs off the end, and [`Dictionary::finish_robust`] deregisters one
/// immediately. Dropping a handle abandons the iteration: the
/// dictionary notices the dropped token and reaps the abandoned state
/// before its next mutation or remap batch, so a dropped handle cannot
/// keep remapping suppressed.
#[must_use = "a robust iterator does nothing unless advanced with robust_next"]
pub struct RobustDictIterator {
    key: DefaultKey,
    /// Keeps the paired state's strong count above one while the handle
    /// lives.
    _token: Rc<()>,
    finished: bool,
}

/// Detached forward cursor that tolerates interleaved mutation.
///
/// Created by [`Dictionary::begin_cursor`] and stepped with
/// [`Dictionary::cursor_next`]. Any structural change to the dictionary
/// ends the cursor: the next [`Dictionary::cursor_next`] observes the
/// change and returns `None`. Replacing the value of an existing key is
/// not a structural change. A cursor stops counting as live as soon as
/// it runs off the end, is passed to [`Dictionary::finish_cursor`], or
/// is dropped; its guard decrements the shared count without reaching
/// back into the dictionary.
#[must_use = "a cursor does nothing unless advanced with cursor_next"]
pub struct DictCursor {
    position: usize,
    generation: u64,
    guard: Option<CursorGuard>,
}

/// Decrements the live-cursor count when the cursor goes away, however
/// it goes away.
struct CursorGuard {
    count: Rc<Cell<usize>>,
}

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.count.set(self.count.get().saturating_sub(1));
    }
}

/// A hash dictionary from caller-hashed byte keys to values of type `V`.
///
/// See the [module docs](self) for the design. All operations are
/// synchronous and the type has no internal synchronization; it is meant
/// for single-threaded cooperative use.
///
/// An empty dictionary allocates nothing; the slot array appears on the
/// first insert. Values are owned by the dictionary and dropped on
/// [`clear`](Dictionary::clear) or drop, but a removed value is always
/// handed back to the caller instead of being dropped.
pub struct Dictionary<V> {
    table: Vec<Option<DictEntry<V>>>,
    log2_buckets: usize,
    num_entries: usize,
    cum_entries: u64,
    max_entries: usize,
    /// Key identities in insertion order, when ordering was requested.
    order: Option<Vec<HashKey>>,
    /// Live robust iterations, patched on every structural change.
    robust_iters: SlotMap<DefaultKey, RobustIterState>,
    /// Live detached cursors. Shared with each cursor's guard so a
    /// dropped cursor decrements the count without reaching back into
    /// the dictionary.
    live_cursors: Rc<Cell<usize>>,
    /// Bumped on every structural change; cursors snapshot it.
    generation: u64,
    /// Number of grows whose remapping is still incomplete.
    remaps: usize,
    /// Highest slot index not yet remapped; `None` once remapping is done.
    remap_end: Option<usize>,
    reporter: Box<dyn Reporter>,
}

impl<V> Dictionary<V> {
    /// Creates an empty dictionary. Nothing is allocated until the first
    /// insert.
    pub fn new(ordering: DictOrder) -> Self {
        Dictionary {
            table: Vec::new(),
            log2_buckets: 0,
            num_entries: 0,
            cum_entries: 0,
            max_entries: 0,
            order: match ordering {
                DictOrder::Ordered => Some(Vec::new()),
                DictOrder::Unordered => None,
            },
            robust_iters: SlotMap::new(),
            live_cursors: Rc::new(Cell::new(0)),
            generation: 0,
            remaps: 0,
            remap_end: None,
            reporter: Box::new(LogReporter),
        }
    }

    /// Creates a dictionary pre-sized for roughly `initial_size` entries,
    /// allocating the slot array immediately.
    pub fn with_initial_size(ordering: DictOrder, initial_size: usize) -> Self {
        let mut dict = Self::new(ordering);
        if initial_size > 0 {
            dict.log2_buckets = log2(initial_size);
            dict.init_table();
        }
        dict
    }

    /// Replaces the reporter that receives fatal errors and internal
    /// warnings. The default logs through the `log` crate and panics on
    /// fatal errors.
    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }

    /// Number of entries currently in the dictionary.
    pub fn len(&self) -> usize {
        self.num_entries
    }

    /// Whether the dictionary holds no entries.
    pub fn is_empty(&self) -> bool {
        self.num_entries == 0
    }

    /// Largest entry count the dictionary has ever reached.
    pub fn max_length(&self) -> usize {
        self.max_entries
    }

    /// Total number of distinct-key insertions over the dictionary's
    /// lifetime. Replacing the value of an existing key does not count.
    pub fn num_cumulative_inserts(&self) -> u64 {
        self.cum_entries
    }

    /// Whether insertion order is being tracked.
    pub fn is_ordered(&self) -> bool {
        self.order.is_some()
    }

    /// Total slot count of the current table, zero before the first
    /// insert. Always `2^k + k` once allocated.
    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    fn buckets(&self) -> usize {
        if self.table.is_empty() {
            0
        } else {
            1 << self.log2_buckets
        }
    }

    fn expected_capacity(&self) -> usize {
        (1 << self.log2_buckets) + self.log2_buckets
    }

    fn init_table(&mut self) {
        debug_assert!(self.table.is_empty());
        let capacity = self.expected_capacity();
        self.table.resize_with(capacity, || None);
    }

    /// Entry count beyond which the next insert triggers a grow. Small
    /// tables only grow when full; larger ones at 75%. Either way the
    /// grow happens before the insert that would need the room, so the
    /// current insert always succeeds.
    fn threshold_entries(&self) -> usize {
        let capacity = self.capacity();
        if self.log2_buckets <= DICT_THRESHOLD_BITS {
            capacity
        } else {
            capacity - (capacity >> DICT_LOAD_FACTOR_BITS)
        }
    }

    fn num_iterators(&self) -> usize {
        self.live_cursors.get() + self.robust_iters.len()
    }

    fn have_only_robust_iterators(&self) -> bool {
        self.live_cursors.get() == 0
    }

    ////////////////////////////////////////////////////////////////////
    // Bucket and cluster math

    fn bucket_by_hash(&self, hash: u64, log2_table_size: usize) -> usize {
        if log2_table_size == 0 {
            return 0;
        }
        (mix_hash(hash) & ((1u64 << log2_table_size) - 1)) as usize
    }

    /// The bucket an occupied slot belongs to, recovered from its probe
    /// distance. During an incomplete remap this may be a bucket under a
    /// previous, smaller table size.
    fn bucket_by_position(&self, position: usize) -> usize {
        let entry = self.table[position]
            .as_ref()
            .expect("bucket_by_position on empty slot");
        position - entry.distance as usize
    }

    /// First slot past the cluster that an insert into `bucket` would
    /// append to: the first empty slot, or the first entry belonging to a
    /// later bucket.
    fn end_of_cluster_by_bucket(&self, bucket: usize) -> usize {
        debug_assert!(bucket < self.buckets());
        let mut i = bucket;
        while i < self.capacity() {
            match &self.table[i] {
                Some(entry) if i - entry.distance as usize <= bucket => i += 1,
                _ => break,
            }
        }
        i
    }

    /// First slot of the run of entries sharing `position`'s bucket.
    fn head_of_cluster_by_position(&self, position: usize) -> usize {
        let bucket = self.bucket_by_position(position);
        let mut head = position;
        // While the predecessor still belongs to the same bucket. A head
        // with distance zero sits on its bucket and the loop never runs.
        while head > bucket && self.bucket_by_position(head - 1) == bucket {
            head -= 1;
        }
        head
    }

    /// Last slot of the run of entries sharing `position`'s bucket.
    fn tail_of_cluster_by_position(&self, position: usize) -> usize {
        let bucket = self.bucket_by_position(position);
        let mut i = position;
        while i < self.capacity() {
            match &self.table[i] {
                Some(entry) if i - entry.distance as usize == bucket => i += 1,
                _ => break,
            }
        }
        i - 1
    }

    fn end_of_cluster_by_position(&self, position: usize) -> usize {
        self.tail_of_cluster_by_position(position) + 1
    }

    /// First occupied slot at or after `from`; `capacity()` if none.
    fn scan_occupied(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.capacity() && self.table[i].is_none() {
            i += 1;
        }
        i
    }

    ////////////////////////////////////////////////////////////////////
    // Lookup

    /// Looks up a value by key bytes and caller-computed hash.
    pub fn lookup(&self, key: &[u8], hash: u64) -> Option<&V> {
        let position = self.lookup_index(key, hash)?;
        self.table[position].as_ref().map(|e| &e.value)
    }

    /// [`lookup`](Dictionary::lookup) taking a prebuilt [`HashKey`].
    pub fn lookup_key(&self, key: &HashKey) -> Option<&V> {
        self.lookup(key.bytes(), key.hash())
    }

    /// Mutable lookup. When the entry is found still under a previous
    /// table size and no iteration is in progress, it is relocated to its
    /// current bucket on the way, so the next lookup is direct.
    pub fn lookup_mut(&mut self, key: &[u8], hash: u64) -> Option<&mut V> {
        self.reap_abandoned_iterators();
        let position = self.lookup_index_mut(key, hash)?;
        self.table[position].as_mut().map(|e| &mut e.value)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &[u8], hash: u64) -> bool {
        self.lookup_index(key, hash).is_some()
    }

    /// Search without side effects: the cluster under the current table
    /// size first, then the still-unremapped region under each previous
    /// size.
    fn lookup_index(&self, key: &[u8], hash: u64) -> Option<usize> {
        if self.table.is_empty() {
            return None;
        }
        let bucket = self.bucket_by_hash(hash, self.log2_buckets);
        if let Ok(position) = self.lookup_cluster(key, hash, bucket, self.capacity()) {
            return Some(position);
        }
        self.lookup_in_old_regions(key, hash)
    }

    /// Search that may relocate a hit found under an old table size.
    fn lookup_index_mut(&mut self, key: &[u8], hash: u64) -> Option<usize> {
        if self.table.is_empty() {
            return None;
        }
        let bucket = self.bucket_by_hash(hash, self.log2_buckets);
        if let Ok(position) = self.lookup_cluster(key, hash, bucket, self.capacity()) {
            return Some(position);
        }
        let position = self.lookup_in_old_regions(key, hash)?;
        if self.num_iterators() == 0 {
            if let Some(new_position) = self.remap_one(position) {
                return Some(new_position);
            }
        }
        Some(position)
    }

    /// Scan one cluster for the key. `Ok` is the slot holding it; `Err`
    /// is where the scan stopped, which is where an insert would begin.
    fn lookup_cluster(
        &self,
        key: &[u8],
        hash: u64,
        bucket: usize,
        end: usize,
    ) -> Result<usize, usize> {
        let mut i = bucket;
        while i < end {
            match &self.table[i] {
                None => break,
                Some(entry) => {
                    let b = i - entry.distance as usize;
                    if b > bucket {
                        break;
                    }
                    if b == bucket && entry.matches(key, hash) {
                        return Ok(i);
                    }
                    i += 1;
                }
            }
        }
        Err(i)
    }

    /// Retry the search under each table size that still has unremapped
    /// entries, confined to the not-yet-remapped region.
    fn lookup_in_old_regions(&self, key: &[u8], hash: u64) -> Option<usize> {
        let remap_end = self.remap_end?;
        for i in 1..=self.remaps {
            debug_assert!(i <= self.log2_buckets);
            let prev_bucket = self.bucket_by_hash(hash, self.log2_buckets - i);
            if prev_bucket <= remap_end {
                if let Ok(position) = self.lookup_cluster(key, hash, prev_bucket, remap_end + 1) {
                    return Some(position);
                }
            }
        }
        None
    }

    /// Lookup on the insert path. On a miss, reports where the new entry
    /// goes and at what distance; a distance at the hard ceiling is
    /// fatal.
    fn lookup_or_insert_spot(&mut self, key: &[u8], hash: u64) -> Result<usize, InsertSpot> {
        let bucket = self.bucket_by_hash(hash, self.log2_buckets);
        match self.lookup_cluster(key, hash, bucket, self.capacity()) {
            Ok(position) => Ok(position),
            Err(stop) => {
                if let Some(position) = self.lookup_in_old_regions(key, hash) {
                    if self.num_iterators() == 0 {
                        if let Some(new_position) = self.remap_one(position) {
                            return Ok(new_position);
                        }
                    }
                    return Ok(position);
                }
                let distance = stop - bucket;
                if distance >= TOO_FAR_TO_REACH as usize {
                    self.reporter.fatal(format_args!(
                        "dictionary (size {}) insertion distance too far: {}",
                        self.num_entries, distance
                    ));
                }
                Err(InsertSpot {
                    position: stop,
                    distance: distance as u16,
                })
            }
        }
    }

    ////////////////////////////////////////////////////////////////////
    // Insert

    /// Inserts a value under a key given as bytes plus caller-computed
    /// hash; the bytes are copied into an entry-owned buffer. Returns the
    /// prior value when the key was already present (its entry is updated
    /// in place, which is not a structural change).
    ///
    /// A structural insert while detached cursors are live sets
    /// `*invalidated`; when no flag was supplied an internal warning is
    /// reported instead.
    pub fn insert(
        &mut self,
        key: &[u8],
        hash: u64,
        value: V,
        invalidated: Option<&mut bool>,
    ) -> Option<V> {
        self.do_insert(KeyArg::Copied(key, hash), value, invalidated)
    }

    /// [`insert`](Dictionary::insert) that consumes an owned [`HashKey`]
    /// instead of copying the bytes.
    pub fn insert_key(
        &mut self,
        key: HashKey,
        value: V,
        invalidated: Option<&mut bool>,
    ) -> Option<V> {
        self.do_insert(KeyArg::Owned(key), value, invalidated)
    }

    fn do_insert(
        &mut self,
        key: KeyArg<'_>,
        value: V,
        invalidated: Option<&mut bool>,
    ) -> Option<V> {
        self.reap_abandoned_iterators();

        // Empty dictionaries carry no table at all; materialize it on the
        // first insert.
        if self.table.is_empty() {
            self.init_table();
        }

        let hash = key.hash();
        let prior = match self.lookup_or_insert_spot(key.bytes(), hash) {
            Ok(position) => {
                // Existing key: swap the value in place. The entry's
                // identity is unchanged, so the order log and robust
                // iterator shadow lists need no patching; they track
                // identities and read values through the table.
                let entry = self.table[position].as_mut().expect("occupied lookup hit");
                Some(mem::replace(&mut entry.value, value))
            }
            Err(spot) => {
                if !self.have_only_robust_iterators() {
                    match invalidated {
                        Some(flag) => *flag = true,
                        None => self.reporter.internal_warning(format_args!(
                            "dictionary insert of a new key possibly invalidated live cursors"
                        )),
                    }
                }
                self.generation = self.generation.wrapping_add(1);

                let entry = DictEntry {
                    key: key.into_hash_key(),
                    distance: spot.distance,
                    value,
                };
                let identity = entry.key.clone();
                let insert_position = spot.position;
                let last_affected_position = self.insert_and_relocate(entry, insert_position);

                // If the displacement chain crossed the remap watermark,
                // an old-hash entry may have been pushed past it; extend
                // the watermark to cover the whole changed range.
                if let Some(remap_end) = self.remap_end {
                    if insert_position <= remap_end && remap_end < last_affected_position {
                        self.remap_end = Some(last_affected_position);
                    }
                }

                self.adjust_iterators_on_insert(
                    &identity,
                    insert_position,
                    last_affected_position,
                );

                if let Some(order) = self.order.as_mut() {
                    order.push(identity);
                }

                self.num_entries += 1;
                self.cum_entries += 1;
                if self.max_entries < self.num_entries {
                    self.max_entries = self.num_entries;
                }
                if self.num_entries > self.threshold_entries() {
                    self.size_up();
                }
                None
            }
        };

        // Shorten the mixed-table period whenever it is safe to do so.
        if self.remapping() {
            self.remap();
        }
        prior
    }

    /// Places `entry` at `position`, displacing occupants Robin Hood
    /// style: each displaced entry is appended to the end of its own
    /// cluster and the walk continues from there. Returns the final slot
    /// the chain touched. A walk that runs off the end of the table grows
    /// it mid-insert; the first slot of the extension is then free by
    /// construction.
    fn insert_and_relocate(&mut self, mut entry: DictEntry<V>, mut position: usize) -> usize {
        loop {
            if position >= self.capacity() {
                debug_assert_eq!(position, self.capacity());
                self.size_up();
                self.table[position] = Some(entry);
                return position;
            }
            if self.table[position].is_none() {
                self.table[position] = Some(entry);
                return position;
            }
            let next = self.end_of_cluster_by_position(position);
            let mut displaced = self.table[position].take().expect("occupied slot");
            displaced.distance += (next - position) as u16;
            self.table[position] = Some(entry);
            entry = displaced;
            position = next;
        }
    }

    /// Doubles the table in place. No entry moves here; the new tail is
    /// empty and relocation happens incrementally afterwards. The
    /// watermark starts at the old capacity so it also covers an entry
    /// just placed there by a mid-insert grow.
    fn size_up(&mut self) {
        let prev_capacity = self.capacity();
        self.log2_buckets += 1;
        let capacity = self.expected_capacity();
        self.table.resize_with(capacity, || None);
        self.remap_end = Some(prev_capacity);
        self.remaps += 1;
        // Grows are one-directional, so there can never be more pending
        // remaps than doublings.
        debug_assert!(self.remaps <= self.log2_buckets);
    }

    ////////////////////////////////////////////////////////////////////
    // Remove

    /// Removes a key and returns its value. The value is always handed
    /// back, never dropped here; dropping values in bulk is what
    /// [`clear`](Dictionary::clear) does.
    ///
    /// A successful remove while detached cursors are live sets
    /// `*invalidated`, or reports an internal warning when no flag was
    /// supplied.
    pub fn remove(
        &mut self,
        key: &[u8],
        hash: u64,
        invalidated: Option<&mut bool>,
    ) -> Option<V> {
        self.reap_abandoned_iterators();

        let position = self.lookup_index_mut(key, hash)?;

        if !self.have_only_robust_iterators() {
            match invalidated {
                Some(flag) => *flag = true,
                None => self.reporter.internal_warning(format_args!(
                    "dictionary remove possibly invalidated live cursors"
                )),
            }
        }
        self.generation = self.generation.wrapping_add(1);

        let entry = self.remove_relocate_and_adjust(position);
        self.num_entries -= 1;

        if let Some(order) = self.order.as_mut() {
            if let Some(idx) = order.iter().position(|k| *k == entry.key) {
                order.remove(idx);
            }
        }

        Some(entry.value)
    }

    /// [`remove`](Dictionary::remove) taking a prebuilt [`HashKey`].
    pub fn remove_key(&mut self, key: &HashKey, invalidated: Option<&mut bool>) -> Option<V> {
        self.remove(key.bytes(), key.hash(), invalidated)
    }

    fn remove_relocate_and_adjust(&mut self, position: usize) -> DictEntry<V> {
        let (entry, last_affected_position) = self.remove_and_relocate(position);
        self.adjust_iterators_on_remove(&entry.key, position, last_affected_position);
        entry
    }

    /// Backward-shift deletion: the freed slot is repeatedly refilled
    /// with the tail of the following cluster, each move improving that
    /// entry's distance, until the next slot is empty, is a cluster head,
    /// or the table ends. Returns the removed entry and the slot that
    /// ended up empty.
    fn remove_and_relocate(&mut self, mut position: usize) -> (DictEntry<V>, usize) {
        let entry = self.table[position].take().expect("remove of empty slot");
        loop {
            let stop = position + 1 >= self.capacity()
                || match &self.table[position + 1] {
                    None => true,
                    Some(next) => next.distance == 0,
                };
            if stop {
                return (entry, position);
            }
            let next = self.tail_of_cluster_by_position(position + 1);
            let mut moved = self.table[next].take().expect("cluster tail occupied");
            moved.distance -= (next - position) as u16;
            self.table[position] = Some(moved);
            position = next;
        }
    }

    ////////////////////////////////////////////////////////////////////
    // Incremental remap

    fn remapping(&self) -> bool {
        self.remap_end.is_some()
    }

    /// Relocates a bounded batch of entries to their buckets under the
    /// current table size, walking the watermark downward. Never runs
    /// while any iterator is live; iteration state cannot follow entries
    /// that remapping moves around.
    fn remap(&mut self) {
        self.reap_abandoned_iterators();
        if self.num_iterators() > 0 {
            return;
        }
        let mut left = DICT_REMAP_ENTRIES;
        while left > 0 {
            let Some(remap_end) = self.remap_end else {
                break;
            };
            // A successful relocation may have raised the watermark again
            // through a mid-insert grow, so only step down when the slot
            // is empty or already in place.
            if self.table[remap_end].is_some() && self.remap_one(remap_end).is_some() {
                left -= 1;
            } else {
                self.remap_end = remap_end.checked_sub(1);
            }
        }
        if self.remap_end.is_none() {
            self.remaps = 0;
        }
    }

    /// Moves the entry at `position` to its bucket under the current
    /// hashing, if it is not there already. Returns the new position, or
    /// `None` when the entry was already in place. Half of all old
    /// entries stay put after a doubling; the mixing step sends the rest
    /// to the new half.
    fn remap_one(&mut self, position: usize) -> Option<usize> {
        let entry = self.table[position].as_ref().expect("remap of empty slot");
        let current = self.bucket_by_position(position);
        let expected = self.bucket_by_hash(entry.key.hash(), self.log2_buckets);
        if current == expected {
            return None;
        }
        let (mut entry, _) = self.remove_and_relocate(position);
        let insert_position = self.end_of_cluster_by_bucket(expected);
        entry.distance = (insert_position - expected) as u16;
        self.insert_and_relocate(entry, insert_position);
        Some(insert_position)
    }

    ////////////////////////////////////////////////////////////////////
    // Insertion order

    /// Value of the `n`-th entry in insertion order. `None` for
    /// unordered dictionaries and out-of-range indices.
    pub fn nth_entry(&self, n: usize) -> Option<&V> {
        self.nth_entry_with_key(n).map(|(_, value)| value)
    }

    /// [`nth_entry`](Dictionary::nth_entry) returning the key bytes as
    /// well.
    pub fn nth_entry_with_key(&self, n: usize) -> Option<(&[u8], &V)> {
        let order = self.order.as_ref()?;
        let identity = order.get(n)?;
        let position = self.lookup_index(identity.bytes(), identity.hash())?;
        let entry = self.table[position].as_ref()?;
        Some((entry.key.bytes(), &entry.value))
    }

    ////////////////////////////////////////////////////////////////////
    // Clear

    /// Drops every entry, including the values, and releases the table.
    /// Counters other than [`max_length`](Dictionary::max_length) and
    /// [`num_cumulative_inserts`](Dictionary::num_cumulative_inserts)
    /// reset; live cursors and robust iterations end.
    pub fn clear(&mut self) {
        self.table = Vec::new();
        if let Some(order) = self.order.as_mut() {
            order.clear();
        }
        self.robust_iters.clear();
        // Outstanding cursor guards keep decrementing the old counter;
        // a fresh one keeps them from undercounting cursors begun later.
        self.live_cursors = Rc::new(Cell::new(0));
        self.generation = self.generation.wrapping_add(1);
        self.log2_buckets = 0;
        self.num_entries = 0;
        self.remaps = 0;
        self.remap_end = None;
    }

    ////////////////////////////////////////////////////////////////////
    // Lightweight iteration

    /// Iterates over `(key_bytes, value)` pairs in slot order. Borrowing
    /// the dictionary rules out mutation for the iterator's lifetime.
    pub fn iter(&self) -> Iter<'_, V> {
        Iter {
            table: &self.table,
            position: 0,
        }
    }

    /// Begins a detached cursor. The cursor count suppresses incremental
    /// remapping until every cursor is finished or dropped.
    pub fn begin_cursor(&self) -> DictCursor {
        self.live_cursors.set(self.live_cursors.get() + 1);
        DictCursor {
            position: 0,
            generation: self.generation,
            guard: Some(CursorGuard {
                count: Rc::clone(&self.live_cursors),
            }),
        }
    }

    /// Advances a cursor, returning the next entry in slot order. Returns
    /// `None`, and releases the cursor, at the end of the table or as
    /// soon as a structural change has invalidated the cursor.
    pub fn cursor_next<'a>(&'a self, cursor: &mut DictCursor) -> Option<(&'a [u8], &'a V)> {
        if cursor.guard.is_none() {
            return None;
        }
        if cursor.generation != self.generation {
            cursor.guard = None;
            return None;
        }
        while cursor.position < self.capacity() {
            let slot = &self.table[cursor.position];
            cursor.position += 1;
            if let Some(entry) = slot {
                return Some((entry.key.bytes(), &entry.value));
            }
        }
        cursor.guard = None;
        None
    }

    /// Releases a cursor that is no longer needed. Equivalent to
    /// dropping it; harmless on cursors that already ran off the end.
    pub fn finish_cursor(&self, cursor: &mut DictCursor) {
        cursor.guard = None;
    }

    ////////////////////////////////////////////////////////////////////
    // Robust iteration

    /// Registers and returns a robust iterator. Unlike a cursor it
    /// survives arbitrary structural changes: every insert and remove
    /// patches the registered state so the traversal still delivers each
    /// surviving entry exactly once.
    pub fn make_robust_iter(&mut self) -> RobustDictIterator {
        self.reap_abandoned_iterators();
        let token = Rc::new(());
        let key = self.robust_iters.insert(RobustIterState {
            handle: Rc::clone(&token),
            ..RobustIterState::default()
        });
        RobustDictIterator {
            key,
            _token: token,
            finished: false,
        }
    }

    /// Drops registry state whose handle is gone. A dropped handle
    /// cannot deregister itself, so abandoned iterations are collected
    /// here before mutations or remap batches consult the registry.
    fn reap_abandoned_iterators(&mut self) {
        self.robust_iters
            .retain(|_, state| Rc::strong_count(&state.handle) > 1);
    }

    /// Advances a robust iteration, returning the next entry. Entries
    /// inserted behind the cursor are delivered first, newest first; the
    /// delivery order overall is unspecified. Returns `None` once every
    /// entry has been delivered, at which point the iterator is
    /// deregistered.
    pub fn robust_next<'a>(
        &'a mut self,
        iter: &mut RobustDictIterator,
    ) -> Option<(&'a [u8], &'a V)> {
        if iter.finished {
            return None;
        }
        // Swap the state out so the traversal below can borrow the table
        // freely; nothing re-enters the registry while it is out.
        let mut state = match self.robust_iters.get_mut(iter.key) {
            Some(slot) => mem::take(slot),
            None => {
                // The dictionary was cleared out from under the handle.
                iter.finished = true;
                return None;
            }
        };
        let position = self.advance_robust(&mut state);
        *self.robust_iters.get_mut(iter.key).expect("registered iterator") = state;

        match position {
            Some(position) => {
                let entry = self.table[position].as_ref().expect("occupied slot");
                Some((entry.key.bytes(), &entry.value))
            }
            None => {
                self.complete_robust(iter);
                None
            }
        }
    }

    /// Re-resolves the entry most recently delivered to `iter`. Reads go
    /// through the table, so an in-place value replacement is observed
    /// here. `None` before the first advance and after the end.
    pub fn robust_current<'a>(&'a self, iter: &RobustDictIterator) -> Option<(&'a [u8], &'a V)> {
        if iter.finished {
            return None;
        }
        let state = self.robust_iters.get(iter.key)?;
        let curr = state.curr.as_ref()?;
        let position = self.lookup_index(curr.bytes(), curr.hash())?;
        let entry = self.table[position].as_ref()?;
        Some((entry.key.bytes(), &entry.value))
    }

    /// Ends a robust iteration early, deregistering it immediately so
    /// remapping can resume. Dropping the handle instead has the same
    /// effect at the dictionary's next mutation or remap batch.
    pub fn finish_robust(&mut self, mut iter: RobustDictIterator) {
        self.complete_robust(&mut iter);
    }

    fn complete_robust(&mut self, iter: &mut RobustDictIterator) {
        if !iter.finished {
            self.robust_iters.remove(iter.key);
            iter.finished = true;
        }
    }

    /// Core of the robust traversal. Returns the slot of the entry to
    /// deliver and records its identity as current, or `None` at the end.
    fn advance_robust(&self, state: &mut RobustIterState) -> Option<usize> {
        if self.table.is_empty() {
            state.curr = None;
            return None;
        }

        // Deliver pending insertions first, newest first; popping from
        // the tail keeps the list cheap to maintain.
        while let Some(identity) = state.inserted.pop() {
            if let Some(position) = self.lookup_index(identity.bytes(), identity.hash()) {
                state.curr = Some(identity);
                return Some(position);
            }
            // Stale identity; removals normally purge these, so simply
            // skip it.
            debug_assert!(false, "stale entry in inserted list");
        }

        let mut next = match state.next_slot {
            None => self.scan_occupied(0),
            Some(next) => next,
        };

        // A saved slot can go empty when the table grew underneath the
        // scan and the slot now sits in the extension. Entries placed or
        // displaced past it are still ahead of the cursor, so plain
        // re-advancing stays correct.
        if next < self.capacity() && self.table[next].is_none() {
            next = self.scan_occupied(next);
        }

        // Filter entries the cursor has effectively seen already.
        while next < self.capacity() {
            let entry = self.table[next].as_ref().expect("scan lands on occupied");
            match state.visited.iter().position(|k| *k == entry.key) {
                Some(idx) => {
                    state.visited.remove(idx);
                    next = self.scan_occupied(next + 1);
                }
                None => break,
            }
        }

        if next >= self.capacity() {
            state.next_slot = Some(next);
            state.curr = None;
            return None;
        }

        let entry = self.table[next].as_ref().expect("occupied slot");
        state.curr = Some(entry.key.clone());
        state.next_slot = Some(self.scan_occupied(next + 1));
        Some(next)
    }

    fn adjust_iterators_on_insert(
        &mut self,
        entry_key: &HashKey,
        insert_position: usize,
        last_affected_position: usize,
    ) {
        if self.robust_iters.is_empty() {
            return;
        }
        let mut iters = mem::take(&mut self.robust_iters);
        for state in iters.values_mut() {
            self.adjust_on_insert(state, entry_key, insert_position, last_affected_position);
        }
        self.robust_iters = iters;
    }

    fn adjust_on_insert(
        &self,
        state: &mut RobustIterState,
        entry_key: &HashKey,
        insert_position: usize,
        last_affected_position: usize,
    ) {
        state.inserted.retain(|k| k != entry_key);
        state.visited.retain(|k| k != entry_key);

        let Some(next) = state.next_slot else {
            return;
        };
        if insert_position < next {
            // The cursor has already passed the slot; queue the entry so
            // it is still delivered.
            state.inserted.push(entry_key.clone());
            if next <= last_affected_position {
                // The displacement chain straddled the cursor, so the
                // entry now under it may come around a second time.
                let tail = self.tail_of_cluster_by_position(next);
                let shadow = self.table[tail].as_ref().expect("occupied tail");
                state.visited.push(shadow.key.clone());
            }
        }
    }

    fn adjust_iterators_on_remove(
        &mut self,
        entry_key: &HashKey,
        position: usize,
        last_affected_position: usize,
    ) {
        if self.robust_iters.is_empty() {
            return;
        }
        let mut iters = mem::take(&mut self.robust_iters);
        for state in iters.values_mut() {
            self.adjust_on_remove(state, entry_key, position, last_affected_position);
        }
        self.robust_iters = iters;
    }

    fn adjust_on_remove(
        &self,
        state: &mut RobustIterState,
        entry_key: &HashKey,
        position: usize,
        last_affected_position: usize,
    ) {
        state.inserted.retain(|k| k != entry_key);
        state.visited.retain(|k| k != entry_key);

        if let Some(next) = state.next_slot {
            if position < next && next <= last_affected_position {
                // The backward shift pulled an entry from under the
                // cursor to below it; queue it or it would be skipped.
                // If the entry carries a shadow it had already been
                // delivered (or is queued), so consume the shadow
                // instead of delivering it a second time.
                let mut moved = self.head_of_cluster_by_position(next - 1);
                if moved < position {
                    moved = position;
                }
                let pulled = self.table[moved].as_ref().expect("shifted slot occupied");
                match state.visited.iter().position(|k| *k == pulled.key) {
                    Some(idx) => {
                        state.visited.remove(idx);
                    }
                    None => state.inserted.push(pulled.key.clone()),
                }
            }

            if next < self.capacity() && self.table[next].is_none() {
                state.next_slot = Some(self.scan_occupied(next));
            }
        }

        if state.curr.as_ref() == Some(entry_key) {
            state.curr = match state.next_slot {
                Some(next) if next < self.capacity() => {
                    self.table[next].as_ref().map(|e| e.key.clone())
                }
                _ => None,
            };
        }
    }

    ////////////////////////////////////////////////////////////////////
    // Validation and statistics

    /// Checks the structural invariants of the table: the entry count,
    /// the order log, probe distances, and the clustering relations
    /// between adjacent slots. Panics on the first violation. Intended
    /// for tests.
    #[doc(hidden)]
    pub fn assert_valid(&self) {
        let occupied = self.table.iter().filter(|slot| slot.is_some()).count();
        assert_eq!(occupied, self.num_entries, "entry count mismatch");
        if let Some(order) = self.order.as_ref() {
            assert_eq!(order.len(), self.num_entries, "order log length mismatch");
        }

        for i in 0..self.capacity() {
            let Some(entry) = &self.table[i] else {
                continue;
            };
            assert!(
                entry.distance < TOO_FAR_TO_REACH,
                "probe distance {} at slot {} beyond ceiling",
                entry.distance,
                i
            );
            assert!(i >= entry.distance as usize, "distance reaches before slot 0");

            if i == 0 || self.table[i - 1].is_none() {
                assert_eq!(entry.distance, 0, "cluster head at {} not on its bucket", i);
            } else {
                let prev = self.table[i - 1].as_ref().unwrap();
                let bucket = i - entry.distance as usize;
                let prev_bucket = (i - 1) - prev.distance as usize;
                assert!(bucket >= prev_bucket, "bucket order violated at slot {}", i);
                if bucket == prev_bucket {
                    assert_eq!(
                        entry.distance,
                        prev.distance + 1,
                        "distance not consecutive within bucket at slot {}",
                        i
                    );
                } else {
                    assert!(
                        entry.distance <= prev.distance,
                        "robin hood balance violated at slot {}",
                        i
                    );
                }
            }
        }
    }

    /// Probe-distance statistics over the current table.
    #[cfg(feature = "stats")]
    pub fn distance_stats(&self) -> DistanceStats {
        let mut stats = DistanceStats {
            entries: self.num_entries,
            max_distance: 0,
            histogram: [0; DICT_NUM_DISTANCES],
        };
        for slot in &self.table {
            let Some(entry) = slot else { continue };
            stats.max_distance = stats.max_distance.max(entry.distance);
            let bucket = (entry.distance as usize).min(DICT_NUM_DISTANCES - 1);
            stats.histogram[bucket] += 1;
        }
        stats
    }

    /// Prints one line per slot: position, bucket, distance, and hash.
    /// Slots still awaiting remap are starred.
    #[cfg(feature = "stats")]
    pub fn dump(&self) {
        println!(
            "capacity {} entries {} (max {}) log2_buckets {} remaps {} remap_end {:?}",
            self.capacity(),
            self.num_entries,
            self.max_entries,
            self.log2_buckets,
            self.remaps,
            self.remap_end,
        );
        for i in 0..self.capacity() {
            match &self.table[i] {
                None => println!("{:>8}", i),
                Some(entry) => println!(
                    "{:>8} {} bucket {:>8} distance {:>3} hash {:#018x} key_size {}",
                    i,
                    if self.remap_end.is_some_and(|re| i <= re) {
                        "*"
                    } else {
                        " "
                    },
                    self.bucket_by_position(i),
                    entry.distance,
                    entry.key.hash(),
                    entry.key.len(),
                ),
            }
        }
    }
}

impl<V> Default for Dictionary<V> {
    fn default() -> Self {
        Self::new(DictOrder::Unordered)
    }
}

impl<V> fmt::Debug for Dictionary<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("len", &self.num_entries)
            .field("capacity", &self.capacity())
            .field("log2_buckets", &self.log2_buckets)
            .field("ordered", &self.is_ordered())
            .field("remaps", &self.remaps)
            .field("remap_end", &self.remap_end)
            .field("iterators", &self.num_iterators())
            .finish()
    }
}

/// Probe-distance summary returned by [`Dictionary::distance_stats`].
#[cfg(feature = "stats")]
#[derive(Debug, Clone)]
pub struct DistanceStats {
    /// Number of entries measured.
    pub entries: usize,
    /// Largest probe distance in the table.
    pub max_distance: u16,
    /// Entry counts by probe distance; the last bucket aggregates all
    /// larger distances.
    pub histogram: [usize; DICT_NUM_DISTANCES],
}

#[cfg(feature = "stats")]
impl DistanceStats {
    /// Pretty-prints the histogram.
    pub fn print(&self) {
        println!(
            "{} entries, max probe distance {}",
            self.entries, self.max_distance
        );
        if self.entries == 0 {
            return;
        }
        for (distance, &count) in self.histogram.iter().enumerate() {
            let label = if distance == DICT_NUM_DISTANCES - 1 {
                format!("{}+", distance)
            } else {
                format!("{}", distance)
            };
            println!(
                "[{:>2}] {:>3}% ({})",
                label,
                100 * count / self.entries,
                count
            );
        }
    }
}

/// Borrowing iterator over `(key_bytes, value)` pairs in slot order.
///
/// Created by [`Dictionary::iter`].
pub struct Iter<'a, V> {
    table: &'a [Option<DictEntry<V>>],
    position: usize,
}

impl<'a, V> Iterator for Iter<'a, V> {
    type Item = (&'a [u8], &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.table.len() {
            let slot = &self.table[self.position];
            self.position += 1;
            if let Some(entry) = slot {
                return Some((entry.key.bytes(), &entry.value));
            }
        }
        None
    }
}

impl<'a, V> IntoIterator for &'a Dictionary<V> {
    type Item = (&'a [u8], &'a V);
    type IntoIter = Iter<'a, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn log2(num: usize) -> usize {
    if num == 0 {
        0
    } else {
        num.ilog2() as usize
    }
}
