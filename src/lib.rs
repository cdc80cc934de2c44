/* SPDX-License-Identifier: MPL-2.0 */
/*! Merge sparse key->count streams into a dense table.
 *
 * The streams are fed one file at a time into a [CountTable], an open addressing hash
 * table (FNV-1a, linear probing, load factor at most 1/2) whose values are count vectors
 * indexed by 1-based file ordinal. Keys absent from a file read as zero at that ordinal.
 */
use std::collections::TryReserveError;
use std::hash::{BuildHasher, Hasher};
use std::iter::FusedIterator;
use thiserror::Error;

pub mod pipeline;
pub mod util;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("table capacity would overflow")]
    Overflow,
    #[error("key not found")]
    NotFound,
    #[error("file ordinal {ordinal} is outside 1..={total}")]
    InvalidOrdinal { ordinal: usize, total: usize },
}

impl From<TryReserveError> for TableError {
    fn from(_: TryReserveError) -> Self {
        TableError::OutOfMemory
    }
}

/* ---------------------------------------------------------------------------- */

pub const FNV_OFFSET: u64 = 14695981039346656037;
pub const FNV_PRIME: u64 = 1099511628211;

/** 64-bit FNV-1a over raw bytes. Only used to pick slots; not collision resistant. */
#[inline]
pub fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/** Streaming form of [fnv1a]. Writing the bytes of a key in one or several pieces
 * produces the same value as `fnv1a` on their concatenation.
 *
 * Note that `str`'s `Hash` impl appends a terminator byte, so `HashMap<String, _, FnvBuildHasher>`
 * does not place keys where [CountTable] would. */
#[derive(Debug, Clone, Copy)]
pub struct FnvHasher(u64);

impl Default for FnvHasher {
    fn default() -> Self {
        FnvHasher(FNV_OFFSET)
    }
}

impl Hasher for FnvHasher {
    fn finish(&self) -> u64 {
        self.0
    }
    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 ^= *b as u64;
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FnvBuildHasher;

impl BuildHasher for FnvBuildHasher {
    type Hasher = FnvHasher;
    fn build_hasher(&self) -> FnvHasher {
        FnvHasher::default()
    }
}

#[test]
fn test_fnv1a_vectors() {
    assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
    assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
    assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);

    let mut h = FnvBuildHasher.build_hasher();
    h.write(b"foo");
    h.write(b"bar");
    assert_eq!(h.finish(), fnv1a(b"foobar"));
}

/* ---------------------------------------------------------------------------- */

/** Counts for one key; index `i` holds the value seen in file ordinal `i + 1`.
 *
 * The length is tracked by the vector itself. Zero is an ordinary value, so nothing
 * may be inferred from the position of zeros. */
#[derive(Debug, Clone, PartialEq, Eq)]
struct CountVec {
    counts: Vec<u64>,
}

impl CountVec {
    /** Counts for a key first seen at `ordinal`: zeros for every earlier file. */
    fn fresh(ordinal: usize, value: u64) -> Result<CountVec, TableError> {
        debug_assert!(ordinal >= 1);
        let mut counts = Vec::new();
        counts.try_reserve_exact(ordinal)?;
        counts.resize(ordinal - 1, 0);
        counts.push(value);
        Ok(CountVec { counts })
    }
    /** Store `value` at `ordinal`, zero-filling any ordinals skipped since the last one
     * recorded. A second value for the same ordinal replaces the first. */
    fn record(&mut self, ordinal: usize, value: u64) -> Result<(), TableError> {
        debug_assert!(ordinal >= 1);
        if ordinal > self.counts.len() {
            // amortized growth
            self.counts.try_reserve(ordinal - self.counts.len())?;
            self.counts.resize(ordinal, 0);
        }
        self.counts[ordinal - 1] = value;
        Ok(())
    }
    /** Append zeros up to `len`; never truncates. */
    fn pad_to(&mut self, len: usize) -> Result<(), TableError> {
        if len > self.counts.len() {
            self.counts.try_reserve_exact(len - self.counts.len())?;
            self.counts.resize(len, 0);
        }
        Ok(())
    }
    fn as_slice(&self) -> &[u64] {
        &self.counts
    }
}

#[test]
fn test_count_vec_zero_fill() {
    let mut c = CountVec::fresh(3, 4).unwrap();
    assert_eq!(c.as_slice(), &[0, 0, 4]);
    c.record(3, 6).unwrap();
    assert_eq!(c.as_slice(), &[0, 0, 6]);
    c.record(6, 0).unwrap();
    assert_eq!(c.as_slice(), &[0, 0, 6, 0, 0, 0]);
    c.record(4, 1).unwrap();
    assert_eq!(c.as_slice(), &[0, 0, 6, 1, 0, 0]);
    c.pad_to(2).unwrap();
    assert_eq!(c.as_slice().len(), 6);
    c.pad_to(8).unwrap();
    assert_eq!(c.as_slice(), &[0, 0, 6, 1, 0, 0, 0, 0]);
}

/* ---------------------------------------------------------------------------- */

const INITIAL_CAPACITY: usize = 16;

#[derive(Debug)]
struct Entry {
    key: String,
    counts: CountVec,
}

#[inline]
fn home_slot(key: &str, mask: usize) -> usize {
    (fnv1a(key.as_bytes()) & mask as u64) as usize
}

/** Linear probe from the home slot of `key`, wrapping around. Returns the index of the
 * slot holding `key`, or of the first empty slot on the way. At least one slot must be empty. */
fn probe(slots: &[Option<Entry>], key: &str) -> usize {
    let mask = slots.len() - 1;
    let mut index = home_slot(key, mask);
    loop {
        match &slots[index] {
            Some(entry) if entry.key != key => index = (index + 1) & mask,
            _ => return index,
        }
    }
}

/** An all-empty slot array. `capacity` must be a power of two. */
fn alloc_slots(capacity: usize) -> Result<Vec<Option<Entry>>, TableError> {
    debug_assert!(capacity.is_power_of_two());
    let bytes = capacity.checked_mul(std::mem::size_of::<Option<Entry>>());
    if bytes.map_or(true, |b| b > isize::MAX as usize) {
        return Err(TableError::Overflow);
    }
    let mut slots = Vec::new();
    slots.try_reserve_exact(capacity)?;
    slots.resize_with(capacity, || None);
    Ok(slots)
}

/** Open addressing table from string keys to per-file count vectors.
 *
 * Feed it with [CountTable::set] file by file in increasing ordinal order, call
 * [CountTable::finalize] once all files are in, then read it back with [CountTable::iter].
 * After `finalize(n)` every key has exactly `n` counts.
 *
 * The capacity is a power of two and at most half the slots are in use after any insert;
 * the table doubles before an insert that would break this. Nothing is ever removed, so
 * probing needs no tombstones. */
#[derive(Debug)]
pub struct CountTable {
    slots: Vec<Option<Entry>>,
    occupied: usize,
}

impl CountTable {
    pub fn new() -> Result<CountTable, TableError> {
        Self::with_capacity(INITIAL_CAPACITY)
    }
    /** Table with at least `capacity` slots (rounded up to a power of two, minimum 16).
     * Note that only half of them can be filled before the table grows. */
    pub fn with_capacity(capacity: usize) -> Result<CountTable, TableError> {
        let capacity = capacity
            .max(INITIAL_CAPACITY)
            .checked_next_power_of_two()
            .ok_or(TableError::Overflow)?;
        Ok(CountTable {
            slots: alloc_slots(capacity)?,
            occupied: 0,
        })
    }
    /** Number of distinct keys */
    pub fn len(&self) -> usize {
        self.occupied
    }
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
    /** Number of slots in the backing array */
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /** Record `value` for `key` in file `file_ordinal` (1-based) out of `total_files`.
     *
     * An existing key has its counts extended to `file_ordinal` entries, zero-filling the
     * files it skipped; a new key gets zeros for every earlier file. Returns the stored copy
     * of the key. On error the table is left as it was, apart from possibly having grown. */
    pub fn set(
        &mut self,
        key: &str,
        value: u64,
        file_ordinal: usize,
        total_files: usize,
    ) -> Result<&str, TableError> {
        if file_ordinal == 0 || file_ordinal > total_files {
            return Err(TableError::InvalidOrdinal {
                ordinal: file_ordinal,
                total: total_files,
            });
        }
        if self.occupied >= self.slots.len() / 2 {
            self.grow()?;
        }

        let index = probe(&self.slots, key);
        let slot = &mut self.slots[index];
        let entry = match slot {
            Some(entry) => {
                entry.counts.record(file_ordinal, value)?;
                entry
            }
            None => {
                let counts = CountVec::fresh(file_ordinal, value)?;
                let mut owned = String::new();
                owned.try_reserve_exact(key.len())?;
                owned.push_str(key);
                self.occupied += 1;
                slot.insert(Entry { key: owned, counts })
            }
        };
        Ok(entry.key.as_str())
    }

    /** Counts recorded so far for `key` */
    pub fn get(&self, key: &str) -> Result<&[u64], TableError> {
        match &self.slots[probe(&self.slots, key)] {
            Some(entry) => Ok(entry.counts.as_slice()),
            None => Err(TableError::NotFound),
        }
    }
    pub fn contains_key(&self, key: &str) -> bool {
        self.slots[probe(&self.slots, key)].is_some()
    }

    /** Pad every count vector with trailing zeros to `total_files` entries, covering keys
     * missing from the last file(s). Calling it again with the same value changes nothing. */
    pub fn finalize(&mut self, total_files: usize) -> Result<(), TableError> {
        for entry in self.slots.iter_mut().flatten() {
            entry.counts.pad_to(total_files)?;
        }
        Ok(())
    }

    /** All `(key, counts)` pairs, in slot order. */
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            slots: self.slots.iter(),
            remaining: self.occupied,
        }
    }

    /** Double the slot array and move every entry to its slot in the new array. Keys and
     * counts are moved, not copied. On failure the table is unchanged. */
    fn grow(&mut self) -> Result<(), TableError> {
        let new_capacity = self
            .slots
            .len()
            .checked_mul(2)
            .ok_or(TableError::Overflow)?;
        let new_slots = alloc_slots(new_capacity)?;
        let old_slots = std::mem::replace(&mut self.slots, new_slots);
        for entry in old_slots.into_iter().flatten() {
            let index = probe(&self.slots, &entry.key);
            self.slots[index] = Some(entry);
        }
        Ok(())
    }

    /** Worst-case number of slots a successful lookup inspects (1 if every key sits in its
     * home slot, 0 for an empty table). */
    pub fn longest_probe(&self) -> usize {
        let mask = self.slots.len() - 1;
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let entry = slot.as_ref()?;
                Some((i.wrapping_sub(home_slot(&entry.key, mask)) & mask) + 1)
            })
            .max()
            .unwrap_or(0)
    }
    /* Total memory usage estimate (_including_ the size of this structure). This is
     * the _ideal_ space estimate, excluding spare capacity from allocations. */
    pub fn total_memory_usage(&self) -> usize {
        let mut space = std::mem::size_of::<Self>();
        space += self.slots.len() * std::mem::size_of::<Option<Entry>>();
        for entry in self.slots.iter().flatten() {
            space += entry.key.len();
            space += entry.counts.as_slice().len() * std::mem::size_of::<u64>();
        }
        space
    }
}

/** Iterator over the `(key, counts)` pairs of a [CountTable], in slot order. */
pub struct Iter<'a> {
    slots: std::slice::Iter<'a, Option<Entry>>,
    remaining: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (&'a str, &'a [u64]);

    fn next(&mut self) -> Option<Self::Item> {
        for slot in self.slots.by_ref() {
            if let Some(entry) = slot {
                self.remaining -= 1;
                return Some((entry.key.as_str(), entry.counts.as_slice()));
            }
        }
        None
    }
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for Iter<'_> {}
impl FusedIterator for Iter<'_> {}

impl<'a> IntoIterator for &'a CountTable {
    type Item = (&'a str, &'a [u64]);
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

#[cfg(test)]
fn sorted_rows(table: &CountTable) -> Vec<(String, Vec<u64>)> {
    use itertools::Itertools;
    table
        .iter()
        .map(|(k, c)| (k.to_string(), c.to_vec()))
        .sorted()
        .collect()
}

#[test]
fn test_two_file_merge() {
    let mut t = CountTable::new().unwrap();
    assert_eq!(t.set("x", 5, 1, 2).unwrap(), "x");
    assert_eq!(t.set("y", 2, 1, 2).unwrap(), "y");
    t.set("y", 9, 2, 2).unwrap();
    t.finalize(2).unwrap();
    assert_eq!(
        sorted_rows(&t),
        vec![("x".to_string(), vec![5, 0]), ("y".to_string(), vec![2, 9])]
    );
}

#[test]
fn test_presence_absence() {
    let mut t = CountTable::new().unwrap();
    t.set("other", 1, 1, 5).unwrap();
    t.set("k", 7, 2, 5).unwrap();
    assert_eq!(t.get("k").unwrap(), &[0, 7]);
    t.set("k", 3, 5, 5).unwrap();
    assert_eq!(t.get("k").unwrap(), &[0, 7, 0, 0, 3]);
    t.finalize(5).unwrap();
    assert_eq!(t.get("k").unwrap(), &[0, 7, 0, 0, 3]);
    assert_eq!(t.get("other").unwrap(), &[1, 0, 0, 0, 0]);
    assert_eq!(t.get("absent"), Err(TableError::NotFound));
    assert!(!t.contains_key("absent"));
}

#[test]
fn test_finalize_idempotent() {
    let mut t = CountTable::new().unwrap();
    for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
        t.set(key, i as u64 + 1, i + 1, 4).unwrap();
    }
    t.finalize(4).unwrap();
    let first = sorted_rows(&t);
    t.finalize(4).unwrap();
    assert_eq!(first, sorted_rows(&t));
    assert!(first.iter().all(|(_, c)| c.len() == 4));
    assert_eq!(t.get("c").unwrap(), &[0, 0, 3, 0]);
}

#[test]
fn test_invalid_ordinal() {
    let mut t = CountTable::new().unwrap();
    assert_eq!(
        t.set("a", 1, 0, 3),
        Err(TableError::InvalidOrdinal {
            ordinal: 0,
            total: 3
        })
    );
    assert_eq!(
        t.set("a", 1, 4, 3),
        Err(TableError::InvalidOrdinal {
            ordinal: 4,
            total: 3
        })
    );
    assert!(t.is_empty());
}

#[test]
fn test_growth_keeps_entries() {
    let mut t = CountTable::new().unwrap();
    let n = 1000;
    for i in 0..n {
        let key = format!("key{}", i);
        t.set(&key, i as u64, 1, 2).unwrap();
        assert_eq!(t.len(), i + 1);
        assert!(t.capacity().is_power_of_two());
        assert!(t.len() <= t.capacity() / 2);
    }
    /* Touching existing keys must not add entries */
    for i in (0..n).step_by(3) {
        t.set(&format!("key{}", i), 1, 2, 2).unwrap();
    }
    assert_eq!(t.len(), n);
    assert_eq!(t.iter().len(), n);
    t.finalize(2).unwrap();

    let rows = sorted_rows(&t);
    assert_eq!(rows.len(), n);
    for w in rows.windows(2) {
        assert!(w[0].0 != w[1].0);
    }
    for i in 0..n {
        let expected = if i % 3 == 0 { 1 } else { 0 };
        assert_eq!(t.get(&format!("key{}", i)).unwrap(), &[i as u64, expected]);
    }
}

#[test]
fn test_colliding_keys() {
    let mask = INITIAL_CAPACITY - 1;
    let target = home_slot("seed", mask);
    let colliding: Vec<String> = (0..)
        .map(|i| format!("c{}", i))
        .filter(|k| home_slot(k, mask) == target)
        .take(3)
        .collect();

    let mut t = CountTable::new().unwrap();
    t.set("seed", 100, 1, 1).unwrap();
    for (i, k) in colliding.iter().enumerate() {
        t.set(k, i as u64, 1, 1).unwrap();
    }
    assert_eq!(t.capacity(), INITIAL_CAPACITY);
    assert!(t.longest_probe() >= 4);
    assert_eq!(t.get("seed").unwrap(), &[100]);
    for (i, k) in colliding.iter().enumerate() {
        assert_eq!(t.get(k).unwrap(), &[i as u64]);
    }
}

#[test]
fn test_capacity_overflow() {
    assert_eq!(
        CountTable::with_capacity(usize::MAX).unwrap_err(),
        TableError::Overflow
    );
    assert_eq!(
        CountTable::with_capacity(1 << (usize::BITS - 2)).unwrap_err(),
        TableError::Overflow
    );
    let t = CountTable::with_capacity(100).unwrap();
    assert_eq!(t.capacity(), 128);
    assert_eq!(t.longest_probe(), 0);
}

#[test]
fn test_random_streams_match_reference() {
    let streams = util::make_random_streams(5000, 7, 0x5eed);
    let table = util::build_table(&streams).unwrap();
    let reference = util::dense_reference(&streams);

    assert_eq!(table.len(), reference.len());
    for (key, counts) in &table {
        assert_eq!(Some(&counts.to_vec()), reference.get(key));
    }
    assert!(table.total_memory_usage() > table.capacity() * std::mem::size_of::<usize>());
}
