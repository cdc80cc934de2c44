/* SPDX-License-Identifier: MPL-2.0 */
/*! Synthetic input streams and a reference merge, for tests and benchmarks */

use crate::{CountTable, TableError};
use rand::{seq::SliceRandom, Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha12Rng;
use std::collections::BTreeMap;

/** One input file: `(key, count)` lines in file order */
pub type Stream = Vec<(String, u64)>;

/** Produce `n_files` sparse streams drawn from a pool of `n_keys` distinct keys.
 *
 * Each key appears in each file with probability 1/2, with a count in 0..1000 (zero
 * counts occur, and must survive the merge as values rather than as gaps). Line order
 * within each file is shuffled. Every key appears in at least one file. */
pub fn make_random_streams(n_keys: usize, n_files: usize, seed: u64) -> Vec<Stream> {
    assert!(n_files >= 1);
    let mut rng = ChaCha12Rng::seed_from_u64(seed);

    let mut streams: Vec<Stream> = vec![Vec::new(); n_files];
    for i in 0..n_keys {
        /* The index prefix keeps keys distinct; the random tail spreads their lengths */
        let tail = rng.next_u64() >> (rng.next_u32() % 64);
        let key = format!("{}_{:x}", i, tail);

        let forced = rng.random_range(0..n_files);
        for (f, stream) in streams.iter_mut().enumerate() {
            if f == forced || rng.random_bool(0.5) {
                stream.push((key.clone(), rng.random_range(0..1000)));
            }
        }
    }
    for stream in streams.iter_mut() {
        stream.shuffle(&mut rng);
    }
    streams
}

/** Feed `streams` into a fresh table, file by file, and finalize it. */
pub fn build_table(streams: &[Stream]) -> Result<CountTable, TableError> {
    let total = streams.len();
    let mut table = CountTable::new()?;
    for (i, stream) in streams.iter().enumerate() {
        for (key, value) in stream {
            table.set(key, *value, i + 1, total)?;
        }
    }
    table.finalize(total)?;
    Ok(table)
}

/** The merged table `build_table` should produce, computed the obvious way */
pub fn dense_reference(streams: &[Stream]) -> BTreeMap<String, Vec<u64>> {
    let mut out: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (i, stream) in streams.iter().enumerate() {
        for (key, value) in stream {
            out.entry(key.clone())
                .or_insert_with(|| vec![0; streams.len()])[i] = *value;
        }
    }
    out
}

/** Look up every key of every stream; returns the sum of the counts found, which
 * must equal the sum of all values in `streams`. */
pub fn lookup_all(table: &CountTable, streams: &[Stream]) -> u64 {
    let mut total = 0;
    for (i, stream) in streams.iter().enumerate() {
        for (key, _) in stream {
            total += table.get(key).map(|c| c[i]).unwrap_or(0);
        }
    }
    total
}

#[test]
fn test_random_streams() {
    let a = make_random_streams(300, 4, 7);
    let b = make_random_streams(300, 4, 7);
    assert_eq!(a, b);
    assert_eq!(a.len(), 4);

    let reference = dense_reference(&a);
    assert_eq!(reference.len(), 300);
    for stream in a.iter() {
        let mut keys: Vec<&String> = stream.iter().map(|x| &x.0).collect();
        keys.sort_unstable();
        for w in keys.windows(2) {
            assert!(w[0] != w[1]);
        }
    }

    let table = build_table(&a).unwrap();
    let expected: u64 = a.iter().flatten().map(|x| x.1).sum();
    assert_eq!(lookup_all(&table, &a), expected);
}
