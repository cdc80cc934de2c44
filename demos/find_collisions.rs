/* SPDX-License-Identifier: MPL-2.0 */
/*! Test program: how evenly does FNV-1a spread all k-mers over the slots of a table?
 *
 * $ cargo run --release --example find_collisions -- 7 16384
 */

use countmerge::{fnv1a, CountTable};
use rayon::prelude::*;

const ALPHABET: &[u8; 4] = b"ACGT";

fn kmer(mut index: u64, k: usize) -> Vec<u8> {
    let mut out = vec![0; k];
    for c in out.iter_mut().rev() {
        *c = ALPHABET[(index % 4) as usize];
        index /= 4;
    }
    out
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let k: usize = args.get(1).map(|x| x.parse().unwrap()).unwrap_or(7);
    let capacity: usize = args
        .get(2)
        .map(|x| x.parse().unwrap())
        .unwrap_or(1 << 15);
    assert!(capacity.is_power_of_two());
    assert!(k <= 16);
    let mask = (capacity - 1) as u64;
    let n = 1u64 << (2 * k);

    let histogram: Vec<u32> = (0..n)
        .into_par_iter()
        .fold(
            || vec![0u32; capacity],
            |mut h, i| {
                h[(fnv1a(&kmer(i, k)) & mask) as usize] += 1;
                h
            },
        )
        .reduce(
            || vec![0u32; capacity],
            |mut a, b| {
                for (x, y) in a.iter_mut().zip(b.iter()) {
                    *x += y;
                }
                a
            },
        );

    let (worst_slot, worst) = histogram
        .iter()
        .enumerate()
        .max_by_key(|x| *x.1)
        .unwrap();
    let empty = histogram.iter().filter(|x| **x == 0).count();
    println!(
        "{} {}-mers over {} slots: {} empty, fullest slot {} holds {}",
        n, k, capacity, empty, worst_slot, worst
    );

    /* A few keys sharing the fullest home slot */
    let sharing: Vec<String> = (0..n)
        .into_par_iter()
        .filter(|i| (fnv1a(&kmer(*i, k)) & mask) as usize == worst_slot)
        .map(|i| String::from_utf8(kmer(i, k)).unwrap())
        .collect();
    println!("sharing slot {}: {:?}", worst_slot, &sharing[..sharing.len().min(4)]);

    /* Probe lengths once the keys are actually stored */
    let mut table = CountTable::with_capacity(capacity).unwrap();
    for i in 0..n {
        let key = String::from_utf8(kmer(i, k)).unwrap();
        table.set(&key, 1, 1, 1).unwrap();
    }
    println!(
        "table: {} keys, capacity {}, longest probe {}, ~{} bytes",
        table.len(),
        table.capacity(),
        table.longest_probe(),
        table.total_memory_usage()
    );
}
