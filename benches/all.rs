/* SPDX-License-Identifier: MPL-2.0 */
/* Benchmarking code for the merge table, compared against std maps doing the same
 * zero-filling merge. Each benchmark measures building the table from a set of random
 * streams (including `finalize`) and then looking up every line of every stream.
 *
 * Results are written as JSON to target/bench/<timestamp>/ and linked from target/bench/main/.
 */

use clap::{Arg, ArgAction};
use countmerge::*;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;

const N_FILES: usize = 8;

struct CycleResults {
    average_time_per_build: f64,
    average_time_per_lookup: f64,
}

struct ParameterInfo {
    samples: u64,
    min: f64,
    q1: f64,
    median: f64,
    q3: f64,
    max: f64,
}

impl ParameterInfo {
    fn from_iter<I: Iterator<Item = f64>>(x: I) -> ParameterInfo {
        let mut v: Vec<f64> = x.collect();
        v.sort_by(|x, y| f64::partial_cmp(x, y).unwrap());
        let median = (v[v.len() / 2] + v[v.len() - 1 - v.len() / 2]) / 2.0;
        ParameterInfo {
            samples: v.len() as u64,
            min: *v.first().unwrap(),
            q1: v[v.len() / 4],
            median,
            q3: v[v.len() - 1 - v.len() / 4],
            max: *v.last().unwrap(),
        }
    }
    fn to_string(&self) -> String {
        format!("{{ \"samples\": {}, \"min\": {}, \"q1\": {}, \"median\": {}, \"q3\": {}, \"max\": {} }}", self.samples, self.min, self.q1, self.median, self.q3, self.max)
    }
}

/** The operations a merge table needs, so the std maps can be measured alongside */
trait MergeTable: Sized {
    fn build(streams: &[util::Stream]) -> Self;
    fn lookup_all(&self, streams: &[util::Stream]) -> u64;
}

impl MergeTable for CountTable {
    fn build(streams: &[util::Stream]) -> Self {
        util::build_table(streams).unwrap()
    }
    fn lookup_all(&self, streams: &[util::Stream]) -> u64 {
        util::lookup_all(self, streams)
    }
}

impl MergeTable for HashMap<String, Vec<u64>, FnvBuildHasher> {
    fn build(streams: &[util::Stream]) -> Self {
        let mut map = HashMap::with_hasher(FnvBuildHasher);
        for (i, stream) in streams.iter().enumerate() {
            for (key, value) in stream {
                let counts: &mut Vec<u64> = map.entry(key.clone()).or_default();
                counts.resize(i + 1, 0);
                counts[i] = *value;
            }
        }
        for counts in map.values_mut() {
            counts.resize(streams.len(), 0);
        }
        map
    }
    fn lookup_all(&self, streams: &[util::Stream]) -> u64 {
        let mut total = 0;
        for (i, stream) in streams.iter().enumerate() {
            for (key, _) in stream {
                total += self.get(key).map(|c| c[i]).unwrap_or(0);
            }
        }
        total
    }
}

impl MergeTable for BTreeMap<String, Vec<u64>> {
    fn build(streams: &[util::Stream]) -> Self {
        util::dense_reference(streams)
    }
    fn lookup_all(&self, streams: &[util::Stream]) -> u64 {
        let mut total = 0;
        for (i, stream) in streams.iter().enumerate() {
            for (key, _) in stream {
                total += self.get(key).map(|c| c[i]).unwrap_or(0);
            }
        }
        total
    }
}

fn run_cycle<T: MergeTable>(iterations: u64, sz: usize, seed: u64) -> CycleResults {
    let streams = std::hint::black_box(util::make_random_streams(sz, N_FILES, seed));
    let expected: u64 = streams.iter().flatten().map(|x| x.1).sum();

    let start_time = std::time::Instant::now();
    let mut table = None;
    for _ in 0..iterations {
        table = Some(std::hint::black_box(T::build(&streams)));
    }
    let build_time = std::time::Instant::now();
    let table = table.unwrap();
    for _ in 0..iterations {
        assert!(std::hint::black_box(table.lookup_all(&streams)) == expected);
    }
    let lookup_time = std::time::Instant::now();

    CycleResults {
        average_time_per_build: build_time.duration_since(start_time).as_secs_f64()
            / (iterations as f64),
        average_time_per_lookup: lookup_time.duration_since(build_time).as_secs_f64()
            / (iterations as f64),
    }
}

fn run_bench<T: MergeTable>(table_name: &str, sz: usize, min_time_sec: f64) -> String {
    /* Warm up code and caches on a small instance first */
    run_cycle::<T>(1, 64, 0x1);

    let mut seed = 0x1234;
    let seed_start = std::time::Instant::now();
    let first = run_cycle::<T>(1, sz, seed);
    let seed_elapsed = seed_start.elapsed().as_secs_f64();

    let iterations = ((min_time_sec / (10.0 * seed_elapsed)).ceil() as u64).max(1);
    let mut measurements = vec![first];
    for _ in 0..10 {
        seed += 2;
        measurements.push(run_cycle::<T>(iterations, sz, seed));
    }

    let info_build =
        ParameterInfo::from_iter(measurements.iter().map(|x| x.average_time_per_build));
    let info_lookup =
        ParameterInfo::from_iter(measurements.iter().map(|x| x.average_time_per_lookup));

    let mut message = String::from("{");
    message += &format!(
        "\"table\": \"{}\", \"n_files\": {}, \"n_keys\": {}, ",
        table_name, N_FILES, sz
    );
    message += "\"measurements\": {\n";
    message += "  \"build\": ";
    message += &info_build.to_string();
    message += ",\n";
    message += "  \"lookup\": ";
    message += &info_lookup.to_string();
    message.push_str("\n} }\n");
    message
}

type BenchFn = Box<dyn Fn(usize) -> String>;

fn make_bench_fn<T: MergeTable>(name: &'static str) -> BenchFn {
    Box::new(move |sz| run_bench::<T>(name, sz, 0.1))
}

fn main() {
    let cmd = clap::Command::new("bench-all")
        .about("Benchmarks for the count merge table")
        .arg(
            Arg::new("bench")
                .long("bench")
                .action(ArgAction::SetTrue)
                .default_value("false"),
        )
        .arg(
            Arg::new("list")
                .long("list")
                .action(ArgAction::SetTrue)
                .default_value("false"),
        )
        .arg(Arg::new("filters").action(ArgAction::Append));

    let matches = cmd.get_matches();

    let benchmarks: &[(&'static str, BenchFn)] = &[
        ("countmerge", make_bench_fn::<CountTable>("countmerge")),
        (
            "hashmap",
            make_bench_fn::<HashMap<String, Vec<u64>, FnvBuildHasher>>("hashmap"),
        ),
        ("btree", make_bench_fn::<BTreeMap<String, Vec<u64>>>("btree")),
    ];
    let size_classes: Vec<u32> = (4..=20).collect();

    if matches.get_flag("list") {
        for c in size_classes.iter() {
            for entry in benchmarks {
                println!("{}_{}", entry.0, c);
            }
        }
        return;
    }
    if !matches.get_flag("bench") {
        eprintln!("Running in test mode (without --bench) not yet supported");
        return;
    }

    let filters: Vec<&String> = matches
        .get_many::<String>("filters")
        .unwrap_or_default()
        .collect();

    let bench_time: String = chrono::Local::now().format("%Y-%m-%d-%H:%M:%S").to_string();
    let folder = "target/bench/";
    let archive_folder = String::from(folder) + &bench_time + "/";
    let output_folder = String::from(folder) + "main/";
    std::fs::create_dir_all(&archive_folder).unwrap();
    std::fs::create_dir_all(&output_folder).unwrap();

    for c in size_classes.iter() {
        for (name, f) in benchmarks {
            let full_name = format!("{}_{}", name, c);
            if !filters.is_empty() && !filters.iter().any(|x| full_name.contains(x.as_str())) {
                continue;
            }
            let start = std::time::Instant::now();
            let output = f(1 << c);
            println!(
                "Benchmark '{}' completed after {} secs",
                full_name,
                start.elapsed().as_secs_f64()
            );

            let file_name = full_name + ".json";
            let archive_path = std::path::PathBuf::from(&archive_folder).join(&file_name);
            let current_path = std::path::PathBuf::from(&output_folder).join(&file_name);
            let rel_archive_path = std::path::PathBuf::from("../")
                .join(&bench_time)
                .join(&file_name);

            let mut f = std::fs::File::create(&archive_path).unwrap();
            f.write_all(output.as_bytes()).unwrap();
            drop(f);

            let _ = std::fs::remove_file(&current_path);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&rel_archive_path, &current_path).unwrap();
            #[cfg(not(unix))]
            let _ = (rel_archive_path, std::fs::copy(&archive_path, &current_path));
        }
    }

    println!("Done.");
}
