/* SPDX-License-Identifier: MPL-2.0 */
/*! Merge several `key count` files into one CSV table, writing 0 where a key is absent.
 *
 * $ cargo run --example concatenate -- T4.counts T6.counts -o merged
 */

use clap::{Arg, ArgAction};
use countmerge::pipeline::{self, MergeConfig};
use std::path::PathBuf;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cmd = clap::Command::new("concatenate")
        .about("Concatenate count tables, filling in zeros for absent keys")
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .action(ArgAction::Set)
                .help("Output name, '.csv' is appended if missing [default: concatenation_output.csv]"),
        )
        .arg(
            Arg::new("require-output")
                .long("require-output")
                .action(ArgAction::SetTrue)
                .help("Fail instead of using the default output name"),
        )
        .arg(
            Arg::new("trace")
                .long("trace")
                .action(ArgAction::SetTrue)
                .help("Print the merged rows to stdout"),
        )
        .arg(
            Arg::new("key-size")
                .long("key-size")
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(usize))
                .default_value("40")
                .help("Longest accepted key, in bytes"),
        )
        .arg(
            Arg::new("inputs")
                .action(ArgAction::Append)
                .required(true)
                .num_args(1..)
                .value_parser(clap::value_parser!(PathBuf)),
        );

    let matches = cmd.get_matches();

    let mut config = MergeConfig::new(
        matches
            .get_many::<PathBuf>("inputs")
            .unwrap_or_default()
            .cloned()
            .collect(),
    );
    config.output = matches.get_one::<String>("output").map(PathBuf::from);
    config.require_output = matches.get_flag("require-output");
    config.trace = matches.get_flag("trace");
    config.key_size = *matches.get_one::<usize>("key-size").unwrap();

    match pipeline::run(&config) {
        Ok(summary) => {
            log::info!(
                "Wrote {} keys from {} files to {}",
                summary.keys,
                summary.files,
                summary.output.display()
            );
        }
        Err(err) => {
            log::error!("{}", err);
            std::process::exit(1);
        }
    }
}
