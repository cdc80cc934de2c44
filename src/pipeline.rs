/* SPDX-License-Identifier: MPL-2.0 */
/*! Reading count files into a [CountTable] and writing the merged table as CSV.
 *
 * Input files hold one `key count` pair per line, separated by a single space, where
 * the count is a non-negative decimal integer. */

use crate::{CountTable, TableError};
use log::{debug, info, warn};
use std::ffi::OsStr;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/** Output file used when none is named */
pub const DEFAULT_OUTPUT: &str = "concatenation_output.csv";
/** Longest accepted key, in bytes */
pub const DEFAULT_KEY_SIZE: usize = 40;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LineError {
    #[error("the fields are not space separated")]
    NotSpaceSeparated,
    #[error("empty identifier")]
    EmptyKey,
    #[error("identifier is {len} bytes long, the limit is {limit}")]
    KeyTooLong { len: usize, limit: usize },
    #[error("empty count")]
    EmptyCount,
    #[error("count has a non-digit character {0:?}")]
    NonDigit(char),
    #[error("count does not fit in 64 bits")]
    CountOverflow,
    #[error("more than two fields")]
    TooManyFields,
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("need at least two files to concatenate, got {0}")]
    NotEnoughInputs(usize),
    #[error("no name was given for the output file")]
    MissingOutput,
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{}:{}: {}", .path.display(), .line, .source)]
    Format {
        path: PathBuf,
        line: usize,
        #[source]
        source: LineError,
    },
    #[error(transparent)]
    Table(#[from] TableError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> MergeError + '_ {
    move |source| MergeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/** Split one input line into its key and count. Blank lines yield `None`. */
pub fn parse_line(line: &str, key_size: usize) -> Result<Option<(&str, u64)>, LineError> {
    let line = line.trim_end_matches(|c: char| c == '\n' || c == '\r');
    if line.is_empty() {
        return Ok(None);
    }
    let Some((key, count)) = line.split_once(' ') else {
        return Err(LineError::NotSpaceSeparated);
    };
    if key.is_empty() {
        return Err(LineError::EmptyKey);
    }
    if key.len() > key_size {
        return Err(LineError::KeyTooLong {
            len: key.len(),
            limit: key_size,
        });
    }
    if count.contains(' ') {
        return Err(LineError::TooManyFields);
    }
    if count.is_empty() {
        return Err(LineError::EmptyCount);
    }
    if let Some(c) = count.chars().find(|c| !c.is_ascii_digit()) {
        return Err(LineError::NonDigit(c));
    }
    let value = count.parse().map_err(|_| LineError::CountOverflow)?;
    Ok(Some((key, value)))
}

#[test]
fn test_parse_line() {
    assert_eq!(parse_line("AACGT 12", 40), Ok(Some(("AACGT", 12))));
    assert_eq!(parse_line("AACGT 0\r\n", 40), Ok(Some(("AACGT", 0))));
    assert_eq!(parse_line("", 40), Ok(None));
    assert_eq!(parse_line("\r", 40), Ok(None));
    assert_eq!(parse_line("AACGT\t12", 40), Err(LineError::NotSpaceSeparated));
    assert_eq!(parse_line(" 12", 40), Err(LineError::EmptyKey));
    assert_eq!(
        parse_line("AACGT 12", 4),
        Err(LineError::KeyTooLong { len: 5, limit: 4 })
    );
    assert_eq!(parse_line("AACGT ", 40), Err(LineError::EmptyCount));
    assert_eq!(parse_line("AACGT -3", 40), Err(LineError::NonDigit('-')));
    assert_eq!(parse_line("AACGT 1.5", 40), Err(LineError::NonDigit('.')));
    assert_eq!(parse_line("AACGT 1 2", 40), Err(LineError::TooManyFields));
    assert_eq!(
        parse_line("AACGT 99999999999999999999", 40),
        Err(LineError::CountOverflow)
    );
}

/* ---------------------------------------------------------------------------- */

/** Settings for one merge run */
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /** Count files, in output column order */
    pub inputs: Vec<PathBuf>,
    /** Output name; `.csv` is appended unless already present */
    pub output: Option<PathBuf>,
    /** Treat a missing output name as an error instead of using [DEFAULT_OUTPUT] */
    pub require_output: bool,
    /** Print every merged row to stdout before saving */
    pub trace: bool,
    pub key_size: usize,
}

impl MergeConfig {
    pub fn new(inputs: Vec<PathBuf>) -> MergeConfig {
        MergeConfig {
            inputs,
            output: None,
            require_output: false,
            trace: false,
            key_size: DEFAULT_KEY_SIZE,
        }
    }

    pub fn validate(&self) -> Result<(), MergeError> {
        if self.inputs.len() < 2 {
            return Err(MergeError::NotEnoughInputs(self.inputs.len()));
        }
        if self.output.is_none() && self.require_output {
            return Err(MergeError::MissingOutput);
        }
        Ok(())
    }

    /** Where the CSV will be written */
    pub fn output_path(&self) -> Result<PathBuf, MergeError> {
        match &self.output {
            Some(p) if p.extension() == Some(OsStr::new("csv")) => Ok(p.clone()),
            Some(p) => {
                let mut name = p.clone().into_os_string();
                name.push(".csv");
                Ok(PathBuf::from(name))
            }
            None if self.require_output => Err(MergeError::MissingOutput),
            None => Ok(PathBuf::from(DEFAULT_OUTPUT)),
        }
    }
}

#[test]
fn test_config() {
    let mut cfg = MergeConfig::new(vec!["a.counts".into()]);
    assert!(matches!(cfg.validate(), Err(MergeError::NotEnoughInputs(1))));
    cfg.inputs.push("b.counts".into());
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.output_path().unwrap(), PathBuf::from(DEFAULT_OUTPUT));

    cfg.require_output = true;
    assert!(matches!(cfg.validate(), Err(MergeError::MissingOutput)));
    cfg.output = Some("merged".into());
    assert_eq!(cfg.output_path().unwrap(), PathBuf::from("merged.csv"));
    cfg.output = Some("out/merged.csv".into());
    assert_eq!(cfg.output_path().unwrap(), PathBuf::from("out/merged.csv"));
}

/* ---------------------------------------------------------------------------- */

/** Add every line of `reader` to `table` as file `ordinal` of `total`. `path` is only
 * used for error messages. Returns the number of items read. */
pub fn accumulate<R: BufRead>(
    table: &mut CountTable,
    reader: R,
    path: &Path,
    ordinal: usize,
    total: usize,
    key_size: usize,
) -> Result<usize, MergeError> {
    let mut items = 0;
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(io_error(path))?;
        let parsed = parse_line(&line, key_size).map_err(|source| MergeError::Format {
            path: path.to_path_buf(),
            line: i + 1,
            source,
        })?;
        let Some((key, value)) = parsed else {
            continue;
        };
        table.set(key, value, ordinal, total)?;
        items += 1;
    }
    Ok(items)
}

pub fn accumulate_file(
    table: &mut CountTable,
    path: &Path,
    ordinal: usize,
    total: usize,
    key_size: usize,
) -> Result<usize, MergeError> {
    info!("Processing file {}", path.display());
    let file = File::open(path).map_err(io_error(path))?;
    let items = accumulate(table, BufReader::new(file), path, ordinal, total, key_size)?;
    info!("{} items processed", items);
    Ok(items)
}

/** Check that the first line of `path` is a well-formed `key count` pair. */
pub fn check_format(path: &Path, key_size: usize) -> Result<(), MergeError> {
    debug!("Verifying format of file: {}", path.display());
    let file = File::open(path).map_err(io_error(path))?;
    let mut first = String::new();
    BufReader::new(file)
        .read_line(&mut first)
        .map_err(io_error(path))?;
    parse_line(&first, key_size).map_err(|source| MergeError::Format {
        path: path.to_path_buf(),
        line: 1,
        source,
    })?;
    Ok(())
}

#[test]
fn test_accumulate() {
    let mut t = CountTable::new().unwrap();
    let a: &[u8] = b"x 5\ny 2\n";
    let b: &[u8] = b"y 9\r\n\r\n";
    assert_eq!(accumulate(&mut t, a, Path::new("a"), 1, 2, 40).unwrap(), 2);
    assert_eq!(accumulate(&mut t, b, Path::new("b"), 2, 2, 40).unwrap(), 1);
    t.finalize(2).unwrap();
    assert_eq!(t.get("x").unwrap(), &[5, 0]);
    assert_eq!(t.get("y").unwrap(), &[2, 9]);

    let bad: &[u8] = b"z 1\nz2\n";
    match accumulate(&mut t, bad, Path::new("bad"), 2, 2, 40) {
        Err(MergeError::Format { line, source, .. }) => {
            assert_eq!(line, 2);
            assert_eq!(source, LineError::NotSpaceSeparated);
        }
        other => panic!("unexpected {:?}", other),
    }
    let late: &[u8] = b"w 1\n";
    assert!(matches!(
        accumulate(&mut t, late, Path::new("late"), 3, 2, 40),
        Err(MergeError::Table(TableError::InvalidOrdinal { .. }))
    ));
}

/* ---------------------------------------------------------------------------- */

fn write_rows<W: Write>(table: &CountTable, out: &mut W) -> io::Result<()> {
    for (key, counts) in table {
        write!(out, "{}", key)?;
        for c in counts {
            write!(out, ",{}", c)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/** Write `table` as CSV: a header naming each input column, then one row per key.
 * Row order follows the table's slot order. */
pub fn write_csv<W: Write>(table: &CountTable, input_names: &[String], mut out: W) -> io::Result<()> {
    write!(out, "identifier")?;
    for name in input_names {
        write!(out, ",{}", name)?;
    }
    writeln!(out)?;
    write_rows(table, &mut out)?;
    out.flush()
}

/** Dump the rows of `table`, without header. */
pub fn trace_table<W: Write>(table: &CountTable, mut out: W) -> io::Result<()> {
    write_rows(table, &mut out)?;
    out.flush()
}

#[test]
fn test_write_csv() {
    use itertools::Itertools;

    let mut t = CountTable::new().unwrap();
    t.set("x", 5, 1, 2).unwrap();
    t.set("y", 2, 1, 2).unwrap();
    t.set("y", 9, 2, 2).unwrap();
    t.finalize(2).unwrap();

    let mut out = Vec::new();
    write_csv(&t, &["A.counts".to_string(), "B.counts".to_string()], &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("identifier,A.counts,B.counts"));
    assert_eq!(lines.sorted().collect::<Vec<_>>(), vec!["x,5,0", "y,2,9"]);

    let mut out = Vec::new();
    trace_table(&t, &mut out).unwrap();
    assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
}

/* ---------------------------------------------------------------------------- */

/** Outcome of [run] */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub files: usize,
    pub keys: usize,
    pub output: PathBuf,
}

/** Merge all inputs of `config` and save the result as CSV. */
pub fn run(config: &MergeConfig) -> Result<MergeSummary, MergeError> {
    config.validate()?;
    if config.output.is_none() {
        warn!(
            "No output name was given, results will be saved under {}",
            DEFAULT_OUTPUT
        );
    }
    let output = config.output_path()?;
    for path in &config.inputs {
        check_format(path, config.key_size)?;
    }

    let total = config.inputs.len();
    info!("Merging {} files", total);
    let mut table = CountTable::new()?;
    for (i, path) in config.inputs.iter().enumerate() {
        accumulate_file(&mut table, path, i + 1, total, config.key_size)?;
    }
    table.finalize(total)?;
    debug!(
        "{} keys in {} slots, longest probe {}, ~{} bytes",
        table.len(),
        table.capacity(),
        table.longest_probe(),
        table.total_memory_usage()
    );

    if config.trace {
        trace_table(&table, io::stdout().lock()).map_err(io_error(Path::new("<stdout>")))?;
    }

    info!("Saving results to file: {}", output.display());
    let names: Vec<String> = config
        .inputs
        .iter()
        .map(|p| p.display().to_string())
        .collect();
    let file = File::create(&output).map_err(io_error(&output))?;
    write_csv(&table, &names, BufWriter::new(file)).map_err(io_error(&output))?;

    Ok(MergeSummary {
        files: total,
        keys: table.len(),
        output,
    })
}

#[cfg(test)]
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("countmerge-{}-{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_run() {
    let dir = scratch_dir("run");
    let a = dir.join("A.counts");
    let b = dir.join("B.counts");
    std::fs::write(&a, "x 5\ny 2\n").unwrap();
    std::fs::write(&b, "y 9\n").unwrap();

    let mut cfg = MergeConfig::new(vec![a.clone(), b.clone()]);
    cfg.output = Some(dir.join("merged"));
    let summary = run(&cfg).unwrap();
    assert_eq!(summary.files, 2);
    assert_eq!(summary.keys, 2);
    assert_eq!(summary.output, dir.join("merged.csv"));

    let text = std::fs::read_to_string(&summary.output).unwrap();
    let mut lines: Vec<&str> = text.lines().collect();
    assert_eq!(
        lines.remove(0),
        format!("identifier,{},{}", a.display(), b.display())
    );
    lines.sort_unstable();
    assert_eq!(lines, vec!["x,5,0", "y,2,9"]);

    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn test_run_rejects_bad_first_line() {
    let dir = scratch_dir("badfmt");
    let a = dir.join("A.counts");
    let b = dir.join("B.counts");
    std::fs::write(&a, "x 5\n").unwrap();
    std::fs::write(&b, "y,9\n").unwrap();

    let mut cfg = MergeConfig::new(vec![a, b.clone()]);
    cfg.output = Some(dir.join("merged"));
    match run(&cfg) {
        Err(MergeError::Format { path, line, .. }) => {
            assert_eq!(path, b);
            assert_eq!(line, 1);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(!dir.join("merged.csv").exists());

    std::fs::remove_dir_all(&dir).unwrap();
}
