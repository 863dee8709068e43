//! Partition a CSV file by the values of one or more columns.
//!
//! Rows go to `<dst>/<value1>/<value2>/.../<filename>`, each output starting
//! with the source header. Only a bounded number of writers is kept open; an
//! evicted output is reopened in append mode when its key shows up again.

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

const MAX_OPEN_WRITERS: usize = 200;

#[derive(Debug, Clone)]
pub struct SplitFileResult {
    pub header: StringRecord,
    /// Raw column values (not sanitised) to the output written for them.
    pub outputs: BTreeMap<Vec<String>, PathBuf>,
    pub rows: usize,
}

/// Replace characters that are unsafe in directory names with a space.
pub fn sanitise_component(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| match c {
            ':' | '\\' | '/' | '*' | '"' | '?' | '|' | '<' | '>' | '\'' => ' ',
            other => other,
        })
        .collect();
    match cleaned.as_str() {
        "." | ".." => cleaned.replace('.', "_"),
        _ => cleaned,
    }
}

fn header_position(header: &StringRecord, column: &str) -> Option<usize> {
    header
        .iter()
        .position(|h| h.trim_start_matches('\u{feff}') == column)
}

pub fn read_header(path: &Path) -> Result<StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    Ok(reader.headers()?.clone())
}

/// Write a file holding only `header`.
pub fn write_header_only(path: &Path, header: &StringRecord) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer.write_record(header)?;
    writer.flush()?;
    Ok(())
}

pub fn split_by_columns(src: &Path, dst_root: &Path, columns: &[&str]) -> Result<SplitFileResult> {
    let filename = src
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", src.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(src)
        .with_context(|| format!("failed to open {}", src.display()))?;
    let header = reader.headers()?.clone();
    let indices = columns
        .iter()
        .map(|c| {
            header_position(&header, c)
                .ok_or_else(|| anyhow!("{} has no column {}", src.display(), c))
        })
        .collect::<Result<Vec<usize>>>()?;

    let mut outputs: BTreeMap<Vec<String>, PathBuf> = BTreeMap::new();
    let mut claimed: HashMap<PathBuf, Vec<String>> = HashMap::new();
    let mut open: HashMap<Vec<String>, csv::Writer<fs::File>> = HashMap::new();
    let mut rows = 0usize;

    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("failed to read {}", src.display()))?;
        let key: Vec<String> = indices
            .iter()
            .map(|i| record.get(*i).unwrap_or("").to_string())
            .collect();
        if let Some(pos) = key.iter().position(|v| v.trim().is_empty()) {
            return Err(anyhow!(
                "{} row {} has an empty {}",
                src.display(),
                line + 2,
                columns[pos]
            ));
        }

        if !open.contains_key(&key) {
            if open.len() >= MAX_OPEN_WRITERS {
                for (_, mut writer) in open.drain() {
                    writer.flush()?;
                }
            }
            let writer = match outputs.get(&key) {
                Some(path) => {
                    let file = OpenOptions::new()
                        .append(true)
                        .open(path)
                        .with_context(|| format!("failed to reopen {}", path.display()))?;
                    csv::Writer::from_writer(file)
                }
                None => {
                    let dir = key
                        .iter()
                        .fold(dst_root.to_path_buf(), |dir, v| dir.join(sanitise_component(v)));
                    fs::create_dir_all(&dir)
                        .with_context(|| format!("failed to create {}", dir.display()))?;
                    let path = dir.join(filename);
                    if let Some(other) = claimed.get(&path) {
                        return Err(anyhow!(
                            "{} values {:?} and {:?} map to the same output {}",
                            src.display(),
                            other,
                            key,
                            path.display()
                        ));
                    }
                    claimed.insert(path.clone(), key.clone());
                    let mut writer = csv::Writer::from_path(&path)
                        .with_context(|| format!("failed to create {}", path.display()))?;
                    writer.write_record(&header)?;
                    outputs.insert(key.clone(), path);
                    writer
                }
            };
            open.insert(key.clone(), writer);
        }
        if let Some(writer) = open.get_mut(&key) {
            writer.write_record(&record)?;
        }
        rows += 1;
    }

    for (_, mut writer) in open.drain() {
        writer.flush()?;
    }

    Ok(SplitFileResult {
        header,
        outputs,
        rows,
    })
}
