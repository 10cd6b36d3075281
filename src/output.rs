//! Verdict buckets and the rollup report.
//!
//! The output directory is rebuilt once per run from the checkpointed rows,
//! each file written to a temporary name and renamed into place. After that
//! every batch is appended, so nothing but the not-yet-replayed checkpoint
//! is held in memory.

use crate::error::PersistenceError;
use crate::record::{normalize_address, Record, Verdict};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};

/// A finished record as it appears in the outputs and the checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputRow {
    pub address: String,
    pub secret: String,
    pub source: String,
    pub country: String,
    pub verdict: Verdict,
    pub score: u8,
    pub diagnostics: Vec<String>,
}

impl OutputRow {
    /// `None` for a record that has not reached a verdict.
    pub fn from_record(record: &Record) -> Option<Self> {
        Some(Self {
            address: record.address.clone(),
            secret: record.secret.clone(),
            source: record.source.clone(),
            country: record.country.clone(),
            verdict: record.verdict?,
            score: record.score,
            diagnostics: record.diagnostics.clone(),
        })
    }

    pub fn normalized(&self) -> String {
        normalize_address(&self.address)
    }

    /// `address:secret:country:VERDICT`
    pub fn bucket_line(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.address, self.secret, self.country, self.verdict
        )
    }
}

const CSV_HEADER: &str = "address,secret,country,verdict,diagnostics";

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn csv_line(row: &OutputRow) -> String {
    [
        csv_field(&row.address),
        csv_field(&row.secret),
        csv_field(&row.country),
        row.verdict.to_string(),
        csv_field(&row.diagnostics.join("; ")),
    ]
    .join(",")
}

#[derive(Debug)]
pub struct OutputAggregator {
    dir: PathBuf,
    /// Checkpointed rows, taken on the first write to rebuild the files
    replay: Option<Vec<OutputRow>>,
    /// Sources whose per-source files exist for this run
    sources: HashSet<String>,
}

impl OutputAggregator {
    /// Writer for `dir` that starts from the rows of earlier runs.
    pub fn new(dir: &Path, checkpointed: Vec<OutputRow>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            replay: Some(checkpointed),
            sources: HashSet::new(),
        }
    }

    /// Append a finished batch to the combined and per-source files.
    pub fn append(&mut self, rows: &[OutputRow]) -> Result<(), PersistenceError> {
        self.rebuild()?;

        let by_source = group_by_source(rows);
        for (source, rows) in &by_source {
            if self.sources.insert(source.to_string()) {
                write_set(&self.dir, &format!("{source}_"), &[])?;
            }
            append_set(&self.dir, &format!("{source}_"), rows)?;
        }
        let all: Vec<&OutputRow> = rows.iter().collect();
        append_set(&self.dir, "", &all)?;

        log::debug!("Appended {} rows to {}", rows.len(), self.dir.display());
        Ok(())
    }

    /// Make sure the files exist even when the run added nothing.
    pub fn flush(&mut self) -> Result<(), PersistenceError> {
        self.rebuild()
    }

    /// Truncate every file and replay the checkpoint. Runs at most once.
    fn rebuild(&mut self) -> Result<(), PersistenceError> {
        let Some(rows) = self.replay.take() else {
            return Ok(());
        };
        std::fs::create_dir_all(&self.dir).map_err(|source| PersistenceError::Output {
            path: self.dir.clone(),
            source,
        })?;

        let all: Vec<&OutputRow> = rows.iter().collect();
        write_set(&self.dir, "", &all)?;
        for (source, rows) in group_by_source(&rows) {
            write_set(&self.dir, &format!("{source}_"), &rows)?;
            self.sources.insert(source.to_string());
        }

        log::debug!(
            "Output rebuilt in {} from {} checkpointed rows",
            self.dir.display(),
            rows.len()
        );
        Ok(())
    }
}

fn group_by_source(rows: &[OutputRow]) -> BTreeMap<&str, Vec<&OutputRow>> {
    let mut groups: BTreeMap<&str, Vec<&OutputRow>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.source.as_str()).or_default().push(row);
    }
    groups
}

fn append_set(dir: &Path, prefix: &str, rows: &[&OutputRow]) -> Result<(), PersistenceError> {
    for verdict in Verdict::ALL {
        let mut content = String::new();
        for row in rows.iter().filter(|r| r.verdict == verdict) {
            content.push_str(&row.bucket_line());
            content.push('\n');
        }
        if !content.is_empty() {
            append_file(&dir.join(format!("{prefix}{}.txt", verdict.file_stem())), &content)?;
        }
    }

    let mut report = String::new();
    for row in rows {
        let _ = writeln!(report, "{}", csv_line(row));
    }
    append_file(&dir.join(format!("{prefix}summary.csv")), &report)
}

fn append_file(path: &Path, content: &str) -> Result<(), PersistenceError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(content.as_bytes()))
        .map_err(|source| PersistenceError::Output {
            path: path.to_path_buf(),
            source,
        })
}

fn write_set(dir: &Path, prefix: &str, rows: &[&OutputRow]) -> Result<(), PersistenceError> {
    for verdict in Verdict::ALL {
        let mut content = String::new();
        for row in rows.iter().filter(|r| r.verdict == verdict) {
            content.push_str(&row.bucket_line());
            content.push('\n');
        }
        let path = dir.join(format!("{prefix}{}.txt", verdict.file_stem()));
        write_atomic(&path, &content)?;
    }

    let mut report = String::new();
    let _ = writeln!(report, "{CSV_HEADER}");
    for row in rows {
        let _ = writeln!(report, "{}", csv_line(row));
    }
    write_atomic(&dir.join(format!("{prefix}summary.csv")), &report)
}

fn write_atomic(path: &Path, content: &str) -> Result<(), PersistenceError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    std::fs::write(&tmp, content)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|source| PersistenceError::Output {
            path: path.to_path_buf(),
            source,
        })
}
