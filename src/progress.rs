use crate::error::PersistenceError;
use crate::input::read_line_lossy;
use crate::output::OutputRow;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Snapshot of run progress, rewritten at each batch boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressMeta {
    pub session: String,
    pub processed: usize,
    pub batches: usize,
    pub completed: bool,
}

/// Append-only checkpoint log of finished rows, one JSON object per line.
///
/// Each row is the full output line so a resumed run can rebuild its
/// outputs without re-validating anything.
pub struct ProgressStore {
    session: String,
    log_path: PathBuf,
    meta_path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ProgressStore {
    pub fn new(dir: &Path, session: &str) -> Self {
        Self {
            session: session.to_string(),
            log_path: dir.join(format!("{session}_checkpoint.jsonl")),
            meta_path: dir.join(format!("{session}_progress.json")),
            file: Mutex::new(None),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Rows checkpointed by earlier runs of this session.
    pub fn load(&self) -> anyhow::Result<Vec<OutputRow>> {
        if !self.log_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_path)
            .with_context(|| format!("Failed to open checkpoint: {}", self.log_path.display()))?;

        let mut rows = Vec::new();
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();
        let mut index = 0;
        while let Some(line) = read_line_lossy(&mut reader, &mut buf)
            .with_context(|| format!("Failed to read checkpoint: {}", self.log_path.display()))?
        {
            index += 1;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<OutputRow>(&line) {
                Ok(row) => rows.push(row),
                // A torn final line from an interrupted append
                Err(e) => log::warn!("Ignoring checkpoint line {index}: {e}"),
            }
        }

        log::info!(
            "Loaded {} checkpointed records from {}",
            rows.len(),
            self.log_path.display()
        );
        Ok(rows)
    }

    /// Append a finished batch and fsync before returning.
    pub fn append(&self, rows: &[OutputRow]) -> Result<(), PersistenceError> {
        let err = |source: std::io::Error| PersistenceError::Checkpoint {
            path: self.log_path.clone(),
            source,
        };

        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_none() {
            if let Some(parent) = self.log_path.parent() {
                std::fs::create_dir_all(parent).map_err(err)?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.log_path)
                .map_err(err)?;
            *guard = Some(file);
        }
        let Some(file) = guard.as_mut() else {
            return Ok(());
        };

        let mut buffer = String::new();
        for row in rows {
            let line = serde_json::to_string(row)
                .map_err(|e| err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
            buffer.push_str(&line);
            buffer.push('\n');
        }
        file.write_all(buffer.as_bytes()).map_err(err)?;
        file.sync_all().map_err(err)?;
        Ok(())
    }

    pub fn write_meta(
        &self,
        processed: usize,
        batches: usize,
        completed: bool,
    ) -> Result<(), PersistenceError> {
        let meta = ProgressMeta {
            session: self.session.clone(),
            processed,
            batches,
            completed,
        };
        let err = |source: std::io::Error| PersistenceError::Checkpoint {
            path: self.meta_path.clone(),
            source,
        };
        let content = serde_json::to_string_pretty(&meta)
            .map_err(|e| err(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;

        if let Some(parent) = self.meta_path.parent() {
            std::fs::create_dir_all(parent).map_err(err)?;
        }
        let tmp = self.meta_path.with_extension("json.tmp");
        std::fs::write(&tmp, content).map_err(err)?;
        std::fs::rename(&tmp, &self.meta_path).map_err(err)
    }

    #[cfg(test)]
    pub fn read_meta(&self) -> Option<ProgressMeta> {
        let content = std::fs::read_to_string(&self.meta_path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Remove the checkpoint artifacts after a clean full run.
    pub fn cleanup(&self) -> anyhow::Result<()> {
        *self.file.lock().unwrap_or_else(|e| e.into_inner()) = None;
        for path in [&self.log_path, &self.meta_path] {
            if path.exists() {
                std::fs::remove_file(path)
                    .with_context(|| format!("Failed to remove {}", path.display()))?;
            }
        }
        log::info!("Progress files cleaned up for session {}", self.session);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Verdict;

    fn row(address: &str) -> OutputRow {
        OutputRow {
            address: address.to_string(),
            secret: "p".to_string(),
            source: "list".to_string(),
            country: "Unknown".to_string(),
            verdict: Verdict::ProbablyValid,
            score: 65,
            diagnostics: vec!["Valid syntax".to_string()],
        }
    }

    #[test]
    fn test_load_without_checkpoint_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "s");
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_append_then_load_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let progress = dir.path().join("progress");

        let store = ProgressStore::new(&progress, "s");
        store.append(&[row("a@x.com"), row("b@x.com")]).unwrap();
        store.append(&[row("c@x.com")]).unwrap();

        let reopened = ProgressStore::new(&progress, "s");
        let loaded = reopened.load().unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2], row("c@x.com"));

        // Sessions do not see each other's checkpoints
        assert!(ProgressStore::new(&progress, "other").load().unwrap().is_empty());
    }

    #[test]
    fn test_torn_last_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "s");
        store.append(&[row("a@x.com")]).unwrap();

        let mut file = OpenOptions::new().append(true).open(store.log_path()).unwrap();
        // Cut off in the middle of a multi-byte character
        file.write_all(b"{\"address\":\"b@x\xc3").unwrap();

        let loaded = ProgressStore::new(dir.path(), "s").load().unwrap();
        assert_eq!(loaded, vec![row("a@x.com")]);
    }

    #[test]
    fn test_meta_and_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path(), "s");
        store.append(&[row("a@x.com")]).unwrap();
        store.write_meta(1, 1, true).unwrap();

        let meta = store.read_meta().unwrap();
        assert_eq!(meta.processed, 1);
        assert!(meta.completed);

        store.cleanup().unwrap();
        assert!(!store.log_path().exists());
        assert!(store.read_meta().is_none());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_unwritable_dir_is_a_checkpoint_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "").unwrap();

        let store = ProgressStore::new(&blocker, "s");
        assert!(matches!(
            store.append(&[row("a@x.com")]),
            Err(PersistenceError::Checkpoint { .. })
        ));
    }
}
