//! Append-only patch log for committed working texts.
//!
//! Every cascade commit is appended as one JSON line. Undo/redo replay is
//! done by other tools reading this file; here we only append and inspect.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{VerseId, WorkingVerseText};

/// One committed working text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchEntry {
    pub patch_id: Uuid,
    pub verse_id: VerseId,
    pub committed_at: DateTime<Utc>,
    pub payload: WorkingVerseText,
}

/// Narrow commit interface used by the cascade selector
pub trait PatchLog: Send + Sync {
    /// Append a commit and return its patch id
    fn commit_working_text(&self, verse_id: &VerseId, payload: &WorkingVerseText) -> Result<Uuid>;
}

/// JSONL-file patch log
#[derive(Debug, Clone)]
pub struct JsonlPatchLog {
    path: PathBuf,
}

impl JsonlPatchLog {
    /// Open (creating parent directories) a patch log at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create patch log directory: {}", parent.display()))?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay all entries in order
    pub fn entries(&self) -> Result<Vec<PatchEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open patch log: {}", self.path.display()))?;
        file.lock_shared()
            .context("Failed to acquire shared lock on patch log")?;

        let mut entries = Vec::new();
        for line in BufReader::new(&file).lines() {
            let line = line.context("Failed to read patch log")?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: PatchEntry = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse patch entry: {}", line))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Commits for one verse, oldest first
    pub fn history(&self, verse_id: &VerseId) -> Result<Vec<PatchEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| &e.verse_id == verse_id)
            .collect())
    }
}

impl PatchLog for JsonlPatchLog {
    fn commit_working_text(&self, verse_id: &VerseId, payload: &WorkingVerseText) -> Result<Uuid> {
        let entry = PatchEntry {
            patch_id: Uuid::new_v4(),
            verse_id: verse_id.clone(),
            committed_at: Utc::now(),
            payload: payload.clone(),
        };
        let json = serde_json::to_string(&entry).context("Failed to serialize patch entry")?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open patch log: {}", self.path.display()))?;

        // Released when the file is dropped
        file.lock_exclusive()
            .context("Failed to acquire file lock on patch log")?;
        writeln!(file, "{}", json).context("Failed to write patch entry")?;
        file.flush().context("Failed to flush patch entry")?;

        Ok(entry.patch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SelectedSource;
    use tempfile::TempDir;

    fn payload(verse: &str, text: &str) -> WorkingVerseText {
        WorkingVerseText {
            verse_id: verse.parse().unwrap(),
            selected_source: SelectedSource::Witness("aleppo".into()),
            surface_text: text.into(),
            normalized_text: text.into(),
            text_hash: crate::alignment::text_hash(text),
            ensemble_confidence: 0.9,
            flags: vec![],
            reason_codes: vec![],
            computed_at: Utc::now(),
        }
    }

    #[test]
    fn test_commit_appends_and_history_filters() {
        let temp = TempDir::new().unwrap();
        let log = JsonlPatchLog::open(temp.path().join("logs").join("patches.jsonl")).unwrap();

        let g1: VerseId = "Genesis 1:1".parse().unwrap();
        let g2: VerseId = "Genesis 1:2".parse().unwrap();
        let first = log.commit_working_text(&g1, &payload("Genesis 1:1", "א")).unwrap();
        log.commit_working_text(&g2, &payload("Genesis 1:2", "ב")).unwrap();
        let third = log.commit_working_text(&g1, &payload("Genesis 1:1", "ג")).unwrap();
        assert_ne!(first, third);

        assert_eq!(log.entries().unwrap().len(), 3);
        let history = log.history(&g1).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].patch_id, first);
        assert_eq!(history[1].payload.surface_text, "ג");
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp = TempDir::new().unwrap();
        let log = JsonlPatchLog::open(temp.path().join("none.jsonl")).unwrap();
        assert!(log.entries().unwrap().is_empty());
    }
}
