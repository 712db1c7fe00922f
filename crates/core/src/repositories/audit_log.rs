//! Append-only audit log storage.
//!
//! Entries are JSON files partitioned by month:
//!
//! ```text
//! audit_log/
//!   2026/
//!     10/
//!       <timestamp-uuid>.json
//! ```
//!
//! Ids are time-prefixed, so sorting file names within a month sorts entries chronologically.
//! Entries are written once and never rewritten; the only removal path is the retention purge.

use crate::domain::audit::AuditLogEntry;
use crate::ids::AuditLogId;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Datelike, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct AuditLogRepository {
    root: PathBuf,
}

impl AuditLogRepository {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn month_dir(&self, at: DateTime<Utc>) -> PathBuf {
        self.root
            .join(format!("{:04}", at.year()))
            .join(format!("{:02}", at.month()))
    }

    /// Persist a new entry.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Conflict`] if an entry with the same id already exists; existing
    /// entries are never overwritten.
    pub fn append(&self, entry: &AuditLogEntry) -> CoreResult<()> {
        let dir = self.month_dir(entry.timestamp);
        fs::create_dir_all(&dir).map_err(CoreError::StorageDirCreation)?;

        let json = serde_json::to_string_pretty(entry).map_err(CoreError::JsonSerialization)?;
        let path = dir.join(format!("{}.json", entry.id));
        let tmp = dir.join(format!(".{}.tmp", entry.id));
        fs::write(&tmp, json).map_err(CoreError::FileWrite)?;

        // hard_link refuses to replace an existing file, unlike rename
        let linked = fs::hard_link(&tmp, &path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CoreError::Conflict(format!(
                "audit entry {} already exists",
                entry.id
            ))),
            Err(e) => Err(CoreError::FileWrite(e)),
        }
    }

    /// Every entry, oldest first.
    pub fn list_all(&self) -> CoreResult<Vec<AuditLogEntry>> {
        self.list_since(None)
    }

    /// Entries with a timestamp at or after `since`, oldest first. Whole months before `since`
    /// are skipped without being read.
    pub fn list_since(&self, since: Option<DateTime<Utc>>) -> CoreResult<Vec<AuditLogEntry>> {
        let mut entries = Vec::new();
        for path in self.entry_files(since)? {
            let parsed = fs::read_to_string(&path)
                .map_err(CoreError::FileRead)
                .and_then(|contents| {
                    serde_json::from_str::<AuditLogEntry>(&contents)
                        .map_err(CoreError::JsonDeserialization)
                });
            match parsed {
                Ok(entry) if since.is_none_or(|s| entry.timestamp >= s) => entries.push(entry),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("failed to parse audit entry: {} - {}", path.display(), e);
                }
            }
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    pub fn count(&self) -> CoreResult<usize> {
        Ok(self.entry_files(None)?.len())
    }

    /// Delete entries whose timestamp is strictly before `cutoff`. Returns the number removed.
    ///
    /// The timestamp is read from the file name, so unreadable entries are purged on schedule
    /// like any other.
    pub fn remove_older_than(&self, cutoff: DateTime<Utc>) -> CoreResult<usize> {
        let mut removed = 0;
        for path in self.entry_files(None)? {
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| AuditLogId::parse(s).ok())
            else {
                tracing::warn!("skipping unrecognised audit file: {}", path.display());
                continue;
            };
            if id.inner().timestamp() < cutoff {
                fs::remove_file(&path).map_err(CoreError::FileRemove)?;
                removed += 1;
            }
        }
        self.prune_empty_dirs();
        Ok(removed)
    }

    fn entry_files(&self, since: Option<DateTime<Utc>>) -> CoreResult<Vec<PathBuf>> {
        let since_month = since.map(|s| (s.year(), s.month()));
        let mut files = Vec::new();
        for year_dir in subdirs(&self.root)? {
            let Some(year) = dir_number::<i32>(&year_dir) else { continue };
            if since_month.is_some_and(|(y, _)| year < y) {
                continue;
            }
            for month_dir in subdirs(&year_dir)? {
                let Some(month) = dir_number::<u32>(&month_dir) else { continue };
                if since_month.is_some_and(|(y, m)| (year, month) < (y, m)) {
                    continue;
                }
                let iter = fs::read_dir(&month_dir).map_err(CoreError::FileRead)?;
                files.extend(
                    iter.flatten()
                        .map(|e| e.path())
                        .filter(|p| p.extension().is_some_and(|ext| ext == "json")),
                );
            }
        }
        files.sort();
        Ok(files)
    }

    fn prune_empty_dirs(&self) {
        let Ok(years) = subdirs(&self.root) else { return };
        for year_dir in years {
            if let Ok(months) = subdirs(&year_dir) {
                for month_dir in months {
                    let _ = fs::remove_dir(&month_dir);
                }
            }
            let _ = fs::remove_dir(&year_dir);
        }
    }
}

fn subdirs(dir: &Path) -> CoreResult<Vec<PathBuf>> {
    match fs::read_dir(dir) {
        Ok(iter) => {
            let mut out: Vec<PathBuf> = iter
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            out.sort();
            Ok(out)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(CoreError::FileRead(e)),
    }
}

fn dir_number<T: std::str::FromStr>(dir: &Path) -> Option<T> {
    dir.file_name()?.to_str()?.parse().ok()
}
