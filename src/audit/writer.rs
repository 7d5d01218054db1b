//! Approval audit trail as JSONL, one file per thread per day.
//!
//! Layout: `<log_dir>/<YYYY-MM-DD>/<thread>.jsonl`. Entries without a thread
//! go to `unscoped.jsonl`. Thread ids are reduced to `[A-Za-z0-9_-]` before
//! they become file names.
//!
//! Submitted and deferred entries are buffered; the entry that records a
//! disposition flushes its thread's file, so every completed approval is on
//! disk with its whole history.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, Utc};
use tracing::{debug, warn};

use super::{AuditEntry, AuditLogger};
use crate::{AppError, Result};

const UNSCOPED: &str = "unscoped";
const MAX_OPEN_THREADS: usize = 64;

/// Open thread files for one calendar day.
struct DayFiles {
    date: NaiveDate,
    threads: HashMap<String, BufWriter<File>>,
}

impl DayFiles {
    fn flush_all(&mut self) -> Result<()> {
        for (thread, file) in &mut self.threads {
            file.flush()
                .map_err(|e| AppError::Io(format!("audit flush failed for {thread}: {e}")))?;
        }
        Ok(())
    }
}

/// Appends approval transitions to per-thread daily JSONL files.
pub struct JsonlAuditWriter {
    log_dir: PathBuf,
    day: Mutex<Option<DayFiles>>,
}

impl JsonlAuditWriter {
    /// Writer rooted at `log_dir`, created with its parents if missing.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if the directory cannot be created.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&log_dir).map_err(|e| {
            AppError::Io(format!(
                "failed to create audit log directory {}: {e}",
                log_dir.display()
            ))
        })?;
        Ok(Self {
            log_dir,
            day: Mutex::new(None),
        })
    }

    /// File that holds entries for `thread_id` on `date`.
    #[must_use]
    pub fn thread_log_path(&self, date: NaiveDate, thread_id: Option<&str>) -> PathBuf {
        self.log_dir
            .join(date.to_string())
            .join(format!("{}.jsonl", file_stem(thread_id)))
    }

    /// Flush every open thread file.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Io`] if a flush fails.
    pub fn flush(&self) -> Result<()> {
        match self.lock()?.as_mut() {
            Some(day) => day.flush_all(),
            None => Ok(()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<DayFiles>>> {
        self.day
            .lock()
            .map_err(|_| AppError::Io("audit writer mutex poisoned".into()))
    }

    fn open(&self, date: NaiveDate, stem: &str) -> Result<BufWriter<File>> {
        let dir = self.log_dir.join(date.to_string());
        fs::create_dir_all(&dir)
            .map_err(|e| AppError::Io(format!("failed to create {}: {e}", dir.display())))?;
        let path = dir.join(format!("{stem}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| {
                AppError::Io(format!("failed to open audit log {}: {e}", path.display()))
            })?;
        debug!(path = %path.display(), "audit file opened");
        Ok(BufWriter::new(file))
    }
}

impl AuditLogger for JsonlAuditWriter {
    fn log_entry(&self, entry: AuditEntry) -> Result<()> {
        let today = Utc::now().date_naive();
        let stem = file_stem(entry.thread_id.as_deref());
        let line = serde_json::to_string(&entry)?;

        let mut guard = self.lock()?;
        if guard.as_ref().is_none_or(|day| day.date != today) {
            if let Some(previous) = guard.as_mut() {
                previous.flush_all()?;
            }
            *guard = Some(DayFiles {
                date: today,
                threads: HashMap::new(),
            });
        }
        let Some(day) = guard.as_mut() else {
            return Ok(());
        };

        if !day.threads.contains_key(&stem) && day.threads.len() >= MAX_OPEN_THREADS {
            day.flush_all()?;
            day.threads.clear();
        }
        let file = match day.threads.entry(stem) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let opened = self.open(today, slot.key())?;
                slot.insert(opened)
            }
        };

        writeln!(file, "{line}").map_err(|e| {
            warn!(%e, "audit write failed");
            AppError::Io(format!("audit write failed: {e}"))
        })?;
        if entry.event_type.is_disposition() {
            file.flush()
                .map_err(|e| AppError::Io(format!("audit flush failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for JsonlAuditWriter {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(%err, "audit flush on drop failed");
        }
    }
}

/// File name stem for a thread id.
fn file_stem(thread_id: Option<&str>) -> String {
    let stem: String = thread_id
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        UNSCOPED.to_owned()
    } else {
        stem
    }
}
