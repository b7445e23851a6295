//! Retention trimming of the historical sample log and the report
//! directory. Both operations are idempotent and scheduled externally.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info, warn};

use crate::ReportError;

/// Default cap on the historical sample log.
pub const DEFAULT_MAX_HISTORY_ROWS: usize = 30_000;

/// Default cap on finalized documents in the output directory.
pub const DEFAULT_MAX_REPORTS: usize = 100;

/// Keep only the last `max_rows` rows of the headerless historical log.
///
/// The trimmed file is written beside the original and renamed over it, so
/// a crash mid-rewrite never loses the log. Returns the number of rows
/// removed.
pub fn trim_history(path: &Path, max_rows: usize) -> Result<usize, ReportError> {
    let file = fs::File::open(path).map_err(|e| ReportError::io(path, e))?;
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(file);

    let mut rows: Vec<csv::StringRecord> = Vec::new();
    for record in reader.records() {
        rows.push(record.map_err(|e| ReportError::malformed(path, e))?);
    }
    if rows.len() <= max_rows {
        debug!(rows = rows.len(), max_rows, "history below cap, nothing to trim");
        return Ok(0);
    }
    let removed = rows.len() - max_rows;

    let temp_path = temp_rewrite_path(path);
    {
        let file = fs::File::create(&temp_path).map_err(|e| ReportError::io(&temp_path, e))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_writer(file);
        for record in rows.iter().skip(removed) {
            writer
                .write_record(record)
                .map_err(|e| ReportError::malformed(&temp_path, e))?;
        }
        writer
            .flush()
            .map_err(|e| ReportError::io(&temp_path, e))?;
    }
    fs::rename(&temp_path, path).map_err(|e| ReportError::io(path, e))?;
    info!(removed, kept = max_rows, path = %path.display(), "trimmed history log");
    Ok(removed)
}

fn temp_rewrite_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.tmp"))
}

/// Delete the oldest finalized documents until the directory holds at most
/// `max_files`. A missing directory or an individual delete failure is
/// logged and does not abort the pass. Returns the number of deletions.
pub fn trim_reports(dir: &Path, max_files: usize) -> Result<usize, ReportError> {
    if !dir.exists() {
        warn!(dir = %dir.display(), "report directory does not exist");
        return Ok(0);
    }
    let entries = fs::read_dir(dir).map_err(|e| ReportError::io(dir, e))?;

    let mut documents: Vec<(SystemTime, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ReportError::io(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        let is_final_pdf = name
            .as_deref()
            .map(|n| n.ends_with(".pdf") && !n.ends_with(".tmp.pdf"))
            .unwrap_or(false);
        if !is_final_pdf {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        documents.push((modified, path));
    }

    if documents.len() <= max_files {
        debug!(count = documents.len(), max_files, "report count below cap");
        return Ok(0);
    }

    documents.sort();
    let excess = documents.len() - max_files;
    let mut deleted = 0usize;
    for (_, path) in documents.into_iter().take(excess) {
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted old report");
                deleted += 1;
            }
            Err(error) => warn!(path = %path.display(), %error, "failed to delete report"),
        }
    }
    info!(deleted, kept = max_files, dir = %dir.display(), "trimmed report directory");
    Ok(deleted)
}
