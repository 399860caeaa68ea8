//! Append-only CSV audit trail of per-asset outcomes.
//!
//! Each category is one file under the log directory. Lines look like
//! `1712345678.123456,<identifier>,<sha256 or empty>[,extra...]`. The files double as a
//! resumability oracle: an identifier with a render-success line has already been published.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender};

use crate::foundation::error::{PipelineError, PipelineResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LogCategory {
    NewObject,
    ModifiedObjectSuccess,
    ModifiedObjectFailure,
    MissingObject,
    RenderSuccess,
    RenderFailure,
}

impl LogCategory {
    pub const ALL: [LogCategory; 6] = [
        Self::NewObject,
        Self::ModifiedObjectSuccess,
        Self::ModifiedObjectFailure,
        Self::MissingObject,
        Self::RenderSuccess,
        Self::RenderFailure,
    ];

    pub fn file_name(self) -> &'static str {
        match self {
            Self::NewObject => "handle-new-object.csv",
            Self::ModifiedObjectSuccess => "handle-modified-object-successful.csv",
            Self::ModifiedObjectFailure => "handle-modified-object-failed.csv",
            Self::MissingObject => "handle-missing-object.csv",
            Self::RenderSuccess => "handle-found-object-successful.csv",
            Self::RenderFailure => "handle-found-object-failed.csv",
        }
    }
}

/// One parsed log line.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    /// Seconds since the Unix epoch.
    pub timestamp: f64,
    pub asset_id: String,
    /// Empty when the content hash was unknown.
    pub sha: String,
    pub extra: Vec<String>,
}

impl LogEntry {
    pub fn parse_line(line: &str) -> Option<Self> {
        let mut parts = line.trim_end_matches(['\r', '\n']).split(',');
        let timestamp = parts.next()?.parse::<f64>().ok()?;
        let asset_id = parts.next()?.to_string();
        if asset_id.is_empty() {
            return None;
        }
        let sha = parts.next().unwrap_or_default().to_string();
        let extra = parts.map(str::to_string).collect();
        Some(Self {
            timestamp,
            asset_id,
            sha,
            extra,
        })
    }
}

enum Msg {
    Append { path: PathBuf, line: String },
    Flush(Sender<Option<String>>),
}

/// Handle to the log directory.
///
/// Appends are queued to one writer thread that owns every file handle. Each write also holds an
/// exclusive advisory lock on its file, so lines from concurrent processes never interleave.
pub struct EventLog {
    dir: PathBuf,
    tx: Option<Sender<Msg>>,
    writer: Option<JoinHandle<()>>,
}

impl EventLog {
    pub fn open(dir: impl Into<PathBuf>) -> PipelineResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create log directory '{}'", dir.display()))?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let writer = std::thread::Builder::new()
            .name("event-log".to_string())
            .spawn(move || write_loop(rx))
            .context("spawn event log writer")?;
        Ok(Self {
            dir,
            tx: Some(tx),
            writer: Some(writer),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, category: LogCategory) -> PathBuf {
        self.dir.join(category.file_name())
    }

    /// Queue one timestamped line. Commas and line breaks inside fields are replaced.
    pub fn append(&self, category: LogCategory, fields: &[&str]) {
        self.append_named(category.file_name(), fields);
    }

    /// Queue a line into an arbitrary file name under the log directory.
    pub fn append_named(&self, file_name: &str, fields: &[&str]) {
        let mut line = format_timestamp(SystemTime::now());
        for field in fields {
            line.push(',');
            line.push_str(&sanitize(field));
        }
        line.push('\n');
        let msg = Msg::Append {
            path: self.dir.join(file_name),
            line,
        };
        if let Some(tx) = &self.tx
            && tx.send(msg).is_err()
        {
            tracing::error!(file_name, "event log writer is gone, dropping entry");
        }
    }

    /// Wait until every queued line is on disk.
    ///
    /// Reports the first write failure since the previous flush.
    pub fn flush(&self) -> PipelineResult<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        tx.send(Msg::Flush(ack_tx))
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("event log writer is gone")))?;
        match ack_rx.recv() {
            Ok(None) => Ok(()),
            Ok(Some(err)) => Err(PipelineError::Other(anyhow::anyhow!(err))),
            Err(_) => Err(PipelineError::Other(anyhow::anyhow!(
                "event log writer stopped before flushing"
            ))),
        }
    }

    /// Parse every well-formed line of a category. Missing files read as empty.
    pub fn read(&self, category: LogCategory) -> PipelineResult<Vec<LogEntry>> {
        self.flush()?;
        read_entries(&self.path(category))
    }

    /// Identifiers with at least one render-success entry.
    pub fn completed_ids(&self) -> PipelineResult<HashSet<String>> {
        Ok(self
            .read(LogCategory::RenderSuccess)?
            .into_iter()
            .map(|e| e.asset_id)
            .collect())
    }
}

impl Drop for EventLog {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            tracing::error!("event log writer panicked");
        }
    }
}

fn write_loop(rx: Receiver<Msg>) {
    let mut first_error: Option<String> = None;
    for msg in rx {
        match msg {
            Msg::Append { path, line } => {
                if let Err(e) = append_locked(&path, line.as_bytes()) {
                    tracing::error!(path = %path.display(), error = %e, "failed to append log line");
                    first_error.get_or_insert_with(|| format!("{}: {e}", path.display()));
                }
            }
            Msg::Flush(ack) => {
                let _ = ack.send(first_error.take());
            }
        }
    }
}

fn append_locked(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock()?;
    let out = file.write_all(bytes).and_then(|()| file.flush());
    file.unlock()?;
    out
}

/// Parse a log file, skipping malformed lines with a warning.
pub fn read_entries(path: &Path) -> PipelineResult<Vec<LogEntry>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(anyhow::Error::new(e)
                .context(format!("read log '{}'", path.display()))
                .into());
        }
    };
    let mut out = Vec::new();
    for (n, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match LogEntry::parse_line(line) {
            Some(entry) => out.push(entry),
            None => tracing::warn!(path = %path.display(), line = n + 1, "skipping malformed log line"),
        }
    }
    Ok(out)
}

fn format_timestamp(t: SystemTime) -> String {
    let secs = t
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    format!("{secs:.6}")
}

fn sanitize(field: &str) -> String {
    field.replace([',', '\n', '\r'], " ")
}
