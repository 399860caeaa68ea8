//! Background extraction of uploaded archives.
//!
//! Archives are queued on a channel and extracted by one supervised worker thread, so the
//! render loop never waits for it. Every job reports an [`UnpackEvent`]; [`Unpacker::finish`]
//! drains the queue and returns them all.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use anyhow::Context as _;
use crossbeam_channel::{Receiver, Sender};

use crate::foundation::error::{PipelineError, PipelineResult};
use crate::publish::archive::extract_zip;

/// Appended with one folder name per successfully extracted archive.
pub const EXTRACTED_LIST: &str = "extracted_folders.txt";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpackEvent {
    pub archive: PathBuf,
    /// Extracted folder on success, error message otherwise.
    pub result: Result<PathBuf, String>,
}

impl UnpackEvent {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UnpackSummary {
    pub events: Vec<UnpackEvent>,
}

impl UnpackSummary {
    pub fn extracted(&self) -> usize {
        self.events.iter().filter(|e| e.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.events.len() - self.extracted()
    }
}

struct UnpackJob {
    archive: PathBuf,
}

pub struct Unpacker {
    tx: Option<Sender<UnpackJob>>,
    events: Receiver<UnpackEvent>,
    worker: Option<JoinHandle<()>>,
}

impl Unpacker {
    pub fn spawn() -> PipelineResult<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<UnpackJob>();
        let (event_tx, events) = crossbeam_channel::unbounded();
        let worker = std::thread::Builder::new()
            .name("unpack".to_string())
            .spawn(move || {
                for job in rx {
                    let event = unpack_one(&job.archive);
                    match &event.result {
                        Ok(dir) => tracing::info!(dir = %dir.display(), "unpacked archive"),
                        Err(e) => {
                            tracing::warn!(archive = %job.archive.display(), error = %e, "unpack failed")
                        }
                    }
                    if event_tx.send(event).is_err() {
                        break;
                    }
                }
            })
            .context("spawn unpack worker")?;
        Ok(Self {
            tx: Some(tx),
            events,
            worker: Some(worker),
        })
    }

    /// Queue `archive` for extraction next to itself.
    pub fn submit(&self, archive: PathBuf) -> PipelineResult<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::Other(anyhow::anyhow!("unpacker already finished")))?;
        tx.send(UnpackJob { archive })
            .map_err(|_| PipelineError::Other(anyhow::anyhow!("unpack worker is gone")))
    }

    /// Events reported so far, without blocking.
    pub fn poll(&self) -> Vec<UnpackEvent> {
        self.events.try_iter().collect()
    }

    /// Close the queue, wait for the worker and return every event not yet polled.
    pub fn finish(mut self) -> PipelineResult<UnpackSummary> {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| PipelineError::Other(anyhow::anyhow!("unpack worker panicked")))?;
        }
        Ok(UnpackSummary {
            events: self.events.try_iter().collect(),
        })
    }
}

impl Drop for Unpacker {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            tracing::error!("unpack worker panicked");
        }
    }
}

/// Extract `<dir>/<stem>.zip` into `<dir>/<stem>/` and record `<stem>` in the folder list.
fn unpack_one(archive: &Path) -> UnpackEvent {
    let result = extract_next_to(archive).map_err(|e| e.to_string());
    UnpackEvent {
        archive: archive.to_path_buf(),
        result,
    }
}

fn extract_next_to(archive: &Path) -> PipelineResult<PathBuf> {
    let stem = archive
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| PipelineError::validation(format!("bad archive name '{}'", archive.display())))?;
    let dir = archive.parent().unwrap_or_else(|| Path::new("."));
    let dest = dir.join(stem);
    extract_zip(archive, &dest, Some(stem))?;
    record_extracted(dir, stem)?;
    Ok(dest)
}

fn record_extracted(dir: &Path, name: &str) -> PipelineResult<()> {
    let path = dir.join(EXTRACTED_LIST);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open '{}'", path.display()))?;
    writeln!(file, "{name}").with_context(|| format!("append to '{}'", path.display()))?;
    Ok(())
}

/// Extract every `*.zip` directly inside `dir`, in name order.
///
/// The folder list is rewritten from scratch. Individual failures are reported in the summary
/// and do not stop the rest.
pub fn unpack_dir(dir: &Path) -> PipelineResult<UnpackSummary> {
    let list = dir.join(EXTRACTED_LIST);
    std::fs::write(&list, b"").with_context(|| format!("reset '{}'", list.display()))?;

    let mut archives = std::fs::read_dir(dir)
        .with_context(|| format!("list '{}'", dir.display()))?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|x| x == "zip"))
        .collect::<Vec<_>>();
    archives.sort();

    let mut summary = UnpackSummary::default();
    for archive in archives {
        let event = unpack_one(&archive);
        match &event.result {
            Ok(dest) => tracing::info!(dir = %dest.display(), "unpacked archive"),
            Err(e) => tracing::warn!(archive = %archive.display(), error = %e, "unpack failed"),
        }
        summary.events.push(event);
    }
    Ok(summary)
}
