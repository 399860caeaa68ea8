//! Packaging finished job directories and handing them to a storage backend.

use std::path::{Path, PathBuf};

use crate::foundation::error::{PipelineError, PipelineResult};

pub mod archive;
pub mod storage;
pub mod unpack;

pub use storage::{LocalBackend, SshBackend, StorageBackend, backend_for};
pub use unpack::{UnpackEvent, UnpackSummary, Unpacker};

/// Destination subfolder that receives the archives.
pub const RENDERS_DIR: &str = "renders";

/// A successfully uploaded archive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedArtifact {
    /// Backend-relative path, `renders/<save_uid>.zip`.
    pub remote_path: String,
    /// Where the backend placed it, for logs.
    pub location: String,
    pub files: usize,
    /// Whether an older archive of the same name was replaced.
    pub replaced: bool,
}

pub struct Publisher {
    backend: Box<dyn StorageBackend>,
    unpacker: Option<Unpacker>,
}

impl Publisher {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self {
            backend,
            unpacker: None,
        }
    }

    pub fn for_destination(url: &str) -> PipelineResult<Self> {
        Ok(Self::new(backend_for(url)?))
    }

    /// Queue uploaded archives on `unpacker` when the backend is local.
    pub fn with_unpacker(mut self, unpacker: Unpacker) -> Self {
        self.unpacker = Some(unpacker);
        self
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        self.backend.as_ref()
    }

    /// Zip `working_dir`, replace any archive of the same name at the destination, then upload.
    ///
    /// The local archive is written next to `working_dir` and removed afterwards.
    #[tracing::instrument(skip(self, working_dir), fields(dir = %working_dir.display()))]
    pub fn publish(&self, working_dir: &Path, save_uid: &str) -> PipelineResult<PublishedArtifact> {
        let archive = local_archive_path(working_dir);
        let files = archive::zip_dir(working_dir, &archive)?;
        let uploaded = self.upload(&archive, save_uid);
        if let Err(e) = std::fs::remove_file(&archive) {
            tracing::warn!(archive = %archive.display(), error = %e, "failed to remove local archive");
        }
        let (remote_path, replaced) = uploaded?;

        let location = self.backend.describe(&remote_path);
        tracing::info!(location = %location, files, replaced, "uploaded archive");

        if let Some(unpacker) = &self.unpacker {
            match self.backend.local_path(&remote_path) {
                Some(local) => unpacker.submit(local)?,
                None => tracing::info!(location = %location, "remote destination, skipping unpack"),
            }
        }
        Ok(PublishedArtifact {
            remote_path,
            location,
            files,
            replaced,
        })
    }

    fn upload(&self, archive: &Path, save_uid: &str) -> PipelineResult<(String, bool)> {
        let remote_path = format!("{RENDERS_DIR}/{save_uid}.zip");
        self.backend
            .make_dirs(RENDERS_DIR)
            .map_err(|e| PipelineError::upload(format!("prepare destination: {e}")))?;

        let replaced = self
            .backend
            .exists(&remote_path)
            .map_err(|e| PipelineError::upload(format!("check destination: {e}")))?;
        if replaced {
            tracing::info!(path = %remote_path, "removing stale archive");
            if let Err(e) = self.backend.remove(&remote_path) {
                tracing::warn!(path = %remote_path, error = %e, "failed to remove stale archive");
            }
        }
        self.backend.put(archive, &remote_path).map_err(|e| match e {
            PipelineError::Upload(_) => e,
            other => PipelineError::upload(other.to_string()),
        })?;
        Ok((remote_path, replaced))
    }

    /// Poll unpack events reported so far.
    pub fn unpack_events(&self) -> Vec<UnpackEvent> {
        self.unpacker.as_ref().map(Unpacker::poll).unwrap_or_default()
    }

    /// Stop the unpack worker, if any, and collect its remaining events.
    pub fn finish(mut self) -> PipelineResult<UnpackSummary> {
        match self.unpacker.take() {
            Some(unpacker) => unpacker.finish(),
            None => Ok(UnpackSummary::default()),
        }
    }
}

fn local_archive_path(dir: &Path) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".zip");
    dir.with_file_name(name)
}
