use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::prelude::*;

use crate::foundation::error::{PipelineError, PipelineResult};
use crate::manifest::ManifestResolver;
use crate::net::{Fetch, fetch_to_path, join_url};

/// Lifecycle of one requested identifier within a coordinator run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssetStatus {
    Unresolved,
    CachedLocally,
    Downloading,
    Downloaded,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: String,
    pub remote_path: Option<String>,
    pub local_path: Option<PathBuf>,
    pub status: AssetStatus,
}

impl AssetRecord {
    fn unresolved(id: &str) -> Self {
        Self {
            id: id.to_string(),
            remote_path: None,
            local_path: None,
            status: AssetStatus::Unresolved,
        }
    }
}

/// Result of one [`DownloadCoordinator::fetch`] call.
#[derive(Debug, Default)]
pub struct DownloadReport {
    /// Identifier → local file for everything present after the run.
    pub paths: BTreeMap<String, PathBuf>,
    /// Identifiers the manifest does not know.
    pub unknown: Vec<String>,
    /// Per-item failures; siblings are unaffected.
    pub failures: Vec<(String, PipelineError)>,
    /// Final record per requested identifier: unknown ones first, then resolved ones.
    pub records: Vec<AssetRecord>,
    /// Number of network downloads performed by this call.
    pub downloaded: usize,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Materializes assets into a local cache directory that mirrors the repository layout.
///
/// Already-present files are never fetched again, and every download lands through an atomic
/// rename, so several coordinators may share one cache directory.
pub struct DownloadCoordinator {
    root: PathBuf,
    base_url: String,
    resolver: Arc<ManifestResolver>,
    fetcher: Arc<dyn Fetch>,
}

impl DownloadCoordinator {
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        resolver: Arc<ManifestResolver>,
        fetcher: Arc<dyn Fetch>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            resolver,
            fetcher,
        }
    }

    pub fn local_path(&self, remote_path: &str) -> PathBuf {
        self.root.join(remote_path)
    }

    /// Ensure every known identifier in `ids` exists locally.
    ///
    /// `parallelism == 1` downloads in input order on the calling thread; larger values use a
    /// dedicated pool of that many workers. Only a manifest failure aborts the call.
    #[tracing::instrument(skip(self, ids), fields(requested = ids.len()))]
    pub fn fetch<S: AsRef<str>>(
        &self,
        ids: &[S],
        parallelism: usize,
    ) -> PipelineResult<DownloadReport> {
        if parallelism == 0 {
            return Err(PipelineError::validation("download parallelism must be >= 1"));
        }
        let resolution = self.resolver.resolve(ids)?;

        let mut report = DownloadReport {
            unknown: resolution.unknown.clone(),
            ..DownloadReport::default()
        };
        report.records = resolution
            .unknown
            .iter()
            .map(|id| AssetRecord::unresolved(id))
            .collect();

        let mut pending = Vec::new();
        for (id, remote_path) in resolution.resolved {
            let local_path = self.local_path(&remote_path);
            if local_path.exists() {
                report.paths.insert(id.clone(), local_path.clone());
                report.records.push(AssetRecord {
                    id,
                    remote_path: Some(remote_path),
                    local_path: Some(local_path),
                    status: AssetStatus::CachedLocally,
                });
            } else {
                pending.push(AssetRecord {
                    id,
                    remote_path: Some(remote_path),
                    local_path: Some(local_path),
                    status: AssetStatus::Downloading,
                });
            }
        }
        if pending.is_empty() {
            return Ok(report);
        }

        let total = pending.len();
        let progress = Progress::start(&self.root, total);
        tracing::info!(total, parallelism, "starting download");

        let results: Vec<(AssetRecord, PipelineResult<()>)> = if parallelism == 1 {
            pending
                .into_iter()
                .map(|rec| {
                    let out = self.download_one(&rec, &progress);
                    (rec, out)
                })
                .collect()
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(parallelism)
                .thread_name(|i| format!("download-{i}"))
                .build()
                .map_err(|e| {
                    PipelineError::validation(format!("failed to build download pool: {e}"))
                })?;
            pool.install(|| {
                pending
                    .into_par_iter()
                    .map(|rec| {
                        let out = self.download_one(&rec, &progress);
                        (rec, out)
                    })
                    .collect()
            })
        };

        for (mut rec, out) in results {
            match out {
                Ok(()) => {
                    rec.status = AssetStatus::Downloaded;
                    report.downloaded += 1;
                    if let Some(path) = &rec.local_path {
                        report.paths.insert(rec.id.clone(), path.clone());
                    }
                }
                Err(e) => {
                    tracing::error!(id = %rec.id, error = %e, "download failed");
                    rec.status = AssetStatus::Failed;
                    report.failures.push((rec.id.clone(), e));
                }
            }
            report.records.push(rec);
        }
        Ok(report)
    }

    fn download_one(&self, rec: &AssetRecord, progress: &Progress) -> PipelineResult<()> {
        let (Some(remote_path), Some(local_path)) = (&rec.remote_path, &rec.local_path) else {
            return Err(PipelineError::download(&rec.id, "record was never resolved"));
        };
        let url = join_url(&self.base_url, remote_path);
        let bytes = fetch_to_path(self.fetcher.as_ref(), &url, local_path)
            .map_err(|msg| PipelineError::download(&rec.id, msg))?;
        tracing::debug!(id = %rec.id, bytes, "downloaded");
        progress.report();
        Ok(())
    }
}

/// Progress derived from the cache directory contents rather than in-memory counters.
struct Progress {
    root: PathBuf,
    start_count: usize,
    total: usize,
}

impl Progress {
    fn start(root: &Path, total: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            start_count: count_cached_meshes(root),
            total,
        }
    }

    fn report(&self) {
        let done = count_cached_meshes(&self.root).saturating_sub(self.start_count);
        tracing::info!("downloaded {done} / {} objects", self.total);
    }
}

/// Count `<root>/glbs/*/*.glb` files.
pub fn count_cached_meshes(root: &Path) -> usize {
    walkdir::WalkDir::new(root.join("glbs"))
        .min_depth(2)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|x| x == "glb"))
        .count()
}
