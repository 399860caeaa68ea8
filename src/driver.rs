//! Sequential per-asset loop: render, publish, record.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use sha2::Digest as _;

use crate::eventlog::{EventLog, LogCategory};
use crate::foundation::error::{PipelineError, PipelineResult};
use crate::publish::{PublishedArtifact, Publisher, UnpackSummary};
use crate::render::orchestrator::RenderOrchestrator;
use crate::selection::SelectedAsset;

#[derive(Debug, Default)]
pub struct DriverSummary {
    pub rendered: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Camera views still without a video across rendered assets.
    pub pending_cameras: usize,
    pub unpack: UnpackSummary,
}

/// Which log files a render pass reports to.
#[derive(Clone, Copy)]
enum Reporting {
    FoundObject,
    Silent,
}

pub struct Driver {
    orchestrator: RenderOrchestrator,
    publisher: Publisher,
    log: EventLog,
    skip_completed: bool,
}

impl Driver {
    pub fn new(orchestrator: RenderOrchestrator, publisher: Publisher, log: EventLog) -> Self {
        Self {
            orchestrator,
            publisher,
            log,
            skip_completed: false,
        }
    }

    /// Skip assets that already have a render-success log entry.
    pub fn skip_completed(mut self, yes: bool) -> Self {
        self.skip_completed = yes;
        self
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    /// Process `assets` one after another.
    ///
    /// Asset failures are logged and counted. Only run-fatal errors end the loop early.
    pub fn run(self, assets: &[SelectedAsset]) -> PipelineResult<DriverSummary> {
        let completed: HashSet<String> = if self.skip_completed {
            self.log.completed_ids()?
        } else {
            HashSet::new()
        };

        let mut summary = DriverSummary::default();
        for (i, asset) in assets.iter().enumerate() {
            if completed.contains(&asset.id) {
                tracing::info!(asset = %asset.id, "already rendered, skipping");
                summary.skipped += 1;
                continue;
            }
            tracing::info!(asset = %asset.id, n = i + 1, total = assets.len(), "rendering");
            match self.process_found_object(asset) {
                Ok(pending) => {
                    summary.rendered += 1;
                    summary.pending_cameras += pending;
                }
                Err(e) if e.is_asset_scoped() => summary.failed += 1,
                Err(e) => return Err(e),
            }
            summary.unpack.events.extend(self.publisher.unpack_events());
        }

        let Self { publisher, log, .. } = self;
        summary.unpack.events.extend(publisher.finish()?.events);
        log.flush()?;
        tracing::info!(
            rendered = summary.rendered,
            skipped = summary.skipped,
            failed = summary.failed,
            unpacked = summary.unpack.extracted(),
            "run finished"
        );
        Ok(summary)
    }

    /// Render and publish one asset, recording the outcome in the found-object logs.
    ///
    /// Returns the number of camera views still missing a video.
    pub fn process_found_object(&self, asset: &SelectedAsset) -> PipelineResult<usize> {
        let sha = file_sha256(&asset.local_path);
        self.render_and_publish(asset, &sha, Reporting::FoundObject)
            .map(|(_, pending)| pending)
    }

    /// Re-render an asset whose content changed, reporting to the modified-object logs only.
    pub fn process_modified_object(&self, asset: &SelectedAsset, old_sha: &str) -> bool {
        let new_sha = file_sha256(&asset.local_path);
        let ok = self
            .render_and_publish(asset, &new_sha, Reporting::Silent)
            .is_ok();
        let category = if ok {
            LogCategory::ModifiedObjectSuccess
        } else {
            LogCategory::ModifiedObjectFailure
        };
        self.log.append(category, &[asset.id.as_str(), old_sha, new_sha.as_str()]);
        ok
    }

    pub fn record_new_object(&self, id: &str, sha: &str) {
        self.log.append(LogCategory::NewObject, &[id, sha]);
    }

    pub fn record_missing_object(&self, id: &str, sha: &str) {
        self.log.append(LogCategory::MissingObject, &[id, sha]);
    }

    fn render_and_publish(
        &self,
        asset: &SelectedAsset,
        sha: &str,
        reporting: Reporting,
    ) -> PipelineResult<(PublishedArtifact, usize)> {
        let result = self.render_and_publish_inner(asset);
        match (&result, reporting) {
            (Ok(_), Reporting::FoundObject) => {
                self.log.append(LogCategory::RenderSuccess, &[asset.id.as_str(), sha]);
            }
            (Err(e), Reporting::FoundObject) => {
                self.log
                    .append(LogCategory::RenderFailure, &[asset.id.as_str(), sha, e.to_string().as_str()]);
            }
            (_, Reporting::Silent) => {}
        }
        if let Err(e) = &result {
            tracing::error!(asset = %asset.id, error = %e, "asset failed");
        }
        result
    }

    fn render_and_publish_inner(
        &self,
        asset: &SelectedAsset,
    ) -> PipelineResult<(PublishedArtifact, usize)> {
        if !asset.local_path.is_file() {
            return Err(PipelineError::render_process(
                &asset.id,
                format!("asset file '{}' does not exist", asset.local_path.display()),
            ));
        }
        let outcome = self.orchestrator.render(&asset.id, &asset.local_path)?;
        let published = self
            .publisher
            .publish(outcome.job_dir.path(), &outcome.save_uid)?;
        Ok((published, outcome.pending.len()))
    }
}

/// Lowercase hex SHA-256 of a file, or an empty string when it cannot be read.
pub fn file_sha256(path: &Path) -> String {
    let digest = File::open(path).and_then(|f| {
        let mut hasher = sha2::Sha256::new();
        std::io::copy(&mut BufReader::new(f), &mut hasher)?;
        Ok(hasher.finalize())
    });
    match digest {
        Ok(d) => format!("{d:x}"),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot hash asset");
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.glb");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(
            file_sha256(&path),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(file_sha256(&dir.path().join("missing.glb")), "");
    }
}
