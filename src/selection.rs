use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::foundation::error::{PipelineError, PipelineResult};
use crate::manifest::{AssetManifest, normalize_id};

/// One asset picked for rendering from local inputs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectedAsset {
    pub id: String,
    pub local_path: PathBuf,
}

/// Window into a list of identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: usize,
    pub count: usize,
}

impl Default for Window {
    fn default() -> Self {
        Self { start: 0, count: 1 }
    }
}

/// Read identifiers from a text file, one per line. Blank lines are ignored.
pub fn read_ids(path: &Path) -> PipelineResult<Vec<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read identifiers '{}'", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(|l| normalize_id(l).to_string())
        .collect())
}

/// Apply `window` to `ids`.
///
/// A start beyond the end is an error. A count running past the end is clamped.
pub fn window<T: Clone>(ids: &[T], window: Window) -> PipelineResult<Vec<T>> {
    if ids.is_empty() {
        return Err(PipelineError::validation("no identifiers to select from"));
    }
    if window.start >= ids.len() {
        return Err(PipelineError::validation(format!(
            "start index {} is out of range, {} identifiers available",
            window.start,
            ids.len()
        )));
    }
    let available = ids.len() - window.start;
    let count = if window.count > available {
        tracing::warn!(
            requested = window.count,
            start = window.start,
            available,
            "fewer identifiers than requested, using all available"
        );
        available
    } else {
        window.count
    };
    Ok(ids[window.start..window.start + count].to_vec())
}

/// Pick assets listed in `objects_file` that `mapping` knows, windowed, with local paths under
/// `root`.
pub fn select_local(
    objects_file: &Path,
    mapping: &AssetManifest,
    root: &Path,
    win: Window,
) -> PipelineResult<Vec<SelectedAsset>> {
    let ids = read_ids(objects_file)?;
    let available = ids
        .into_iter()
        .filter(|id| mapping.contains(id))
        .collect::<Vec<_>>();
    if available.is_empty() {
        return Err(PipelineError::validation(format!(
            "none of the identifiers in '{}' are in the object mapping",
            objects_file.display()
        )));
    }
    let total = available.len();
    let selected = window(&available, win)?;
    tracing::info!(
        selected = selected.len(),
        start = win.start,
        total,
        "selected local objects"
    );
    Ok(selected
        .into_iter()
        .filter_map(|id| {
            let rel = mapping.get(&id)?;
            Some(SelectedAsset {
                local_path: root.join(rel),
                id,
            })
        })
        .collect())
}

/// [`select_local`] with the mapping read from a gzipped JSON file.
pub fn select_local_from_files(
    objects_file: &Path,
    object_paths: &Path,
    root: &Path,
    win: Window,
) -> PipelineResult<Vec<SelectedAsset>> {
    if !object_paths.is_file() {
        return Err(PipelineError::validation(format!(
            "object mapping '{}' not found",
            object_paths.display()
        )));
    }
    let mapping = AssetManifest::from_gz_path(object_paths)?;
    select_local(objects_file, &mapping, root, win)
}
