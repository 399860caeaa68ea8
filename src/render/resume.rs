use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::foundation::error::PipelineResult;

/// Prefix of the per-camera folders the renderer writes (`cameras_cam01`).
pub const CAMERA_DIR_PREFIX: &str = "cameras_";
/// Shared raw-frame folder holding `000.png`, `001.png`, ...
pub const FRAMES_DIR: &str = "frames";
/// Encoded videos, one `<camera>.mp4` per camera.
pub const VIDEOS_DIR: &str = "videos";
pub const VIDEO_EXT: &str = "mp4";

/// Camera-view names are `cam` followed by digits.
pub fn is_camera_name(name: &str) -> bool {
    name.strip_prefix("cam")
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Camera name for a job-directory entry: `cameras_cam01` and `cam01` both map to `cam01`.
pub fn camera_name_of_dir(dir_name: &str) -> Option<&str> {
    let name = dir_name.strip_prefix(CAMERA_DIR_PREFIX).unwrap_or(dir_name);
    is_camera_name(name).then_some(name)
}

/// Which camera views a job directory holds and which already have a video.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CameraProgress {
    /// Camera name → its folder, ordered by name.
    pub cameras: BTreeMap<String, PathBuf>,
    /// Cameras with an encoded video (including videos whose folder is gone).
    pub encoded: Vec<String>,
}

impl CameraProgress {
    pub fn scan(job_dir: &Path) -> PipelineResult<Self> {
        let mut out = Self::default();
        let entries = std::fs::read_dir(job_dir)
            .with_context(|| format!("list job directory '{}'", job_dir.display()))?;
        for entry in entries {
            let entry =
                entry.with_context(|| format!("read entry in '{}'", job_dir.display()))?;
            let file_type = entry
                .file_type()
                .with_context(|| format!("stat '{}'", entry.path().display()))?;
            if !file_type.is_dir() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str().and_then(camera_name_of_dir) else {
                continue;
            };
            out.cameras.insert(name.to_string(), entry.path());
        }

        let videos = job_dir.join(VIDEOS_DIR);
        if videos.is_dir() {
            for entry in std::fs::read_dir(&videos)
                .with_context(|| format!("list videos '{}'", videos.display()))?
            {
                let path = entry
                    .with_context(|| format!("read entry in '{}'", videos.display()))?
                    .path();
                if path.extension().is_some_and(|e| e == VIDEO_EXT)
                    && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
                {
                    out.encoded.push(stem.to_string());
                }
            }
        }
        out.encoded.sort();
        Ok(out)
    }

    /// Cameras that still need a video, in lexicographic order.
    pub fn missing(&self) -> Vec<&str> {
        self.cameras
            .keys()
            .map(String::as_str)
            .filter(|cam| !self.encoded.iter().any(|e| e == cam))
            .collect()
    }

    /// The single camera the next pass encodes.
    pub fn next_to_encode(&self) -> Option<&str> {
        self.missing().into_iter().next()
    }

    pub fn is_complete(&self) -> bool {
        !self.cameras.is_empty() && self.missing().is_empty()
    }
}

/// Where the raw frames for `camera` live.
///
/// A camera folder holding its own `000.png` sequence wins; otherwise the shared `frames/`
/// folder carries the most recently rendered view.
pub fn frame_source(job_dir: &Path, camera_dir: &Path) -> PathBuf {
    if camera_dir.join(frame_file_name(0)).is_file() {
        camera_dir.to_path_buf()
    } else {
        job_dir.join(FRAMES_DIR)
    }
}

pub fn frame_file_name(index: u32) -> String {
    format!("{index:03}.png")
}

/// Printf-style input pattern for the encoder.
pub const FRAME_PATTERN: &str = "%03d.png";
