use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::foundation::config::{PipelineConfig, RendererConfig};
use crate::foundation::error::{PipelineError, PipelineResult};
use crate::gpu::{GpuDevices, GpuPool, RenderEngine};
use crate::render::encode::{CameraOutput, FfmpegEncoder};
use crate::render::job::{JobDir, RenderJob, WorkspaceMode, save_uid};
use crate::render::resume::{CameraProgress, FRAMES_DIR, VIDEO_EXT, VIDEOS_DIR, frame_source};

/// Settings for [`RenderOrchestrator`], fixed for a whole run.
#[derive(Clone, Debug)]
pub struct RenderSettings {
    pub renderer: RendererConfig,
    pub num_renders: u32,
    pub num_cameras: Option<u32>,
    pub only_northern_hemisphere: bool,
    pub timeout: Duration,
    pub lease_wait: Duration,
    pub workspace: WorkspaceMode,
}

impl RenderSettings {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            renderer: cfg.renderer.clone(),
            num_renders: cfg.num_renders,
            num_cameras: cfg.num_cameras,
            only_northern_hemisphere: cfg.only_northern_hemisphere,
            timeout: cfg.render_timeout(),
            lease_wait: cfg.lease_wait(),
            workspace: match &cfg.work_dir {
                Some(root) => WorkspaceMode::Persistent(root.clone()),
                None => WorkspaceMode::Temporary,
            },
        }
    }
}

/// Result of one successful render pass.
#[derive(Debug)]
pub struct RenderOutcome {
    pub asset_id: String,
    pub save_uid: String,
    pub gpu_slot: Option<u32>,
    /// The job directory, ready for packaging.
    pub job_dir: JobDir,
    /// The camera encoded by this pass, if any was still missing.
    pub encoded: Option<CameraOutput>,
    /// Cameras that still lack a video after this pass.
    pub pending: Vec<String>,
}

/// Drives one asset through render, resume detection, encode and frame cleanup.
///
/// Each pass encodes at most one camera view: the lexicographically first one without a video.
/// Assets with several missing views need repeated passes, each of which is resumable.
pub struct RenderOrchestrator {
    settings: RenderSettings,
    engine: RenderEngine,
    gpus: GpuPool,
    encoder: FfmpegEncoder,
}

impl RenderOrchestrator {
    pub fn new(settings: RenderSettings, gpus: GpuPool, encoder: FfmpegEncoder) -> PipelineResult<Self> {
        if settings.num_renders == 0 {
            return Err(PipelineError::validation("num_renders must be > 0"));
        }
        let engine = RenderEngine::for_host(gpus.devices())?;
        Ok(Self {
            settings,
            engine,
            gpus,
            encoder,
        })
    }

    /// Override the platform-derived engine choice.
    pub fn with_engine(mut self, engine: RenderEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn devices(&self) -> &GpuDevices {
        self.gpus.devices()
    }

    pub fn engine(&self) -> RenderEngine {
        self.engine
    }

    /// Render `local_path` and advance its job by one camera encode.
    ///
    /// Every failure is asset-scoped; the caller logs it and moves on.
    #[tracing::instrument(skip(self, local_path), fields(path = %local_path.display()))]
    pub fn render(&self, asset_id: &str, local_path: &Path) -> PipelineResult<RenderOutcome> {
        let uid = save_uid(asset_id);
        let job_dir = JobDir::create(&self.settings.workspace, &uid)?;

        let gpu_slot = {
            let lease = self.gpus.acquire(self.settings.lease_wait)?;
            let job = RenderJob {
                asset_id: asset_id.to_string(),
                local_path: local_path.to_path_buf(),
                output_dir: job_dir.path().to_path_buf(),
                num_cameras: self.settings.num_cameras,
                num_frames_per_camera: self.settings.num_renders,
                gpu_slot: lease.as_ref().map(|l| l.index()),
                engine: self.engine,
                only_northern_hemisphere: self.settings.only_northern_hemisphere,
                timeout: self.settings.timeout,
            };
            job.run(&self.settings.renderer)?;
            job.gpu_slot
            // The lease is released here; encoding does not touch the GPU.
        };

        let (encoded, pending) = self.encode_next(asset_id, job_dir.path())?;
        Ok(RenderOutcome {
            asset_id: asset_id.to_string(),
            save_uid: uid,
            gpu_slot,
            job_dir,
            encoded,
            pending,
        })
    }

    /// Resume step on an already rendered job directory: encode the first camera without a
    /// video, then drop the raw frames.
    ///
    /// Returns the encoded camera (if any) and the cameras still missing afterwards.
    pub fn encode_next(
        &self,
        asset_id: &str,
        job_dir: &Path,
    ) -> PipelineResult<(Option<CameraOutput>, Vec<String>)> {
        let progress = CameraProgress::scan(job_dir)?;
        if progress.cameras.is_empty() {
            return Err(PipelineError::render_process(
                asset_id,
                format!("renderer left no camera folders in '{}'", job_dir.display()),
            ));
        }
        if let Some(expected) = self.settings.num_cameras
            && progress.cameras.len() != expected as usize
        {
            tracing::warn!(
                asset = asset_id,
                expected,
                found = progress.cameras.len(),
                "unexpected camera count"
            );
        }

        let Some(camera) = progress.next_to_encode().map(str::to_string) else {
            tracing::info!(asset = asset_id, "every camera already has a video");
            discard_frames(asset_id, job_dir, &job_dir.join(FRAMES_DIR));
            for camera_dir in progress.cameras.values() {
                discard_frames(asset_id, job_dir, camera_dir);
            }
            return Ok((None, Vec::new()));
        };
        let camera_dir = progress.cameras[&camera].clone();
        let frames = frame_source(job_dir, &camera_dir);
        let video_path = job_dir
            .join(VIDEOS_DIR)
            .join(format!("{camera}.{VIDEO_EXT}"));

        let output = self
            .encoder
            .encode(&camera, &frames, self.settings.num_renders, &video_path)?;

        discard_frames(asset_id, job_dir, &frames);

        let pending = progress
            .missing()
            .into_iter()
            .filter(|c| *c != camera)
            .map(str::to_string)
            .collect::<Vec<_>>();
        if !pending.is_empty() {
            tracing::info!(asset = asset_id, remaining = pending.len(), "cameras still pending");
        }
        Ok((Some(output), pending))
    }
}

/// Best-effort [`remove_frames`]: a failure is only logged.
fn discard_frames(asset_id: &str, job_dir: &Path, frames: &Path) {
    if let Err(e) = remove_frames(job_dir, frames) {
        tracing::warn!(asset = asset_id, error = %e, "failed to delete frames");
    }
}

/// Delete consumed raw frames: the whole shared `frames/` folder, or only the numbered images
/// inside a camera folder.
fn remove_frames(job_dir: &Path, frames: &Path) -> PipelineResult<()> {
    if !frames.exists() {
        return Ok(());
    }
    if frames == job_dir.join(FRAMES_DIR) {
        std::fs::remove_dir_all(frames).map_err(|e| {
            PipelineError::cleanup(format!("remove '{}': {e}", frames.display()))
        })?;
        tracing::debug!(dir = %frames.display(), "deleted frames directory");
        return Ok(());
    }
    let entries = std::fs::read_dir(frames)
        .map_err(|e| PipelineError::cleanup(format!("list '{}': {e}", frames.display())))?;
    let pngs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "png"))
        .collect();
    for png in pngs {
        std::fs::remove_file(&png)
            .map_err(|e| PipelineError::cleanup(format!("remove '{}': {e}", png.display())))?;
    }
    Ok(())
}
