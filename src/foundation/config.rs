use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;

use crate::foundation::error::{PipelineError, PipelineResult};
use crate::gpu::GpuDevices;

/// Mirror the original dataset layout so existing caches are picked up.
pub const DEFAULT_DATA_ROOT: &str = "~/.objaverse";
pub const DEFAULT_REMOTE_BASE: &str = "https://hf-mirror.com/datasets/allenai/objaverse/resolve/main";

/// Run-scoped configuration shared by every stage.
///
/// Loaded from JSON with [`PipelineConfig::from_path`] (all fields optional) and then overridden
/// by CLI flags. Paths may start with `~`; call [`PipelineConfig::expanded`] before use.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Local asset cache root; assets land at `<root>/<manifest path>`.
    pub download_root: PathBuf,
    /// Base URL that manifest-relative paths are appended to.
    pub remote_base_url: String,
    /// Destination for packaged renders: a path, `file://` URL or `ssh://` URL.
    pub render_dir: String,
    /// Persistent job directory root. `None` renders into fresh temporary directories.
    pub work_dir: Option<PathBuf>,
    /// Frames rendered per camera view.
    pub num_renders: u32,
    /// Expected camera views per asset, if known up front.
    pub num_cameras: Option<u32>,
    /// Download pool size. `None` uses the host core count.
    pub processes: Option<usize>,
    /// `None` detects the device count at startup.
    pub gpu_devices: Option<GpuDevices>,
    pub render_timeout_secs: u64,
    /// How long to wait for a free GPU lease. `None` waits as long as one render may take.
    pub lease_wait_secs: Option<u64>,
    pub lease_dir: Option<PathBuf>,
    pub only_northern_hemisphere: bool,
    pub renderer: RendererConfig,
    pub encoder: EncoderConfig,
    pub log_dir: PathBuf,
    /// Skip assets that already have a render-success log entry.
    pub skip_completed: bool,
    /// Queue uploaded archives for background extraction.
    pub unpack_after_upload: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DATA_ROOT),
            remote_base_url: DEFAULT_REMOTE_BASE.to_string(),
            render_dir: format!("{DEFAULT_DATA_ROOT}/renders"),
            work_dir: None,
            num_renders: 81,
            num_cameras: None,
            processes: None,
            gpu_devices: None,
            render_timeout_secs: 9000,
            lease_wait_secs: None,
            lease_dir: None,
            only_northern_hemisphere: false,
            renderer: RendererConfig::default(),
            encoder: EncoderConfig::default(),
            log_dir: PathBuf::from(DEFAULT_DATA_ROOT).join("logs"),
            skip_completed: false,
            unpack_after_upload: true,
        }
    }
}

/// External renderer invocation settings.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    pub blender: PathBuf,
    pub script: PathBuf,
    /// Wrap the renderer in `xvfb-run -a` to give it a virtual display.
    pub use_xvfb: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            blender: PathBuf::from("/data1/blender-3.2.2-linux-x64/blender"),
            script: PathBuf::from("blender_script.py"),
            use_xvfb: true,
        }
    }
}

/// Frame-sequence to video encoder settings.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EncoderConfig {
    pub ffmpeg: PathBuf,
    pub frame_rate: u32,
    /// x264 constant rate factor (0-51, lower is better quality).
    pub crf: u8,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            frame_rate: 30,
            crf: 23,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_path(path: &Path) -> PipelineResult<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config '{}'", path.display()))?;
        serde_json::from_str(&text).map_err(|e| {
            PipelineError::validation(format!("invalid config '{}': {e}", path.display()))
        })
    }

    pub fn validate(&self) -> PipelineResult<()> {
        if self.num_renders == 0 {
            return Err(PipelineError::validation("num_renders must be > 0"));
        }
        if self.num_cameras == Some(0) {
            return Err(PipelineError::validation("num_cameras must be > 0 when set"));
        }
        if self.processes == Some(0) {
            return Err(PipelineError::validation("processes must be >= 1 when set"));
        }
        if self.render_timeout_secs == 0 {
            return Err(PipelineError::validation("render_timeout_secs must be > 0"));
        }
        if self.encoder.frame_rate == 0 {
            return Err(PipelineError::validation("encoder frame_rate must be > 0"));
        }
        if self.encoder.crf > 51 {
            return Err(PipelineError::validation("encoder crf must be within 0..=51"));
        }
        if let Some(devices) = &self.gpu_devices {
            devices.validate()?;
        }
        if self.remote_base_url.trim().is_empty() {
            return Err(PipelineError::validation("remote_base_url must be non-empty"));
        }
        Ok(())
    }

    /// Copy with every `~`-prefixed path resolved against the home directory.
    pub fn expanded(&self) -> Self {
        let mut out = self.clone();
        out.download_root = expand_home(&self.download_root);
        out.log_dir = expand_home(&self.log_dir);
        out.work_dir = self.work_dir.as_deref().map(expand_home);
        out.lease_dir = self.lease_dir.as_deref().map(expand_home);
        out.renderer.blender = expand_home(&self.renderer.blender);
        out.renderer.script = expand_home(&self.renderer.script);
        if !self.render_dir.contains("://") {
            out.render_dir = expand_home(Path::new(&self.render_dir))
                .to_string_lossy()
                .into_owned();
        }
        out
    }

    pub fn render_timeout(&self) -> Duration {
        Duration::from_secs(self.render_timeout_secs)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_secs(self.lease_wait_secs.unwrap_or(self.render_timeout_secs))
    }

    pub fn lease_dir(&self) -> PathBuf {
        self.lease_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("turntable-gpu-leases"))
    }

    pub fn download_parallelism(&self) -> usize {
        self.processes.unwrap_or_else(host_cpu_count)
    }
}

/// Replace a leading `~` with the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match dirs::home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

pub fn host_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"num_renders": 12, "gpu_devices": [1, 3]}"#).unwrap();
        assert_eq!(cfg.num_renders, 12);
        assert_eq!(cfg.gpu_devices, Some(GpuDevices::List(vec![1, 3])));
        assert_eq!(cfg.encoder.frame_rate, 30);
        assert_eq!(cfg.render_timeout_secs, 9000);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = serde_json::from_str::<PipelineConfig>(r#"{"num_render": 12}"#);
        assert!(err.is_err());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let cfg = PipelineConfig {
            num_renders: 0,
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PipelineConfig {
            processes: Some(0),
            ..PipelineConfig::default()
        };
        assert!(cfg.validate().is_err());

        let mut cfg = PipelineConfig::default();
        cfg.encoder.crf = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn expand_home_leaves_other_paths_alone() {
        assert_eq!(expand_home(Path::new("/abs/x")), PathBuf::from("/abs/x"));
        assert_eq!(expand_home(Path::new("rel/x")), PathBuf::from("rel/x"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expand_home(Path::new("~/logs")), home.join("logs"));
        }
    }

    #[test]
    fn expanded_keeps_remote_render_dir() {
        let cfg = PipelineConfig {
            render_dir: "ssh://host/data/renders".to_string(),
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.expanded().render_dir, "ssh://host/data/renders");
    }

    #[test]
    fn lease_wait_defaults_to_render_timeout() {
        let cfg = PipelineConfig {
            render_timeout_secs: 40,
            ..PipelineConfig::default()
        };
        assert_eq!(cfg.lease_wait(), Duration::from_secs(40));
    }
}
