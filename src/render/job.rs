use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::Context as _;

use crate::foundation::config::RendererConfig;
use crate::foundation::error::{PipelineError, PipelineResult};
use crate::gpu::RenderEngine;
use crate::process::{self, Exit};

/// Stable directory/archive name for an asset identifier (UUIDv5 in the DNS namespace).
pub fn save_uid(asset_id: &str) -> String {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_DNS, asset_id.as_bytes()).to_string()
}

/// Where job directories are created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkspaceMode {
    /// A fresh temporary directory per job, removed when the job is dropped.
    Temporary,
    /// `<root>/<save_uid>`, kept across runs so interrupted jobs resume.
    Persistent(PathBuf),
}

/// A job's exclusively owned working directory.
#[derive(Debug)]
pub struct JobDir {
    path: PathBuf,
    _temp: Option<tempfile::TempDir>,
}

impl JobDir {
    pub fn create(mode: &WorkspaceMode, save_uid: &str) -> PipelineResult<Self> {
        let (path, temp) = match mode {
            WorkspaceMode::Temporary => {
                let temp = tempfile::Builder::new()
                    .prefix("turntable-")
                    .tempdir()
                    .context("create temporary job directory")?;
                (temp.path().join(save_uid), Some(temp))
            }
            WorkspaceMode::Persistent(root) => (root.join(save_uid), None),
        };
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create job directory '{}'", path.display()))?;
        Ok(Self { path, _temp: temp })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_temporary(&self) -> bool {
        self._temp.is_some()
    }
}

/// One invocation of the external renderer for one asset.
#[derive(Clone, Debug)]
pub struct RenderJob {
    pub asset_id: String,
    pub local_path: PathBuf,
    pub output_dir: PathBuf,
    /// Expected camera views, when known up front.
    pub num_cameras: Option<u32>,
    pub num_frames_per_camera: u32,
    /// `None` renders on the CPU.
    pub gpu_slot: Option<u32>,
    pub engine: RenderEngine,
    pub only_northern_hemisphere: bool,
    pub timeout: Duration,
}

impl RenderJob {
    /// Arguments after the `--` separator, read by the scene-setup script.
    pub fn script_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![
            "--object_path".into(),
            self.local_path.clone().into(),
            "--num_renders".into(),
            self.num_frames_per_camera.to_string().into(),
            "--output_dir".into(),
            self.output_dir.clone().into(),
            "--engine".into(),
            self.engine.as_arg().into(),
        ];
        if self.only_northern_hemisphere {
            args.push("--only_northern_hemisphere".into());
        }
        args
    }

    pub fn command(&self, renderer: &RendererConfig) -> Command {
        let mut cmd = if renderer.use_xvfb {
            let mut cmd = Command::new("xvfb-run");
            cmd.arg("-a").arg(&renderer.blender);
            cmd
        } else {
            Command::new(&renderer.blender)
        };
        cmd.arg("--background")
            .arg("--python")
            .arg(&renderer.script)
            .arg("--")
            .args(self.script_args());
        if let Some(slot) = self.gpu_slot {
            cmd.env("DISPLAY", format!(":0.{slot}"));
        }
        cmd
    }

    /// Run the renderer to completion or until the timeout kills it.
    #[tracing::instrument(skip(self, renderer), fields(asset = %self.asset_id, gpu = ?self.gpu_slot))]
    pub fn run(&self, renderer: &RendererConfig) -> PipelineResult<()> {
        let mut cmd = self.command(renderer);
        tracing::info!(command = ?cmd, "starting renderer");
        let exit = process::run(&mut cmd, Some(self.timeout)).map_err(|e| {
            PipelineError::render_process(&self.asset_id, format!("failed to spawn renderer: {e}"))
        })?;
        match exit {
            Exit::Finished { status, .. } if status.success() => Ok(()),
            Exit::Finished { status, stderr } => {
                let tail = tail_lines(&stderr, 20);
                Err(PipelineError::render_process(
                    &self.asset_id,
                    format!("renderer exited with status {status}: {tail}"),
                ))
            }
            Exit::TimedOut => Err(PipelineError::RenderTimeout {
                id: self.asset_id.clone(),
                after: self.timeout,
            }),
        }
    }
}

fn tail_lines(text: &str, n: usize) -> String {
    let lines = text.lines().collect::<Vec<_>>();
    lines[lines.len().saturating_sub(n)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> RenderJob {
        RenderJob {
            asset_id: "a1".to_string(),
            local_path: PathBuf::from("/data/glbs/x/a1.glb"),
            output_dir: PathBuf::from("/tmp/w/uid"),
            num_cameras: None,
            num_frames_per_camera: 81,
            gpu_slot: Some(2),
            engine: RenderEngine::Eevee,
            only_northern_hemisphere: true,
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn save_uid_is_stable_uuid_v5() {
        let a = save_uid("a1");
        assert_eq!(a, save_uid("a1"));
        assert_ne!(a, save_uid("a2"));
        let parsed = uuid::Uuid::parse_str(&a).unwrap();
        assert_eq!(parsed.get_version_num(), 5);
    }

    #[test]
    fn command_carries_the_renderer_contract() {
        let renderer = RendererConfig {
            blender: PathBuf::from("/opt/blender"),
            script: PathBuf::from("/opt/scene.py"),
            use_xvfb: true,
        };
        let cmd = job().command(&renderer);
        assert_eq!(cmd.get_program(), "xvfb-run");
        let args = cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        assert_eq!(
            args,
            "-a /opt/blender --background --python /opt/scene.py -- \
             --object_path /data/glbs/x/a1.glb --num_renders 81 --output_dir /tmp/w/uid \
             --engine BLENDER_EEVEE --only_northern_hemisphere"
        );
        let display = cmd
            .get_envs()
            .find(|(k, _)| *k == "DISPLAY")
            .and_then(|(_, v)| v)
            .map(|v| v.to_string_lossy().into_owned());
        assert_eq!(display.as_deref(), Some(":0.2"));
    }

    #[test]
    fn cpu_job_sets_no_display() {
        let mut j = job();
        j.gpu_slot = None;
        j.only_northern_hemisphere = false;
        let cmd = j.command(&RendererConfig {
            use_xvfb: false,
            ..RendererConfig::default()
        });
        assert!(cmd.get_envs().all(|(k, _)| k != "DISPLAY"));
        assert!(cmd.get_args().all(|a| a != "--only_northern_hemisphere"));
    }

    #[test]
    fn temporary_job_dir_is_removed_on_drop() {
        let dir = JobDir::create(&WorkspaceMode::Temporary, "uid").unwrap();
        let path = dir.path().to_path_buf();
        assert!(path.is_dir());
        assert!(dir.is_temporary());
        assert_eq!(path.file_name().unwrap(), "uid");
        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn persistent_job_dir_survives() {
        let root = tempfile::tempdir().unwrap();
        let mode = WorkspaceMode::Persistent(root.path().to_path_buf());
        let path = JobDir::create(&mode, "uid").unwrap().path().to_path_buf();
        assert_eq!(path, root.path().join("uid"));
        assert!(path.is_dir());
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail_lines("a\nb\nc", 2), "b\nc");
        assert_eq!(tail_lines("a", 5), "a");
    }
}
