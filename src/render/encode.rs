use std::path::{Path, PathBuf};
use std::process::Command;

use crate::foundation::config::EncoderConfig;
use crate::foundation::error::{PipelineError, PipelineResult};
use crate::process::{self, Exit};
use crate::render::resume::FRAME_PATTERN;

/// One encoded camera view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CameraOutput {
    pub camera_name: String,
    pub frame_count: u32,
    pub video_path: PathBuf,
}

/// Turns a numbered PNG sequence into an H.264 MP4 through the system `ffmpeg`.
#[derive(Clone, Debug)]
pub struct FfmpegEncoder {
    cfg: EncoderConfig,
}

impl FfmpegEncoder {
    pub fn new(cfg: EncoderConfig) -> PipelineResult<Self> {
        if cfg.frame_rate == 0 {
            return Err(PipelineError::validation("encoder frame_rate must be non-zero"));
        }
        if cfg.crf > 51 {
            return Err(PipelineError::validation("encoder crf must be within 0..=51"));
        }
        Ok(Self { cfg })
    }

    /// Arguments for encoding `frames_dir/%03d.png` into `out_path`.
    pub fn args(&self, frames_dir: &Path, frame_count: u32, out_path: &Path) -> Vec<String> {
        let input = frames_dir.join(FRAME_PATTERN);
        vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-framerate".to_string(),
            self.cfg.frame_rate.to_string(),
            "-start_number".to_string(),
            "0".to_string(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
            "-frames:v".to_string(),
            frame_count.to_string(),
            // h264 + yuv420p for broad player compatibility.
            "-c:v".to_string(),
            "libx264".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
            "-crf".to_string(),
            self.cfg.crf.to_string(),
            out_path.to_string_lossy().into_owned(),
        ]
    }

    /// Encode one camera's frames. Blocks until the encoder exits; there is no timeout.
    #[tracing::instrument(skip(self, frames_dir, out_path), fields(out = %out_path.display()))]
    pub fn encode(
        &self,
        camera_name: &str,
        frames_dir: &Path,
        frame_count: u32,
        out_path: &Path,
    ) -> PipelineResult<CameraOutput> {
        if frame_count == 0 {
            return Err(PipelineError::encode("frame_count must be > 0"));
        }
        if !frames_dir.is_dir() {
            return Err(PipelineError::encode(format!(
                "frame directory '{}' does not exist",
                frames_dir.display()
            )));
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PipelineError::encode(format!(
                    "failed to create video directory '{}': {e}",
                    parent.display()
                ))
            })?;
        }
        if !process::is_on_path(&self.cfg.ffmpeg) {
            return Err(PipelineError::encode(format!(
                "'{}' is required for video encoding, but could not be run",
                self.cfg.ffmpeg.display()
            )));
        }

        let mut cmd = Command::new(&self.cfg.ffmpeg);
        cmd.args(self.args(frames_dir, frame_count, out_path));
        let exit = process::run(&mut cmd, None).map_err(|e| {
            PipelineError::encode(format!(
                "failed to spawn '{}': {e}",
                self.cfg.ffmpeg.display()
            ))
        })?;
        match exit {
            Exit::Finished { status, .. } if status.success() => {}
            Exit::Finished { status, stderr } => {
                return Err(PipelineError::encode(format!(
                    "ffmpeg exited with status {status}: {stderr}"
                )));
            }
            Exit::TimedOut => return Err(PipelineError::encode("ffmpeg timed out")),
        }
        if !out_path.is_file() {
            return Err(PipelineError::encode(format!(
                "ffmpeg reported success but '{}' is missing",
                out_path.display()
            )));
        }

        tracing::info!(camera = camera_name, frames = frame_count, "encoded camera video");
        Ok(CameraOutput {
            camera_name: camera_name.to_string(),
            frame_count,
            video_path: out_path.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_follow_the_fixed_encode_contract() {
        let enc = FfmpegEncoder::new(EncoderConfig::default()).unwrap();
        let args = enc.args(Path::new("/w/frames"), 81, Path::new("/w/videos/cam01.mp4"));
        let joined = args.join(" ");
        assert!(joined.contains("-framerate 30"));
        assert!(joined.contains("-start_number 0 -i /w/frames/%03d.png"));
        assert!(joined.contains("-frames:v 81"));
        assert!(joined.contains("-c:v libx264 -pix_fmt yuv420p -crf 23"));
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(args.last().map(String::as_str), Some("/w/videos/cam01.mp4"));
    }

    #[test]
    fn rejects_bad_settings() {
        let cfg = EncoderConfig {
            frame_rate: 0,
            ..EncoderConfig::default()
        };
        assert!(FfmpegEncoder::new(cfg).is_err());
    }

    #[test]
    fn missing_frames_is_an_encode_error() {
        let enc = FfmpegEncoder::new(EncoderConfig::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let err = enc
            .encode("cam00", &dir.path().join("frames"), 10, &dir.path().join("v.mp4"))
            .unwrap_err();
        assert!(matches!(err, PipelineError::Encode(_)));
    }

    #[test]
    fn missing_encoder_binary_is_an_encode_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("frames")).unwrap();
        let enc = FfmpegEncoder::new(EncoderConfig {
            ffmpeg: dir.path().join("no-such-ffmpeg"),
            ..EncoderConfig::default()
        })
        .unwrap();
        let err = enc
            .encode("cam00", &dir.path().join("frames"), 10, &dir.path().join("v.mp4"))
            .unwrap_err();
        assert!(err.to_string().contains("could not be run"));
    }
}
