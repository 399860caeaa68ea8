//! Per-asset rendering: external renderer invocation, resume detection and video encoding.

/// Frame-sequence to MP4 encoding via the system `ffmpeg`.
pub mod encode;
/// Renderer invocation and job directories.
pub mod job;
/// The render → detect → encode → cleanup sequence.
pub mod orchestrator;
/// Job-directory inspection for interrupted work.
pub mod resume;
