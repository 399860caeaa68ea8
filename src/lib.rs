#![forbid(unsafe_code)]

pub mod foundation {
    pub mod config;
    pub mod error;
}

pub mod download;
pub mod driver;
pub mod eventlog;
pub mod gpu;
pub mod manifest;
pub mod net;
pub(crate) mod process;
pub mod publish;
pub mod render;
pub mod selection;

pub use download::{DownloadCoordinator, DownloadReport, count_cached_meshes};
pub use driver::{Driver, DriverSummary};
pub use eventlog::{EventLog, LogCategory, LogEntry};
pub use foundation::config::{EncoderConfig, PipelineConfig, RendererConfig};
pub use foundation::error::{PipelineError, PipelineResult};
pub use gpu::{GpuDevices, GpuPool, RenderEngine};
pub use manifest::{AssetManifest, CategoryIndex, ManifestResolver};
pub use net::{Fetch, HttpFetcher};
pub use process::is_on_path;
pub use publish::{Publisher, StorageBackend, Unpacker, backend_for};
pub use render::encode::FfmpegEncoder;
pub use render::orchestrator::{RenderOrchestrator, RenderOutcome, RenderSettings};
pub use selection::{SelectedAsset, Window};
