use std::time::Duration;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown identifier: {0}")]
    UnknownIdentifier(String),

    #[error("manifest fetch failed: {0}")]
    ManifestFetch(String),

    #[error("download failed for '{id}': {msg}")]
    Download { id: String, msg: String },

    #[error("render of '{id}' timed out after {}s", .after.as_secs())]
    RenderTimeout { id: String, after: Duration },

    #[error("render process failed for '{id}': {msg}")]
    RenderProcess { id: String, msg: String },

    #[error("encode error: {0}")]
    Encode(String),

    #[error("upload error: {0}")]
    Upload(String),

    #[error("cleanup error: {0}")]
    Cleanup(String),

    #[error("gpu lease error: {0}")]
    Lease(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn manifest_fetch(msg: impl Into<String>) -> Self {
        Self::ManifestFetch(msg.into())
    }

    pub fn download(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Download {
            id: id.into(),
            msg: msg.into(),
        }
    }

    pub fn render_process(id: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RenderProcess {
            id: id.into(),
            msg: msg.into(),
        }
    }

    pub fn encode(msg: impl Into<String>) -> Self {
        Self::Encode(msg.into())
    }

    pub fn upload(msg: impl Into<String>) -> Self {
        Self::Upload(msg.into())
    }

    pub fn cleanup(msg: impl Into<String>) -> Self {
        Self::Cleanup(msg.into())
    }

    pub fn lease(msg: impl Into<String>) -> Self {
        Self::Lease(msg.into())
    }

    /// Errors that end the work on a single asset but must not stop the batch.
    ///
    /// `Other` counts as asset-scoped: it carries I/O failures from a job's own files.
    pub fn is_asset_scoped(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::ManifestFetch(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        assert!(
            PipelineError::validation("x")
                .to_string()
                .contains("validation error:")
        );
        assert!(
            PipelineError::encode("x")
                .to_string()
                .contains("encode error:")
        );
        assert!(
            PipelineError::upload("x")
                .to_string()
                .contains("upload error:")
        );
        assert!(
            PipelineError::download("a1", "503")
                .to_string()
                .contains("download failed for 'a1'")
        );
    }

    #[test]
    fn timeout_reports_seconds() {
        let err = PipelineError::RenderTimeout {
            id: "a1".to_string(),
            after: Duration::from_secs(90),
        };
        assert_eq!(err.to_string(), "render of 'a1' timed out after 90s");
    }

    #[test]
    fn run_fatal_errors_are_not_asset_scoped() {
        assert!(!PipelineError::validation("x").is_asset_scoped());
        assert!(!PipelineError::manifest_fetch("x").is_asset_scoped());
        assert!(PipelineError::encode("x").is_asset_scoped());
        assert!(PipelineError::lease("x").is_asset_scoped());
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = PipelineError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
