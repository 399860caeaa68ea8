use std::ffi::OsString;
use std::io::Write;
use std::path::Path;

use crate::foundation::error::{PipelineError, PipelineResult};

/// Some mirrors reject non-browser agents.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";

/// Source of remote bytes.
///
/// Implementations must be shareable across download workers.
pub trait Fetch: Send + Sync {
    /// Stream the body at `url` into `sink`, returning the number of bytes written.
    ///
    /// Errors carry a human-readable message; callers wrap them into the stage's error variant.
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, String>;
}

/// Blocking HTTP client used for the manifest and asset downloads.
#[derive(Clone, Debug)]
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
}

impl HttpFetcher {
    pub fn new() -> PipelineResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            // Large meshes on slow mirrors; only bound the connect phase.
            .timeout(None)
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::validation(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &str, sink: &mut dyn Write) -> Result<u64, String> {
        let mut resp = self
            .client
            .get(url)
            .send()
            .and_then(|r| r.error_for_status())
            .map_err(|e| format!("GET {url}: {e}"))?;
        resp.copy_to(sink).map_err(|e| format!("read body of {url}: {e}"))
    }
}

/// Join a base URL and a manifest-relative path with exactly one `/`.
pub fn join_url(base: &str, rel: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        rel.trim_start_matches('/')
    )
}

/// Download `url` to `dest` through a `.tmp` sibling and an atomic rename.
///
/// Readers of `dest` never observe a partial file. Every writer stages into its own uniquely
/// named sibling, so two processes racing on the same `dest` cannot interleave bytes; the last
/// rename wins with a complete file. The staging file is removed when the fetch fails.
pub fn fetch_to_path(fetcher: &dyn Fetch, url: &str, dest: &Path) -> Result<u64, String> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)
        .map_err(|e| format!("create directory '{}': {e}", parent.display()))?;

    let mut prefix = dest.file_name().map(OsString::from).unwrap_or_default();
    prefix.push(".");
    let mut staged = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| format!("create staging file in '{}': {e}", parent.display()))?;

    let n = {
        let mut out = std::io::BufWriter::new(staged.as_file_mut());
        let n = fetcher.fetch(url, &mut out)?;
        out.flush()
            .map_err(|e| format!("write staging file for '{}': {e}", dest.display()))?;
        n
    };
    staged
        .persist(dest)
        .map_err(|e| format!("rename into '{}': {}", dest.display(), e.error))?;
    Ok(n)
}
