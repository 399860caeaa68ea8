use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context as _;

use crate::foundation::config::expand_home;
use crate::foundation::error::{PipelineError, PipelineResult};
use crate::process::{self, Exit};

/// Minimal filesystem surface needed to publish archives.
///
/// Paths are `/`-separated and relative to the backend's root.
pub trait StorageBackend: Send + Sync {
    fn make_dirs(&self, path: &str) -> PipelineResult<()>;
    fn exists(&self, path: &str) -> PipelineResult<bool>;
    fn remove(&self, path: &str) -> PipelineResult<()>;
    fn put(&self, local: &Path, path: &str) -> PipelineResult<()>;

    /// Human-readable location, for logs.
    fn describe(&self, path: &str) -> String;

    /// The same location on this host's filesystem, if the backend is local.
    fn local_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Pick a backend for `url`: a plain path, `file://<path>` or `ssh://[user@]host/<path>`.
pub fn backend_for(url: &str) -> PipelineResult<Box<dyn StorageBackend>> {
    let url = url.trim();
    if url.is_empty() {
        return Err(PipelineError::validation("destination must be non-empty"));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Box::new(LocalBackend::new(expand_home(Path::new(path)))));
    }
    if let Some(rest) = url.strip_prefix("ssh://") {
        return Ok(Box::new(SshBackend::parse(rest)?));
    }
    if let Some((scheme, _)) = url.split_once("://") {
        return Err(PipelineError::validation(format!(
            "unsupported destination scheme '{scheme}' in '{url}'"
        )));
    }
    Ok(Box::new(LocalBackend::new(expand_home(Path::new(url)))))
}

#[derive(Clone, Debug)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        path.split('/')
            .filter(|p| !p.is_empty())
            .fold(self.root.clone(), |acc, p| acc.join(p))
    }
}

impl StorageBackend for LocalBackend {
    fn make_dirs(&self, path: &str) -> PipelineResult<()> {
        let dir = self.resolve(path);
        std::fs::create_dir_all(&dir).with_context(|| format!("create '{}'", dir.display()))?;
        Ok(())
    }

    fn exists(&self, path: &str) -> PipelineResult<bool> {
        Ok(self.resolve(path).exists())
    }

    fn remove(&self, path: &str) -> PipelineResult<()> {
        let target = self.resolve(path);
        let res = if target.is_dir() {
            std::fs::remove_dir_all(&target)
        } else {
            std::fs::remove_file(&target)
        };
        match res {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PipelineError::cleanup(format!(
                "remove '{}': {e}",
                target.display()
            ))),
        }
    }

    /// Copy next to the target, then rename over it.
    fn put(&self, local: &Path, path: &str) -> PipelineResult<()> {
        let target = self.resolve(path);
        let parent = target
            .parent()
            .ok_or_else(|| PipelineError::upload(format!("no parent for '{}'", target.display())))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| PipelineError::upload(format!("create '{}': {e}", parent.display())))?;
        let staged = tempfile::Builder::new()
            .prefix(".upload-")
            .tempfile_in(parent)
            .map_err(|e| PipelineError::upload(format!("stage in '{}': {e}", parent.display())))?;
        std::fs::copy(local, staged.path()).map_err(|e| {
            PipelineError::upload(format!("copy '{}' -> '{}': {e}", local.display(), target.display()))
        })?;
        staged
            .persist(&target)
            .map_err(|e| PipelineError::upload(format!("rename into '{}': {}", target.display(), e.error)))?;
        Ok(())
    }

    fn describe(&self, path: &str) -> String {
        self.resolve(path).display().to_string()
    }

    fn local_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.resolve(path))
    }
}

/// Remote directory reached through the system `ssh` and `scp` clients.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshBackend {
    /// `[user@]host`
    target: String,
    root: String,
}

impl SshBackend {
    /// Parse the part of an `ssh://` URL after the scheme.
    pub fn parse(rest: &str) -> PipelineResult<Self> {
        let (target, path) = rest.split_once('/').unwrap_or((rest, ""));
        if target.is_empty() || target.ends_with('@') {
            return Err(PipelineError::validation(format!(
                "ssh destination 'ssh://{rest}' has no host"
            )));
        }
        let root = if path.is_empty() {
            ".".to_string()
        } else {
            format!("/{}", path.trim_end_matches('/'))
        };
        Ok(Self {
            target: target.to_string(),
            root,
        })
    }

    fn remote(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.root.clone()
        } else {
            format!("{}/{path}", self.root)
        }
    }

    fn ssh(&self, script: String) -> PipelineResult<Exit> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o").arg("BatchMode=yes").arg(&self.target).arg(script);
        process::run(&mut cmd, None)
            .map_err(|e| PipelineError::Other(anyhow::anyhow!("failed to spawn ssh: {e}")))
    }
}

impl StorageBackend for SshBackend {
    fn make_dirs(&self, path: &str) -> PipelineResult<()> {
        match self.ssh(format!("mkdir -p {}", shell_quote(&self.remote(path))))? {
            Exit::Finished { status, .. } if status.success() => Ok(()),
            Exit::Finished { stderr, .. } => Err(PipelineError::upload(format!(
                "mkdir on {}: {}",
                self.target,
                stderr.trim()
            ))),
            Exit::TimedOut => Err(PipelineError::upload("ssh timed out")),
        }
    }

    fn exists(&self, path: &str) -> PipelineResult<bool> {
        match self.ssh(format!("test -e {}", shell_quote(&self.remote(path))))? {
            Exit::Finished { status, .. } if status.success() => Ok(true),
            Exit::Finished { status, .. } if status.code() == Some(1) => Ok(false),
            Exit::Finished { stderr, .. } => Err(PipelineError::upload(format!(
                "stat on {}: {}",
                self.target,
                stderr.trim()
            ))),
            Exit::TimedOut => Err(PipelineError::upload("ssh timed out")),
        }
    }

    fn remove(&self, path: &str) -> PipelineResult<()> {
        match self.ssh(format!("rm -rf {}", shell_quote(&self.remote(path))))? {
            Exit::Finished { status, .. } if status.success() => Ok(()),
            Exit::Finished { stderr, .. } => Err(PipelineError::cleanup(format!(
                "remove on {}: {}",
                self.target,
                stderr.trim()
            ))),
            Exit::TimedOut => Err(PipelineError::cleanup("ssh timed out")),
        }
    }

    fn put(&self, local: &Path, path: &str) -> PipelineResult<()> {
        let mut cmd = Command::new("scp");
        cmd.arg("-q")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(local)
            .arg(format!("{}:{}", self.target, self.remote(path)));
        let exit = process::run(&mut cmd, None)
            .map_err(|e| PipelineError::upload(format!("failed to spawn scp: {e}")))?;
        match exit {
            Exit::Finished { status, .. } if status.success() => Ok(()),
            Exit::Finished { status, stderr } => Err(PipelineError::upload(format!(
                "scp exited with status {status}: {}",
                stderr.trim()
            ))),
            Exit::TimedOut => Err(PipelineError::upload("scp timed out")),
        }
    }

    fn describe(&self, path: &str) -> String {
        format!("ssh://{}{}", self.target, self.remote(path))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}
