use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context as _;
use serde::de::DeserializeOwned;

use crate::foundation::error::{PipelineError, PipelineResult};
use crate::net::{Fetch, fetch_to_path, join_url};

/// File name of the compressed identifier → path manifest, both remotely and in the cache root.
pub const MANIFEST_FILE: &str = "object-paths.json.gz";

/// File name of the compressed category → identifiers annotation index.
pub const ANNOTATIONS_FILE: &str = "lvis-annotations.json.gz";

fn decode_gz_json<T: DeserializeOwned>(reader: impl Read, what: &str) -> PipelineResult<T> {
    let decoder = flate2::read::GzDecoder::new(reader);
    serde_json::from_reader(decoder)
        .map_err(|e| PipelineError::validation(format!("invalid {what}: {e}")))
}

fn open_gz(path: &Path) -> PipelineResult<std::io::BufReader<std::fs::File>> {
    let file = std::fs::File::open(path).with_context(|| format!("open '{}'", path.display()))?;
    Ok(std::io::BufReader::new(file))
}

/// Identifier → repository-relative path mapping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssetManifest {
    paths: HashMap<String, String>,
}

impl AssetManifest {
    pub fn new(paths: HashMap<String, String>) -> Self {
        Self { paths }
    }

    /// Decode a gzip-compressed JSON object of string → string.
    pub fn from_gz_reader(reader: impl Read) -> PipelineResult<Self> {
        Ok(Self {
            paths: decode_gz_json(reader, "manifest")?,
        })
    }

    pub fn from_gz_path(path: &Path) -> PipelineResult<Self> {
        Self::from_gz_reader(open_gz(path)?)
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.paths.get(id).map(String::as_str)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.paths.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.paths.keys().map(String::as_str)
    }
}

/// Category name → identifiers tagged with it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CategoryIndex {
    categories: BTreeMap<String, Vec<String>>,
}

impl CategoryIndex {
    pub fn new(categories: BTreeMap<String, Vec<String>>) -> Self {
        Self { categories }
    }

    pub fn from_gz_reader(reader: impl Read) -> PipelineResult<Self> {
        Ok(Self {
            categories: decode_gz_json(reader, "category annotations")?,
        })
    }

    pub fn from_gz_path(path: &Path) -> PipelineResult<Self> {
        Self::from_gz_reader(open_gz(path)?)
    }

    pub fn get(&self, category: &str) -> Option<&[String]> {
        self.categories.get(category).map(Vec::as_slice)
    }

    /// Category names in sorted order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.categories.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }
}

/// Strip the mesh extension callers sometimes keep on identifiers.
pub fn normalize_id(id: &str) -> &str {
    let id = id.trim();
    id.strip_suffix(".glb").unwrap_or(id)
}

/// Outcome of resolving a batch of identifiers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Resolution {
    /// `(id, remote relative path)` in first-seen input order, without duplicates.
    pub resolved: Vec<(String, String)>,
    /// Normalized identifiers absent from the manifest.
    pub unknown: Vec<String>,
}

/// Lazily loads the manifest once per resolver and answers identifier lookups.
///
/// The manifest is read from `<root>/object-paths.json.gz`, downloading it first when the cache
/// file is missing. Every later call reuses the in-memory copy. The category annotations are
/// handled the same way, on first use.
pub struct ManifestResolver {
    root: PathBuf,
    base_url: String,
    fetcher: Arc<dyn Fetch>,
    loaded: Mutex<Option<Arc<AssetManifest>>>,
    annotations: Mutex<Option<Arc<CategoryIndex>>>,
}

impl ManifestResolver {
    pub fn new(root: impl Into<PathBuf>, base_url: impl Into<String>, fetcher: Arc<dyn Fetch>) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into(),
            fetcher,
            loaded: Mutex::new(None),
            annotations: Mutex::new(None),
        }
    }

    pub fn cache_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Load (or return the already loaded) manifest.
    ///
    /// Any failure here is a [`PipelineError::ManifestFetch`]: nothing downstream can proceed
    /// without it.
    pub fn manifest(&self) -> PipelineResult<Arc<AssetManifest>> {
        let mut slot = self
            .loaded
            .lock()
            .map_err(|_| PipelineError::manifest_fetch("manifest lock poisoned"))?;
        if let Some(manifest) = slot.as_ref() {
            return Ok(Arc::clone(manifest));
        }

        let path = self.cached(MANIFEST_FILE)?;
        let manifest = AssetManifest::from_gz_path(&path).map_err(|e| {
            PipelineError::manifest_fetch(format!("load '{}': {e}", path.display()))
        })?;
        tracing::debug!(entries = manifest.len(), "asset manifest loaded");

        let manifest = Arc::new(manifest);
        *slot = Some(Arc::clone(&manifest));
        Ok(manifest)
    }

    /// Load (or return the already loaded) category annotations.
    pub fn annotations(&self) -> PipelineResult<Arc<CategoryIndex>> {
        let mut slot = self
            .annotations
            .lock()
            .map_err(|_| PipelineError::manifest_fetch("annotations lock poisoned"))?;
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }

        let path = self.cached(ANNOTATIONS_FILE)?;
        let index = CategoryIndex::from_gz_path(&path).map_err(|e| {
            PipelineError::manifest_fetch(format!("load '{}': {e}", path.display()))
        })?;
        tracing::debug!(categories = index.len(), "category annotations loaded");

        let index = Arc::new(index);
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Identifiers tagged with any of `categories`, in category then annotation order, without
    /// duplicates. An unknown category is a validation error.
    pub fn ids_in_categories<S: AsRef<str>>(&self, categories: &[S]) -> PipelineResult<Vec<String>> {
        let index = self.annotations()?;
        let mut seen = HashSet::new();
        let mut ids = Vec::new();
        for category in categories {
            let category = category.as_ref();
            let members = index.get(category).ok_or_else(|| {
                PipelineError::validation(format!("unknown category '{category}'"))
            })?;
            ids.extend(members.iter().filter(|id| seen.insert(id.as_str())).cloned());
        }
        Ok(ids)
    }

    /// `<root>/<file>`, downloading it from the mirror first when missing.
    fn cached(&self, file: &str) -> PipelineResult<PathBuf> {
        let path = self.root.join(file);
        if !path.exists() {
            let url = join_url(&self.base_url, file);
            tracing::info!(%url, dest = %path.display(), "fetching index file");
            fetch_to_path(self.fetcher.as_ref(), &url, &path)
                .map_err(PipelineError::manifest_fetch)?;
        }
        Ok(path)
    }

    /// Every identifier the repository knows about.
    pub fn identifiers(&self) -> PipelineResult<Vec<String>> {
        let manifest = self.manifest()?;
        let mut ids = manifest.identifiers().map(str::to_string).collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Look up a single identifier.
    pub fn resolve_one(&self, id: &str) -> PipelineResult<String> {
        let id = normalize_id(id);
        self.manifest()?
            .get(id)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::UnknownIdentifier(id.to_string()))
    }

    /// Resolve a batch. Unknown identifiers are reported with a warning, never as an error.
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> PipelineResult<Resolution> {
        let manifest = self.manifest()?;
        let mut seen = HashSet::new();
        let mut out = Resolution::default();
        for raw in ids {
            let id = normalize_id(raw.as_ref());
            if !seen.insert(id.to_string()) {
                continue;
            }
            match manifest.get(id) {
                Some(path) => out.resolved.push((id.to_string(), path.to_string())),
                None => {
                    tracing::warn!(id, "could not find object in manifest, skipping it");
                    out.unknown.push(id.to_string());
                }
            }
        }
        Ok(out)
    }
}
