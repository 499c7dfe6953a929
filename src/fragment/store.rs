//! Fragment store backends.
//!
//! A [`FragmentStore`] persists sealed fragments, serves their content
//! back, and produces fetchable URLs. Backends are selected by the URL
//! scheme of a fragment's backing store through a [`StoreRegistry`]
//! assembled at broker startup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use super::Fragment;
use crate::error::{Error, Result};

/// Capability set of a fragment store backend.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    /// Durably copy a sealed fragment's content into the store.
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<()>;

    /// Read a persisted fragment's content from `offset` (a journal byte
    /// offset within the fragment) through its end.
    async fn open(&self, fragment: &Fragment, offset: i64) -> Result<Bytes>;

    /// A URL from which the fragment may be fetched directly.
    fn sign(&self, fragment: &Fragment) -> Result<String>;
}

fn check_offset(fragment: &Fragment, offset: i64) -> Result<usize> {
    if offset < fragment.begin || offset >= fragment.end {
        return Err(Error::Validation(format!(
            "offset {} outside fragment range [{}, {})",
            offset, fragment.begin, fragment.end
        )));
    }
    Ok((offset - fragment.begin) as usize)
}

/// Filesystem-backed store rooted at a directory. Fragments live at
/// `<root>/<journal>/<content_name>`.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> FsStore {
        FsStore { root: root.into() }
    }

    fn path_of(&self, fragment: &Fragment) -> PathBuf {
        self.root.join(fragment.content_path())
    }
}

#[async_trait]
impl FragmentStore for FsStore {
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<()> {
        let path = self.path_of(fragment);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename, so a torn write never surfaces as a
        // readable fragment.
        let staged = path.with_extension("staging");
        tokio::fs::write(&staged, &content).await?;
        tokio::fs::rename(&staged, &path).await?;
        Ok(())
    }

    async fn open(&self, fragment: &Fragment, offset: i64) -> Result<Bytes> {
        let skip = check_offset(fragment, offset)?;
        let content = tokio::fs::read(self.path_of(fragment)).await?;
        Ok(Bytes::from(content).slice(skip..))
    }

    fn sign(&self, fragment: &Fragment) -> Result<String> {
        Ok(format!(
            "file://{}",
            self.path_of(fragment).to_string_lossy()
        ))
    }
}

/// In-memory store, used by tests and available as `mem://` URLs.
#[derive(Default)]
pub struct MemoryStore {
    fragments: DashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn new() -> MemoryStore {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    /// Whether a fragment with this content path has been persisted.
    pub fn contains(&self, fragment: &Fragment) -> bool {
        self.fragments.contains_key(&fragment.content_path())
    }
}

#[async_trait]
impl FragmentStore for MemoryStore {
    async fn persist(&self, fragment: &Fragment, content: Bytes) -> Result<()> {
        self.fragments.insert(fragment.content_path(), content);
        Ok(())
    }

    async fn open(&self, fragment: &Fragment, offset: i64) -> Result<Bytes> {
        let skip = check_offset(fragment, offset)?;
        let content = self
            .fragments
            .get(&fragment.content_path())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                Error::Unavailable(format!("fragment not in store ({})", fragment.content_path()))
            })?;
        Ok(content.slice(skip..))
    }

    fn sign(&self, fragment: &Fragment) -> Result<String> {
        Ok(format!("mem://{}", fragment.content_path()))
    }
}

/// Scheme-keyed dispatch across fragment store backends.
#[derive(Clone, Default)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn FragmentStore>>,
}

impl StoreRegistry {
    pub fn new() -> StoreRegistry {
        StoreRegistry::default()
    }

    /// Register `store` to serve URLs of `scheme`.
    pub fn register(mut self, scheme: impl Into<String>, store: Arc<dyn FragmentStore>) -> Self {
        self.stores.insert(scheme.into(), store);
        self
    }

    /// The store serving `fragment.backing_store`.
    pub fn store_for(&self, fragment: &Fragment) -> Result<&Arc<dyn FragmentStore>> {
        let url = &fragment.backing_store;
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| Error::Validation(format!("invalid store URL ({url})")))?;
        self.stores
            .get(scheme)
            .ok_or_else(|| Error::Validation(format!("no store for scheme ({scheme})")))
    }
}
