//! Keyed blob cache with metadata, tag indexes and integrity checks.
//!
//! Two locations share one implementation ([`BlobCache`]): a host directory
//! ([`LocalStorage`]) and a directory on the BMC reached over SFTP
//! ([`SftpStorage`]). Each entry is a pair of sibling files:
//!
//! - `<name>.data` - the content
//! - `<name>.meta.json` - [`CacheMetadata`]
//!
//! where `<name>` is the key, or a sanitized form of it when the key is not a
//! safe filename. An entry is visible once its metadata file exists; both
//! files are written under temporary names and renamed into place under the
//! cache's write lock.

mod index;
mod local;
mod remote;
mod store;

pub use index::CacheIndex;
pub use local::LocalStorage;
pub use remote::SftpStorage;
pub use store::{BlobCache, BlobStorage};
pub(crate) use store::sha256_file;

#[cfg(test)]
pub(crate) use store::MemoryStorage;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use time::OffsetDateTime;

use crate::context::ExecContext;

/// Local cache of downloaded base images and built outputs.
pub type LocalCache = BlobCache<LocalStorage>;

/// Cache stored on the BMC.
pub type RemoteCache = BlobCache<SftpStorage>;

/// Content stream handed to callers of [`Cache::get`].
pub type ContentReader = Box<dyn Read + Send>;

/// Metadata stored beside each cache entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub mtime: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl CacheMetadata {
    pub fn new(filename: impl Into<String>) -> Self {
        Self {
            key: String::new(),
            filename: filename.into(),
            content_type: default_content_type(),
            size: 0,
            mtime: OffsetDateTime::UNIX_EPOCH,
            content_hash: None,
            tags: BTreeMap::new(),
            os_type: None,
            os_version: None,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn os(mut self, os_type: Option<&str>, os_version: Option<&str>) -> Self {
        self.os_type = os_type.map(str::to_string);
        self.os_version = os_version.map(str::to_string);
        self
    }

    /// Expected SHA-256 (lowercase hex); `put` fails if the content differs.
    pub fn expect_hash(mut self, sha256: &str) -> Self {
        self.content_hash = Some(sha256.to_ascii_lowercase());
        self
    }

    /// True if every `key=value` pair of `filter` is among the tags.
    pub fn matches(&self, filter: &BTreeMap<String, String>) -> bool {
        filter
            .iter()
            .all(|(k, v)| self.tags.get(k).is_some_and(|have| have == v))
    }
}

/// A consistency problem found by [`Cache::verify_integrity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityIssue {
    /// Content file without metadata.
    OrphanContent { name: String },
    /// Metadata without a content file.
    OrphanMetadata { key: String },
    UnparseableMetadata { name: String, detail: String },
    HashMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    SizeMismatch { key: String, expected: u64, actual: u64 },
}

impl fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityIssue::OrphanContent { name } => {
                write!(f, "orphan content {name} has no metadata")
            }
            IntegrityIssue::OrphanMetadata { key } => {
                write!(f, "metadata for '{key}' has no content")
            }
            IntegrityIssue::UnparseableMetadata { name, detail } => {
                write!(f, "metadata {name} cannot be parsed: {detail}")
            }
            IntegrityIssue::HashMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "content hash mismatch for '{key}'\n  expected: {expected}\n  actual:   {actual}"
            ),
            IntegrityIssue::SizeMismatch {
                key,
                expected,
                actual,
            } => write!(
                f,
                "size mismatch for '{key}': metadata says {expected}, content has {actual}"
            ),
        }
    }
}

/// The cache contract shared by the local and remote locations.
pub trait Cache: Send + Sync {
    /// Store `content` under `key`. The returned metadata carries the final
    /// size, mtime and SHA-256.
    fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        meta: CacheMetadata,
        content: &mut dyn Read,
    ) -> Result<CacheMetadata>;

    /// Metadata plus, when `want_content` is set, a reader over the content.
    fn get(
        &self,
        ctx: &ExecContext,
        key: &str,
        want_content: bool,
    ) -> Result<(CacheMetadata, Option<ContentReader>)>;

    /// Metadata for `key`; an absent key is [`crate::Error::NotFound`].
    fn stat(&self, ctx: &ExecContext, key: &str) -> Result<CacheMetadata>;

    fn exists(&self, ctx: &ExecContext, key: &str) -> Result<bool>;

    /// Entries whose tags include every pair of `filter` (all when empty).
    fn list(&self, ctx: &ExecContext, filter: &BTreeMap<String, String>)
        -> Result<Vec<CacheMetadata>>;

    /// Entries with the given OS type, optionally narrowed to one version.
    fn list_by_os(
        &self,
        ctx: &ExecContext,
        os_type: &str,
        os_version: Option<&str>,
    ) -> Result<Vec<CacheMetadata>>;

    /// Remove `key`; absent keys are not an error.
    fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()>;

    fn verify_integrity(&self, ctx: &ExecContext) -> Result<Vec<IntegrityIssue>>;

    fn rebuild_index(&self, ctx: &ExecContext) -> Result<()>;

    /// Where the content of `key` lives inside the storage (a host path or a
    /// path on the BMC).
    fn content_location(&self, key: &str) -> Result<String>;
}
