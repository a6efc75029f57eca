use anyhow::{bail, Context, Result};
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::OffsetDateTime;

use super::{Cache, CacheIndex, CacheMetadata, ContentReader, IntegrityIssue};
use crate::context::ExecContext;
use crate::error::{self, Error};

pub(crate) const DATA_SUFFIX: &str = ".data";
pub(crate) const META_SUFFIX: &str = ".meta.json";
pub(crate) const TMP_INFIX: &str = ".tmp-";
pub(crate) const LOCK_FILENAME: &str = ".cache.lock";

/// Flat directory of named files; the backing store of a [`BlobCache`].
///
/// Names never contain path separators. Missing files are reported as
/// `Ok(None)` / `Ok(false)` rather than errors.
pub trait BlobStorage: Send + Sync {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Create the directory if needed.
    fn prepare(&self) -> Result<()>;

    fn list_names(&self) -> Result<Vec<String>>;

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    fn open(&self, name: &str) -> Result<Option<ContentReader>>;

    /// Create or truncate `name` and copy `content` into it.
    fn write(&self, name: &str, content: &mut dyn Read) -> Result<u64>;

    /// Rename, replacing `to` if it exists.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Remove `name`; absent files are fine.
    fn remove(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> Result<bool>;

    /// Full path of `name` inside the storage.
    fn location(&self, name: &str) -> String;
}

/// [`Cache`] implementation over any [`BlobStorage`].
///
/// Writers hold the in-process index lock for writing plus an exclusive
/// advisory lock on `lock_path`; readers hold both in shared mode, so a
/// reader never observes an entry between its two renames.
#[derive(Debug)]
pub struct BlobCache<S> {
    storage: S,
    lock_path: PathBuf,
    index: RwLock<CacheIndex>,
    index_max_age: Duration,
}

impl<S: BlobStorage> BlobCache<S> {
    pub fn new(storage: S, lock_path: PathBuf, index_max_age: Duration) -> Result<Self> {
        storage
            .prepare()
            .with_context(|| format!("preparing cache at {}", storage.describe()))?;
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating lock directory {}", parent.display()))?;
        }
        Ok(Self {
            storage,
            lock_path,
            index: RwLock::new(CacheIndex::default()),
            index_max_age,
        })
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn read_index(&self) -> RwLockReadGuard<'_, CacheIndex> {
        self.index.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_index(&self) -> RwLockWriteGuard<'_, CacheIndex> {
        self.index.write().unwrap_or_else(|e| e.into_inner())
    }

    fn lock(&self, exclusive: bool) -> Result<CacheLock> {
        CacheLock::acquire(&self.lock_path, exclusive)
    }

    fn read_meta(&self, name: &str) -> Result<Option<CacheMetadata>> {
        let meta_name = format!("{name}{META_SUFFIX}");
        let Some(bytes) = self.storage.read(&meta_name)? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&bytes).with_context(|| {
            format!(
                "parsing cache metadata {}",
                self.storage.location(&meta_name)
            )
        })?;
        Ok(Some(meta))
    }

    /// All parseable metadata records.
    fn scan(&self) -> Result<Vec<CacheMetadata>> {
        let mut out = Vec::new();
        for name in self.storage.list_names()? {
            let Some(stem) = entry_stem(&name, META_SUFFIX) else {
                continue;
            };
            match self.read_meta(stem) {
                Ok(Some(meta)) => out.push(meta),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(name = %name, "skipping unreadable cache metadata: {e:#}")
                }
            }
        }
        Ok(out)
    }

    fn refresh_if_stale(&self, ctx: &ExecContext) -> Result<()> {
        let stale = self.read_index().is_stale(self.index_max_age);
        if stale {
            self.rebuild_index(ctx)?;
        }
        Ok(())
    }

    /// Move the staged files into place. The old metadata is retired before
    /// any content moves, so an entry is never visible with a mismatched
    /// body; on failure the previous entry is put back.
    fn commit(&self, name: &str, tmp_data: &str, tmp_meta: &str) -> Result<()> {
        let data_name = format!("{name}{DATA_SUFFIX}");
        let meta_name = format!("{name}{META_SUFFIX}");
        let prev_data = format!("{tmp_data}-prev");
        let prev_meta = format!("{tmp_meta}-prev");

        let (mut retired_meta, mut retired_data, mut placed_data) = (false, false, false);
        let result = (|| -> Result<()> {
            if self.storage.exists(&meta_name)? {
                self.storage.rename(&meta_name, &prev_meta)?;
                retired_meta = true;
            }
            if self.storage.exists(&data_name)? {
                self.storage.rename(&data_name, &prev_data)?;
                retired_data = true;
            }
            self.storage.rename(tmp_data, &data_name)?;
            placed_data = true;
            self.storage.rename(tmp_meta, &meta_name)
        })();

        match result {
            Ok(()) => {
                let mut prev = Vec::new();
                if retired_data {
                    prev.push(prev_data.as_str());
                }
                if retired_meta {
                    prev.push(prev_meta.as_str());
                }
                self.discard(&prev);
                Ok(())
            }
            Err(e) => {
                if placed_data {
                    if let Err(r) = self.storage.remove(&data_name) {
                        tracing::warn!(name = %data_name, "rolling back cache content: {r:#}");
                    }
                }
                if retired_data {
                    if let Err(r) = self.storage.rename(&prev_data, &data_name) {
                        tracing::warn!(name = %data_name, "restoring cache content: {r:#}");
                    }
                }
                if retired_meta {
                    if let Err(r) = self.storage.rename(&prev_meta, &meta_name) {
                        tracing::warn!(name = %meta_name, "restoring cache metadata: {r:#}");
                    }
                }
                Err(e)
            }
        }
    }

    fn discard(&self, names: &[&str]) {
        for name in names {
            if let Err(e) = self.storage.remove(name) {
                tracing::warn!(name = %name, "failed to remove temporary cache file: {e:#}");
            }
        }
    }
}

impl<S: BlobStorage> Cache for BlobCache<S> {
    fn put(
        &self,
        ctx: &ExecContext,
        key: &str,
        mut meta: CacheMetadata,
        content: &mut dyn Read,
    ) -> Result<CacheMetadata> {
        validate_key(key)?;
        ctx.check()?;
        let name = entry_name(key);
        let tmp_data = tmp_name(&name, DATA_SUFFIX);
        let tmp_meta = tmp_name(&name, META_SUFFIX);

        let mut index = self.write_index();
        let _lock = self.lock(true)?;

        let mut reader = HashingReader::new(content, Some(ctx));
        if let Err(e) = self.storage.write(&tmp_data, &mut reader) {
            self.discard(&[&tmp_data]);
            ctx.check()?;
            return Err(e).with_context(|| format!("writing cache content for '{key}'"));
        }
        let (actual, size) = reader.finish();

        if let Some(expected) = &meta.content_hash {
            if !expected.eq_ignore_ascii_case(&actual) {
                self.discard(&[&tmp_data]);
                bail!(Error::Validation(format!(
                    "content hash mismatch for '{key}': expected {expected}, got {actual}"
                )));
            }
        }

        meta.key = key.to_string();
        if meta.filename.is_empty() {
            meta.filename = key.to_string();
        }
        meta.size = size;
        meta.mtime = OffsetDateTime::now_utc();
        meta.content_hash = Some(actual);

        let bytes = serde_json::to_vec_pretty(&meta).context("serializing cache metadata")?;
        let committed = self
            .storage
            .write(&tmp_meta, &mut bytes.as_slice())
            .and_then(|_| self.commit(&name, &tmp_data, &tmp_meta));
        if let Err(e) = committed {
            self.discard(&[&tmp_data, &tmp_meta]);
            return Err(e).with_context(|| format!("committing cache entry '{key}'"));
        }

        tracing::debug!(key = %key, size, cache = %self.storage.describe(), "cache put");
        index.insert(meta.clone());
        Ok(meta)
    }

    fn get(
        &self,
        ctx: &ExecContext,
        key: &str,
        want_content: bool,
    ) -> Result<(CacheMetadata, Option<ContentReader>)> {
        validate_key(key)?;
        ctx.check()?;
        let name = entry_name(key);
        let _index = self.read_index();
        let _lock = self.lock(false)?;

        let meta = self
            .read_meta(&name)?
            .ok_or_else(|| Error::NotFound(key.to_string()))?;
        if !want_content {
            return Ok((meta, None));
        }
        let reader = self
            .storage
            .open(&format!("{name}{DATA_SUFFIX}"))?
            .ok_or_else(|| Error::NotFound(format!("content for '{key}'")))?;
        Ok((meta, Some(reader)))
    }

    fn stat(&self, ctx: &ExecContext, key: &str) -> Result<CacheMetadata> {
        self.get(ctx, key, false).map(|(meta, _)| meta)
    }

    fn exists(&self, ctx: &ExecContext, key: &str) -> Result<bool> {
        match self.stat(ctx, key) {
            Ok(_) => Ok(true),
            Err(e) if error::is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list(
        &self,
        ctx: &ExecContext,
        filter: &BTreeMap<String, String>,
    ) -> Result<Vec<CacheMetadata>> {
        ctx.check()?;
        self.refresh_if_stale(ctx)?;
        Ok(self.read_index().filter_tags(filter))
    }

    fn list_by_os(
        &self,
        ctx: &ExecContext,
        os_type: &str,
        os_version: Option<&str>,
    ) -> Result<Vec<CacheMetadata>> {
        ctx.check()?;
        self.refresh_if_stale(ctx)?;
        Ok(self.read_index().filter_os(os_type, os_version))
    }

    fn delete(&self, ctx: &ExecContext, key: &str) -> Result<()> {
        validate_key(key)?;
        ctx.check()?;
        let name = entry_name(key);
        let mut index = self.write_index();
        let _lock = self.lock(true)?;

        self.storage
            .remove(&format!("{name}{META_SUFFIX}"))
            .with_context(|| format!("removing metadata for '{key}'"))?;
        self.storage
            .remove(&format!("{name}{DATA_SUFFIX}"))
            .with_context(|| format!("removing content for '{key}'"))?;
        index.remove(key);
        tracing::debug!(key = %key, cache = %self.storage.describe(), "cache delete");
        Ok(())
    }

    fn verify_integrity(&self, ctx: &ExecContext) -> Result<Vec<IntegrityIssue>> {
        ctx.check()?;
        let _index = self.read_index();
        let _lock = self.lock(false)?;

        let names = self.storage.list_names()?;
        let data: BTreeSet<&str> = names
            .iter()
            .filter_map(|n| entry_stem(n, DATA_SUFFIX))
            .collect();
        let metas: BTreeSet<&str> = names
            .iter()
            .filter_map(|n| entry_stem(n, META_SUFFIX))
            .collect();

        let mut issues = Vec::new();
        for stem in &metas {
            ctx.check()?;
            let meta = match self.read_meta(stem) {
                Ok(Some(meta)) => meta,
                Ok(None) => continue,
                Err(e) => {
                    issues.push(IntegrityIssue::UnparseableMetadata {
                        name: format!("{stem}{META_SUFFIX}"),
                        detail: format!("{:#}", e.root_cause()),
                    });
                    continue;
                }
            };
            if !data.contains(stem) {
                issues.push(IntegrityIssue::OrphanMetadata { key: meta.key });
                continue;
            }
            let Some(reader) = self.storage.open(&format!("{stem}{DATA_SUFFIX}"))? else {
                issues.push(IntegrityIssue::OrphanMetadata { key: meta.key });
                continue;
            };
            let mut hashing = HashingReader::new(reader, Some(ctx));
            io::copy(&mut hashing, &mut io::sink()).map_err(|e| {
                ctx.check().err().map(anyhow::Error::from).unwrap_or_else(|| {
                    anyhow::Error::from(e).context(format!("hashing content of '{}'", meta.key))
                })
            })?;
            let (actual, size) = hashing.finish();
            if size != meta.size {
                issues.push(IntegrityIssue::SizeMismatch {
                    key: meta.key.clone(),
                    expected: meta.size,
                    actual: size,
                });
            }
            if let Some(expected) = &meta.content_hash {
                if !expected.eq_ignore_ascii_case(&actual) {
                    issues.push(IntegrityIssue::HashMismatch {
                        key: meta.key.clone(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }
        for stem in data.difference(&metas) {
            issues.push(IntegrityIssue::OrphanContent {
                name: format!("{stem}{DATA_SUFFIX}"),
            });
        }
        Ok(issues)
    }

    fn rebuild_index(&self, ctx: &ExecContext) -> Result<()> {
        ctx.check()?;
        let entries = {
            let _lock = self.lock(false)?;
            self.scan()?
        };
        let fresh = CacheIndex::from_entries(entries);
        tracing::debug!(
            entries = fresh.len(),
            cache = %self.storage.describe(),
            "rebuilt cache index"
        );
        *self.write_index() = fresh;
        Ok(())
    }

    fn content_location(&self, key: &str) -> Result<String> {
        validate_key(key)?;
        Ok(self
            .storage
            .location(&format!("{}{DATA_SUFFIX}", entry_name(key))))
    }
}

/// Advisory lock on the cache's lock file, released on drop.
#[derive(Debug)]
struct CacheLock {
    file: File,
}

impl CacheLock {
    fn acquire(path: &Path, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening cache lock {}", path.display()))?;
        let locked = if exclusive {
            FileExt::lock_exclusive(&file)
        } else {
            FileExt::lock_shared(&file)
        };
        locked.with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Computes SHA-256 and byte count of everything read through it.
pub(crate) struct HashingReader<'a, R> {
    inner: R,
    hasher: Sha256,
    count: u64,
    ctx: Option<&'a ExecContext>,
}

impl<'a, R: Read> HashingReader<'a, R> {
    pub(crate) fn new(inner: R, ctx: Option<&'a ExecContext>) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
            ctx,
        }
    }

    /// Lowercase hex digest and total bytes.
    pub(crate) fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for HashingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(ctx) = self.ctx {
            ctx.check().map_err(io::Error::other)?;
        }
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// SHA-256 hex digest and size of a host file.
pub(crate) fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = HashingReader::new(io::BufReader::new(file), None);
    io::copy(&mut reader, &mut io::sink())
        .with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(reader.finish())
}

/// Keys must be non-empty and printable.
fn validate_key(key: &str) -> Result<(), Error> {
    if key.trim().is_empty() {
        return Err(Error::Validation("cache key must not be empty".into()));
    }
    if key.chars().any(char::is_control) {
        return Err(Error::Validation(format!(
            "cache key {key:?} contains control characters"
        )));
    }
    Ok(())
}

/// File stem for `key`: the key itself when it is a safe filename,
/// otherwise a sanitized form with a short digest suffix.
pub(crate) fn entry_name(key: &str) -> String {
    let plain = key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !key.starts_with('.')
        && !key.contains(TMP_INFIX)
        && !key.contains("..");
    if plain {
        return key.to_string();
    }
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("{sanitized}-{}", &digest[..12])
}

/// The entry stem if `name` is a committed file with `suffix`.
fn entry_stem<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    if name.contains(TMP_INFIX) || name.starts_with('.') {
        return None;
    }
    name.strip_suffix(suffix).filter(|stem| !stem.is_empty())
}

fn tmp_name(name: &str, suffix: &str) -> String {
    let n = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{name}{suffix}{TMP_INFIX}{}-{n}", std::process::id())
}

/// In-memory storage for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct MemoryStorage {
    files: std::sync::Mutex<BTreeMap<String, Vec<u8>>>,
    fail_renames_to: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryStorage {
    /// Make the next rename onto `name` fail.
    pub(crate) fn fail_next_rename_to(&self, name: &str) {
        self.fail_renames_to.lock().unwrap().push(name.to_string());
    }

    pub(crate) fn insert(&self, name: &str, bytes: &[u8]) {
        self.files
            .lock()
            .unwrap()
            .insert(name.to_string(), bytes.to_vec());
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.files.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
impl BlobStorage for MemoryStorage {
    fn describe(&self) -> String {
        "memory".into()
    }

    fn prepare(&self) -> Result<()> {
        Ok(())
    }

    fn list_names(&self) -> Result<Vec<String>> {
        Ok(self.names())
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.files.lock().unwrap().get(name).cloned())
    }

    fn open(&self, name: &str) -> Result<Option<ContentReader>> {
        Ok(self
            .read(name)?
            .map(|bytes| Box::new(io::Cursor::new(bytes)) as ContentReader))
    }

    fn write(&self, name: &str, content: &mut dyn Read) -> Result<u64> {
        let mut buf = Vec::new();
        content.read_to_end(&mut buf)?;
        let n = buf.len() as u64;
        self.insert(name, &buf);
        Ok(n)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        {
            let mut failing = self.fail_renames_to.lock().unwrap();
            if let Some(i) = failing.iter().position(|n| n == to) {
                failing.remove(i);
                anyhow::bail!("rename {from} -> {to}: input/output error");
            }
        }
        let mut files = self.files.lock().unwrap();
        let bytes = files
            .remove(from)
            .ok_or_else(|| anyhow::anyhow!("no such file {from}"))?;
        files.insert(to.to_string(), bytes);
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.files.lock().unwrap().remove(name);
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.files.lock().unwrap().contains_key(name))
    }

    fn location(&self, name: &str) -> String {
        format!("mem://{name}")
    }
}
