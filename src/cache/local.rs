use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::store::LOCK_FILENAME;
use super::{BlobCache, BlobStorage, ContentReader};

/// Cache files in a host directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    dir: PathBuf,
}

impl LocalStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl BlobStorage for LocalStorage {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating cache directory {}", self.dir.display()))
    }

    fn list_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(names),
            Err(e) => {
                return Err(e).with_context(|| format!("listing {}", self.dir.display()))
            }
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn open(&self, name: &str) -> Result<Option<ContentReader>> {
        let path = self.path(name);
        match File::open(&path) {
            Ok(f) => Ok(Some(Box::new(io::BufReader::new(f)))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("opening {}", path.display())),
        }
    }

    fn write(&self, name: &str, content: &mut dyn Read) -> Result<u64> {
        let path = self.path(name);
        let file =
            File::create(&path).with_context(|| format!("creating {}", path.display()))?;
        let mut out = BufWriter::new(file);
        let n = io::copy(content, &mut out)
            .with_context(|| format!("writing {}", path.display()))?;
        let file = out
            .into_inner()
            .map_err(|e| e.into_error())
            .with_context(|| format!("flushing {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing {}", path.display()))?;
        Ok(n)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let (src, dst) = (self.path(from), self.path(to));
        fs::rename(&src, &dst)
            .with_context(|| format!("renaming {} to {}", src.display(), dst.display()))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
        }
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.path(name).is_file())
    }

    fn location(&self, name: &str) -> String {
        self.path(name).display().to_string()
    }
}

impl BlobCache<LocalStorage> {
    /// Open the host cache rooted at `dir`, locking `<dir>/.cache.lock`.
    pub fn open_local(dir: &Path, index_max_age: Duration) -> Result<Self> {
        Self::new(
            LocalStorage::new(dir),
            dir.join(LOCK_FILENAME),
            index_max_age,
        )
    }

    /// Copy the content of `key` to `dest` through a temp file.
    pub fn materialize(&self, ctx: &crate::ExecContext, key: &str, dest: &Path) -> Result<()> {
        use super::Cache;

        let (_, reader) = self.get(ctx, key, true)?;
        let Some(mut reader) = reader else {
            return Ok(());
        };
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = dest.with_extension("tmp");
        let mut out = File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        io::copy(&mut reader, &mut out)
            .with_context(|| format!("copying cache entry '{key}' to {}", tmp.display()))?;
        out.flush()?;
        fs::rename(&tmp, dest)
            .with_context(|| format!("renaming {} to {}", tmp.display(), dest.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, CacheMetadata};
    use crate::error;
    use crate::ExecContext;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn open(tmp: &TempDir) -> BlobCache<LocalStorage> {
        BlobCache::open_local(&tmp.path().join("local"), Duration::from_secs(60)).unwrap()
    }

    #[test]
    fn local_roundtrip_on_disk() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp);
        let ctx = ExecContext::background();
        cache
            .put(
                &ctx,
                "ubuntu-2204-rk1-base-net",
                CacheMetadata::new("ubuntu.img.xz").tag("stage", "net"),
                &mut &b"hello"[..],
            )
            .unwrap();
        let dir = tmp.path().join("local");
        assert!(dir.join("ubuntu-2204-rk1-base-net.data").is_file());
        assert!(dir.join("ubuntu-2204-rk1-base-net.meta.json").is_file());
        assert!(dir.join(".cache.lock").is_file());

        let dest = tmp.path().join("out/img.xz");
        cache
            .materialize(&ctx, "ubuntu-2204-rk1-base-net", &dest)
            .unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"hello");
    }

    #[test]
    fn second_handle_sees_entries_after_rebuild() {
        let tmp = TempDir::new().unwrap();
        let a = open(&tmp);
        let b = open(&tmp);
        let ctx = ExecContext::background();
        a.put(&ctx, "k", CacheMetadata::new("k"), &mut &b"1"[..])
            .unwrap();
        assert!(b.exists(&ctx, "k").unwrap());
        assert_eq!(b.list(&ctx, &BTreeMap::new()).unwrap().len(), 1);
    }

    #[test]
    fn unparseable_metadata_is_an_error_not_a_miss() {
        let tmp = TempDir::new().unwrap();
        let cache = open(&tmp);
        fs::write(tmp.path().join("local/k.meta.json"), b"[").unwrap();
        let err = cache.stat(&ExecContext::background(), "k").unwrap_err();
        assert!(!error::is_not_found(&err));
    }
}
