use anyhow::Result;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

use super::store::LOCK_FILENAME;
use super::{BlobCache, BlobStorage, ContentReader};
use crate::ssh::sftp::{posix_join, require_absolute};
use crate::ssh::SftpClient;

/// Cache files in a directory on the BMC.
#[derive(Debug, Clone)]
pub struct SftpStorage {
    client: SftpClient,
    dir: String,
}

impl SftpStorage {
    pub fn new(client: SftpClient, dir: &str) -> Result<Self> {
        require_absolute(dir)?;
        Ok(Self {
            client,
            dir: dir.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    fn path(&self, name: &str) -> String {
        posix_join(&self.dir, name)
    }
}

impl BlobStorage for SftpStorage {
    fn describe(&self) -> String {
        format!("{}:{}", self.client.label(), self.dir)
    }

    fn prepare(&self) -> Result<()> {
        self.client.mkdir_all(&self.dir)
    }

    fn list_names(&self) -> Result<Vec<String>> {
        if !self.client.exists(&self.dir)? {
            return Ok(Vec::new());
        }
        self.client.list_files(&self.dir)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.client.read(&self.path(name))
    }

    fn open(&self, name: &str) -> Result<Option<ContentReader>> {
        Ok(self
            .client
            .open(&self.path(name))?
            .map(|r| Box::new(r) as ContentReader))
    }

    fn write(&self, name: &str, content: &mut dyn Read) -> Result<u64> {
        self.client.write_from(&self.path(name), content)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.client.rename(&self.path(from), &self.path(to))
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.client.remove(&self.path(name))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.client.exists(&self.path(name))
    }

    fn location(&self, name: &str) -> String {
        self.path(name)
    }
}

impl BlobCache<SftpStorage> {
    /// Open the BMC cache at `remote_dir`. Cross-process writes are
    /// serialized by `<cache_dir>/remote/.cache.lock` on the host.
    pub fn open_remote(
        client: SftpClient,
        remote_dir: &str,
        cache_dir: &Path,
        index_max_age: Duration,
    ) -> Result<Self> {
        Self::new(
            SftpStorage::new(client, remote_dir)?,
            cache_dir.join("remote").join(LOCK_FILENAME),
            index_max_age,
        )
    }
}
