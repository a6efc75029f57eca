//! Synchronous SFTP client over a shared russh session.

use anyhow::{anyhow, bail, Context, Result};
use russh_sftp::client::fs::File as RemoteFile;
use russh_sftp::client::SftpSession;
use std::future::Future;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::runtime::Runtime;

use crate::error::Error;

const CHUNK: usize = 256 * 1024;

/// File-transfer subclient; cheap to clone.
#[derive(Clone)]
pub struct SftpClient {
    runtime: Arc<Runtime>,
    session: Arc<SftpSession>,
    op_timeout: Duration,
    label: String,
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

impl SftpClient {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        session: SftpSession,
        op_timeout: Duration,
        label: String,
    ) -> Self {
        Self {
            runtime,
            session: Arc::new(session),
            op_timeout,
            label,
        }
    }

    /// `user@host:port` of the endpoint this subclient belongs to.
    pub fn label(&self) -> &str {
        &self.label
    }

    fn block<T, E>(&self, what: &str, fut: impl Future<Output = Result<T, E>>) -> Result<T>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        let limit = self.op_timeout;
        match self
            .runtime
            .block_on(async { tokio::time::timeout(limit, fut).await })
        {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(anyhow::Error::new(e).context(format!("sftp {what} on {}", self.label))),
            Err(_) => Err(Error::Transient(format!(
                "sftp {what} on {} timed out after {limit:?}",
                self.label
            ))
            .into()),
        }
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.block(&format!("stat {path}"), self.session.try_exists(path))
    }

    pub fn size(&self, path: &str) -> Result<u64> {
        let meta = self.block(&format!("stat {path}"), self.session.metadata(path))?;
        Ok(meta.len())
    }

    /// Create `path` and any missing ancestors.
    pub fn mkdir_all(&self, path: &str) -> Result<()> {
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.exists(&current)? {
                continue;
            }
            if let Err(e) = self.block(&format!("mkdir {current}"), self.session.create_dir(current.as_str())) {
                // Lost a race with another writer.
                if !self.exists(&current)? {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Regular files in `dir`, sorted.
    pub fn list_files(&self, dir: &str) -> Result<Vec<String>> {
        let entries = self.block(&format!("readdir {dir}"), self.session.read_dir(dir))?;
        let mut names: Vec<String> = entries
            .filter(|e| e.file_type().is_file())
            .map(|e| e.file_name())
            .filter(|n| n != "." && n != "..")
            .collect();
        names.sort();
        Ok(names)
    }

    pub fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let Some(mut reader) = self.open(path)? else {
            return Ok(None);
        };
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .with_context(|| format!("reading {path} on {}", self.label))?;
        Ok(Some(buf))
    }

    pub fn open(&self, path: &str) -> Result<Option<SftpReader>> {
        if !self.exists(path)? {
            return Ok(None);
        }
        let file = self.block(&format!("open {path}"), self.session.open(path))?;
        Ok(Some(SftpReader {
            runtime: self.runtime.clone(),
            file,
            op_timeout: self.op_timeout,
        }))
    }

    /// Create or truncate `path` and stream `content` into it. A partial
    /// file is removed on failure.
    pub fn write_from(&self, path: &str, content: &mut dyn Read) -> Result<u64> {
        let mut file = self.block(&format!("create {path}"), self.session.create(path))?;
        match self.stream_into(&mut file, content) {
            Ok(n) => Ok(n),
            Err(e) => {
                let _ = self.runtime.block_on(file.shutdown());
                if let Err(cleanup) = self.remove(path) {
                    tracing::warn!(path = %path, "failed to remove partial upload: {cleanup:#}");
                }
                Err(e.context(format!("writing {path} on {}", self.label)))
            }
        }
    }

    fn stream_into(&self, file: &mut RemoteFile, content: &mut dyn Read) -> Result<u64> {
        let mut buf = vec![0u8; CHUNK];
        let mut total = 0u64;
        loop {
            let n = content.read(&mut buf).context("reading local content")?;
            if n == 0 {
                break;
            }
            self.block("write", file.write_all(&buf[..n]))?;
            total += n as u64;
        }
        self.block("flush", file.flush())?;
        self.block("close", file.shutdown())?;
        Ok(total)
    }

    /// Rename, replacing an existing target.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.exists(to)? {
            self.remove(to)?;
        }
        self.block(
            &format!("rename {from} -> {to}"),
            self.session.rename(from, to),
        )
    }

    /// Remove a file; absent files are fine.
    pub fn remove(&self, path: &str) -> Result<()> {
        if !self.exists(path)? {
            return Ok(());
        }
        self.block(&format!("remove {path}"), self.session.remove_file(path))
    }

    pub fn close(&self) -> Result<()> {
        self.block("close", self.session.close())
    }
}

/// Blocking reader over a remote file.
pub struct SftpReader {
    runtime: Arc<Runtime>,
    file: RemoteFile,
    op_timeout: Duration,
}

impl Read for SftpReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Self {
            runtime,
            file,
            op_timeout,
        } = self;
        let limit = *op_timeout;
        match runtime.block_on(async { tokio::time::timeout(limit, file.read(buf)).await }) {
            Ok(r) => r,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("sftp read timed out after {limit:?}"),
            )),
        }
    }
}

/// Parent directory of a POSIX path.
pub(crate) fn posix_parent(path: &str) -> Option<&str> {
    match path.trim_end_matches('/').rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

/// Final component of a POSIX path.
pub(crate) fn posix_basename(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit_once('/')
        .map_or(path, |(_, name)| name)
}

pub(crate) fn posix_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Reject remote paths that are not absolute.
pub(crate) fn require_absolute(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!(Error::Validation(format!(
            "remote path '{path}' must be absolute"
        )));
    }
    if path.split('/').any(|p| p == "..") {
        return Err(anyhow!(Error::Validation(format!(
            "remote path '{path}' must not contain '..'"
        ))));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_helpers() {
        assert_eq!(posix_parent("/root/imgs/1/a.img.xz"), Some("/root/imgs/1"));
        assert_eq!(posix_parent("/a"), Some("/"));
        assert_eq!(posix_parent("a"), None);
        assert_eq!(posix_basename("/root/imgs/1/a.img.xz"), "a.img.xz");
        assert_eq!(posix_basename("a.img"), "a.img");
        assert_eq!(posix_join("/root/tftpi-cache/", "k.data"), "/root/tftpi-cache/k.data");
    }

    #[test]
    fn remote_paths_must_be_absolute() {
        assert!(require_absolute("/root/x").is_ok());
        assert!(require_absolute("root/x").is_err());
        assert!(require_absolute("/root/../etc").is_err());
    }
}
