//! Disk image customization.
//!
//! A prepared image is produced in one pass: the XZ source is decompressed
//! into a scratch directory, its partitions are mapped with `kpartx`, the
//! root partition is mounted, network files and staged file operations are
//! written, and the result is unmounted, unmapped and recompressed into the
//! output directory.
//!
//! [`ImageOps`] implements the steps once, over a [`Toolbox`] that decides
//! where the tools run: on the host ([`HostToolbox`]) or inside a privileged
//! utility container ([`ContainerToolbox`]). Every intermediate resource is
//! a guard ([`ScratchWorkdir`], [`MappedImage`], [`MountedRoot`]) with an
//! explicit `close()` and a best-effort `Drop`, so a failure at any step
//! unwinds whatever was set up before it.

mod container;
pub mod kpartx;
mod native;
pub mod network;

pub use container::{ContainerRuntime, ContainerToolbox, UTILITY_IMAGE};
pub use kpartx::{KpartxMaps, MappedImage};
pub use native::HostToolbox;

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::cache::sha256_file;
use crate::config::{NetworkConfig, NodeId};
use crate::context::ExecContext;
use crate::error::Error;
use crate::process::{shell_quote, CmdOutput};

/// Host directories the tools need to see during one `prepare`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mounts {
    pub source_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub output_dir: PathBuf,
}

/// Where image tools run.
pub trait Toolbox: Send + Sync {
    fn describe(&self) -> String;

    /// Make `mounts` reachable by the tools. Called at the start of every
    /// `prepare`.
    fn attach(&self, ctx: &ExecContext, mounts: &Mounts) -> Result<()>;

    /// Run `argv` and return its output whatever the exit status.
    fn exec(&self, ctx: &ExecContext, argv: &[&str]) -> Result<CmdOutput>;

    /// Path under which the tools see the host path `host`.
    fn tool_path(&self, host: &Path) -> Result<String>;

    /// Release whatever the toolbox started. Idempotent.
    fn close(&self) -> Result<()>;

    /// Like [`Toolbox::exec`], failing on a non-zero status.
    fn run(&self, ctx: &ExecContext, argv: &[&str]) -> Result<CmdOutput> {
        let out = self.exec(ctx, argv)?;
        if !out.success() {
            return Err(Error::CommandFailed {
                command: argv.join(" "),
                status: out.status,
                stdout: out.stdout,
                stderr: out.stderr,
            }
            .into());
        }
        Ok(out)
    }

    fn shell(&self, ctx: &ExecContext, script: &str) -> Result<CmdOutput> {
        self.run(ctx, &["sh", "-c", script])
    }
}

/// One mutation of the mounted root filesystem. Paths are absolute paths
/// inside the image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOperation {
    /// Replace `path` with `content`.
    Write {
        path: String,
        content: Vec<u8>,
        mode: u32,
    },
    /// Copy a host file into the image. Without a mode, the host file's
    /// permission bits are kept.
    Copy {
        source: PathBuf,
        path: String,
        mode: Option<u32>,
    },
    Mkdir {
        path: String,
        mode: u32,
    },
    /// The target must already exist.
    Chmod {
        path: String,
        mode: u32,
    },
}

impl FileOperation {
    pub fn write(path: &str, content: impl Into<Vec<u8>>, mode: u32) -> Self {
        Self::Write {
            path: path.to_string(),
            content: content.into(),
            mode,
        }
    }

    pub fn copy(source: impl Into<PathBuf>, path: &str) -> Self {
        Self::Copy {
            source: source.into(),
            path: path.to_string(),
            mode: None,
        }
    }

    pub fn mkdir(path: &str, mode: u32) -> Self {
        Self::Mkdir {
            path: path.to_string(),
            mode,
        }
    }

    pub fn chmod(path: &str, mode: u32) -> Self {
        Self::Chmod {
            path: path.to_string(),
            mode,
        }
    }

    /// Path inside the image this operation changes.
    pub fn target(&self) -> &str {
        match self {
            Self::Write { path, .. }
            | Self::Copy { path, .. }
            | Self::Mkdir { path, .. }
            | Self::Chmod { path, .. } => path,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        image_relative(self.target())?;
        if let Self::Copy { source, .. } = self {
            if !source.is_file() {
                return Err(Error::Validation(format!(
                    "copy source {} is not a file",
                    source.display()
                )));
            }
        }
        Ok(())
    }

    fn digest(&self, hasher: &mut Sha256) -> Result<()> {
        match self {
            Self::Write {
                path,
                content,
                mode,
            } => {
                hasher.update(format!("write\0{path}\0{mode:o}\0"));
                hasher.update(content);
            }
            Self::Copy { source, path, mode } => {
                let (sha, _) = sha256_file(source)?;
                hasher.update(format!("copy\0{path}\0{mode:?}\0{sha}"));
            }
            Self::Mkdir { path, mode } => hasher.update(format!("mkdir\0{path}\0{mode:o}")),
            Self::Chmod { path, mode } => hasher.update(format!("chmod\0{path}\0{mode:o}")),
        }
        hasher.update(b"\n");
        Ok(())
    }
}

impl fmt::Display for FileOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Write { path, mode, .. } => write!(f, "write {path} ({mode:04o})"),
            Self::Copy { source, path, .. } => write!(f, "copy {} -> {path}", source.display()),
            Self::Mkdir { path, mode } => write!(f, "mkdir {path} ({mode:04o})"),
            Self::Chmod { path, mode } => write!(f, "chmod {mode:04o} {path}"),
        }
    }
}

/// Strip the leading `/` and refuse anything that could leave the root.
fn image_relative(path: &str) -> Result<&str, Error> {
    let rel = path.trim_start_matches('/');
    let bad = rel.is_empty()
        || Path::new(rel)
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if bad {
        return Err(Error::Validation(format!(
            "invalid path inside image: {path:?}"
        )));
    }
    Ok(rel)
}

/// Inputs to [`ImageBackend::prepare`].
#[derive(Debug, Clone)]
pub struct PrepareOptions {
    /// Absolute path of the `.img.xz` source.
    pub source: PathBuf,
    pub network: NetworkConfig,
    pub interface: String,
    pub output_dir: PathBuf,
    pub scratch_dir: PathBuf,
    pub node: NodeId,
    /// Applied in order after the network files.
    pub operations: Vec<FileOperation>,
}

impl PrepareOptions {
    pub fn new(
        source: impl Into<PathBuf>,
        network: NetworkConfig,
        output_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        node: NodeId,
    ) -> Self {
        Self {
            source: source.into(),
            network,
            interface: network::DEFAULT_INTERFACE.to_string(),
            output_dir: output_dir.into(),
            scratch_dir: scratch_dir.into(),
            node,
            operations: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if !self.source.is_absolute() {
            return Err(Error::Validation(format!(
                "source image must be an absolute path: {}",
                self.source.display()
            )));
        }
        if self.source.extension().and_then(|e| e.to_str()) != Some("xz") {
            return Err(Error::Validation(format!(
                "source image must be XZ-compressed: {}",
                self.source.display()
            )));
        }
        if !self.source.is_file() {
            return Err(Error::NotFound(format!(
                "source image {}",
                self.source.display()
            )));
        }
        self.network.validate()?;
        if self.interface.is_empty() || self.interface.contains(char::is_whitespace) {
            return Err(Error::Validation(format!(
                "invalid interface name {:?}",
                self.interface
            )));
        }
        for op in &self.operations {
            op.validate()?;
        }
        Ok(())
    }

    /// `<output_dir>/<stem>-<hostname>.img.xz`, where `<stem>` is the
    /// source name without `.img.xz`.
    pub fn output_path(&self) -> Result<PathBuf, Error> {
        let name = self
            .source
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                Error::Validation(format!("bad source name: {}", self.source.display()))
            })?;
        let stem = name.trim_end_matches(".xz").trim_end_matches(".img");
        Ok(self
            .output_dir
            .join(format!("{stem}-{}.img.xz", self.network.hostname)))
    }

    /// Digest of the source path, network settings and the ordered file
    /// operations.
    pub fn input_hash(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(b"tftpi-image\0");
        hasher.update(self.source.to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(serde_json::to_vec(&self.network)?);
        hasher.update(b"\0");
        hasher.update(self.interface.as_bytes());
        hasher.update(b"\n");
        for op in &self.operations {
            op.digest(&mut hasher)?;
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    fn mounts(&self) -> Result<Mounts, Error> {
        let source_dir = self.source.parent().ok_or_else(|| {
            Error::Validation(format!("bad source path: {}", self.source.display()))
        })?;
        Ok(Mounts {
            source_dir: source_dir.to_path_buf(),
            scratch_dir: self.scratch_dir.clone(),
            output_dir: self.output_dir.clone(),
        })
    }
}

/// Per-build directory under the scratch dir; removed on close or drop.
///
/// Removal is refused while a mount below it could not be released, so a
/// stuck mount never has its contents deleted.
#[derive(Debug)]
pub struct ScratchWorkdir {
    path: PathBuf,
    mount_stuck: Arc<AtomicBool>,
    removed: bool,
}

impl ScratchWorkdir {
    pub fn create(scratch_dir: &Path, node: NodeId) -> Result<Self> {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let path = scratch_dir.join(format!("node{node}-{}-{nanos}", std::process::id()));
        for dir in [path.join("root"), path.join("stage")] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(Self {
            path,
            mount_stuck: Arc::new(AtomicBool::new(false)),
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Mount point of the root partition.
    pub fn mountpoint(&self) -> PathBuf {
        self.path.join("root")
    }

    /// Host files copied into the image are staged here first.
    pub fn staging(&self) -> PathBuf {
        self.path.join("stage")
    }

    fn impl_close(&mut self) -> Result<()> {
        if self.removed {
            return Ok(());
        }
        self.removed = true;
        if self.mount_stuck.load(Ordering::SeqCst) {
            bail!(
                "leaving {} in place: its mount could not be released",
                self.path.display()
            );
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for ScratchWorkdir {
    fn drop(&mut self) {
        if let Err(e) = self.impl_close() {
            tracing::warn!("{e:#}");
        }
    }
}

/// The mounted root partition; unmounted on close or drop.
pub struct MountedRoot {
    toolbox: Arc<dyn Toolbox>,
    host: PathBuf,
    tool: String,
    staging: PathBuf,
    staged: AtomicUsize,
    stuck: Arc<AtomicBool>,
    mounted: bool,
}

impl fmt::Debug for MountedRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountedRoot")
            .field("host", &self.host)
            .field("tool", &self.tool)
            .field("mounted", &self.mounted)
            .finish()
    }
}

impl MountedRoot {
    /// Host path of the mount point.
    pub fn path(&self) -> &Path {
        &self.host
    }

    /// Tool-side path of `path` inside the image.
    fn resolve(&self, path: &str) -> Result<String, Error> {
        Ok(format!("{}/{}", self.tool, image_relative(path)?))
    }

    /// Copy `write` into a fresh staging file and return its tool path.
    fn stage(&self, write: impl FnOnce(&Path) -> std::io::Result<()>) -> Result<String> {
        let n = self.staged.fetch_add(1, Ordering::SeqCst);
        let file = self.staging.join(format!("op-{n}"));
        write(&file).with_context(|| format!("Failed to stage {}", file.display()))?;
        self.toolbox.tool_path(&file)
    }

    fn impl_close(&mut self) -> Result<()> {
        if !self.mounted {
            return Ok(());
        }
        self.mounted = false;
        let ctx = &ExecContext::background();
        let first = match self.toolbox.run(ctx, &["umount", &self.tool]) {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };
        tracing::warn!("umount {} failed, retrying lazily: {first:#}", self.tool);
        match self.toolbox.run(ctx, &["umount", "-l", &self.tool]) {
            Ok(_) => Ok(()),
            Err(e) => {
                self.stuck.store(true, Ordering::SeqCst);
                Err(e).with_context(|| format!("Failed to unmount {}", self.tool))
            }
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for MountedRoot {
    fn drop(&mut self) {
        if let Err(e) = self.impl_close() {
            tracing::warn!("{e:#}");
        }
    }
}

/// Image customization steps. [`ImageBackend::prepare`] runs them all.
pub trait ImageBackend: Send + Sync {
    fn describe(&self) -> String;

    /// Produce the customized image, or leave nothing behind. Returns the
    /// existing output untouched if it is already there.
    fn prepare(&self, ctx: &ExecContext, opts: &PrepareOptions) -> Result<PathBuf>;

    /// Decompress `source` into the workdir; returns the raw image path.
    fn decompress(&self, ctx: &ExecContext, source: &Path, work: &ScratchWorkdir)
        -> Result<PathBuf>;

    fn map_partitions(&self, ctx: &ExecContext, image: &Path) -> Result<MappedImage>;

    /// Mount the root partition at the workdir mount point.
    fn mount(
        &self,
        ctx: &ExecContext,
        mapped: &MappedImage,
        work: &ScratchWorkdir,
    ) -> Result<MountedRoot>;

    /// Hostname, hosts and netplan or interfaces file.
    fn apply_network(
        &self,
        ctx: &ExecContext,
        root: &MountedRoot,
        net: &NetworkConfig,
        iface: &str,
    ) -> Result<()>;

    /// Apply `ops` in order.
    fn apply_file_operations(
        &self,
        ctx: &ExecContext,
        root: &MountedRoot,
        ops: &[FileOperation],
    ) -> Result<()>;

    fn unmount(&self, root: MountedRoot) -> Result<()>;

    fn unmap_partitions(&self, mapped: MappedImage) -> Result<()>;

    /// Compress `image` and move the result to `output`.
    fn recompress(&self, ctx: &ExecContext, image: &Path, output: &Path) -> Result<PathBuf>;

    fn close(&self) -> Result<()>;
}

/// The one [`ImageBackend`] implementation, parameterized by where the
/// tools run.
pub struct ImageOps {
    toolbox: Arc<dyn Toolbox>,
}

impl fmt::Debug for ImageOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageOps")
            .field("toolbox", &self.toolbox.describe())
            .finish()
    }
}

impl ImageOps {
    pub fn new(toolbox: Arc<dyn Toolbox>) -> Self {
        Self { toolbox }
    }

    /// Tools on the host; needs root and the tools on `PATH`.
    pub fn native() -> Result<Self> {
        Ok(Self::new(Arc::new(HostToolbox::new()?)))
    }

    /// Tools in a utility container.
    pub fn container() -> Result<Self> {
        Ok(Self::new(Arc::new(ContainerToolbox::new(
            ContainerRuntime::detect()?,
        ))))
    }

    /// Native on Linux, container elsewhere.
    pub fn for_host() -> Result<Self> {
        if cfg!(target_os = "linux") {
            Self::native()
        } else {
            Self::container()
        }
    }

    fn tool(&self, host: &Path) -> Result<String> {
        self.toolbox.tool_path(host)
    }

    fn customize(
        &self,
        ctx: &ExecContext,
        opts: &PrepareOptions,
        work: &ScratchWorkdir,
        output: &Path,
    ) -> Result<()> {
        let raw = self.decompress(ctx, &opts.source, work)?;
        let mapped = self.map_partitions(ctx, &raw)?;
        let root = self.mount(ctx, &mapped, work)?;
        self.apply_network(ctx, &root, &opts.network, &opts.interface)?;
        self.apply_file_operations(ctx, &root, &opts.operations)?;
        self.unmount(root)?;
        self.unmap_partitions(mapped)?;
        self.recompress(ctx, &raw, output)?;
        Ok(())
    }

    fn operation_script(&self, root: &MountedRoot, op: &FileOperation) -> Result<String> {
        let target = root.resolve(op.target())?;
        let script = match op {
            FileOperation::Write { content, mode, .. } => {
                let staged = root.stage(|file| fs::write(file, content))?;
                replace_script(&staged, &target, *mode)
            }
            FileOperation::Copy { source, mode, .. } => {
                let mode = match mode {
                    Some(m) => *m,
                    None => {
                        fs::metadata(source)
                            .with_context(|| format!("Failed to stat {}", source.display()))?
                            .permissions()
                            .mode()
                            & 0o7777
                    }
                };
                let staged = root.stage(|file| fs::copy(source, file).map(|_| ()))?;
                replace_script(&staged, &target, mode)
            }
            FileOperation::Mkdir { mode, .. } => {
                let t = shell_quote(&target);
                format!("mkdir -p {t} && chmod {mode:04o} {t}")
            }
            FileOperation::Chmod { mode, .. } => {
                let t = shell_quote(&target);
                format!("test -e {t} && chmod {mode:04o} {t}")
            }
        };
        Ok(script)
    }
}

/// `<output>.inputs`: input hash of the build that wrote `output`.
pub fn input_stamp_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_os_string();
    name.push(".inputs");
    PathBuf::from(name)
}

/// Stage into a sibling temp file, then rename over the target.
fn replace_script(staged: &str, target: &str, mode: u32) -> String {
    let parent = target.rsplit_once('/').map(|(p, _)| p).unwrap_or("/");
    let tmp = format!("{target}.tftpi-new");
    format!(
        "mkdir -p {p} && cp {s} {t} && chmod {mode:04o} {t} && mv -f {t} {d}",
        p = shell_quote(parent),
        s = shell_quote(staged),
        t = shell_quote(&tmp),
        d = shell_quote(target),
    )
}

impl ImageBackend for ImageOps {
    fn describe(&self) -> String {
        self.toolbox.describe()
    }

    fn prepare(&self, ctx: &ExecContext, opts: &PrepareOptions) -> Result<PathBuf> {
        opts.validate()?;
        let output = opts.output_path()?;
        let input_hash = opts.input_hash()?;
        let stamp = input_stamp_path(&output);
        if output.exists() {
            let recorded = fs::read_to_string(&stamp).unwrap_or_default();
            if recorded.trim() == input_hash {
                tracing::info!(node = %opts.node, output = %output.display(), "prepared image already exists");
                return Ok(output);
            }
            tracing::info!(node = %opts.node, output = %output.display(), "prepared image has other inputs, rebuilding");
            fs::remove_file(&output)
                .with_context(|| format!("Failed to remove {}", output.display()))?;
        }
        if stamp.exists() {
            fs::remove_file(&stamp)
                .with_context(|| format!("Failed to remove {}", stamp.display()))?;
        }
        ctx.check()?;
        for dir in [&opts.output_dir, &opts.scratch_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        self.toolbox.attach(ctx, &opts.mounts()?)?;

        tracing::info!(
            node = %opts.node,
            source = %opts.source.display(),
            backend = %self.toolbox.describe(),
            "customizing image"
        );
        let work = ScratchWorkdir::create(&opts.scratch_dir, opts.node)?;
        let built = self.customize(ctx, opts, &work, &output);
        let cleaned = work.close();
        match built {
            Ok(()) => {
                if let Err(e) = cleaned {
                    tracing::warn!("{e:#}");
                }
                fs::write(&stamp, format!("{input_hash}\n"))
                    .with_context(|| format!("Failed to write {}", stamp.display()))?;
                tracing::info!(node = %opts.node, output = %output.display(), "image prepared");
                Ok(output)
            }
            Err(e) => {
                if let Err(c) = cleaned {
                    tracing::warn!("{c:#}");
                }
                Err(e).with_context(|| format!("preparing image for node {}", opts.node))
            }
        }
    }

    fn decompress(
        &self,
        ctx: &ExecContext,
        source: &Path,
        work: &ScratchWorkdir,
    ) -> Result<PathBuf> {
        let name = source
            .file_name()
            .with_context(|| format!("bad source path {}", source.display()))?;
        let staged = work.path().join(name);
        self.toolbox
            .run(ctx, &["cp", &self.tool(source)?, &self.tool(&staged)?])
            .context("copying source image into scratch")?;
        self.toolbox
            .run(ctx, &["xz", "-d", "-f", "-T0", &self.tool(&staged)?])
            .context("decompressing image")?;
        let raw = staged.with_extension("");
        if !raw.is_file() {
            bail!("decompression did not produce {}", raw.display());
        }
        Ok(raw)
    }

    fn map_partitions(&self, ctx: &ExecContext, image: &Path) -> Result<MappedImage> {
        MappedImage::create(ctx, self.toolbox.clone(), self.tool(image)?)
    }

    fn mount(
        &self,
        ctx: &ExecContext,
        mapped: &MappedImage,
        work: &ScratchWorkdir,
    ) -> Result<MountedRoot> {
        let host = work.mountpoint();
        let tool = self.tool(&host)?;
        let device = mapped.root_device()?;
        self.toolbox
            .run(ctx, &["mount", &device, &tool])
            .with_context(|| format!("mounting {device}"))?;
        tracing::debug!(device = %device, mountpoint = %tool, "root mounted");
        Ok(MountedRoot {
            toolbox: self.toolbox.clone(),
            host,
            tool,
            staging: work.staging(),
            staged: AtomicUsize::new(0),
            stuck: work.mount_stuck.clone(),
            mounted: true,
        })
    }

    fn apply_network(
        &self,
        ctx: &ExecContext,
        root: &MountedRoot,
        net: &NetworkConfig,
        iface: &str,
    ) -> Result<()> {
        let netplan_dir = root.resolve(network::NETPLAN_DIR)?;
        let netplan = self.toolbox.exec(ctx, &["test", "-d", &netplan_dir])?.success();
        tracing::debug!(hostname = %net.hostname, netplan, "writing network configuration");
        let ops = network::network_operations(net, iface, netplan)?;
        self.apply_file_operations(ctx, root, &ops)
    }

    fn apply_file_operations(
        &self,
        ctx: &ExecContext,
        root: &MountedRoot,
        ops: &[FileOperation],
    ) -> Result<()> {
        for op in ops {
            ctx.check()?;
            let script = self.operation_script(root, op)?;
            self.toolbox
                .shell(ctx, &script)
                .with_context(|| format!("applying {op}"))?;
        }
        Ok(())
    }

    fn unmount(&self, root: MountedRoot) -> Result<()> {
        root.close()
    }

    fn unmap_partitions(&self, mapped: MappedImage) -> Result<()> {
        mapped.close()
    }

    fn recompress(&self, ctx: &ExecContext, image: &Path, output: &Path) -> Result<PathBuf> {
        let mut compressed = image.as_os_str().to_os_string();
        compressed.push(".xz");
        let compressed = PathBuf::from(compressed);
        let name = output
            .file_name()
            .with_context(|| format!("bad output path {}", output.display()))?;
        let mut partial_name = std::ffi::OsString::from(".");
        partial_name.push(name);
        partial_name.push(".partial");
        let partial = output.with_file_name(partial_name);

        let moved = (|| -> Result<()> {
            self.toolbox
                .run(ctx, &["xz", "-z", "-f", "-T0", "-k", &self.tool(image)?])
                .context("compressing image")?;
            self.toolbox
                .run(ctx, &["mv", "-f", &self.tool(&compressed)?, &self.tool(&partial)?])?;
            self.toolbox
                .run(ctx, &["mv", "-f", &self.tool(&partial)?, &self.tool(output)?])?;
            Ok(())
        })();
        if let Err(e) = moved {
            let _ = fs::remove_file(&partial);
            return Err(e).with_context(|| format!("writing {}", output.display()));
        }
        Ok(output.to_path_buf())
    }

    fn close(&self) -> Result<()> {
        self.toolbox.close()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use crate::process::Cmd;
    use std::sync::Mutex;

    pub(crate) const KPARTX_OUTPUT: &str =
        "add map loop7p1 (253:0): 0 1048576 linear 7:7 2048\n\
         add map loop7p2 (253:1): 0 7340032 linear 7:7 1050624\n";

    /// Runs file commands for real and simulates the privileged ones
    /// (`xz`, `kpartx`, `mount`, `umount`, `losetup`).
    #[derive(Default)]
    pub(crate) struct FakeToolbox {
        log: Mutex<Vec<String>>,
        fail: Mutex<Vec<String>>,
        pub(crate) netplan: bool,
        closed: AtomicBool,
    }

    impl FakeToolbox {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn with_netplan() -> Self {
            Self {
                netplan: true,
                ..Self::default()
            }
        }

        /// Commands starting with `prefix` exit 1.
        pub(crate) fn fail_on(&self, prefix: &str) {
            self.fail.lock().unwrap().push(prefix.to_string());
        }

        pub(crate) fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        pub(crate) fn ran(&self, prefix: &str) -> bool {
            self.log().iter().any(|l| l.starts_with(prefix))
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn ok(stdout: &str) -> CmdOutput {
        CmdOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    impl Toolbox for FakeToolbox {
        fn describe(&self) -> String {
            "fake".into()
        }

        fn attach(&self, _ctx: &ExecContext, _mounts: &Mounts) -> Result<()> {
            Ok(())
        }

        fn exec(&self, ctx: &ExecContext, argv: &[&str]) -> Result<CmdOutput> {
            ctx.check()?;
            let line = argv.join(" ");
            self.log.lock().unwrap().push(line.clone());
            if self.fail.lock().unwrap().iter().any(|p| line.starts_with(p)) {
                return Ok(CmdOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "simulated failure".into(),
                });
            }
            let last = argv.last().copied().unwrap_or_default();
            match argv {
                ["kpartx", "-av", ..] => Ok(ok(KPARTX_OUTPUT)),
                ["kpartx", ..] => Ok(ok("")),
                ["test", "-e", dev] if dev.starts_with("/dev/mapper/") => Ok(ok("")),
                ["losetup", ..] => Ok(CmdOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "No such device or address".into(),
                }),
                ["mount", _, dir] => {
                    if self.netplan {
                        fs::create_dir_all(Path::new(dir).join("etc/netplan"))?;
                    }
                    Ok(ok(""))
                }
                ["umount", ..] => {
                    fs::remove_dir_all(last)?;
                    fs::create_dir_all(last)?;
                    Ok(ok(""))
                }
                ["xz", "-d", ..] => {
                    fs::rename(last, last.trim_end_matches(".xz"))?;
                    Ok(ok(""))
                }
                ["xz", "-z", ..] => {
                    fs::copy(last, format!("{last}.xz"))?;
                    Ok(ok(""))
                }
                _ => Cmd::new(argv[0])
                    .args(&argv[1..])
                    .allow_fail()
                    .run_ctx(ctx),
            }
        }

        fn tool_path(&self, host: &Path) -> Result<String> {
            Ok(host.to_string_lossy().into_owned())
        }

        fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
