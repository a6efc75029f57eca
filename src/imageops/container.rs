//! Image tools inside a long-lived privileged utility container.

use anyhow::{bail, Context, Result};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use super::{Mounts, Toolbox};
use crate::context::ExecContext;
use crate::error::Error;
use crate::preflight;
use crate::process::{Cmd, CmdOutput};

/// Tag of the utility image.
pub const UTILITY_IMAGE: &str = "tftpi-imgtools:latest";

const DOCKERFILE: &str = "\
FROM debian:bookworm-slim
RUN apt-get update \\
 && DEBIAN_FRONTEND=noninteractive apt-get install -y --no-install-recommends \\
      xz-utils kpartx util-linux mount coreutils \\
 && rm -rf /var/lib/apt/lists/*
CMD [\"sleep\", \"infinity\"]
";

const NAME_ATTEMPTS: usize = 3;

/// The `docker` or `podman` executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRuntime {
    pub program: PathBuf,
}

impl ContainerRuntime {
    /// `docker` if present, else `podman`.
    pub fn detect() -> Result<Self> {
        Ok(Self {
            program: preflight::find_container_runtime()?,
        })
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program)
    }

    fn name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

#[derive(Debug)]
struct Running {
    name: String,
    mounts: Mounts,
}

/// Runs image tools in a container owned by this instance. The container
/// is started on the first `attach` and removed by `close` or drop.
#[derive(Debug)]
pub struct ContainerToolbox {
    runtime: ContainerRuntime,
    running: Mutex<Option<Running>>,
}

impl ContainerToolbox {
    pub fn new(runtime: ContainerRuntime) -> Self {
        Self {
            runtime,
            running: Mutex::new(None),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<Running>>> {
        self.running
            .lock()
            .map_err(|_| anyhow::anyhow!("container state lock poisoned"))
    }

    fn ensure_image(&self, ctx: &ExecContext) -> Result<()> {
        let present = self
            .runtime
            .cmd()
            .args(["image", "inspect", UTILITY_IMAGE])
            .allow_fail()
            .run_ctx(ctx)?
            .success();
        if present {
            return Ok(());
        }
        tracing::info!(image = UTILITY_IMAGE, runtime = %self.runtime.name(), "building utility image");
        self.runtime
            .cmd()
            .args(["build", "-t", UTILITY_IMAGE, "-"])
            .stdin_bytes(build_context()?)
            .error_msg("Failed to build the utility image")
            .run_ctx(ctx)?;
        Ok(())
    }

    fn start(&self, ctx: &ExecContext, mounts: &Mounts) -> Result<String> {
        for dir in [&mounts.source_dir, &mounts.scratch_dir, &mounts.output_dir] {
            if !dir.is_absolute() {
                return Err(Error::Validation(format!(
                    "container bind mounts need absolute paths: {}",
                    dir.display()
                ))
                .into());
            }
        }
        let volume = |host: &Path, guest: &str, opts: &str| {
            format!("{}:{guest}{opts}", host.display())
        };
        let mut last = None;
        for _ in 0..NAME_ATTEMPTS {
            let name = container_name();
            let out = self
                .runtime
                .cmd()
                .args(["run", "-d", "--privileged", "--name", &name])
                .args(["-v", "/dev:/dev"])
                .args(["-v", &volume(&mounts.source_dir, "/src", ":ro")])
                .args(["-v", &volume(&mounts.scratch_dir, "/scratch", "")])
                .args(["-v", &volume(&mounts.output_dir, "/out", "")])
                .args([UTILITY_IMAGE, "sleep", "infinity"])
                .allow_fail()
                .run_ctx(ctx)?;
            if out.success() {
                tracing::debug!(container = %name, "utility container started");
                return Ok(name);
            }
            if !out.stderr.contains("already in use") {
                return Err(Error::CommandFailed {
                    command: format!("{} run {name}", self.runtime.name()),
                    status: out.status,
                    stdout: out.stdout,
                    stderr: out.stderr,
                })
                .context("Failed to start the utility container");
            }
            last = Some(out.stderr);
        }
        bail!(
            "no free container name after {NAME_ATTEMPTS} attempts: {}",
            last.unwrap_or_default().trim()
        )
    }

    fn stop(&self, name: &str) -> Result<()> {
        let ctx = ExecContext::background();
        let _ = self
            .runtime
            .cmd()
            .args(["stop", "-t", "2", name])
            .allow_fail()
            .run_ctx(&ctx);
        self.runtime
            .cmd()
            .args(["rm", "-f", name])
            .error_msg("Failed to remove the utility container")
            .run_ctx(&ctx)?;
        tracing::debug!(container = %name, "utility container removed");
        Ok(())
    }
}

impl Toolbox for ContainerToolbox {
    fn describe(&self) -> String {
        format!("{} container", self.runtime.name())
    }

    fn attach(&self, ctx: &ExecContext, mounts: &Mounts) -> Result<()> {
        let mut running = self.lock()?;
        if let Some(current) = running.as_ref() {
            if current.mounts == *mounts {
                return Ok(());
            }
            if let Some(old) = running.take() {
                self.stop(&old.name)?;
            }
        }
        self.ensure_image(ctx)?;
        let name = self.start(ctx, mounts)?;
        *running = Some(Running {
            name,
            mounts: mounts.clone(),
        });
        Ok(())
    }

    fn exec(&self, ctx: &ExecContext, argv: &[&str]) -> Result<CmdOutput> {
        let name = match self.lock()?.as_ref() {
            Some(r) => r.name.clone(),
            None => bail!("utility container is not running"),
        };
        self.runtime
            .cmd()
            .args(["exec", &name])
            .args(argv)
            .allow_fail()
            .run_ctx(ctx)
    }

    fn tool_path(&self, host: &Path) -> Result<String> {
        let running = self.lock()?;
        let mounts = match running.as_ref() {
            Some(r) => &r.mounts,
            None => bail!("utility container is not running"),
        };
        guest_path(mounts, host)
    }

    fn close(&self) -> Result<()> {
        let taken = self.lock()?.take();
        match taken {
            Some(r) => self.stop(&r.name),
            None => Ok(()),
        }
    }
}

impl Drop for ContainerToolbox {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("{e:#}");
        }
    }
}

/// Map a host path to its bind mount inside the container, preferring
/// the most specific mount.
fn guest_path(mounts: &Mounts, host: &Path) -> Result<String> {
    let candidates = [
        (&mounts.source_dir, "/src"),
        (&mounts.scratch_dir, "/scratch"),
        (&mounts.output_dir, "/out"),
    ];
    let best = candidates
        .iter()
        .filter_map(|(dir, guest)| host.strip_prefix(dir).ok().map(|rel| (dir, guest, rel)))
        .max_by_key(|(dir, _, _)| dir.components().count());
    match best {
        Some((_, guest, rel)) if rel.as_os_str().is_empty() => Ok(guest.to_string()),
        Some((_, guest, rel)) => Ok(format!("{guest}/{}", rel.to_string_lossy())),
        None => bail!("{} is outside the container's bind mounts", host.display()),
    }
}

/// `tftpi-imgtools-<unix>-<random>`.
fn container_name() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u32(std::process::id());
    format!("tftpi-imgtools-{secs}-{:08x}", hasher.finish() as u32)
}

/// Tar build context holding only the Dockerfile.
fn build_context() -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(DOCKERFILE.len() as u64);
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", DOCKERFILE.as_bytes())?;
    builder
        .into_inner()
        .context("Failed to finalize build context")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn mounts() -> Mounts {
        Mounts {
            source_dir: PathBuf::from("/home/op/images"),
            scratch_dir: PathBuf::from("/home/op/.tftpi/prep"),
            output_dir: PathBuf::from("/home/op/.tftpi/prep/out"),
        }
    }

    #[test]
    fn maps_host_paths_to_mounts() {
        let m = mounts();
        assert_eq!(
            guest_path(&m, Path::new("/home/op/images/ubuntu.img.xz")).unwrap(),
            "/src/ubuntu.img.xz"
        );
        assert_eq!(
            guest_path(&m, Path::new("/home/op/.tftpi/prep/node1-1/root")).unwrap(),
            "/scratch/node1-1/root"
        );
        assert_eq!(
            guest_path(&m, Path::new("/home/op/.tftpi/prep/out/a.img.xz")).unwrap(),
            "/out/a.img.xz"
        );
        assert_eq!(guest_path(&m, Path::new("/home/op/images")).unwrap(), "/src");
        assert!(guest_path(&m, Path::new("/etc/passwd")).is_err());
    }

    #[test]
    fn names_are_unique() {
        let a = container_name();
        let b = container_name();
        assert!(a.starts_with("tftpi-imgtools-"));
        assert_ne!(a, b);
    }

    #[test]
    fn build_context_contains_dockerfile() {
        let bytes = build_context().unwrap();
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("Dockerfile"));
        let mut text = String::new();
        entry.read_to_string(&mut text).unwrap();
        assert!(text.contains("kpartx"));
        assert!(text.contains("xz-utils"));
        assert!(entries.next().is_none());
    }

    #[test]
    fn unattached_toolbox_refuses_commands() {
        let toolbox = ContainerToolbox::new(ContainerRuntime {
            program: PathBuf::from("/nonexistent/docker"),
        });
        assert!(toolbox
            .exec(&ExecContext::background(), &["true"])
            .is_err());
        assert!(toolbox.tool_path(Path::new("/tmp")).is_err());
        assert!(toolbox.close().is_ok());
    }
}
