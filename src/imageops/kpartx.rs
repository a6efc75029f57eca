//! Partition mapping with `kpartx`.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Toolbox;
use crate::context::ExecContext;
use crate::process::CmdOutput;
use crate::error::Error;

/// How long to wait for `/dev/mapper/<name>` after `kpartx -a`.
pub const DEVICE_WAIT: Duration = Duration::from_secs(5);
const DEVICE_POLL: Duration = Duration::from_millis(200);

/// Maps reported by `kpartx -av`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KpartxMaps {
    pub maps: Vec<String>,
}

impl KpartxMaps {
    /// Parse lines like `add map loop0p2 (253:1): 0 7340032 linear 7:0 264192`.
    pub fn parse(output: &str) -> Result<Self, Error> {
        let maps: Vec<String> = output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("add map "))
            .filter_map(|rest| rest.split_whitespace().next())
            .map(str::to_string)
            .collect();
        if maps.is_empty() {
            return Err(Error::Validation(format!(
                "kpartx reported no partitions: {}",
                output.trim()
            )));
        }
        Ok(Self { maps })
    }

    /// The root filesystem is the second mapped partition.
    pub fn root(&self) -> Result<&str, Error> {
        self.maps.get(1).map(String::as_str).ok_or_else(|| {
            Error::Validation(format!(
                "expected a boot and a root partition, kpartx mapped only {:?}",
                self.maps
            ))
        })
    }

    /// Loop device behind the maps, e.g. `/dev/loop0` for `loop0p2`.
    pub fn loop_device(&self) -> Option<String> {
        let first = self.maps.first()?;
        let base = first.trim_end_matches(|c: char| c.is_ascii_digit());
        let base = base.strip_suffix('p')?;
        base.starts_with("loop").then(|| format!("/dev/{base}"))
    }
}

/// Partition maps of one disk image; removed on close or drop.
pub struct MappedImage {
    toolbox: Arc<dyn Toolbox>,
    image: String,
    maps: KpartxMaps,
    active: bool,
}

impl std::fmt::Debug for MappedImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedImage")
            .field("image", &self.image)
            .field("maps", &self.maps)
            .field("active", &self.active)
            .finish()
    }
}

impl MappedImage {
    /// Run `kpartx -av` on `image` (a tool-side path) and wait for the root
    /// mapper node.
    pub(crate) fn create(
        ctx: &ExecContext,
        toolbox: Arc<dyn Toolbox>,
        image: String,
    ) -> Result<Self> {
        let out = toolbox
            .run(ctx, &["kpartx", "-av", &image])
            .with_context(|| format!("mapping partitions of {image}"))?;
        let maps = KpartxMaps::parse(&out.stdout)?;
        let mapped = Self {
            toolbox,
            image,
            maps,
            active: true,
        };
        tracing::debug!(image = %mapped.image, maps = ?mapped.maps.maps, "partitions mapped");
        let root = mapped.root_device()?;
        mapped.wait_for(ctx, &root, DEVICE_WAIT)?;
        Ok(mapped)
    }

    /// `/dev/mapper/<root>`.
    pub fn root_device(&self) -> Result<String, Error> {
        Ok(format!("/dev/mapper/{}", self.maps.root()?))
    }

    pub fn maps(&self) -> &KpartxMaps {
        &self.maps
    }

    fn wait_for(&self, ctx: &ExecContext, device: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            ctx.check()?;
            let probe = self.toolbox.exec(ctx, &["test", "-e", device])?;
            if probe.success() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("{device} did not appear within {timeout:?}");
            }
            ctx.sleep(DEVICE_POLL)?;
        }
    }

    fn impl_close(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        // Teardown runs even when the caller's context is cancelled.
        let ctx = &ExecContext::background();
        let removed = self
            .toolbox
            .run(ctx, &["kpartx", "-dv", &self.image])
            .with_context(|| format!("removing partition maps of {}", self.image));
        if let Some(dev) = self.maps.loop_device() {
            let detached = self.toolbox.exec(ctx, &["losetup", "-d", &dev]);
            if let Some(problem) = detach_failure(detached) {
                tracing::warn!(device = %dev, "detaching loop device: {problem}");
            }
        }
        removed.map(|_| ())
    }

    /// Remove the maps and the loop device.
    pub fn close(mut self) -> Result<()> {
        self.impl_close()
    }
}

impl Drop for MappedImage {
    fn drop(&mut self) {
        if let Err(e) = self.impl_close() {
            tracing::warn!("failed to unmap {}: {e:#}", self.image);
        }
    }
}

/// Why `losetup -d` failed, if it did. kpartx -d normally detaches the
/// loop device itself, so an already-gone device is not a failure.
fn detach_failure(result: Result<CmdOutput>) -> Option<String> {
    match result {
        Ok(out) if out.success() => None,
        Ok(out) if out.stderr.contains("No such device") => None,
        Ok(out) => Some(format!("exit status {}: {}", out.status, out.stderr.trim())),
        Err(e) => Some(format!("{e:#}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OUTPUT: &str = "add map loop0p1 (253:0): 0 1048576 linear 7:0 2048\n\
                          add map loop0p2 (253:1): 0 7340032 linear 7:0 1050624\n";

    #[test]
    fn second_map_is_root() {
        let maps = KpartxMaps::parse(OUTPUT).unwrap();
        assert_eq!(maps.maps, vec!["loop0p1", "loop0p2"]);
        assert_eq!(maps.root().unwrap(), "loop0p2");
        assert_eq!(maps.loop_device().as_deref(), Some("/dev/loop0"));
    }

    #[test]
    fn single_partition_has_no_root() {
        let maps = KpartxMaps::parse("add map loop3p1 (253:0): 0 2048 linear 7:3 2048\n").unwrap();
        assert!(maps.root().is_err());
        assert_eq!(maps.loop_device().as_deref(), Some("/dev/loop3"));
    }

    #[test]
    fn empty_output_is_error() {
        assert!(KpartxMaps::parse("").is_err());
        assert!(KpartxMaps::parse("device-mapper: reload ioctl failed\n").is_err());
    }

    fn output(status: i32, stderr: &str) -> Result<CmdOutput> {
        Ok(CmdOutput {
            status,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    #[test]
    fn detach_reports_real_failures_only() {
        assert_eq!(detach_failure(output(0, "")), None);
        assert_eq!(
            detach_failure(output(1, "losetup: /dev/loop7: detach failed: No such device or address")),
            None
        );
        assert_eq!(
            detach_failure(output(1, "losetup: /dev/loop7: detach failed: Device or resource busy\n")).as_deref(),
            Some("exit status 1: losetup: /dev/loop7: detach failed: Device or resource busy")
        );
        let failed = detach_failure(Err(anyhow::anyhow!("container exited")));
        assert_eq!(failed.as_deref(), Some("container exited"));
    }

    #[test]
    fn loop_device_for_double_digit_loops() {
        let maps = KpartxMaps::parse("add map loop12p1 (253:4): 0 1 linear 7:12 1\n").unwrap();
        assert_eq!(maps.loop_device().as_deref(), Some("/dev/loop12"));
    }
}
