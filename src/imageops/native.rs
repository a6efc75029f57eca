use anyhow::Result;
use std::path::Path;

use super::{Mounts, Toolbox};
use crate::context::ExecContext;
use crate::error::Error;
use crate::preflight;
use crate::process::{Cmd, CmdOutput};

/// Runs image tools directly on the host. Needs root.
#[derive(Debug)]
pub struct HostToolbox(());

impl HostToolbox {
    pub fn new() -> Result<Self> {
        preflight::check_native_tools()?;
        // SAFETY: geteuid has no preconditions and cannot fail.
        if unsafe { libc::geteuid() } != 0 {
            return Err(Error::Validation(
                "the native image backend mounts filesystems and must run as root".into(),
            )
            .into());
        }
        Ok(Self(()))
    }
}

impl Toolbox for HostToolbox {
    fn describe(&self) -> String {
        "host".into()
    }

    fn attach(&self, _ctx: &ExecContext, _mounts: &Mounts) -> Result<()> {
        Ok(())
    }

    fn exec(&self, ctx: &ExecContext, argv: &[&str]) -> Result<CmdOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Validation("empty command".into()))?;
        Cmd::new(program).args(args).allow_fail().run_ctx(ctx)
    }

    fn tool_path(&self, host: &Path) -> Result<String> {
        Ok(host.to_string_lossy().into_owned())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
