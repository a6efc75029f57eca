//! Vendor (`tpi`) commands on the BMC.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{RemoteOutput, RemoteShell};
use crate::config::NodeId;
use crate::context::ExecContext;
use crate::error::Error;
use crate::process::shell_quote;

/// Power state per slot from `tpi power status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PowerStatus {
    pub nodes: BTreeMap<u8, bool>,
}

impl PowerStatus {
    /// Parse lines of the form `node1: on`.
    pub fn parse(text: &str) -> Self {
        let mut nodes = BTreeMap::new();
        for line in text.lines() {
            let Some((left, right)) = line.split_once(':') else {
                continue;
            };
            let left = left.trim().to_ascii_lowercase();
            let Ok(slot) = left.trim_start_matches("node").trim().parse::<u8>() else {
                continue;
            };
            let state = match right.trim().to_ascii_lowercase().as_str() {
                "on" | "1" | "true" => true,
                "off" | "0" | "false" => false,
                _ => continue,
            };
            nodes.insert(slot, state);
        }
        Self { nodes }
    }

    pub fn is_on(&self, node: NodeId) -> Option<bool> {
        self.nodes.get(&node.get()).copied()
    }
}

/// `key: value` facts from `tpi info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BmcInfo {
    pub fields: BTreeMap<String, String>,
}

impl BmcInfo {
    /// Accepts `key: value` lines and `| key | value |` table rows.
    pub fn parse(text: &str) -> Self {
        let mut fields = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            let pair = if line.starts_with('|') {
                let cells: Vec<&str> = line
                    .split('|')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .collect();
                match cells.as_slice() {
                    [k, v] => Some((*k, *v)),
                    _ => None,
                }
            } else {
                line.split_once(':').map(|(k, v)| (k.trim(), v.trim()))
            };
            if let Some((k, v)) = pair {
                if !k.is_empty() && !k.starts_with('-') {
                    fields.insert(k.to_string(), v.to_string());
                }
            }
        }
        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// True if flash output shows the vendor API refusing local connections.
pub fn is_wedged_output(out: &RemoteOutput) -> bool {
    let text = format!("{}\n{}", out.stdout, out.stderr);
    text.contains("Connection refused") && text.contains("127.0.0.1")
}

/// BMC endpoint plus vendor helpers.
#[derive(Clone)]
pub struct Bmc {
    shell: Arc<dyn RemoteShell>,
}

impl std::fmt::Debug for Bmc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bmc")
            .field("shell", &self.shell.describe())
            .finish()
    }
}

impl Bmc {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self { shell }
    }

    pub fn shell(&self) -> &dyn RemoteShell {
        self.shell.as_ref()
    }

    pub fn power_on(&self, ctx: &ExecContext, node: NodeId) -> Result<()> {
        self.shell
            .run(ctx, &format!("tpi power on --node {node}"))
            .with_context(|| format!("powering on node {node}"))?;
        Ok(())
    }

    pub fn power_off(&self, ctx: &ExecContext, node: NodeId) -> Result<()> {
        self.shell
            .run(ctx, &format!("tpi power off --node {node}"))
            .with_context(|| format!("powering off node {node}"))?;
        Ok(())
    }

    pub fn power_status(&self, ctx: &ExecContext) -> Result<PowerStatus> {
        let out = self
            .shell
            .run(ctx, "tpi power status")
            .context("reading power status")?;
        Ok(PowerStatus::parse(&out.stdout))
    }

    pub fn info(&self, ctx: &ExecContext) -> Result<BmcInfo> {
        let out = self.shell.run(ctx, "tpi info").context("reading BMC info")?;
        Ok(BmcInfo::parse(&out.stdout))
    }

    /// Flash an image already on the BMC. Refused local connections are
    /// reported as [`Error::BmcWedged`].
    pub fn flash(&self, ctx: &ExecContext, node: NodeId, image_path: &str) -> Result<RemoteOutput> {
        let command = format!(
            "tpi flash --local --image-path {} --node {node}",
            shell_quote(image_path)
        );
        let out = self.shell.run_raw(ctx, &command)?;
        if is_wedged_output(&out) {
            let detail = out
                .stdout
                .lines()
                .chain(out.stderr.lines())
                .find(|l| l.contains("Connection refused"))
                .unwrap_or("Connection refused")
                .trim()
                .to_string();
            return Err(Error::BmcWedged { detail }.into());
        }
        out.check(&command)
            .map_err(anyhow::Error::from)
            .with_context(|| format!("flashing node {node}"))
    }

    /// One UART snapshot for `node`.
    pub fn uart_read(&self, ctx: &ExecContext, node: NodeId) -> Result<String> {
        let out = self
            .shell
            .run(ctx, &format!("tpi uart --node {node} get"))
            .with_context(|| format!("reading UART of node {node}"))?;
        Ok(out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fake::{self, FakeShell};
    use super::*;
    use crate::error;

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[test]
    fn parses_power_table() {
        let status = PowerStatus::parse("node1: on\nnode2: off\nnode3: On\nnode4: off\n");
        assert_eq!(status.is_on(node(1)), Some(true));
        assert_eq!(status.is_on(node(2)), Some(false));
        assert_eq!(status.is_on(node(3)), Some(true));
        assert_eq!(status.nodes.len(), 4);
        assert!(PowerStatus::parse("garbage").nodes.is_empty());
    }

    #[test]
    fn parses_info_in_both_layouts() {
        let info = BmcInfo::parse("api: 1.1\nbuild_version: 2.0.5\n");
        assert_eq!(info.get("build_version"), Some("2.0.5"));
        let table = BmcInfo::parse(
            "|---------------|----------|\n| ip            | 10.0.0.5 |\n| mac           | aa:bb    |\n",
        );
        assert_eq!(table.get("ip"), Some("10.0.0.5"));
        assert_eq!(table.get("mac"), Some("aa:bb"));
    }

    #[test]
    fn wedged_flash_is_distinct() {
        let shell = Arc::new(FakeShell::new());
        shell.on(
            "tpi flash",
            RemoteOutput {
                stdout: "Error: error sending request for url (http://127.0.0.1/api/bmc): Connection refused (os error 111)".into(),
                stderr: String::new(),
                status: 1,
            },
        );
        let bmc = Bmc::new(shell.clone());
        let err = bmc
            .flash(&ExecContext::background(), node(1), "/root/imgs/1/a.img")
            .unwrap_err();
        assert!(matches!(error::kind(&err), Some(Error::BmcWedged { .. })));
        assert!(!crate::retry::is_retriable(&err));
    }

    #[test]
    fn flash_failure_is_command_failed() {
        let shell = Arc::new(FakeShell::new());
        shell.on("tpi flash", fake::status(2, "image not found"));
        let bmc = Bmc::new(shell);
        let err = bmc
            .flash(&ExecContext::background(), node(2), "/root/imgs/2/a.img")
            .unwrap_err();
        assert!(matches!(
            error::kind(&err),
            Some(Error::CommandFailed { status: 2, .. })
        ));
    }

    #[test]
    fn power_commands_target_node() {
        let shell = Arc::new(FakeShell::new());
        let bmc = Bmc::new(shell.clone());
        let ctx = ExecContext::background();
        bmc.power_off(&ctx, node(3)).unwrap();
        bmc.power_on(&ctx, node(3)).unwrap();
        assert_eq!(
            shell.log(),
            vec!["tpi power off --node 3", "tpi power on --node 3"]
        );
    }
}
