//! Node, board and cluster configuration.
//!
//! The cluster file is TOML:
//!
//! ```toml
//! [bmc]
//! host = "turingpi.local"
//! password = "turing"
//!
//! [[nodes]]
//! id = 1
//! ip = "192.168.1.101/24"
//! board = "rk1"
//! gateway = "192.168.1.1"
//! dns = ["1.1.1.1", "8.8.8.8"]
//! ```

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::retry::RetryPolicy;

/// Directory name under `$HOME` used when `--cache-dir` is not given.
pub const DEFAULT_CACHE_DIRNAME: &str = ".tftpi";

/// Default directory holding the remote cache on the BMC.
pub const DEFAULT_REMOTE_CACHE_DIR: &str = "/root/tftpi-cache";

/// Compute module slot. `0` is the prepare-only sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u8);

impl NodeId {
    pub const PREPARE_ONLY: NodeId = NodeId(0);
    pub const MAX: u8 = 4;

    /// A real slot in `1..=4`.
    pub fn new(n: u8) -> Result<Self, Error> {
        if (1..=Self::MAX).contains(&n) {
            Ok(Self(n))
        } else {
            Err(Error::Validation(format!(
                "node must be between 1 and {}, got {n}",
                Self::MAX
            )))
        }
    }

    /// Like [`NodeId::new`] but also accepts the prepare-only sentinel.
    pub fn new_or_prepare(n: u8) -> Result<Self, Error> {
        if n == 0 {
            Ok(Self::PREPARE_ONLY)
        } else {
            Self::new(n)
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn is_prepare_only(self) -> bool {
        self.0 == 0
    }

    /// All four slots.
    pub fn all() -> impl Iterator<Item = NodeId> {
        (1..=Self::MAX).map(NodeId)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n: u8 = s
            .trim()
            .parse()
            .map_err(|_| Error::Validation(format!("invalid node number '{s}'")))?;
        NodeId::new(n)
    }
}

/// Board fitted in a slot; selects the flashing strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BoardType {
    Rk1,
    Cm4,
    Other(String),
}

impl BoardType {
    pub fn as_str(&self) -> &str {
        match self {
            BoardType::Rk1 => "rk1",
            BoardType::Cm4 => "cm4",
            BoardType::Other(s) => s,
        }
    }
}

impl From<String> for BoardType {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "rk1" => BoardType::Rk1,
            "cm4" => BoardType::Cm4,
            _ => BoardType::Other(s),
        }
    }
}

impl From<BoardType> for String {
    fn from(b: BoardType) -> Self {
        b.as_str().to_string()
    }
}

impl fmt::Display for BoardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IPv4 address with prefix length, e.g. `192.168.1.101/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    /// Dotted netmask for the supported prefix lengths (/8, /16, /24).
    pub fn netmask(&self) -> Result<Ipv4Addr, Error> {
        netmask_for_prefix(self.prefix)
    }
}

/// Netmask selection: only /8, /16 and /24 are supported.
pub fn netmask_for_prefix(prefix: u8) -> Result<Ipv4Addr, Error> {
    match prefix {
        8 => Ok(Ipv4Addr::new(255, 0, 0, 0)),
        16 => Ok(Ipv4Addr::new(255, 255, 0, 0)),
        24 => Ok(Ipv4Addr::new(255, 255, 255, 0)),
        other => Err(Error::Validation(format!(
            "unsupported prefix length /{other} (expected /8, /16 or /24)"
        ))),
    }
}

impl FromStr for Ipv4Cidr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::Validation(format!("'{s}' is missing a /prefix")))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| Error::Validation(format!("invalid IPv4 address in '{s}'")))?;
        let prefix: u8 = prefix
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| Error::Validation(format!("invalid prefix length in '{s}'")))?;
        Ok(Self { addr, prefix })
    }
}

impl TryFrom<String> for Ipv4Cidr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Cidr> for String {
    fn from(c: Ipv4Cidr) -> Self {
        c.to_string()
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Static per-slot record.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub id: NodeId,
    pub ip: Ipv4Cidr,
    pub board: BoardType,
    pub mac: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
    pub hostname: Option<String>,
}

impl NodeConfig {
    /// Hostname used when none is configured, e.g. `rk1-node1`.
    pub fn default_hostname(&self) -> String {
        format!("{}-node{}", self.board, self.id)
    }

    /// Network settings for image customization.
    pub fn network(&self) -> NetworkConfig {
        NetworkConfig {
            hostname: self
                .hostname
                .clone()
                .unwrap_or_else(|| self.default_hostname()),
            ip: self.ip,
            gateway: self.gateway,
            dns: self.dns.clone(),
        }
    }
}

/// Network settings written into an image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    pub hostname: String,
    pub ip: Ipv4Cidr,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub dns: Vec<Ipv4Addr>,
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.hostname.trim().is_empty() {
            return Err(Error::Validation("hostname must not be empty".into()));
        }
        if !self
            .hostname
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::Validation(format!(
                "hostname '{}' may only contain letters, digits and '-'",
                self.hostname
            )));
        }
        self.ip.netmask()?;
        Ok(())
    }
}

/// Connection details for the BMC.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BmcConfig {
    pub host: String,
    #[serde(default = "default_bmc_user")]
    pub user: String,
    pub password: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
}

fn default_bmc_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

/// Timeouts and retries for remote channels.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_command_timeout() -> u64 {
    600
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            retry: RetryPolicy::default(),
        }
    }
}

impl SshSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSettings {
    #[serde(default = "default_remote_dir")]
    pub remote_dir: String,
    #[serde(default = "default_index_max_age")]
    pub index_max_age_secs: u64,
}

fn default_remote_dir() -> String {
    DEFAULT_REMOTE_CACHE_DIR.to_string()
}

fn default_index_max_age() -> u64 {
    60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            remote_dir: default_remote_dir(),
            index_max_age_secs: default_index_max_age(),
        }
    }
}

/// Defaults for image builds.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageDefaults {
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub cache_key: Option<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub force_rebuild: bool,
    #[serde(default)]
    pub augment_key: bool,
}

/// Commands run by `configure`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostInstallSettings {
    #[serde(default)]
    pub commands: Vec<String>,
    pub report_file: Option<PathBuf>,
}

/// Whole cluster configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub bmc: Option<BmcConfig>,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub image: ImageDefaults,
    #[serde(default)]
    pub post_install: PostInstallSettings,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading cluster config '{}'", path.display()))?;
        Self::parse(&text).with_context(|| format!("parsing cluster config '{}'", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: ClusterConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for node in &self.nodes {
            NodeId::new(node.id.get())?;
            if !seen.insert(node.id) {
                bail!(Error::Validation(format!("node {} is defined twice", node.id)));
            }
            node.network().validate()?;
        }
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeConfig> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn require_bmc(&self) -> Result<&BmcConfig, Error> {
        self.bmc
            .as_ref()
            .ok_or_else(|| Error::Validation("cluster config has no [bmc] section".into()))
    }
}

/// `$HOME/.tftpi`, or `./.tftpi` when no home directory is known.
pub fn default_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CACHE_DIRNAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_bounds() {
        assert!(NodeId::new(0).is_err());
        assert!(NodeId::new(5).is_err());
        assert_eq!(NodeId::new(4).unwrap().get(), 4);
        assert!(NodeId::new_or_prepare(0).unwrap().is_prepare_only());
        assert!(NodeId::new_or_prepare(5).is_err());
        assert!("0".parse::<NodeId>().is_err());
        assert_eq!("3".parse::<NodeId>().unwrap().get(), 3);
    }

    #[test]
    fn netmask_selection() {
        assert_eq!(netmask_for_prefix(24).unwrap(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(netmask_for_prefix(16).unwrap(), Ipv4Addr::new(255, 255, 0, 0));
        assert_eq!(netmask_for_prefix(8).unwrap(), Ipv4Addr::new(255, 0, 0, 0));
        assert!(netmask_for_prefix(23).is_err());
        assert!(netmask_for_prefix(32).is_err());
    }

    #[test]
    fn cidr_parse() {
        let c: Ipv4Cidr = "192.168.1.101/24".parse().unwrap();
        assert_eq!(c.addr, Ipv4Addr::new(192, 168, 1, 101));
        assert_eq!(c.prefix, 24);
        assert_eq!(c.to_string(), "192.168.1.101/24");
        assert!("192.168.1.101".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.1.101/33".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn board_type_roundtrip() {
        assert_eq!(BoardType::from("RK1".to_string()), BoardType::Rk1);
        assert_eq!(
            BoardType::from("jetson".to_string()),
            BoardType::Other("jetson".into())
        );
    }

    #[test]
    fn parses_cluster_file() {
        let config = ClusterConfig::parse(
            r#"
            [bmc]
            host = "turingpi.local"
            password = "turing"

            [ssh.retry]
            max_attempts = 2

            [[nodes]]
            id = 1
            ip = "192.168.1.101/24"
            board = "rk1"
            gateway = "192.168.1.1"
            dns = ["1.1.1.1", "8.8.8.8"]
            "#,
        )
        .unwrap();
        let bmc = config.require_bmc().unwrap();
        assert_eq!(bmc.user, "root");
        assert_eq!(bmc.port, 22);
        assert_eq!(config.ssh.retry.max_attempts, 2);
        let node = config.node(NodeId::new(1).unwrap()).unwrap();
        let net = node.network();
        assert_eq!(net.hostname, "rk1-node1");
        assert_eq!(net.dns.len(), 2);
    }

    #[test]
    fn rejects_unsupported_prefix_in_config() {
        let err = ClusterConfig::parse(
            r#"
            [[nodes]]
            id = 2
            ip = "10.0.0.2/20"
            board = "rk1"
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("/20"));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(ClusterConfig::parse("[bmc]\nhost = \"x\"\npassword = \"y\"\nbogus = 1\n").is_err());
    }
}
