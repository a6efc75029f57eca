//! tftpi - provision compute modules behind a cluster board BMC.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tftpi::builder::{BuildEnv, ImageBuilder, ImageConfig, ImageResult};
use tftpi::cache::{Cache, LocalCache, RemoteCache};
use tftpi::config::{
    default_cache_dir, BoardType, ClusterConfig, Ipv4Cidr, NetworkConfig, NodeConfig, NodeId,
};
use tftpi::engine::{InstallStep, PhaseOutcome, PostInstallStep, Provisioner};
use tftpi::imageops::{ImageBackend, ImageOps};
use tftpi::installer::{InstallRequest, OsInstaller};
use tftpi::postinstall::{CommandAction, LocalRuntime, NodeLogin, PostInstaller};
use tftpi::ssh::{Bmc, RemoteShell, SshEndpoint, SshTarget};
use tftpi::state::{Phase, StateStore};
use tftpi::{logging, Error, ExecContext};

/// tftpi - provision compute modules behind a cluster board BMC
#[derive(Parser, Debug)]
#[command(name = "tftpi")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Cluster configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cache and state directory [default: $HOME/.tftpi]
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show recorded node state
    Status {
        /// Node slot (1-4); all nodes when omitted
        node: Option<NodeId>,

        /// Mark a stuck phase as failed so it can run again
        #[arg(long, requires = "node")]
        clear: Option<String>,
    },

    /// Customize an image with the node's network settings
    PrepareImage {
        node: NodeId,

        /// XZ-compressed stock image
        #[arg(long)]
        image: PathBuf,

        /// Static address with prefix, e.g. 192.168.1.101/24
        #[arg(long)]
        ip: Ipv4Cidr,

        #[arg(long)]
        hostname: Option<String>,

        /// Copy the prepared image here
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Rebuild ignoring state and caches
        #[arg(long)]
        force: bool,
    },

    /// Flash an image and complete first boot
    InstallOs {
        node: NodeId,

        /// Prepared XZ image
        #[arg(long)]
        image: PathBuf,

        /// Password set during the first-boot change
        #[arg(long)]
        password: String,

        /// Password the stock image ships with
        #[arg(long, default_value = "ubuntu")]
        old_password: String,
    },

    /// Run the configured post-install commands
    Configure {
        node: NodeId,

        #[arg(long, default_value = "ubuntu")]
        user: String,

        #[arg(long)]
        password: String,
    },
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Status { .. } => "status",
            Commands::PrepareImage { .. } => "prepare-image",
            Commands::InstallOs { .. } => "install-os",
            Commands::Configure { .. } => "configure",
        }
    }

    fn node(&self) -> Option<NodeId> {
        match self {
            Commands::Status { node, .. } => *node,
            Commands::PrepareImage { node, .. }
            | Commands::InstallOs { node, .. }
            | Commands::Configure { node, .. } => Some(*node),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let cache_dir = cli.cache_dir.clone().unwrap_or_else(default_cache_dir);
    let log_file = match cli.command {
        Commands::Status { .. } => None,
        _ => Some(logging::log_file_path(
            &cache_dir,
            cli.command.name(),
            cli.command.node(),
        )),
    };
    logging::init(cli.verbose, log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };
    let ctx = ExecContext::background();
    cancel_on_interrupt(&ctx);
    let app = App {
        ctx,
        config,
        state: StateStore::open(&cache_dir)?,
        cache_dir,
    };

    match cli.command {
        Commands::Status { node, clear } => app.status(node, clear.as_deref()),
        Commands::PrepareImage {
            node,
            image,
            ip,
            hostname,
            output_dir,
            force,
        } => app.prepare_image(node, &image, ip, hostname, output_dir.as_deref(), force),
        Commands::InstallOs {
            node,
            image,
            password,
            old_password,
        } => app.install_os(node, &image, &password, &old_password),
        Commands::Configure {
            node,
            user,
            password,
        } => app.configure(node, &user, &password),
    }
}

/// Cancel `ctx` on the first Ctrl-C.
fn cancel_on_interrupt(ctx: &ExecContext) {
    let ctx = ctx.clone();
    std::thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                tracing::warn!("no interrupt handler: {e}");
                return;
            }
        };
        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            tracing::warn!("interrupted, cleaning up");
            ctx.cancel();
        }
    });
}

struct App {
    ctx: ExecContext,
    config: ClusterConfig,
    state: StateStore,
    cache_dir: PathBuf,
}

impl App {
    fn bmc_endpoint(&self) -> Result<Arc<SshEndpoint>> {
        let bmc = self.config.require_bmc()?;
        Ok(Arc::new(SshEndpoint::new(
            SshTarget::bmc(bmc),
            &self.config.ssh,
        )?))
    }

    fn node_config(&self, node: NodeId) -> Result<&NodeConfig> {
        self.config.node(node).ok_or_else(|| {
            Error::Validation(format!("node {node} is not in the cluster config")).into()
        })
    }

    fn open_remote_cache(&self, endpoint: &SshEndpoint) -> Result<RemoteCache> {
        RemoteCache::open_remote(
            endpoint.sftp(&self.ctx)?,
            &self.config.cache.remote_dir,
            &self.cache_dir,
            Duration::from_secs(self.config.cache.index_max_age_secs),
        )
    }

    fn status(&self, node: Option<NodeId>, clear: Option<&str>) -> Result<()> {
        if let (Some(node), Some(phase)) = (node, clear) {
            let phase = Phase::parse(phase)?;
            if self.state.clear_phase(node, phase)? {
                println!("node {node}: {phase} cleared");
            } else {
                println!("node {node}: {phase} is not running");
            }
            return Ok(());
        }

        let nodes: Vec<_> = match node {
            Some(id) => self
                .state
                .get_node_state(id)
                .map(|st| vec![(id, st)])
                .unwrap_or_default(),
            None => self.state.list_node_states(),
        };
        if nodes.is_empty() {
            println!("no recorded state");
        }
        for (id, st) in &nodes {
            println!("node {id}:");
            if let Some(board) = &st.board_type {
                println!("  board:          {board}");
            }
            if let (Some(os), Some(version)) = (&st.os_type, &st.os_version) {
                println!("  os:             {os} {version}");
            }
            if let Some(host) = &st.hostname {
                println!("  hostname:       {host}");
            }
            if let Some(ip) = &st.ip_address {
                println!("  address:        {ip}");
            }
            if let Some(path) = &st.last_image_path {
                println!("  last image:     {path}");
            }
            for phase in Phase::ALL {
                let record = st.phase(phase);
                println!("  {:<19} {:?}", format!("{phase}:"), record.status);
            }
            if let Some(op) = &st.last_operation {
                println!("  last operation: {op}");
            }
            if let Some(err) = &st.last_error {
                println!("  last error:     {err}");
            }
        }

        if self.config.bmc.is_some() {
            let endpoint = self.bmc_endpoint()?;
            let bmc = Bmc::new(endpoint.clone());
            let power = bmc.power_status(&self.ctx);
            let _ = endpoint.close();
            println!("power:");
            for (slot, on) in &power?.nodes {
                println!("  node {slot}: {}", if *on { "on" } else { "off" });
            }
        }
        Ok(())
    }

    fn prepare_image(
        &self,
        node: NodeId,
        image: &Path,
        ip: Ipv4Cidr,
        hostname: Option<String>,
        output_dir: Option<&Path>,
        force: bool,
    ) -> Result<()> {
        let source = image
            .canonicalize()
            .with_context(|| format!("image {}", image.display()))?;
        let configured = self.config.node(node);
        let board = configured
            .map(|n| n.board.clone())
            .unwrap_or(BoardType::Rk1);
        let network = NetworkConfig {
            hostname: hostname
                .or_else(|| configured.and_then(|n| n.hostname.clone()))
                .unwrap_or_else(|| format!("{board}-node{node}")),
            ip,
            gateway: configured.and_then(|n| n.gateway),
            dns: configured.map(|n| n.dns.clone()).unwrap_or_default(),
        };
        let defaults = &self.config.image;
        let stem = source
            .file_name()
            .map(|n| n.to_string_lossy().trim_end_matches(".img.xz").to_string())
            .unwrap_or_default();
        let mut builder = ImageBuilder::new();
        builder.configure(ImageConfig {
            node: Some(node),
            board: Some(board),
            os_type: defaults.os_type.clone(),
            os_version: Some(
                defaults
                    .os_version
                    .clone()
                    .unwrap_or_else(|| "custom".to_string()),
            ),
            cache_key: Some(defaults.cache_key.clone().unwrap_or(stem)),
            augment_key: defaults.augment_key || defaults.cache_key.is_none(),
            source: Some(source),
            network: Some(network),
            tags: defaults.tags.clone(),
            force_rebuild: force || defaults.force_rebuild,
            operations: Vec::new(),
        })?;

        let local = LocalCache::open_local(
            &self.cache_dir.join("local"),
            Duration::from_secs(self.config.cache.index_max_age_secs),
        )?;
        let endpoint = match self.config.bmc {
            Some(_) => Some(self.bmc_endpoint()?),
            None => None,
        };
        let remote = match &endpoint {
            Some(ep) => Some(self.open_remote_cache(ep)?),
            None => None,
        };
        let factory = || -> Result<Box<dyn ImageBackend>> { Ok(Box::new(ImageOps::for_host()?)) };
        let env = BuildEnv {
            local_cache: &local,
            remote_cache: remote.as_ref().map(|r| r as &dyn Cache),
            backend: &factory,
            base_source: None,
            work_dir: self.cache_dir.join("prep"),
        };

        let prepared = Provisioner::new(&self.state)
            .force(force)
            .prepare_image(&self.ctx, node, &builder, &env);
        if let Some(ep) = &endpoint {
            let _ = ep.close();
        }
        let prepared = prepared?;
        let image = prepared.image;

        let mut shown = image.image_path.clone();
        if let Some(dir) = output_dir {
            if image.is_remote_cache {
                println!("image is in the BMC cache; nothing copied to {}", dir.display());
            } else {
                fs::create_dir_all(dir)?;
                let dest = dir.join(&image.filename);
                fs::copy(&image.image_path, &dest)
                    .with_context(|| format!("copying image to {}", dest.display()))?;
                shown = dest.display().to_string();
            }
        }
        let how = match (prepared.skipped, image.is_remote_cache) {
            (true, _) => "unchanged",
            (false, true) => "from BMC cache",
            (false, false) => "built",
        };
        println!("node {node}: image {how}: {shown}");
        Ok(())
    }

    fn install_os(&self, node: NodeId, image: &Path, password: &str, old_password: &str) -> Result<()> {
        let node_cfg = self.node_config(node)?;
        let image = ImageResult::from_local(image, node_cfg.board.clone())?;
        let endpoint = self.bmc_endpoint()?;
        let bmc = Bmc::new(endpoint.clone());
        let settings = self.config.ssh.clone();
        let connect = move |target: SshTarget| -> Result<Arc<dyn RemoteShell>> {
            Ok(Arc::new(SshEndpoint::new(target, &settings)?))
        };
        let installer = OsInstaller::new(&bmc, &self.state, &connect);
        let step = InstallStep {
            installer: &installer,
            request: InstallRequest {
                node,
                node_ip: node_cfg.ip.addr,
                user: "ubuntu".to_string(),
                old_password: old_password.to_string(),
                new_password: password.to_string(),
            },
        };
        let outcome = Provisioner::new(&self.state).install_os(&self.ctx, &image, &step);
        let _ = endpoint.close();
        match outcome? {
            PhaseOutcome::Skipped => println!("node {node}: {} already installed", image.filename),
            PhaseOutcome::Ran(report) => {
                println!("node {node}: installed {}", report.remote_image);
                if !report.boot.login {
                    println!("node {node}: no login prompt seen on UART");
                }
            }
        }
        Ok(())
    }

    fn configure(&self, node: NodeId, user: &str, password: &str) -> Result<()> {
        let node_cfg = self.node_config(node)?;
        let settings = self.config.ssh.clone();
        let connect = move |target: SshTarget| -> Result<Arc<dyn RemoteShell>> {
            Ok(Arc::new(SshEndpoint::new(target, &settings)?))
        };
        let cwd = std::env::current_dir()?;
        let installer = PostInstaller::new(&self.state, &connect, LocalRuntime::new(cwd));
        let action = CommandAction::new(self.config.post_install.clone());
        let step = PostInstallStep {
            installer: &installer,
            login: NodeLogin {
                node,
                ip: node_cfg.ip.addr,
                user: user.to_string(),
                password: password.to_string(),
            },
            action: &action,
        };
        match Provisioner::new(&self.state).post_install(&self.ctx, &step)? {
            PhaseOutcome::Skipped => println!("node {node}: already configured"),
            PhaseOutcome::Ran(()) => println!("node {node}: configured"),
        }
        Ok(())
    }
}
