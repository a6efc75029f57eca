//! Per-node phase state machine.
//!
//! Each phase is keyed by an input hash. A phase whose last recorded run
//! completed with the same hash is skipped; one still marked running is
//! refused until an operator clears it. Every transition is written to the
//! state store before and after the phase body runs.

use anyhow::Result;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::path::Path;
use time::OffsetDateTime;

use crate::builder::{BuildEnv, ImageBuilder, ImageResult};
use crate::config::NodeId;
use crate::context::ExecContext;
use crate::error::Error;
use crate::installer::{InstallReport, InstallRequest, OsInstaller};
use crate::postinstall::{NodeLogin, PostInstallAction, PostInstaller};
use crate::state::{NodeState, Phase, PhaseStatus, StateStore};

/// Result of [`Provisioner::run_phase`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhaseOutcome<T> {
    /// Completed earlier with the same inputs.
    Skipped,
    Ran(T),
}

impl<T> PhaseOutcome<T> {
    pub fn ran(&self) -> bool {
        matches!(self, PhaseOutcome::Ran(_))
    }

    pub fn into_ran(self) -> Option<T> {
        match self {
            PhaseOutcome::Ran(v) => Some(v),
            PhaseOutcome::Skipped => None,
        }
    }
}

/// The image a node workflow continues with.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub image: ImageResult,
    /// Taken from the state record instead of being built.
    pub skipped: bool,
}

/// Installation half of a workflow.
pub struct InstallStep<'w> {
    pub installer: &'w OsInstaller<'w>,
    pub request: InstallRequest,
}

/// Post-installation half of a workflow.
pub struct PostInstallStep<'w> {
    pub installer: &'w PostInstaller<'w>,
    pub login: NodeLogin,
    pub action: &'w dyn PostInstallAction,
}

/// One node's run through the phases. Phases without a step are left
/// alone.
pub struct Workflow<'w> {
    pub node: NodeId,
    pub builder: &'w ImageBuilder,
    pub build_env: &'w BuildEnv<'w>,
    pub install: Option<InstallStep<'w>>,
    pub post_install: Option<PostInstallStep<'w>>,
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub image: PreparedImage,
    pub install: Option<PhaseOutcome<InstallReport>>,
    pub post_install: Option<PhaseOutcome<()>>,
}

/// Installation key: which image went onto which board in which slot.
pub fn install_hash(image: &ImageResult, node: NodeId) -> String {
    let image_hash = image.content_hash.as_deref().unwrap_or(&image.input_hash);
    digest(&["install", image_hash, image.board.as_str(), &node.to_string()])
}

/// Post-installation key: the action's identity in this slot.
pub fn post_install_hash(action_id: &str, node: NodeId) -> String {
    digest(&["post-install", action_id, &node.to_string()])
}

fn digest(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct Provisioner<'a> {
    state: &'a StateStore,
    force: bool,
}

impl<'a> Provisioner<'a> {
    pub fn new(state: &'a StateStore) -> Self {
        Self {
            state,
            force: false,
        }
    }

    /// Run phases even when a completed record matches.
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn state(&self) -> &StateStore {
        self.state
    }

    /// Run `f` as `phase` of `node` unless it already completed with
    /// `input_hash`.
    pub fn run_phase<T>(
        &self,
        ctx: &ExecContext,
        node: NodeId,
        phase: Phase,
        input_hash: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<PhaseOutcome<T>> {
        self.run_phase_inner(ctx, node, phase, input_hash, self.force, f)
    }

    fn run_phase_inner<T>(
        &self,
        ctx: &ExecContext,
        node: NodeId,
        phase: Phase,
        input_hash: &str,
        force: bool,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<PhaseOutcome<T>> {
        ctx.check()?;
        if let Some(current) = self.state.get_node_state(node) {
            if current.is_running(phase) {
                return Err(Error::AlreadyRunning {
                    node: node.get(),
                    phase: phase.name().to_string(),
                }
                .into());
            }
            let record = current.phase(phase);
            if !force
                && record.status == PhaseStatus::Completed
                && record.input_hash.as_deref() == Some(input_hash)
            {
                tracing::info!(node = %node, phase = %phase, "inputs unchanged, skipping");
                return Ok(PhaseOutcome::Skipped);
            }
        }

        self.state
            .set_phase(node, phase, PhaseStatus::Running, Some(input_hash), None)?;
        tracing::info!(node = %node, phase = %phase, "phase started");
        match f() {
            Ok(value) => {
                self.state
                    .set_phase(node, phase, PhaseStatus::Completed, Some(input_hash), None)?;
                tracing::info!(node = %node, phase = %phase, "phase completed");
                Ok(PhaseOutcome::Ran(value))
            }
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(se) =
                    self.state
                        .set_phase(node, phase, PhaseStatus::Failed, None, Some(&message))
                {
                    tracing::warn!(node = %node, phase = %phase, "recording failure: {se:#}");
                }
                tracing::error!(node = %node, phase = %phase, "phase failed: {message}");
                Err(e.context(format!("{phase} failed for node {node}")))
            }
        }
    }

    /// ImageCustomization. A skipped phase reuses the image recorded in
    /// state; if that image is gone the phase runs again.
    pub fn prepare_image(
        &self,
        ctx: &ExecContext,
        node: NodeId,
        builder: &ImageBuilder,
        env: &BuildEnv<'_>,
    ) -> Result<PreparedImage> {
        let input_hash = builder.input_hash(env)?;
        let force = self.force || builder.force_rebuild();
        let mut recorded = None;
        if !force {
            if let Some(state) = self.state.get_node_state(node) {
                recorded = self.recorded_image(ctx, &state, builder, env, &input_hash)?;
            }
        }

        let outcome = self.run_phase_inner(
            ctx,
            node,
            Phase::ImageCustomization,
            &input_hash,
            force || recorded.is_none(),
            || {
                let image = builder.run(ctx, env)?;
                self.record_image(node, builder, &image)?;
                Ok(image)
            },
        )?;
        match (outcome, recorded) {
            (PhaseOutcome::Ran(image), _) => Ok(PreparedImage {
                image,
                skipped: false,
            }),
            (PhaseOutcome::Skipped, Some(image)) => Ok(PreparedImage {
                image,
                skipped: true,
            }),
            (PhaseOutcome::Skipped, None) => Err(Error::NotFound(format!(
                "no recorded image for node {node}"
            ))
            .into()),
        }
    }

    /// OSInstallation of `image`.
    pub fn install_os(
        &self,
        ctx: &ExecContext,
        image: &ImageResult,
        step: &InstallStep<'_>,
    ) -> Result<PhaseOutcome<InstallReport>> {
        let node = step.request.node;
        let hash = install_hash(image, node);
        self.run_phase(ctx, node, Phase::OSInstallation, &hash, || {
            step.installer.install(ctx, image, &step.request)
        })
    }

    /// PostInstallation with the step's action.
    pub fn post_install(&self, ctx: &ExecContext, step: &PostInstallStep<'_>) -> Result<PhaseOutcome<()>> {
        let node = step.login.node;
        let hash = post_install_hash(&step.action.identity(), node);
        self.run_phase(ctx, node, Phase::PostInstallation, &hash, || {
            step.installer.run(ctx, &step.login, step.action)
        })
    }

    /// All configured phases, strictly in order.
    pub fn provision(&self, ctx: &ExecContext, workflow: &Workflow<'_>) -> Result<ProvisionReport> {
        let image = self.prepare_image(ctx, workflow.node, workflow.builder, workflow.build_env)?;
        let install = match &workflow.install {
            Some(step) => Some(self.install_os(ctx, &image.image, step)?),
            None => None,
        };
        let post_install = match &workflow.post_install {
            Some(step) => Some(self.post_install(ctx, step)?),
            None => None,
        };
        Ok(ProvisionReport {
            image,
            install,
            post_install,
        })
    }

    /// Rebuild the [`ImageResult`] of a completed image phase. `None` when
    /// the record is incomplete or the image no longer exists.
    fn recorded_image(
        &self,
        ctx: &ExecContext,
        state: &NodeState,
        builder: &ImageBuilder,
        env: &BuildEnv<'_>,
        input_hash: &str,
    ) -> Result<Option<ImageResult>> {
        let record = state.phase(Phase::ImageCustomization);
        if record.status != PhaseStatus::Completed || record.input_hash.as_deref() != Some(input_hash) {
            return Ok(None);
        }
        if state.image_from_cache {
            return builder.check_cache(ctx, env);
        }
        let (Some(path), Some(board)) = (&state.last_image_path, &state.board_type) else {
            return Ok(None);
        };
        let local = Path::new(path);
        if !local.is_file() {
            tracing::info!(image = %path, "recorded image is gone, rebuilding");
            return Ok(None);
        }
        Ok(Some(ImageResult {
            image_path: path.clone(),
            filename: local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            cache_key: builder.cache_key(env)?,
            input_hash: input_hash.to_string(),
            board: board.clone(),
            is_remote_cache: false,
            size: state.last_image_size.unwrap_or_default(),
            content_hash: state.last_image_hash.clone(),
        }))
    }

    fn record_image(&self, node: NodeId, builder: &ImageBuilder, image: &ImageResult) -> Result<()> {
        let mut props = Map::new();
        props.insert("boardType".into(), json!(image.board.as_str()));
        props.insert("lastImagePath".into(), json!(image.image_path));
        props.insert("lastImageHash".into(), json!(image.content_hash));
        props.insert("lastImageSize".into(), json!(image.size));
        props.insert(
            "lastImageTime".into(),
            json!(OffsetDateTime::now_utc().unix_timestamp()),
        );
        props.insert("imageFromCache".into(), json!(image.is_remote_cache));
        if let Some((os_type, os_version)) = builder.os_release() {
            props.insert("osType".into(), json!(os_type));
            props.insert("osVersion".into(), json!(os_version));
        }
        if let Some(net) = builder.network() {
            props.insert("hostname".into(), json!(net.hostname));
            props.insert("ipAddress".into(), json!(net.ip.to_string()));
            props.insert(
                "gateway".into(),
                net.gateway.map(|g| Value::from(g.to_string())).unwrap_or(Value::Null),
            );
            props.insert(
                "dnsServers".into(),
                Value::from(net.dns.iter().map(|d| d.to_string()).collect::<Vec<_>>()),
            );
        }
        self.state.update_node_properties(node, &props)
    }
}
