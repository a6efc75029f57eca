//! Customized image production with cache reuse.
//!
//! [`ImageBuilder`] turns an [`ImageConfig`] into an [`ImageResult`]. A hit
//! in the BMC cache short-circuits the build; otherwise the base image is
//! resolved (an explicit path, or the local cache filled from a
//! [`BaseImageSource`]), customized by an [`ImageBackend`], and the output
//! is uploaded to the BMC cache.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::cache::{sha256_file, Cache, CacheMetadata, ContentReader, LocalCache};
use crate::config::{BoardType, ImageDefaults, NetworkConfig, NodeConfig, NodeId};
use crate::context::ExecContext;
use crate::error::{self, Error};
use crate::imageops::{FileOperation, ImageBackend, PrepareOptions};

/// Content type recorded for prepared images.
pub const IMAGE_CONTENT_TYPE: &str = "application/x-xz";

/// Tag holding the input hash on cached images.
pub const INPUT_HASH_TAG: &str = "inputHash";

const DEFAULT_OS_TYPE: &str = "ubuntu";

/// Stock image provider used when no source path is given.
pub trait BaseImageSource: Send + Sync {
    /// XZ-compressed stock image for the OS release and board.
    fn fetch(
        &self,
        ctx: &ExecContext,
        os_type: &str,
        os_version: &str,
        board: &BoardType,
    ) -> Result<ContentReader>;
}

/// Creates the image backend for one build.
pub type BackendFactory<'a> = dyn Fn() -> Result<Box<dyn ImageBackend>> + 'a;

/// Collaborators of a build.
pub struct BuildEnv<'a> {
    /// Base images by `baseimg:<os>:<version>:<board>`.
    pub local_cache: &'a LocalCache,
    /// Prepared images on the BMC; without it every run builds locally.
    pub remote_cache: Option<&'a dyn Cache>,
    pub backend: &'a BackendFactory<'a>,
    pub base_source: Option<&'a dyn BaseImageSource>,
    /// `<cache_dir>/prep`.
    pub work_dir: PathBuf,
}

impl BuildEnv<'_> {
    pub fn scratch_dir(&self) -> PathBuf {
        self.work_dir.join("scratch")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.work_dir.join("out")
    }

    fn base_dir(&self) -> PathBuf {
        self.work_dir.join("base")
    }
}

/// What to build. Required fields are checked by [`ImageBuilder::configure`].
#[derive(Debug, Clone, Default)]
pub struct ImageConfig {
    pub node: Option<NodeId>,
    pub board: Option<BoardType>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub cache_key: Option<String>,
    /// Append the address and source name to the cache key.
    pub augment_key: bool,
    pub source: Option<PathBuf>,
    pub network: Option<NetworkConfig>,
    pub tags: BTreeMap<String, String>,
    pub force_rebuild: bool,
    pub operations: Vec<FileOperation>,
}

impl ImageConfig {
    /// Settings for a configured slot, filled from the `[image]` defaults.
    pub fn for_node(node: &NodeConfig, defaults: &ImageDefaults) -> Self {
        Self {
            node: Some(node.id),
            board: Some(node.board.clone()),
            os_type: defaults.os_type.clone(),
            os_version: defaults.os_version.clone(),
            cache_key: defaults.cache_key.clone(),
            augment_key: defaults.augment_key,
            source: None,
            network: Some(node.network()),
            tags: defaults.tags.clone(),
            force_rebuild: defaults.force_rebuild,
            operations: Vec::new(),
        }
    }
}

/// A validated [`ImageConfig`].
#[derive(Debug, Clone)]
struct Plan {
    node: NodeId,
    board: BoardType,
    os_type: String,
    os_version: String,
    cache_key: String,
    augment_key: bool,
    source: Option<PathBuf>,
    network: NetworkConfig,
    tags: BTreeMap<String, String>,
    force_rebuild: bool,
    operations: Vec<FileOperation>,
}

impl Plan {
    fn base_key(&self) -> String {
        format!("baseimg:{}:{}:{}", self.os_type, self.os_version, self.board)
    }

    fn base_filename(&self) -> String {
        format!("{}-{}-{}.img.xz", self.os_type, self.os_version, self.board)
    }

    fn source_path(&self, env: &BuildEnv<'_>) -> PathBuf {
        match &self.source {
            Some(path) => path.clone(),
            None => env.base_dir().join(self.base_filename()),
        }
    }

    fn cache_key(&self, env: &BuildEnv<'_>) -> String {
        if !self.augment_key {
            return self.cache_key.clone();
        }
        let source = self.source_path(env);
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!(
            "{}-{}_{}-{name}",
            self.cache_key, self.network.ip.addr, self.network.ip.prefix
        )
    }

    fn prepare_options(&self, env: &BuildEnv<'_>) -> PrepareOptions {
        let mut opts = PrepareOptions::new(
            self.source_path(env),
            self.network.clone(),
            env.output_dir(),
            env.scratch_dir(),
            self.node,
        );
        opts.operations = self.operations.clone();
        opts
    }
}

/// Output of a build or a cache hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageResult {
    /// Host path of the XZ, or its location in the BMC cache on a hit.
    pub image_path: String,
    /// File name of the compressed image.
    pub filename: String,
    pub cache_key: String,
    pub input_hash: String,
    pub board: BoardType,
    pub is_remote_cache: bool,
    pub size: u64,
    pub content_hash: Option<String>,
}

impl ImageResult {
    /// Describe an XZ image already on this host.
    pub fn from_local(path: &Path, board: BoardType) -> Result<Self> {
        if !path.is_file() {
            return Err(Error::NotFound(format!("image {}", path.display())).into());
        }
        let path = path
            .canonicalize()
            .with_context(|| format!("resolving {}", path.display()))?;
        let (sha, size) = sha256_file(&path)?;
        let filename = file_name(&path);
        Ok(Self {
            image_path: path.display().to_string(),
            cache_key: filename.clone(),
            filename,
            input_hash: sha.clone(),
            board,
            is_remote_cache: false,
            size,
            content_hash: Some(sha),
        })
    }
}

/// Produces customized images.
#[derive(Debug, Default)]
pub struct ImageBuilder {
    plan: Option<Plan>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and store `config`: cache key, OS version, board and a static
    /// address are required.
    pub fn configure(&mut self, config: ImageConfig) -> Result<(), Error> {
        let missing = |what: &str| Error::Validation(format!("image config: {what} is required"));
        let cache_key = config
            .cache_key
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| missing("cache key"))?;
        let os_version = config
            .os_version
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| missing("OS version"))?;
        let board = config.board.ok_or_else(|| missing("board"))?;
        let network = config.network.ok_or_else(|| missing("static IP"))?;
        network.validate()?;
        if let Some(source) = &config.source {
            if !source.is_absolute() {
                return Err(Error::Validation(format!(
                    "image path must be absolute: {}",
                    source.display()
                )));
            }
        }
        for op in &config.operations {
            op.validate()?;
        }
        self.plan = Some(Plan {
            node: config.node.unwrap_or(NodeId::PREPARE_ONLY),
            board,
            os_type: config
                .os_type
                .unwrap_or_else(|| DEFAULT_OS_TYPE.to_string()),
            os_version,
            cache_key,
            augment_key: config.augment_key,
            source: config.source,
            network,
            tags: config.tags,
            force_rebuild: config.force_rebuild,
            operations: config.operations,
        });
        Ok(())
    }

    fn plan(&self) -> Result<&Plan, Error> {
        self.plan
            .as_ref()
            .ok_or_else(|| Error::Validation("image builder is not configured".into()))
    }

    /// Cache key for the configured build.
    pub fn cache_key(&self, env: &BuildEnv<'_>) -> Result<String> {
        Ok(self.plan()?.cache_key(env))
    }

    /// Deterministic digest of the build inputs.
    pub fn input_hash(&self, env: &BuildEnv<'_>) -> Result<String> {
        self.plan()?.prepare_options(env).input_hash()
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.plan.as_ref().map(|p| &p.network)
    }

    /// `(os_type, os_version)` of the configured build.
    pub fn os_release(&self) -> Option<(&str, &str)> {
        self.plan
            .as_ref()
            .map(|p| (p.os_type.as_str(), p.os_version.as_str()))
    }

    pub fn force_rebuild(&self) -> bool {
        self.plan.as_ref().is_some_and(|p| p.force_rebuild)
    }

    /// Look the build up in the BMC cache. `None` on a miss or when there
    /// is no BMC cache.
    pub fn check_cache(&self, ctx: &ExecContext, env: &BuildEnv<'_>) -> Result<Option<ImageResult>> {
        let plan = self.plan()?;
        let Some(remote) = env.remote_cache else {
            return Ok(None);
        };
        let key = plan.cache_key(env);
        let meta = match remote.stat(ctx, &key) {
            Ok(meta) => meta,
            Err(e) if error::is_not_found(&e) => {
                tracing::debug!(key = %key, "image not in BMC cache");
                return Ok(None);
            }
            Err(e) => return Err(e).context("checking the BMC cache"),
        };
        Ok(Some(ImageResult {
            image_path: remote.content_location(&key)?,
            filename: meta.filename,
            cache_key: key,
            input_hash: self.input_hash(env)?,
            board: plan.board.clone(),
            is_remote_cache: true,
            size: meta.size,
            content_hash: meta.content_hash,
        }))
    }

    /// Build the image, or return the cached one unless `force_rebuild`.
    pub fn run(&self, ctx: &ExecContext, env: &BuildEnv<'_>) -> Result<ImageResult> {
        let plan = self.plan()?;
        if !plan.force_rebuild {
            if let Some(hit) = self.check_cache(ctx, env)? {
                tracing::info!(key = %hit.cache_key, "using image from BMC cache");
                return Ok(hit);
            }
        }

        if plan.source.is_none() {
            self.fetch_base_image(ctx, env, plan)?;
        }
        let opts = plan.prepare_options(env);
        let input_hash = opts.input_hash()?;
        let key = plan.cache_key(env);
        if plan.force_rebuild {
            let stale = opts.output_path()?;
            if stale.exists() {
                fs::remove_file(&stale)
                    .with_context(|| format!("Failed to remove {}", stale.display()))?;
            }
        }

        let backend = (env.backend)()?;
        let built = backend.prepare(ctx, &opts);
        if let Err(e) = backend.close() {
            tracing::warn!("closing image backend: {e:#}");
        }
        let output = built?;

        let (sha, size) = sha256_file(&output)?;
        let filename = file_name(&output);
        if let Some(remote) = env.remote_cache {
            let meta = CacheMetadata::new(filename.as_str())
                .content_type(IMAGE_CONTENT_TYPE)
                .tags(&plan.tags)
                .tag("board", plan.board.as_str())
                .tag(INPUT_HASH_TAG, &input_hash)
                .os(Some(plan.os_type.as_str()), Some(plan.os_version.as_str()))
                .expect_hash(&sha);
            let mut file = File::open(&output)
                .with_context(|| format!("Failed to open {}", output.display()))?;
            remote
                .put(ctx, &key, meta, &mut file)
                .with_context(|| format!("storing '{key}' in the BMC cache"))?;
            tracing::info!(key = %key, size, "image stored in BMC cache");
        }

        Ok(ImageResult {
            image_path: output.display().to_string(),
            filename,
            cache_key: key,
            input_hash,
            board: plan.board.clone(),
            is_remote_cache: false,
            size,
            content_hash: Some(sha),
        })
    }

    /// Make the stock image available at its base path, downloading it into
    /// the local cache first if needed.
    fn fetch_base_image(&self, ctx: &ExecContext, env: &BuildEnv<'_>, plan: &Plan) -> Result<()> {
        let key = plan.base_key();
        let dest = plan.source_path(env);
        if !env.local_cache.exists(ctx, &key)? {
            let source = env.base_source.ok_or_else(|| {
                Error::NotFound(format!(
                    "base image '{key}' is not cached and no download source is configured"
                ))
            })?;
            tracing::info!(key = %key, "downloading base image");
            let mut reader = source.fetch(ctx, &plan.os_type, &plan.os_version, &plan.board)?;
            let meta = CacheMetadata::new(plan.base_filename())
                .content_type(IMAGE_CONTENT_TYPE)
                .tag("board", plan.board.as_str())
                .os(Some(plan.os_type.as_str()), Some(plan.os_version.as_str()));
            env.local_cache
                .put(ctx, &key, meta, &mut reader)
                .with_context(|| format!("caching base image '{key}'"))?;
        }
        if !dest.is_file() {
            env.local_cache.materialize(ctx, &key, &dest)?;
        }
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
