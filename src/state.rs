//! Durable per-node state.
//!
//! One JSON file (`tftpi_state.json`) under the cache directory holds the
//! whole [`SystemState`]. Every mutation re-reads the file under an
//! advisory lock on `<state_file>.lock`, applies the change, serializes in
//! full and renames a temp file over the original. Unparseable state is
//! treated as empty and overwritten by the next write.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::config::{BoardType, NodeId};
use crate::error::Error;

pub const STATE_FILENAME: &str = "tftpi_state.json";

/// Top-level provisioning stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    ImageCustomization,
    OSInstallation,
    PostInstallation,
}

impl Phase {
    pub const ALL: [Phase; 3] = [
        Phase::ImageCustomization,
        Phase::OSInstallation,
        Phase::PostInstallation,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::ImageCustomization => "ImageCustomization",
            Phase::OSInstallation => "OSInstallation",
            Phase::PostInstallation => "PostInstallation",
        }
    }

    pub fn start_label(self) -> String {
        format!("Start{}", self.name())
    }

    pub fn complete_label(self) -> String {
        format!("Complete{}", self.name())
    }

    pub fn failed_label(self) -> String {
        format!("Failed{}", self.name())
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        Phase::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                Error::Validation(format!(
                    "unknown phase '{s}' (expected ImageCustomization, OSInstallation or PostInstallation)"
                ))
            })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRecord {
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_hash: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

/// Last-known facts about one slot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeState {
    pub board_type: Option<BoardType>,
    pub os_type: Option<String>,
    pub os_version: Option<String>,
    pub last_image_path: Option<String>,
    pub last_image_hash: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_image_time: Option<OffsetDateTime>,
    pub last_image_size: Option<u64>,
    pub image_from_cache: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_install_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_configure_time: Option<OffsetDateTime>,
    pub hostname: Option<String>,
    pub ip_address: Option<String>,
    pub gateway: Option<String>,
    pub dns_servers: Vec<String>,
    pub password_changed: bool,
    pub last_operation: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_operation_time: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub phases: BTreeMap<String, PhaseRecord>,
}

/// Kind of a patchable field; selects the coercion rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Text,
    Timestamp,
    Unsigned,
    Flag,
    List,
}

/// Names accepted by [`StateStore::update_node_properties`].
const FIELDS: &[(&str, FieldKind)] = &[
    ("boardType", FieldKind::Text),
    ("osType", FieldKind::Text),
    ("osVersion", FieldKind::Text),
    ("lastImagePath", FieldKind::Text),
    ("lastImageHash", FieldKind::Text),
    ("lastImageTime", FieldKind::Timestamp),
    ("lastImageSize", FieldKind::Unsigned),
    ("imageFromCache", FieldKind::Flag),
    ("lastInstallTime", FieldKind::Timestamp),
    ("lastConfigureTime", FieldKind::Timestamp),
    ("hostname", FieldKind::Text),
    ("ipAddress", FieldKind::Text),
    ("gateway", FieldKind::Text),
    ("dnsServers", FieldKind::List),
    ("passwordChanged", FieldKind::Flag),
    ("lastOperation", FieldKind::Text),
    ("lastOperationTime", FieldKind::Timestamp),
    ("lastError", FieldKind::Text),
];

/// A field value after coercion.
#[derive(Debug, Clone, PartialEq)]
enum Coerced {
    Text(Option<String>),
    Timestamp(Option<OffsetDateTime>),
    Unsigned(Option<u64>),
    Flag(bool),
    List(Vec<String>),
}

impl NodeState {
    /// Status of a phase as last recorded.
    pub fn phase(&self, phase: Phase) -> PhaseRecord {
        self.phases.get(phase.name()).cloned().unwrap_or_default()
    }

    /// True if the phase was entered and never left. States without a
    /// phase record fall back to the last operation label.
    pub fn is_running(&self, phase: Phase) -> bool {
        match self.phases.get(phase.name()) {
            Some(record) => record.status == PhaseStatus::Running,
            None => self.last_operation.as_deref() == Some(phase.start_label().as_str()),
        }
    }

    /// Apply one named field. Returns `false` for unknown names.
    pub fn apply_property(&mut self, key: &str, value: &Value) -> Result<bool, Error> {
        let Some((_, kind)) = FIELDS.iter().find(|(name, _)| *name == key) else {
            return Ok(false);
        };
        let coerced = coerce(*kind, value).ok_or_else(|| {
            Error::Validation(format!("cannot convert {value} for field '{key}'"))
        })?;
        match (key, coerced) {
            ("boardType", Coerced::Text(v)) => self.board_type = v.map(BoardType::from),
            ("osType", Coerced::Text(v)) => self.os_type = v,
            ("osVersion", Coerced::Text(v)) => self.os_version = v,
            ("lastImagePath", Coerced::Text(v)) => self.last_image_path = v,
            ("lastImageHash", Coerced::Text(v)) => self.last_image_hash = v,
            ("lastImageTime", Coerced::Timestamp(v)) => self.last_image_time = v,
            ("lastImageSize", Coerced::Unsigned(v)) => self.last_image_size = v,
            ("imageFromCache", Coerced::Flag(v)) => self.image_from_cache = v,
            ("lastInstallTime", Coerced::Timestamp(v)) => self.last_install_time = v,
            ("lastConfigureTime", Coerced::Timestamp(v)) => self.last_configure_time = v,
            ("hostname", Coerced::Text(v)) => self.hostname = v,
            ("ipAddress", Coerced::Text(v)) => self.ip_address = v,
            ("gateway", Coerced::Text(v)) => self.gateway = v,
            ("dnsServers", Coerced::List(v)) => self.dns_servers = v,
            ("passwordChanged", Coerced::Flag(v)) => self.password_changed = v,
            ("lastOperation", Coerced::Text(v)) => self.last_operation = v,
            ("lastOperationTime", Coerced::Timestamp(v)) => self.last_operation_time = v,
            ("lastError", Coerced::Text(v)) => self.last_error = v,
            _ => return Ok(false),
        }
        Ok(true)
    }

    /// Read one named field back as JSON (timestamps as RFC 3339).
    pub fn property(&self, key: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.clone().map(Value::String).unwrap_or(Value::Null);
        let ts = |v: &Option<OffsetDateTime>| {
            v.and_then(|t| t.format(&Rfc3339).ok())
                .map(Value::String)
                .unwrap_or(Value::Null)
        };
        Some(match key {
            "boardType" => text(&self.board_type.as_ref().map(|b| b.to_string())),
            "osType" => text(&self.os_type),
            "osVersion" => text(&self.os_version),
            "lastImagePath" => text(&self.last_image_path),
            "lastImageHash" => text(&self.last_image_hash),
            "lastImageTime" => ts(&self.last_image_time),
            "lastImageSize" => self.last_image_size.map(Value::from).unwrap_or(Value::Null),
            "imageFromCache" => Value::Bool(self.image_from_cache),
            "lastInstallTime" => ts(&self.last_install_time),
            "lastConfigureTime" => ts(&self.last_configure_time),
            "hostname" => text(&self.hostname),
            "ipAddress" => text(&self.ip_address),
            "gateway" => text(&self.gateway),
            "dnsServers" => Value::from(self.dns_servers.clone()),
            "passwordChanged" => Value::Bool(self.password_changed),
            "lastOperation" => text(&self.last_operation),
            "lastOperationTime" => ts(&self.last_operation_time),
            "lastError" => text(&self.last_error),
            _ => return None,
        })
    }
}

fn coerce(kind: FieldKind, value: &Value) -> Option<Coerced> {
    match kind {
        FieldKind::Text => Some(Coerced::Text(match value {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => return None,
        })),
        FieldKind::Timestamp => Some(Coerced::Timestamp(match value {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(
                OffsetDateTime::parse(s, &Rfc3339)
                    .ok()
                    .or_else(|| s.parse::<i64>().ok().and_then(unix_to_datetime))?,
            ),
            Value::Number(n) => Some(n.as_i64().and_then(unix_to_datetime)?),
            _ => return None,
        })),
        FieldKind::Unsigned => Some(Coerced::Unsigned(match value {
            Value::Null => None,
            Value::Number(n) => Some(
                n.as_u64()
                    .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))?,
            ),
            Value::String(s) => Some(s.trim().parse().ok()?),
            Value::Bool(b) => Some(u64::from(*b)),
            _ => return None,
        })),
        FieldKind::Flag => Some(Coerced::Flag(match value {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" | "" => false,
                _ => return None,
            },
            _ => return None,
        })),
        FieldKind::List => Some(Coerced::List(match value {
            Value::Null => Vec::new(),
            Value::Array(items) => items
                .iter()
                .map(|item| match coerce(FieldKind::Text, item) {
                    Some(Coerced::Text(Some(s))) => Some(s),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()?,
            Value::String(s) => s
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => return None,
        })),
    }
}

fn unix_to_datetime(secs: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(secs).ok()
}

/// Whole-cluster state as stored on disk.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemState {
    #[serde(default)]
    pub nodes: BTreeMap<u8, NodeState>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

/// File-backed state store.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    inner: RwLock<SystemState>,
}

impl StateStore {
    /// Open the store at `<cache_dir>/tftpi_state.json`.
    pub fn open(cache_dir: &Path) -> Result<Self> {
        Self::open_file(&cache_dir.join(STATE_FILENAME))
    }

    pub fn open_file(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating state directory '{}'", parent.display()))?;
        }
        let mut lock_name = path.as_os_str().to_os_string();
        lock_name.push(".lock");
        let state = load_file(path);
        Ok(Self {
            path: path.to_path_buf(),
            lock_path: PathBuf::from(lock_name),
            inner: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deep copy of one node's state, reloaded from disk.
    pub fn get_node_state(&self, id: NodeId) -> Option<NodeState> {
        self.refresh();
        self.read(|s| s.nodes.get(&id.get()).cloned())
    }

    /// All recorded nodes, in slot order.
    pub fn list_node_states(&self) -> Vec<(NodeId, NodeState)> {
        self.refresh();
        self.read(|s| {
            s.nodes
                .iter()
                .filter_map(|(id, st)| NodeId::new_or_prepare(*id).ok().map(|id| (id, st.clone())))
                .collect()
        })
    }

    /// Cluster-wide last write time.
    pub fn last_updated(&self) -> Option<OffsetDateTime> {
        self.refresh();
        self.read(|s| s.last_updated)
    }

    /// Replace a node's entry.
    pub fn update_node_state(&self, id: NodeId, state: NodeState) -> Result<()> {
        self.mutate(|s| {
            s.nodes.insert(id.get(), state);
            Ok(())
        })
    }

    /// Apply only the given fields, creating the entry if absent.
    ///
    /// Unknown keys are ignored; scalar values are coerced to the field's
    /// kind (string, number, boolean, RFC 3339 or unix-seconds timestamp).
    pub fn update_node_properties(&self, id: NodeId, props: &Map<String, Value>) -> Result<()> {
        self.mutate(|s| {
            let node = s.nodes.entry(id.get()).or_default();
            for (key, value) in props {
                if !node.apply_property(key, value)? {
                    tracing::debug!(node = %id, key = %key, "ignoring unknown state property");
                }
            }
            Ok(())
        })
    }

    /// Set last-operation, its timestamp, and last-error.
    pub fn record_operation(&self, id: NodeId, label: &str, error: Option<&str>) -> Result<()> {
        self.mutate(|s| {
            let node = s.nodes.entry(id.get()).or_default();
            node.last_operation = Some(label.to_string());
            node.last_operation_time = Some(OffsetDateTime::now_utc());
            node.last_error = error.map(str::to_string);
            Ok(())
        })
    }

    /// Record a phase transition together with its operation label.
    pub fn set_phase(
        &self,
        id: NodeId,
        phase: Phase,
        status: PhaseStatus,
        input_hash: Option<&str>,
        error: Option<&str>,
    ) -> Result<()> {
        let label = match status {
            PhaseStatus::Running => phase.start_label(),
            PhaseStatus::Completed => phase.complete_label(),
            PhaseStatus::Failed => phase.failed_label(),
            PhaseStatus::Pending => format!("Reset{}", phase.name()),
        };
        self.mutate(|s| {
            let now = OffsetDateTime::now_utc();
            let node = s.nodes.entry(id.get()).or_default();
            let record = node.phases.entry(phase.name().to_string()).or_default();
            record.status = status;
            if let Some(hash) = input_hash {
                record.input_hash = Some(hash.to_string());
            }
            record.updated_at = Some(now);
            node.last_operation = Some(label);
            node.last_operation_time = Some(now);
            node.last_error = error.map(str::to_string);
            Ok(())
        })
    }

    /// Mark a stuck running phase as failed so it can be re-entered.
    pub fn clear_phase(&self, id: NodeId, phase: Phase) -> Result<bool> {
        let running = self
            .get_node_state(id)
            .is_some_and(|n| n.is_running(phase));
        if !running {
            return Ok(false);
        }
        self.set_phase(
            id,
            phase,
            PhaseStatus::Failed,
            None,
            Some("cleared by operator"),
        )?;
        Ok(true)
    }

    /// Flush the in-memory snapshot.
    pub fn save(&self) -> Result<()> {
        let snapshot = self.read(|s| s.clone());
        self.mutate(move |s| {
            for (id, node) in snapshot.nodes {
                s.nodes.entry(id).or_insert(node);
            }
            Ok(())
        })
    }

    fn read<R>(&self, f: impl FnOnce(&SystemState) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    fn refresh(&self) {
        let fresh = load_file(&self.path);
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = fresh;
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SystemState) -> Result<R>) -> Result<R> {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let _lock = StateLock::acquire(&self.lock_path)?;

        let mut state = load_file(&self.path);
        let out = f(&mut state)?;
        state.last_updated = Some(OffsetDateTime::now_utc());

        let bytes = serde_json::to_vec_pretty(&state).context("serializing state")?;
        write_atomic(&self.path, &bytes)?;
        *guard = state;
        Ok(out)
    }
}

/// Load state; missing, empty or malformed files yield an empty state.
fn load_file(path: &Path) -> SystemState {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SystemState::default(),
        Err(e) => {
            tracing::warn!(path = %path.display(), "cannot read state file, starting empty: {e}");
            return SystemState::default();
        }
    };
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return SystemState::default();
    }
    match serde_json::from_slice(&bytes) {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                "state file is corrupt, treating as empty: {e}"
            );
            SystemState::default()
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension(format!("json.tmp-{}", std::process::id()));
    fs::write(&tmp, bytes).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        let _ = fs::remove_file(&tmp);
        format!("replacing {}", path.display())
    })
}

/// Exclusive advisory lock held for the duration of one write.
#[derive(Debug)]
struct StateLock {
    file: File,
}

impl StateLock {
    fn acquire(path: &Path) -> Result<Self> {
        // Never unlink the lock file: a second process could then lock a
        // fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening lock file {}", path.display()))?;
        FileExt::lock_exclusive(&file)
            .with_context(|| format!("locking {}", path.display()))?;
        Ok(Self { file })
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    #[test]
    fn missing_file_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(store.get_node_state(node(1)).is_none());
        assert!(store.list_node_states().is_empty());
    }

    #[test]
    fn corrupt_file_is_empty_and_overwritten() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(STATE_FILENAME), b"{\"nodes\": {\"1\": ").unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(store.list_node_states().is_empty());

        store.record_operation(node(2), "StartOSInstallation", None).unwrap();
        let text = fs::read_to_string(tmp.path().join(STATE_FILENAME)).unwrap();
        let parsed: SystemState = serde_json::from_str(&text).unwrap();
        assert!(parsed.nodes.contains_key(&2));
        assert!(parsed.last_updated.is_some());
    }

    #[test]
    fn file_layout_matches_format() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.record_operation(node(1), "StartImageCustomization", None).unwrap();
        let raw: Value =
            serde_json::from_slice(&fs::read(tmp.path().join(STATE_FILENAME)).unwrap()).unwrap();
        assert!(raw["nodes"]["1"]["lastOperation"].is_string());
        assert!(raw["lastUpdated"].is_string());
    }

    #[test]
    fn properties_patch_only_given_fields() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let mut patch = Map::new();
        patch.insert("osType".into(), json!("ubuntu"));
        patch.insert("lastImageSize".into(), json!("1048576"));
        patch.insert("passwordChanged".into(), json!("yes"));
        patch.insert("lastImageTime".into(), json!(1_700_000_000));
        patch.insert("dnsServers".into(), json!("1.1.1.1, 8.8.8.8"));
        patch.insert("osVersion".into(), json!(22.04));
        patch.insert("notAField".into(), json!(true));
        store.update_node_properties(node(3), &patch).unwrap();

        let st = store.get_node_state(node(3)).unwrap();
        assert_eq!(st.os_type.as_deref(), Some("ubuntu"));
        assert_eq!(st.os_version.as_deref(), Some("22.04"));
        assert_eq!(st.last_image_size, Some(1_048_576));
        assert!(st.password_changed);
        assert_eq!(
            st.last_image_time.unwrap().unix_timestamp(),
            1_700_000_000
        );
        assert_eq!(st.dns_servers, vec!["1.1.1.1", "8.8.8.8"]);
        assert!(st.last_install_time.is_none());

        let mut second = Map::new();
        second.insert("hostname".into(), json!("rk1-node3"));
        store.update_node_properties(node(3), &second).unwrap();
        let st = store.get_node_state(node(3)).unwrap();
        assert_eq!(st.os_type.as_deref(), Some("ubuntu"));
        assert_eq!(st.hostname.as_deref(), Some("rk1-node3"));
    }

    #[test]
    fn properties_read_back_equal_after_update() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let patch: Map<String, Value> = serde_json::from_value(json!({
            "boardType": "rk1",
            "lastImagePath": "/tmp/out.img.xz",
            "lastImageSize": 42,
            "imageFromCache": true,
            "lastInstallTime": "2024-05-01T10:00:00Z",
            "dnsServers": ["1.1.1.1"],
        }))
        .unwrap();
        store.update_node_properties(node(1), &patch).unwrap();
        let st = store.get_node_state(node(1)).unwrap();
        for (key, value) in &patch {
            assert_eq!(st.property(key).as_ref(), Some(value), "field {key}");
        }
    }

    #[test]
    fn bad_coercion_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        let mut patch = Map::new();
        patch.insert("lastImageSize".into(), json!("lots"));
        assert!(store.update_node_properties(node(1), &patch).is_err());
        assert!(store.get_node_state(node(1)).is_none());
    }

    #[test]
    fn record_operation_sets_error() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store
            .record_operation(node(4), "FailedOSInstallation", Some("flash failed"))
            .unwrap();
        let st = store.get_node_state(node(4)).unwrap();
        assert_eq!(st.last_operation.as_deref(), Some("FailedOSInstallation"));
        assert_eq!(st.last_error.as_deref(), Some("flash failed"));
        assert!(st.last_operation_time.is_some());
    }

    #[test]
    fn writes_from_two_handles_are_merged() {
        let tmp = TempDir::new().unwrap();
        let a = StateStore::open(tmp.path()).unwrap();
        let b = StateStore::open(tmp.path()).unwrap();
        a.record_operation(node(1), "StartImageCustomization", None).unwrap();
        b.record_operation(node(2), "StartImageCustomization", None).unwrap();
        assert_eq!(a.list_node_states().len(), 2);
    }

    #[test]
    fn concurrent_writers_do_not_lose_updates() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().to_path_buf();
        let handles: Vec<_> = (1..=4u8)
            .map(|n| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let store = StateStore::open(&path).unwrap();
                    for _ in 0..10 {
                        store
                            .record_operation(NodeId::new(n).unwrap(), "StartOSInstallation", None)
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let store = StateStore::open(&path).unwrap();
        assert_eq!(store.list_node_states().len(), 4);
    }

    #[test]
    fn clear_phase_only_touches_running() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        assert!(!store.clear_phase(node(1), Phase::OSInstallation).unwrap());
        store
            .set_phase(node(1), Phase::OSInstallation, PhaseStatus::Running, Some("h"), None)
            .unwrap();
        assert!(store.clear_phase(node(1), Phase::OSInstallation).unwrap());
        let st = store.get_node_state(node(1)).unwrap();
        assert_eq!(st.phase(Phase::OSInstallation).status, PhaseStatus::Failed);
        assert_eq!(st.last_operation.as_deref(), Some("FailedOSInstallation"));
    }

    #[test]
    fn start_label_without_record_is_running_and_clearable() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::open(tmp.path()).unwrap();
        store.record_operation(node(2), "StartOSInstallation", None).unwrap();
        let st = store.get_node_state(node(2)).unwrap();
        assert!(st.is_running(Phase::OSInstallation));
        assert!(!st.is_running(Phase::PostInstallation));

        assert!(store.clear_phase(node(2), Phase::OSInstallation).unwrap());
        let st = store.get_node_state(node(2)).unwrap();
        assert!(!st.is_running(Phase::OSInstallation));
        assert_eq!(st.phase(Phase::OSInstallation).status, PhaseStatus::Failed);
        assert_eq!(st.last_error.as_deref(), Some("cleared by operator"));
    }
}
