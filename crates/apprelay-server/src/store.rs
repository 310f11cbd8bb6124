//! Credential storage and audit event dispatch.
//!
//! Both are process-wide collaborators shared by every session, so all
//! implementations here are safe for concurrent use.

use apprelay_core::{BoxFuture, RelayError, RelayResult, RouteInfo};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

/// Username/password pair for an upstream target.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "u")]
    pub username: String,
    #[serde(rename = "p")]
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque per-target credential storage.
pub trait CredentialStore: Send + Sync {
    fn get<'a>(&'a self, target: &'a str) -> BoxFuture<'a, RelayResult<Option<Credentials>>>;

    /// Store credentials, returning whatever was stored before.
    fn set<'a>(
        &'a self,
        target: &'a str,
        credentials: Credentials,
    ) -> BoxFuture<'a, RelayResult<Option<Credentials>>>;
}

/// In-memory store, lost on restart.
#[derive(Default)]
pub struct MemoryCredentialStore {
    entries: RwLock<HashMap<String, Credentials>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn get<'a>(&'a self, target: &'a str) -> BoxFuture<'a, RelayResult<Option<Credentials>>> {
        Box::pin(async move { Ok(self.entries.read().await.get(target).cloned()) })
    }

    fn set<'a>(
        &'a self,
        target: &'a str,
        credentials: Credentials,
    ) -> BoxFuture<'a, RelayResult<Option<Credentials>>> {
        Box::pin(async move {
            Ok(self
                .entries
                .write()
                .await
                .insert(target.to_string(), credentials))
        })
    }
}

/// JSON file keyed by target id. Writes go to a temporary file that is
/// then renamed over the original.
pub struct JsonFileCredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> RelayResult<HashMap<String, Credentials>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                RelayError::Store(format!("corrupt credential file {}: {e}", self.path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_all(&self, entries: &HashMap<String, Credentials>) -> RelayResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entries)?).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
        }
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl CredentialStore for JsonFileCredentialStore {
    fn get<'a>(&'a self, target: &'a str) -> BoxFuture<'a, RelayResult<Option<Credentials>>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            Ok(self.read_all().await?.remove(target))
        })
    }

    fn set<'a>(
        &'a self,
        target: &'a str,
        credentials: Credentials,
    ) -> BoxFuture<'a, RelayResult<Option<Credentials>>> {
        Box::pin(async move {
            let _guard = self.lock.lock().await;
            let mut entries = self.read_all().await?;
            let previous = entries.insert(target.to_string(), credentials);
            self.write_all(&entries).await?;
            Ok(previous)
        })
    }
}

// ── Audit events ─────────────────────────────────────────────────────

pub const MSGID_MKDIR: u32 = 44;
pub const MSGID_DELETE: u32 = 45;
pub const MSGID_RENAME: u32 = 48;
pub const MSGID_DOWNLOAD: u32 = 49;
pub const MSGID_UPLOAD: u32 = 105;

/// A user-visible audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub etype: &'static str,
    pub action: &'static str,
    #[serde(rename = "nodeid")]
    pub node_id: String,
    #[serde(rename = "userid")]
    pub user_id: String,
    pub domain: String,
    #[serde(rename = "msgid", skip_serializing_if = "Option::is_none")]
    pub msg_id: Option<u32>,
    #[serde(rename = "msgArgs", skip_serializing_if = "Vec::is_empty")]
    pub msg_args: Vec<Value>,
    pub msg: String,
}

impl AuditEvent {
    /// A file operation performed on a device.
    pub fn agent_log(route: &RouteInfo, msg_id: u32, msg_args: Vec<Value>, msg: String) -> Self {
        Self {
            etype: "node",
            action: "agentlog",
            node_id: route.node_id.clone(),
            user_id: route.user_id.clone(),
            domain: route.domain_id.clone(),
            msg_id: Some(msg_id),
            msg_args,
            msg,
        }
    }

    /// Credentials were stored for a device for the first time.
    pub fn credentials_changed(route: &RouteInfo) -> Self {
        Self {
            etype: "node",
            action: "changenode",
            node_id: route.node_id.clone(),
            user_id: route.user_id.clone(),
            domain: route.domain_id.clone(),
            msg_id: None,
            msg_args: Vec::new(),
            msg: "Changed SSH credentials".to_string(),
        }
    }
}

/// Targets for file-operation audit events.
pub fn user_targets(route: &RouteInfo) -> Vec<String> {
    let mut targets = vec!["*".to_string(), "server-users".to_string()];
    targets.extend(route.groups.iter().map(|group| format!("server-users:{group}")));
    targets
}

/// Targets for device change events.
pub fn node_targets(route: &RouteInfo) -> Vec<String> {
    vec!["*".to_string(), route.node_id.clone()]
}

/// Fire-and-forget event publication.
pub trait EventDispatch: Send + Sync {
    fn publish(&self, targets: &[String], event: AuditEvent);
}

/// Writes audit events to the log under the `audit` target.
#[derive(Debug, Default)]
pub struct TracingDispatch;

impl EventDispatch for TracingDispatch {
    fn publish(&self, targets: &[String], event: AuditEvent) {
        let record = serde_json::to_string(&event).unwrap_or_default();
        info!(target: "audit", targets = ?targets, event = %record, "{}", event.msg);
    }
}

/// Collects published events in memory.
#[derive(Debug, Default)]
pub struct MemoryDispatch {
    events: std::sync::Mutex<Vec<(Vec<String>, AuditEvent)>>,
}

impl MemoryDispatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything published so far.
    pub fn events(&self) -> Vec<(Vec<String>, AuditEvent)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventDispatch for MemoryDispatch {
    fn publish(&self, targets: &[String], event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((targets.to_vec(), event));
    }
}
