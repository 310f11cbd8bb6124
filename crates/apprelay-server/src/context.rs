//! Process-scoped engine context handed to every session.

use crate::config::ServerConfig;
use crate::session::registry::SessionRegistry;
use crate::store::{CredentialStore, EventDispatch, JsonFileCredentialStore, TracingDispatch};
use crate::transport::hop::{HopConnector, WsHopConnector};
use crate::upstream::{DesktopConnector, FileConnector, ShellConnector};
use apprelay_core::cookie::generate_secret;
use apprelay_core::{CookieCodec, HmacCookieCodec, RelayResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Tunables every session reads.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub hop_url: String,
    pub domain: String,
    pub connect_timeout: Duration,
    /// Download buffer size including the 4-byte block header.
    pub block_size: usize,
    pub default_window: u32,
    pub max_window: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hop_url: "ws://127.0.0.1:443".to_string(),
            domain: String::new(),
            connect_timeout: Duration::from_secs(30),
            block_size: apprelay_core::codec::DEFAULT_BLOCK_SIZE,
            default_window: 8,
            max_window: 64,
        }
    }
}

impl From<&ServerConfig> for EngineSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            hop_url: config.hop_url.clone(),
            domain: config.domain.clone(),
            connect_timeout: config.connect_timeout,
            block_size: config.block_size,
            default_window: config.default_window,
            max_window: config.max_window,
        }
    }
}

/// Upstream client implementations linked into this process. A flavor
/// without one is refused.
#[derive(Default, Clone)]
pub struct Capabilities {
    pub desktop: Option<Arc<dyn DesktopConnector>>,
    pub shell: Option<Arc<dyn ShellConnector>>,
    pub files: Option<Arc<dyn FileConnector>>,
}

impl Capabilities {
    /// Names of the flavors that can be served.
    pub fn available(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.desktop.is_some() {
            names.push("desktop");
        }
        if self.shell.is_some() {
            names.push("shell");
        }
        if self.files.is_some() {
            names.push("files");
        }
        names
    }
}

pub struct EngineContext {
    pub settings: EngineSettings,
    pub cookies: Arc<dyn CookieCodec>,
    pub credentials: Arc<dyn CredentialStore>,
    pub events: Arc<dyn EventDispatch>,
    pub hop: Arc<dyn HopConnector>,
    pub capabilities: Capabilities,
    pub registry: SessionRegistry,
    shutdown_tx: broadcast::Sender<()>,
}

impl EngineContext {
    pub fn new(
        settings: EngineSettings,
        cookies: Arc<dyn CookieCodec>,
        credentials: Arc<dyn CredentialStore>,
        events: Arc<dyn EventDispatch>,
        hop: Arc<dyn HopConnector>,
        capabilities: Capabilities,
        max_sessions: usize,
    ) -> Self {
        Self {
            settings,
            cookies,
            credentials,
            events,
            hop,
            capabilities,
            registry: SessionRegistry::new(max_sessions),
            shutdown_tx: broadcast::channel(1).0,
        }
    }

    /// Build the production context: HMAC cookies, JSON credential file,
    /// tracing audit log and a WebSocket relay hop.
    pub fn from_config(config: &ServerConfig, capabilities: Capabilities) -> RelayResult<Self> {
        let key = if config.cookie_key.is_empty() {
            warn!("no cookie key configured, using a random key for this process");
            generate_secret()?
        } else {
            config.cookie_key.clone()
        };
        info!(
            credentials = %config.credentials_path.display(),
            flavors = ?capabilities.available(),
            "engine context ready"
        );
        Ok(Self::new(
            EngineSettings::from(config),
            Arc::new(HmacCookieCodec::new(&key, config.cookie_ttl)),
            Arc::new(JsonFileCredentialStore::new(&config.credentials_path)),
            Arc::new(TracingDispatch),
            Arc::new(WsHopConnector),
            capabilities,
            config.max_sessions,
        ))
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Ask every live session to close.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
