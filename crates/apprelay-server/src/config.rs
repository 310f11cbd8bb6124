//! Server configuration: TOML file + CLI overrides.

use apprelay_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub store: StoreSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind: default_bind(),
            max_sessions: default_max_sessions(),
        }
    }
}

/// `[relay]` section: the further hop upstream bytes travel through.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_hop_url")]
    pub hop_url: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            hop_url: default_hop_url(),
            domain: String::new(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// `[files]` section: download block sizing and windowing.
#[derive(Debug, Clone, Deserialize)]
pub struct FilesSection {
    #[serde(default = "default_block_size")]
    pub block_size: usize,
    #[serde(default = "default_window")]
    pub default_window: u32,
    #[serde(default = "default_max_window")]
    pub max_window: u32,
}

impl Default for FilesSection {
    fn default() -> Self {
        Self {
            block_size: default_block_size(),
            default_window: default_window(),
            max_window: default_max_window(),
        }
    }
}

/// `[auth]` section: routing cookie key.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub cookie_key: String,
    #[serde(default = "default_cookie_ttl")]
    pub cookie_ttl: u64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            cookie_key: String::new(),
            cookie_ttl: default_cookie_ttl(),
        }
    }
}

/// `[store]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_credentials_path")]
    pub credentials: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            credentials: default_credentials_path(),
        }
    }
}

fn default_port() -> u16 {
    4430
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_max_sessions() -> usize {
    100
}
fn default_hop_url() -> String {
    "ws://127.0.0.1:443".to_string()
}
fn default_connect_timeout() -> u64 {
    30
}
fn default_block_size() -> usize {
    apprelay_core::codec::DEFAULT_BLOCK_SIZE
}
fn default_window() -> u32 {
    8
}
fn default_max_window() -> u32 {
    64
}
fn default_cookie_ttl() -> u64 {
    3600
}
fn default_credentials_path() -> String {
    "~/.apprelay/credentials.json".to_string()
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub port: Option<u16>,
    pub hop_url: Option<String>,
    pub max_sessions: Option<usize>,
    pub connect_timeout: Option<u64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub max_sessions: usize,
    pub hop_url: String,
    pub domain: String,
    pub connect_timeout: Duration,
    pub block_size: usize,
    pub default_window: u32,
    pub max_window: u32,
    /// Raw cookie key; empty means a random key per process.
    pub cookie_key: Vec<u8>,
    pub cookie_ttl: u64,
    pub credentials_path: PathBuf,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Self::resolve(file_config, overrides)
    }

    /// Merge a parsed config file with CLI overrides and validate it.
    pub fn resolve(file: ConfigFile, overrides: ConfigOverrides) -> RelayResult<Self> {
        let port = overrides.port.unwrap_or(file.server.port);
        let ip: IpAddr = file
            .server
            .bind
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bind address: {e}")))?;

        if file.files.block_size <= apprelay_core::codec::BLOCK_HEADER_LEN {
            return Err(RelayError::Config(format!(
                "files.block_size must exceed {} bytes",
                apprelay_core::codec::BLOCK_HEADER_LEN
            )));
        }
        if file.files.max_window == 0 {
            return Err(RelayError::Config("files.max_window must be at least 1".into()));
        }

        let cookie_key = if file.auth.cookie_key.is_empty() {
            Vec::new()
        } else {
            hex::decode(file.auth.cookie_key.trim())
                .map_err(|e| RelayError::Config(format!("auth.cookie_key is not hex: {e}")))?
        };

        Ok(Self {
            bind_addr: SocketAddr::new(ip, port),
            max_sessions: overrides.max_sessions.unwrap_or(file.server.max_sessions),
            hop_url: overrides.hop_url.unwrap_or(file.relay.hop_url),
            domain: file.relay.domain,
            connect_timeout: Duration::from_secs(
                overrides.connect_timeout.unwrap_or(file.relay.connect_timeout),
            ),
            block_size: file.files.block_size,
            default_window: file.files.default_window.clamp(1, file.files.max_window),
            max_window: file.files.max_window,
            cookie_key,
            cookie_ttl: file.auth.cookie_ttl,
            credentials_path: expand_tilde_str(&file.store.credentials),
        })
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
