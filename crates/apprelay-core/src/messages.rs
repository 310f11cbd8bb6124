//! JSON control messages exchanged with the browser.
//!
//! Terminal and file sessions use objects tagged by `action`; remote
//! desktop sessions use arrays whose first element names the message.

use crate::error::{RelayError, RelayResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

/// Parse a JSON control frame.
///
/// Invalid JSON is a protocol violation and returns an error. A well-formed
/// message with an unknown tag, or a known tag with missing or mistyped
/// fields, yields `Ok(None)` so the caller can ignore it.
pub fn parse_control<T: DeserializeOwned>(data: &[u8]) -> RelayResult<Option<T>> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| RelayError::Protocol(format!("malformed control frame: {e}")))?;
    match value.get("action") {
        Some(Value::String(_)) => Ok(serde_json::from_value(value).ok()),
        _ => Ok(None),
    }
}

/// Terminal geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalSize {
    pub rows: u32,
    pub cols: u32,
    /// Pixel height.
    pub height: u32,
    /// Pixel width.
    pub width: u32,
}

// ── Terminal flavor ──────────────────────────────────────────────────

/// Login request carrying terminal geometry.
#[derive(Clone, Deserialize)]
pub struct ShellLogin {
    pub username: String,
    pub password: String,
    pub rows: u32,
    pub cols: u32,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub keep: Option<bool>,
}

impl ShellLogin {
    pub fn size(&self) -> TerminalSize {
        TerminalSize {
            rows: self.rows,
            cols: self.cols,
            height: self.height,
            width: self.width,
        }
    }
}

impl fmt::Debug for ShellLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellLogin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("size", &self.size())
            .field("keep", &self.keep)
            .finish()
    }
}

/// Control messages a terminal client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ShellRequest {
    Sshauth(ShellLogin),
    /// Legacy login without credential persistence.
    Connect(ShellLogin),
    Sshautoauth(TerminalSize),
    Resize(TerminalSize),
}

// ── File flavor ──────────────────────────────────────────────────────

/// Login request for the file flavor (no geometry).
#[derive(Clone, Deserialize)]
pub struct FileLogin {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub keep: Option<bool>,
}

impl fmt::Debug for FileLogin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileLogin")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("keep", &self.keep)
            .finish()
    }
}

/// Control messages a file client may send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileRequest {
    Ls {
        path: String,
        #[serde(default)]
        reqid: Value,
    },
    Mkdir {
        path: String,
        #[serde(default)]
        reqid: Value,
    },
    Rm {
        path: String,
        delfiles: Vec<String>,
        #[serde(default)]
        rec: bool,
        #[serde(default)]
        reqid: Value,
    },
    Rename {
        path: String,
        oldname: String,
        newname: String,
        #[serde(default)]
        reqid: Value,
    },
    Upload {
        path: String,
        name: String,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        reqid: Value,
    },
    Uploaddone {
        #[serde(default)]
        reqid: Value,
    },
    Uploadcancel {
        #[serde(default)]
        reqid: Value,
    },
    Download(DownloadRequest),
    Sshauth(FileLogin),
}

/// Sub-commands of the windowed download protocol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "sub", rename_all = "lowercase")]
pub enum DownloadRequest {
    Start {
        path: String,
        id: Value,
    },
    Startack {
        id: Value,
        #[serde(default)]
        ack: Option<Value>,
    },
    Ack {
        id: Value,
    },
    Stop {
        id: Value,
    },
}

/// One directory entry in an `ls` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingEntry {
    /// 2 = directory, 3 = file.
    pub t: u8,
    /// Name.
    pub n: String,
    /// Modification time, ISO-8601 UTC.
    pub d: String,
    /// Size in bytes, files only.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub s: Option<u64>,
}

pub const ENTRY_DIRECTORY: u8 = 2;
pub const ENTRY_FILE: u8 = 3;

/// Reply to `ls`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirListing {
    pub path: String,
    pub reqid: Value,
    pub dir: Vec<ListingEntry>,
}

// ── Server notices ───────────────────────────────────────────────────

/// Control messages sent to terminal and file clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Notice {
    /// Ask the client for credentials.
    Sshauth,
    /// Stored credentials exist; the client may auto-login.
    Sshautoauth,
    Autherror,
    Sessiontimeout,
    Connectionerror,
    Sessionerror,
    Uploadstart { reqid: Value },
    Uploadack { reqid: Value },
    Uploaddone { reqid: Value },
    Uploadcancel { reqid: Value },
    Uploaderror { reqid: Value },
    Download { sub: DownloadNotice, id: Value },
    Fileerror { op: String, path: String, reqid: Value },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadNotice {
    Start,
    Cancel,
}

impl Notice {
    pub fn to_json(&self) -> String {
        // Serializing a plain enum of strings and JSON values cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

// ── Remote desktop flavor ────────────────────────────────────────────

/// Requested screen size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

/// Connection parameters sent by the desktop client in `infos`.
#[derive(Clone, Default, Deserialize)]
pub struct DesktopInfos {
    /// Routing cookie for the relay hop.
    pub ip: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub screen: ScreenSize,
    #[serde(default)]
    pub locale: String,
}

impl fmt::Debug for DesktopInfos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DesktopInfos")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("screen", &self.screen)
            .field("locale", &self.locale)
            .finish()
    }
}

/// Control messages a desktop client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum DesktopRequest {
    Infos(Box<DesktopInfosEq>),
    Mouse { x: i32, y: i32, button: i32, down: bool },
    Wheel { x: i32, y: i32, step: i32, negative: bool, horizontal: bool },
    Scancode { code: u32, down: bool },
    Unicode { code: u32, down: bool },
    Disconnect,
}

/// [`DesktopInfos`] wrapper comparable in tests without exposing the password.
#[derive(Debug, Clone)]
pub struct DesktopInfosEq(pub DesktopInfos);

impl PartialEq for DesktopInfosEq {
    fn eq(&self, other: &Self) -> bool {
        self.0.ip == other.0.ip
            && self.0.username == other.0.username
            && self.0.domain == other.0.domain
            && self.0.screen == other.0.screen
    }
}

impl DesktopRequest {
    /// Parse a `["name", args...]` frame. Same error policy as
    /// [`parse_control`].
    pub fn parse(data: &[u8]) -> RelayResult<Option<Self>> {
        let value: Value = serde_json::from_slice(data)
            .map_err(|e| RelayError::Protocol(format!("malformed desktop frame: {e}")))?;
        let Some(items) = value.as_array() else {
            return Ok(None);
        };
        let Some(name) = items.first().and_then(Value::as_str) else {
            return Ok(None);
        };
        // Out-of-range numbers count as ill-typed fields.
        let int = |i: usize| {
            items
                .get(i)
                .and_then(Value::as_i64)
                .and_then(|v| i32::try_from(v).ok())
        };
        let uint = |i: usize| {
            items
                .get(i)
                .and_then(Value::as_u64)
                .and_then(|v| u32::try_from(v).ok())
        };
        let flag = |i: usize| items.get(i).map(truthy);

        let msg = match name {
            "infos" => items
                .get(1)
                .and_then(|v| serde_json::from_value::<DesktopInfos>(v.clone()).ok())
                .map(|i| DesktopRequest::Infos(Box::new(DesktopInfosEq(i)))),
            "mouse" => match (int(1), int(2), int(3), flag(4)) {
                (Some(x), Some(y), Some(button), Some(down)) => {
                    Some(DesktopRequest::Mouse { x, y, button, down })
                }
                _ => None,
            },
            "wheel" => match (int(1), int(2), int(3)) {
                (Some(x), Some(y), Some(step)) => Some(DesktopRequest::Wheel {
                    x,
                    y,
                    step,
                    negative: flag(4).unwrap_or(false),
                    horizontal: flag(5).unwrap_or(false),
                }),
                _ => None,
            },
            "scancode" => match (uint(1), flag(2)) {
                (Some(code), Some(down)) => Some(DesktopRequest::Scancode { code, down }),
                _ => None,
            },
            "unicode" => match (uint(1), flag(2)) {
                (Some(code), Some(down)) => Some(DesktopRequest::Unicode { code, down }),
                _ => None,
            },
            "disconnect" => Some(DesktopRequest::Disconnect),
            _ => None,
        };
        Ok(msg)
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

/// `["rdp-connect"]`
pub fn desktop_connected() -> String {
    json!(["rdp-connect"]).to_string()
}

/// `["rdp-bitmap", metadata]`, sent right after the binary pixel frame.
pub fn desktop_bitmap(meta: &Value) -> String {
    json!(["rdp-bitmap", meta]).to_string()
}

/// `["rdp-close"]`
pub fn desktop_closed() -> String {
    json!(["rdp-close"]).to_string()
}

/// `["rdp-error", message]`
pub fn desktop_error(message: &str) -> String {
    json!(["rdp-error", message]).to_string()
}
