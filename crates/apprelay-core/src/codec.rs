//! Binary framing shared by the relay flavors.
//!
//! Download block wire format: `[4-byte big-endian status][payload]`
//! where status is [`BLOCK_MORE`] or [`BLOCK_FINAL`].

use crate::error::{RelayError, RelayResult};
use crate::transport::Frame;

/// Text frame a relay hop sends once the far end is attached.
pub const READY_SIGNAL: &str = "c";

/// Prefix of terminal data frames in both directions.
pub const SHELL_DATA_MARKER: char = '~';

/// Optional leading byte on upload chunks, stripped before writing.
pub const UPLOAD_MARKER: u8 = 0;

/// Download block status: more blocks follow.
pub const BLOCK_MORE: u32 = 0x0100_0000;
/// Download block status: last block, transfer complete.
pub const BLOCK_FINAL: u32 = 0x0100_0001;

/// Length of the download block status header.
pub const BLOCK_HEADER_LEN: usize = 4;

/// Default download buffer size, header included.
pub const DEFAULT_BLOCK_SIZE: usize = 16 * 1024;

/// Status carried in a download block header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    More,
    Final,
}

impl BlockStatus {
    fn code(self) -> u32 {
        match self {
            BlockStatus::More => BLOCK_MORE,
            BlockStatus::Final => BLOCK_FINAL,
        }
    }
}

/// Build a download block frame.
pub fn encode_block(status: BlockStatus, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(BLOCK_HEADER_LEN + payload.len());
    frame.extend_from_slice(&status.code().to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Split a download block frame into its status and payload.
pub fn decode_block(data: &[u8]) -> RelayResult<(BlockStatus, &[u8])> {
    if data.len() < BLOCK_HEADER_LEN {
        return Err(RelayError::Codec(format!(
            "block too short: {} bytes",
            data.len()
        )));
    }
    let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    let status = match code {
        BLOCK_MORE => BlockStatus::More,
        BLOCK_FINAL => BlockStatus::Final,
        other => {
            return Err(RelayError::Codec(format!(
                "unknown block status 0x{other:08x}"
            )))
        }
    };
    Ok((status, &data[BLOCK_HEADER_LEN..]))
}

/// Strip the optional upload marker byte from a chunk.
pub fn strip_upload_marker(chunk: &[u8]) -> &[u8] {
    match chunk.first() {
        Some(&UPLOAD_MARKER) => &chunk[1..],
        _ => chunk,
    }
}

/// Whether a binary frame is a JSON control message rather than payload.
pub fn is_json_control(data: &[u8]) -> bool {
    data.first() == Some(&b'{')
}

/// Frames terminal output for the browser: `~` followed by the text.
///
/// Shell output arrives in arbitrary chunks, so a multi-byte character may
/// be split between two of them. The incomplete tail is held back and
/// completed by the next chunk; bytes that can never form a character
/// become U+FFFD.
#[derive(Debug, Default)]
pub struct ShellOutput {
    tail: Vec<u8>,
}

impl ShellOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text frame for `data`, or `None` while only a partial character is
    /// buffered.
    pub fn frame(&mut self, data: &[u8]) -> Option<Frame> {
        self.tail.extend_from_slice(data);
        let mut out = String::with_capacity(self.tail.len() + 1);
        out.push(SHELL_DATA_MARKER);

        let mut rest: &[u8] = &self.tail;
        while !rest.is_empty() {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }
        self.tail = rest.to_vec();

        (out.len() > SHELL_DATA_MARKER.len_utf8()).then_some(Frame::Text(out))
    }
}

/// Extract terminal input from a `~`-prefixed text frame.
pub fn shell_input(text: &str) -> Option<&str> {
    text.strip_prefix(SHELL_DATA_MARKER)
}

// ── Remote paths ─────────────────────────────────────────────────────

/// Make a client supplied directory absolute and normalized.
pub fn normalize_dir(path: &str) -> String {
    normalize(path)
}

/// Join a file name onto a directory, POSIX style.
///
/// Backslashes are treated as separators and `.`/`..` are resolved; the
/// result never climbs above `/`.
pub fn join_remote(dir: &str, name: &str) -> String {
    let mut combined = String::with_capacity(dir.len() + name.len() + 1);
    combined.push_str(dir);
    combined.push('/');
    combined.push_str(name);
    normalize(&combined)
}

fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut out = String::from("/");
    out.push_str(&parts.join("/"));
    out
}
