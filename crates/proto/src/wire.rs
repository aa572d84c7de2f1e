//! Wire format: line-framed JSON messages.
//!
//! Every message is one JSON value followed by a newline. The compact
//! encodings used here never contain a raw newline, so a frame is exactly
//! one line. Byte-slice fields travel as standard base64 strings, and a
//! `put` request's body follows its header as a separate frame holding one
//! JSON string of base64.

use crate::error::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. Bodies arrive as one frame, so this has
/// to accommodate the largest cacheable artifact plus base64 overhead.
pub const MAX_FRAME_BYTES: usize = 1 << 30;

/// Chunk size for streaming body encoding; a multiple of 3 so every chunk
/// but the last encodes without padding.
const BODY_CHUNK_BYTES: usize = 48 * 1024;

/// Session phase announced in the hello frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Register a workspace for an upcoming build and disconnect.
    Hook,
    /// Start the request loop for a registered build.
    Build,
}

/// First frame of every session, peer to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    #[serde(rename = "BuildID")]
    pub build_id: String,
    #[serde(rename = "Phase")]
    pub phase: Phase,
}

/// Reply to a hook-phase hello; the connection closes after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResponse {
    #[serde(rename = "BuildDir")]
    pub build_dir: PathBuf,
}

/// Request commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cmd {
    Get,
    Put,
    Close,
}

/// A request frame, peer to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "ID", default)]
    pub id: i64,
    #[serde(rename = "Command")]
    pub command: Cmd,
    #[serde(
        rename = "ActionID",
        with = "base64_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub action_id: Option<Vec<u8>>,
    #[serde(
        rename = "ObjectID",
        with = "base64_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub object_id: Option<Vec<u8>>,
    #[serde(rename = "BodySize", default, skip_serializing_if = "is_zero")]
    pub body_size: i64,
}

/// A response frame, server to peer. Zero values are omitted on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(rename = "ID", default)]
    pub id: i64,
    #[serde(
        rename = "KnownCommands",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub known_commands: Option<Vec<Cmd>>,
    #[serde(rename = "Miss", default, skip_serializing_if = "is_false")]
    pub miss: bool,
    #[serde(
        rename = "OutputID",
        with = "base64_opt",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub output_id: Option<Vec<u8>>,
    #[serde(rename = "Size", default, skip_serializing_if = "is_zero")]
    pub size: i64,
    #[serde(rename = "TimeNanos", default, skip_serializing_if = "is_zero")]
    pub time_nanos: i64,
    #[serde(rename = "DiskPath", default, skip_serializing_if = "String::is_empty")]
    pub disk_path: String,
    #[serde(rename = "Err", default, skip_serializing_if = "String::is_empty")]
    pub err: String,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(v: &bool) -> bool {
    !*v
}

/// Byte slices as standard base64 strings, the JSON convention the
/// toolchain uses for byte fields.
mod base64_opt {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(bytes) => s.serialize_str(&BASE64.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let raw = Option::<String>::deserialize(d)?;
        raw.map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Read one frame, skipping blank lines. Returns `None` on a clean EOF.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = reader
            .read_until(b'\n', &mut line)
            .await
            .map_err(|e| Error::io(e, "read frame"))?;
        if n == 0 {
            return Ok(None);
        }
        if line.len() > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge {
                len: line.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        return serde_json::from_slice(&line)
            .map(Some)
            .map_err(|e| Error::frame(e.to_string()));
    }
}

/// Write one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut buf = serde_json::to_vec(value).map_err(|e| Error::frame(e.to_string()))?;
    buf.push(b'\n');
    writer
        .write_all(&buf)
        .await
        .map_err(|e| Error::io(e, "write frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::io(e, "flush frame"))?;
    Ok(())
}

/// Read a body frame and decode it. Returns `None` on EOF.
pub async fn read_body_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let Some(encoded) = read_frame::<R, String>(reader).await? else {
        return Ok(None);
    };
    BASE64
        .decode(encoded)
        .map(Some)
        .map_err(|e| Error::frame(format!("bad body encoding: {e}")))
}

/// Stream `size` bytes from `body` as one body frame, base64-encoding
/// chunk by chunk so the body is never buffered whole. Fails if the
/// reader ends early; the caller must treat the stream as poisoned then,
/// because a partial frame is already on the wire.
pub async fn write_body_frame<W, R>(writer: &mut W, body: &mut R, size: u64) -> Result<()>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin + ?Sized,
{
    writer
        .write_all(b"\"")
        .await
        .map_err(|e| Error::io(e, "write body frame"))?;

    let mut buf = vec![0u8; BODY_CHUNK_BYTES];
    let mut remaining = size;
    while remaining > 0 {
        let want = buf.len().min(usize::try_from(remaining).unwrap_or(buf.len()));
        read_full(body, &mut buf[..want]).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Error::protocol(format!("body ended {remaining} bytes early"))
            } else {
                Error::io(e, "read body")
            }
        })?;
        let encoded = BASE64.encode(&buf[..want]);
        writer
            .write_all(encoded.as_bytes())
            .await
            .map_err(|e| Error::io(e, "write body frame"))?;
        remaining -= want as u64;
    }

    writer
        .write_all(b"\"\n")
        .await
        .map_err(|e| Error::io(e, "write body frame"))?;
    writer
        .flush()
        .await
        .map_err(|e| Error::io(e, "flush body frame"))?;
    Ok(())
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        filled += n;
    }
    Ok(())
}
