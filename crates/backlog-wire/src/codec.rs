use std::io;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::types::{BacklogError, Command, Result};

/// Upper bound for one encoded frame (request or reply), newline excluded.
///
/// Message dumps can be large but are still bounded by the engine's body
/// truncation; anything beyond this is treated as a broken peer.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Reply to a single request. Exactly one of `ok`/`error` is meaningful.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReplyFrame {
    pub fn into_result(self) -> Result<Value> {
        match self.error {
            Some(message) => Err(BacklogError::Remote(message)),
            None => Ok(self.ok.unwrap_or(Value::Null)),
        }
    }
}

pub fn encode_request(id: u64, command: &Command) -> Result<Vec<u8>> {
    let mut object = match serde_json::to_value(command)? {
        Value::Object(object) => object,
        other => {
            return Err(BacklogError::Protocol(format!(
                "command encoded to non-object {other}"
            )))
        }
    };
    object.insert("id".to_string(), Value::from(id));
    let mut bytes = serde_json::to_vec(&Value::Object(object))?;
    bytes.push(b'\n');
    Ok(bytes)
}

#[cfg_attr(not(any(test, feature = "test-support")), allow(dead_code))]
pub fn decode_request(frame: &[u8]) -> Result<(u64, Command)> {
    let mut object: Map<String, Value> = serde_json::from_slice(frame)?;
    let id = object
        .remove("id")
        .and_then(|id| id.as_u64())
        .ok_or_else(|| BacklogError::Protocol("request without numeric id".to_string()))?;
    let command = serde_json::from_value(Value::Object(object))?;
    Ok((id, command))
}

#[cfg_attr(not(any(test, feature = "test-support")), allow(dead_code))]
pub fn encode_reply(reply: &ReplyFrame) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(reply)?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn decode_reply(frame: &[u8]) -> Result<ReplyFrame> {
    Ok(serde_json::from_slice(frame)?)
}

/// Read one newline-terminated frame into `buf` (terminator stripped).
///
/// Returns `Ok(false)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let limit = MAX_FRAME_BYTES as u64 + 1;
    let n = (&mut *reader).take(limit).read_until(b'\n', buf).await?;
    if n == 0 {
        return Ok(false);
    }

    if buf.last() != Some(&b'\n') {
        if buf.len() > MAX_FRAME_BYTES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame exceeds maximum size ({MAX_FRAME_BYTES} bytes)"),
            ));
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed in the middle of a frame",
        ));
    }

    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(true)
}
