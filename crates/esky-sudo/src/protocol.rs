use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Sent by the client, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub operation: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// The helper's answer to a [`Request`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// First line the helper writes once it is listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ready {
    pub ready: String,
}

pub const KIND_REJECTED: &str = "privilege_rejected";
pub const KIND_FAILED: &str = "failed";

impl Response {
    pub fn success(id: u64, value: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            value: Some(value),
            error: None,
            kind: None,
        }
    }

    pub fn failure(id: u64, kind: &str, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            value: None,
            error: Some(error.into()),
            kind: Some(kind.to_string()),
        }
    }
}

pub fn write_message<W: Write, T: Serialize>(output: &mut W, message: &T) -> Result<()> {
    let line = serde_json::to_string(message).context("failed to encode helper message")?;
    writeln!(output, "{line}").context("failed to write helper message")?;
    output.flush().context("failed to flush helper message")
}

/// Reads the next non-empty line as `T`. `None` means the peer hung up.
pub fn read_message<R: BufRead, T: DeserializeOwned>(input: &mut R) -> Result<Option<T>> {
    loop {
        let mut line = String::new();
        let read = input
            .read_line(&mut line)
            .context("failed to read helper message")?;
        if read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return serde_json::from_str(trimmed)
            .map(Some)
            .with_context(|| format!("malformed helper message: {trimmed}"));
    }
}
