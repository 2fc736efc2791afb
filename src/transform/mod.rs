//! Payload Transforms and Topic Templates
//!
//! Turns a routed message into the payload and topic that get published
//! to the sink.

use std::fmt::Write;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::TransformKind;
use crate::remote::InboundMessage;

/// Seconds since the epoch of 10000-01-01, the first instant RFC 3339 cannot express
const RFC3339_LIMIT_SECS: u64 = 253_402_300_800;

/// Error produced while transforming a payload
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("failed to encode JSON envelope: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON wrapper carrying source metadata alongside the value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// RFC 3339 with millisecond precision
    pub timestamp: Option<String>,
    /// Lossy UTF-8 rendering of the key
    pub key: Option<String>,
    /// Lossy UTF-8 rendering of the value
    pub value: String,
}

impl Envelope {
    pub fn from_message(msg: &InboundMessage) -> Self {
        Self {
            topic: msg.topic.clone(),
            partition: msg.partition,
            offset: msg.offset,
            timestamp: msg.timestamp.and_then(format_timestamp),
            key: msg
                .key
                .as_ref()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            value: String::from_utf8_lossy(&msg.value).into_owned(),
        }
    }
}

fn format_timestamp(ts: SystemTime) -> Option<String> {
    let since_epoch = ts.duration_since(UNIX_EPOCH).ok()?;
    if since_epoch.is_zero() || since_epoch.as_secs() >= RFC3339_LIMIT_SECS {
        return None;
    }
    Some(humantime::format_rfc3339_millis(ts).to_string())
}

/// Applies a [`TransformKind`] to a message value
pub struct Transformer;

impl Transformer {
    pub fn apply(kind: TransformKind, msg: &InboundMessage) -> Result<Bytes, TransformError> {
        match kind {
            TransformKind::None => Ok(msg.value.clone()),
            TransformKind::Json => {
                let encoded = serde_json::to_vec(&Envelope::from_message(msg))?;
                Ok(Bytes::from(encoded))
            }
        }
    }
}

/// Expands destination topic templates
pub struct TopicResolver;

impl TopicResolver {
    /// Substitute `{sourceTopic}`, `{partition}` and `{key}` in one pass.
    /// Unknown `{...}` tokens are left as written.
    pub fn resolve(template: &str, msg: &InboundMessage) -> String {
        let mut out = String::with_capacity(template.len() + msg.topic.len());
        let mut rest = template;

        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];

            let Some(end) = tail.find('}') else {
                rest = tail;
                break;
            };

            match &tail[1..end] {
                "sourceTopic" => out.push_str(&msg.topic),
                "partition" => {
                    let _ = write!(out, "{}", msg.partition);
                }
                "key" => {
                    if let Some(key) = &msg.key {
                        out.push_str(&String::from_utf8_lossy(key));
                    }
                }
                _ => {
                    // Emit the brace alone so a placeholder starting later still expands
                    out.push('{');
                    rest = &tail[1..];
                    continue;
                }
            }
            rest = &tail[end + 1..];
        }

        out.push_str(rest);
        out
    }
}
