//! Message Filters
//!
//! Compiled predicates over a single inbound message. Patterns are
//! compiled once when the router is built and shared read-only by all
//! workers afterwards.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::bytes::Regex as BytesRegex;
use regex::Regex;

use crate::config::{ConfigError, FilterSpec};
use crate::remote::InboundMessage;

/// A compiled filter
#[derive(Debug, Clone)]
pub enum Filter {
    Header {
        key: String,
        pattern: BytesRegex,
        required: bool,
    },
    Key {
        pattern: BytesRegex,
    },
    Value {
        pattern: BytesRegex,
        json_path: Option<String>,
    },
    Topic {
        pattern: Regex,
    },
    Size {
        min: usize,
        max: usize,
    },
    Timestamp {
        min_age: u64,
        max_age: u64,
    },
}

impl Filter {
    /// Compile a filter. `context` names the owning route in errors.
    pub fn from_spec(spec: &FilterSpec, context: &str) -> Result<Self, ConfigError> {
        let context = format!("{} ({} filter)", context, spec.kind());

        let filter = match spec {
            FilterSpec::Header {
                key,
                pattern,
                required,
            } => {
                if key.is_empty() {
                    return Err(ConfigError::Validation(format!(
                        "{}: header key must not be empty",
                        context
                    )));
                }
                Filter::Header {
                    key: key.clone(),
                    pattern: compile_bytes(pattern, &context)?,
                    required: *required,
                }
            }
            FilterSpec::Key { pattern } => Filter::Key {
                pattern: compile_bytes(pattern, &context)?,
            },
            FilterSpec::Value { pattern, json_path } => Filter::Value {
                pattern: compile_bytes(pattern, &context)?,
                json_path: json_path.clone().filter(|path| !path.is_empty()),
            },
            FilterSpec::Topic { pattern } => Filter::Topic {
                pattern: Regex::new(pattern).map_err(|source| ConfigError::Regex {
                    context: context.clone(),
                    source,
                })?,
            },
            FilterSpec::Size { min, max } => {
                if min > max {
                    return Err(ConfigError::Validation(format!(
                        "{}: min {} exceeds max {}",
                        context, min, max
                    )));
                }
                Filter::Size {
                    min: *min,
                    max: *max,
                }
            }
            FilterSpec::Timestamp { min_age, max_age } => {
                if min_age > max_age {
                    return Err(ConfigError::Validation(format!(
                        "{}: minAge {} exceeds maxAge {}",
                        context, min_age, max_age
                    )));
                }
                Filter::Timestamp {
                    min_age: *min_age,
                    max_age: *max_age,
                }
            }
        };

        Ok(filter)
    }

    /// Whether the message passes this filter
    #[inline]
    pub fn matches(&self, msg: &InboundMessage) -> bool {
        self.matches_at(msg, SystemTime::now())
    }

    /// Evaluate with an explicit clock for age checks
    pub fn matches_at(&self, msg: &InboundMessage, now: SystemTime) -> bool {
        match self {
            Filter::Header {
                key,
                pattern,
                required,
            } => match msg.header(key) {
                Some(value) => pattern.is_match(value),
                None => !required,
            },
            Filter::Key { pattern } => {
                pattern.is_match(msg.key.as_deref().unwrap_or_default())
            }
            Filter::Value { pattern, json_path } => match json_path
                .as_deref()
                .and_then(|path| json_field(&msg.value, path))
            {
                Some(field) => pattern.is_match(field.as_bytes()),
                None => pattern.is_match(&msg.value),
            },
            Filter::Topic { pattern } => pattern.is_match(&msg.topic),
            Filter::Size { min, max } => (*min..=*max).contains(&msg.value.len()),
            Filter::Timestamp { min_age, max_age } => match msg.timestamp {
                None => true,
                Some(ts) if ts == UNIX_EPOCH => true,
                Some(ts) => {
                    // Future timestamps count as brand new
                    let age = now.duration_since(ts).unwrap_or(Duration::ZERO).as_secs();
                    (*min_age..=*max_age).contains(&age)
                }
            },
        }
    }
}

fn compile_bytes(pattern: &str, context: &str) -> Result<BytesRegex, ConfigError> {
    BytesRegex::new(pattern).map_err(|source| ConfigError::Regex {
        context: context.to_string(),
        source,
    })
}

/// String form of a top-level field of a JSON object payload.
/// Strings are unquoted; other values are rendered as JSON text.
fn json_field(value: &[u8], path: &str) -> Option<String> {
    let parsed: serde_json::Value = serde_json::from_slice(value).ok()?;
    match parsed.as_object()?.get(path)? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
