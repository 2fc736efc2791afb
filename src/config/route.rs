//! Route Configuration
//!
//! Declarative route rules: filters to match inbound messages and the
//! destination mapping applied to matches.

use serde::{Deserialize, Deserializer, Serialize};

/// A named, prioritized routing rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    /// Unique route name
    pub name: String,

    /// Higher priorities are evaluated first
    #[serde(default)]
    pub priority: i32,

    /// AND-combined filters; empty matches everything
    #[serde(default)]
    pub filters: Vec<FilterSpec>,

    /// Where and how matching messages are republished
    pub mapping: DestinationMapping,
}

impl RouteSpec {
    /// Wildcard route publishing to `destination_template` unchanged
    pub fn new(name: impl Into<String>, destination_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: 0,
            filters: Vec::new(),
            mapping: DestinationMapping {
                source_pattern: String::new(),
                destination_template: destination_template.into(),
                transform: TransformKind::None,
            },
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filter(mut self, filter: FilterSpec) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn with_transform(mut self, transform: TransformKind) -> Self {
        self.mapping.transform = transform;
        self
    }
}

/// Per-kind filter parameters, keyed by `type` with the record in `config`
///
/// ```json
/// {"type": "header", "config": {"key": "env", "pattern": "^prod$", "required": true}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", content = "config", rename_all = "lowercase")]
pub enum FilterSpec {
    /// Regex over the value of the first header named `key`
    Header {
        key: String,
        pattern: String,
        /// Whether an absent header fails the filter
        #[serde(default)]
        required: bool,
    },
    /// Regex over the message key
    Key { pattern: String },
    /// Regex over the value, or over one top-level JSON field of it
    Value {
        pattern: String,
        #[serde(default, rename = "jsonPath")]
        json_path: Option<String>,
    },
    /// Regex over the source topic
    Topic { pattern: String },
    /// Inclusive bounds on the value length in bytes
    Size {
        #[serde(default)]
        min: usize,
        #[serde(default = "default_max_size")]
        max: usize,
    },
    /// Inclusive bounds on the message age in seconds
    Timestamp {
        #[serde(default, rename = "minAge")]
        min_age: u64,
        #[serde(default = "default_max_age", rename = "maxAge")]
        max_age: u64,
    },
}

fn default_max_size() -> usize {
    usize::MAX
}

fn default_max_age() -> u64 {
    u64::MAX
}

impl FilterSpec {
    /// Lowercase kind name as used in configuration
    pub fn kind(&self) -> &'static str {
        match self {
            FilterSpec::Header { .. } => "header",
            FilterSpec::Key { .. } => "key",
            FilterSpec::Value { .. } => "value",
            FilterSpec::Topic { .. } => "topic",
            FilterSpec::Size { .. } => "size",
            FilterSpec::Timestamp { .. } => "timestamp",
        }
    }
}

/// Destination topic template and payload transform
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationMapping {
    /// Informational only
    #[serde(default)]
    pub source_pattern: String,

    /// Topic template with `{sourceTopic}`, `{partition}` and `{key}` placeholders
    pub destination_template: String,

    #[serde(default)]
    pub transform: TransformKind,
}

/// Payload transform applied before publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    /// Pass the value through unchanged
    #[default]
    None,
    /// Wrap the message in a JSON envelope
    Json,
}

impl TransformKind {
    /// Parse a transform name; unrecognized names fall back to `None`
    pub fn from_name(name: &str) -> Self {
        if name.eq_ignore_ascii_case("json") {
            TransformKind::Json
        } else {
            TransformKind::None
        }
    }
}

impl<'de> Deserialize<'de> for TransformKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(TransformKind::from_name(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_filter_spec_tagged_form() {
        let spec: FilterSpec = serde_json::from_str(
            r#"{"type": "header", "config": {"key": "env", "pattern": "^prod$"}}"#,
        )
        .unwrap();
        assert_eq!(
            spec,
            FilterSpec::Header {
                key: "env".to_string(),
                pattern: "^prod$".to_string(),
                required: false,
            }
        );
    }

    #[test]
    fn test_filter_spec_defaults() {
        let size: FilterSpec =
            serde_json::from_str(r#"{"type": "size", "config": {"min": 10}}"#).unwrap();
        assert_eq!(
            size,
            FilterSpec::Size {
                min: 10,
                max: usize::MAX
            }
        );

        let age: FilterSpec =
            serde_json::from_str(r#"{"type": "timestamp", "config": {"maxAge": 60}}"#).unwrap();
        assert_eq!(
            age,
            FilterSpec::Timestamp {
                min_age: 0,
                max_age: 60
            }
        );
    }

    #[test]
    fn test_filter_spec_missing_required_param() {
        let result: Result<FilterSpec, _> =
            serde_json::from_str(r#"{"type": "topic", "config": {}}"#);
        assert!(result.is_err());

        let result: Result<FilterSpec, _> =
            serde_json::from_str(r#"{"type": "geo", "config": {"pattern": "x"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_value_filter_json_path() {
        let spec: FilterSpec = serde_json::from_str(
            r#"{"type": "value", "config": {"pattern": "ERROR", "jsonPath": "level"}}"#,
        )
        .unwrap();
        assert_eq!(spec.kind(), "value");
        assert_eq!(
            spec,
            FilterSpec::Value {
                pattern: "ERROR".to_string(),
                json_path: Some("level".to_string()),
            }
        );
    }

    #[test]
    fn test_transform_kind_fallback() {
        let parse = |s: &str| serde_json::from_str::<TransformKind>(s).unwrap();
        assert_eq!(parse(r#""json""#), TransformKind::Json);
        assert_eq!(parse(r#""none""#), TransformKind::None);
        assert_eq!(parse(r#""avro""#), TransformKind::None);
    }

    #[test]
    fn test_route_spec_defaults() {
        let route: RouteSpec = serde_json::from_str(
            r#"{"name": "all", "mapping": {"destinationTemplate": "out/{sourceTopic}"}}"#,
        )
        .unwrap();
        assert_eq!(route, RouteSpec::new("all", "out/{sourceTopic}"));
    }
}
