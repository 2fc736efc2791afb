//! Inbound Message Type
//!
//! A message pulled from the source system, owned by exactly one stage of
//! the pipeline at a time (ingest loop, queue, then a single worker).

use std::time::SystemTime;

use bytes::Bytes;

/// A message consumed from the source system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Source topic name
    pub topic: String,
    /// Source partition
    pub partition: i32,
    /// Offset within the partition, monotonic per partition
    pub offset: i64,
    /// Message key, if any
    pub key: Option<Bytes>,
    /// Message payload
    pub value: Bytes,
    /// Headers in wire order
    pub headers: Vec<(Bytes, Bytes)>,
    /// Producer or receive timestamp
    pub timestamp: Option<SystemTime>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: 0,
            offset: 0,
            key: None,
            value: value.into(),
            headers: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// First header whose name equals `name`
    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers
            .iter()
            .find(|(k, _)| k.as_ref() == name.as_bytes())
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_returns_first_match() {
        let msg = InboundMessage::new("t", "v")
            .with_header("env", "prod")
            .with_header("env", "dev");
        assert_eq!(msg.header("env").map(|v| v.as_ref()), Some(&b"prod"[..]));
        assert!(msg.header("missing").is_none());
    }

    #[test]
    fn test_builder_defaults() {
        let msg = InboundMessage::new("orders", "payload");
        assert_eq!(msg.partition, 0);
        assert_eq!(msg.offset, 0);
        assert!(msg.key.is_none());
        assert!(msg.timestamp.is_none());
    }
}
