//! Snapshot record types.
//!
//! A snapshot is the full response of a successful render together with the
//! request that produced it. It is serialized as one JSON document per file;
//! the file's modification time is the authoritative save time.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response body of a stored render.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum Payload {
    Text(String),
    /// Non-UTF-8 body, stored with an explicit marker.
    Binary(Vec<u8>),
}

impl Payload {
    pub fn is_empty(&self) -> bool {
        match self {
            Payload::Text(text) => text.is_empty(),
            Payload::Binary(bytes) => bytes.is_empty(),
        }
    }
}

/// Status line and headers of the stored response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredResponse {
    pub status: u16,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
}

/// Metadata of the request that triggered the render.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub header: BTreeMap<String, String>,
}

/// On-disk format of a snapshot entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    pub response_body: Payload,
    pub response_headers: StoredResponse,
    pub request: RequestMeta,
}

impl SnapshotRecord {
    pub fn new(
        status: u16, header: BTreeMap<String, String>, body: Payload, request: RequestMeta,
    ) -> Self {
        Self { response_body: body, response_headers: StoredResponse { status, header }, request }
    }
}

/// A fresh snapshot returned by a cache lookup.
#[derive(Debug, Clone)]
pub struct CachedSnapshot {
    /// Modification time of the entry file.
    pub saved_at: DateTime<Utc>,
    /// `None` when entries never expire.
    pub expires_at: Option<DateTime<Utc>>,
    pub record: SnapshotRecord,
}

impl CachedSnapshot {
    pub fn status(&self) -> u16 {
        self.record.response_headers.status
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.record.response_headers.header
    }

    pub fn body(&self) -> &Payload {
        &self.record.response_body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_wire_format() {
        let mut header = BTreeMap::new();
        header.insert("content-type".to_string(), "text/html".to_string());
        let record = SnapshotRecord::new(
            200,
            header,
            Payload::Text("<html></html>".into()),
            RequestMeta { method: "GET".into(), url: "/render/https://example.com".into(), header: BTreeMap::new() },
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["responseBody"]["type"], "text");
        assert_eq!(value["responseBody"]["data"], "<html></html>");
        assert_eq!(value["responseHeaders"]["status"], 200);
        assert_eq!(value["responseHeaders"]["header"]["content-type"], "text/html");
        assert_eq!(value["request"]["method"], "GET");
    }

    #[test]
    fn test_binary_payload_marker() {
        let value = serde_json::to_value(Payload::Binary(vec![0xff, 0x00])).unwrap();
        assert_eq!(value["type"], "binary");
        assert_eq!(value["data"], serde_json::json!([255, 0]));
    }

    #[test]
    fn test_missing_headers_default_to_empty() {
        let record: SnapshotRecord = serde_json::from_str(
            r#"{"responseBody":{"type":"text","data":"x"},"responseHeaders":{"status":200},"request":{"method":"GET","url":"/"}}"#,
        )
        .unwrap();
        assert!(record.response_headers.header.is_empty());
        assert!(record.request.header.is_empty());
    }

    #[test]
    fn test_payload_is_empty() {
        assert!(Payload::Text(String::new()).is_empty());
        assert!(Payload::Binary(Vec::new()).is_empty());
        assert!(!Payload::Text("x".into()).is_empty());
    }
}
