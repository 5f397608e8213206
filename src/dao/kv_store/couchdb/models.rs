use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// High sort-order suffix used to bound `_all_docs` prefix scans.
pub const END_SUFFIX: &str = "\u{ffff}";

#[derive(Debug, Deserialize)]
pub struct AllDocsResponse {
    pub rows: Vec<AllDocsRow>,
}

#[derive(Debug, Deserialize)]
pub struct AllDocsRow {
    pub id: String,
    #[serde(default)]
    pub doc: Option<Value>,
}

/// One KV entry stored as a CouchDB document, keyed by the KV key itself.
///
/// CouchDB has no native TTL, so expiry is a stored wall-clock deadline
/// filtered out at read time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchKvDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl CouchKvDocument {
    pub fn new(key: String, value: Value, expires_at: Option<i64>) -> Self {
        Self {
            id: key,
            rev: None,
            value,
            expires_at,
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }
}

/// Current wall clock as epoch milliseconds.
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn expiry_is_inclusive_of_the_deadline() {
        let doc = CouchKvDocument::new("k".into(), json!(1), Some(1_000));
        assert!(!doc.is_expired(999));
        assert!(doc.is_expired(1_000));
        assert!(doc.is_expired(1_001));

        let durable = CouchKvDocument::new("k".into(), json!(1), None);
        assert!(!durable.is_expired(i64::MAX));
    }

    #[test]
    fn rev_is_omitted_when_absent() {
        let doc = CouchKvDocument::new("tracker:g:1".into(), json!({"s": true}), None);
        let encoded = serde_json::to_value(&doc).unwrap();
        assert_eq!(encoded["_id"], "tracker:g:1");
        assert!(encoded.get("_rev").is_none());
        assert!(encoded.get("expires_at").is_none());
    }
}
