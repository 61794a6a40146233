//! Helpers for constructing and hashing Qdrant payloads.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

/// Payload key holding the passage text.
pub const TEXT_KEY: &str = "text";
/// Payload key holding provenance metadata.
pub const METADATA_KEY: &str = "metadata";

/// Build the payload object stored alongside each indexed passage.
pub(crate) fn build_payload(text: &str, metadata: &Map<String, Value>) -> Value {
    let mut payload = Map::new();
    payload.insert(TEXT_KEY.into(), Value::String(text.to_string()));
    payload.insert(METADATA_KEY.into(), Value::Object(metadata.clone()));
    Value::Object(payload)
}

/// Split a stored payload back into passage text and metadata.
pub(crate) fn split_payload(payload: Option<Map<String, Value>>) -> (String, Map<String, Value>) {
    let Some(mut map) = payload else {
        return (String::new(), Map::new());
    };
    let text = match map.remove(TEXT_KEY) {
        Some(Value::String(text)) => text,
        _ => String::new(),
    };
    let metadata = match map.remove(METADATA_KEY) {
        Some(Value::Object(metadata)) => metadata,
        _ => map,
    };
    (text, metadata)
}

/// Compute a deterministic SHA-256 hash for the chunk text.
pub fn compute_chunk_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// Current timestamp formatted for payload storage.
pub fn current_timestamp_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Construct an identifier suitable for Qdrant points.
pub(crate) fn generate_point_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chunk_hash_is_stable() {
        let h1 = compute_chunk_hash("Hello world");
        let h2 = compute_chunk_hash("Hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn timestamp_is_rfc3339_like() {
        let ts = current_timestamp_rfc3339();
        assert!(ts.contains('T') && ts.ends_with('Z'));
    }

    #[test]
    fn payload_round_trips_text_and_metadata() {
        let mut metadata = Map::new();
        metadata.insert("source".into(), json!("Syllabus.pdf"));
        let payload = build_payload("sample", &metadata);
        assert_eq!(payload["text"], "sample");
        assert_eq!(payload["metadata"]["source"], "Syllabus.pdf");

        let Value::Object(map) = payload else {
            panic!("payload should be an object");
        };
        let (text, restored) = split_payload(Some(map));
        assert_eq!(text, "sample");
        assert_eq!(restored, metadata);
    }

    #[test]
    fn split_payload_keeps_flat_fields_as_metadata() {
        let map = json!({ "text": "t", "source": "faculty.json" });
        let Value::Object(map) = map else {
            unreachable!()
        };
        let (text, metadata) = split_payload(Some(map));
        assert_eq!(text, "t");
        assert_eq!(metadata["source"], "faculty.json");
    }
}
