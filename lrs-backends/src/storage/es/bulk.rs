//! Elasticsearch `_bulk` body and response reconciliation.

use serde::Deserialize;
use serde_json::{json, Value};

use lrs_core::{
    BackendError, BackendResult, ChunkReport, Operation, Rejection, RejectionKind,
    ValidatedRecord,
};

/// NDJSON body of one `_bulk` request.
///
/// # Errors
/// Returns `BadFormat` if a document cannot be serialized.
pub fn bulk_body(
    index: &str,
    chunk: &[ValidatedRecord],
    operation: Operation,
) -> BackendResult<String> {
    let action = action_name(operation)?;
    let mut body = String::new();
    for record in chunk {
        let header = json!({ action: { "_index": index, "_id": record.id } });
        body.push_str(&serde_json::to_string(&header)?);
        body.push('\n');
        match operation {
            Operation::Delete => {}
            Operation::Update => {
                body.push_str(&serde_json::to_string(&json!({ "doc": record.document }))?);
                body.push('\n');
            }
            _ => {
                body.push_str(&serde_json::to_string(&record.document)?);
                body.push('\n');
            }
        }
    }
    Ok(body)
}

fn action_name(operation: Operation) -> BackendResult<&'static str> {
    match operation {
        Operation::Index => Ok("index"),
        Operation::Create => Ok("create"),
        Operation::Update => Ok("update"),
        Operation::Delete => Ok("delete"),
        Operation::Append => Err(BackendError::parameter(
            "es does not support the append operation",
        )),
    }
}

#[derive(Debug, Deserialize)]
struct BulkResponse {
    #[serde(default)]
    items: Vec<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct BulkItem {
    #[serde(rename = "_id", default)]
    id: Option<String>,
    status: u16,
    #[serde(default)]
    error: Option<Value>,
}

/// Per-record outcome of a `_bulk` response.
///
/// 2xx items are applied, 409 is a duplicate, 404 a missing document;
/// everything else is rejected with the engine's reason.
///
/// # Errors
/// Returns `Engine` if the response does not describe every record.
pub fn reconcile_bulk_response(chunk: &[ValidatedRecord], body: &str) -> BackendResult<ChunkReport> {
    let response: BulkResponse = serde_json::from_str(body)
        .map_err(|e| BackendError::engine(format!("unexpected bulk response: {e}")))?;
    if response.items.len() != chunk.len() {
        return Err(BackendError::engine(format!(
            "bulk response describes {} items for {} records",
            response.items.len(),
            chunk.len()
        )));
    }

    let mut report = ChunkReport::default();
    for (record, item) in chunk.iter().zip(response.items) {
        let Some(outcome) = item.into_iter().next().map(|(_, outcome)| outcome) else {
            return Err(BackendError::engine("empty bulk response item"));
        };
        let item: BulkItem = serde_json::from_value(outcome)
            .map_err(|e| BackendError::engine(format!("unexpected bulk response item: {e}")))?;
        let id = item.id.unwrap_or_else(|| record.id.clone());
        match item.status {
            200..=299 => report.push_applied(),
            409 => report.push_rejected(Rejection::new(
                id,
                RejectionKind::Duplicate,
                error_reason(item.error.as_ref()),
            )),
            404 => report.push_rejected(Rejection::new(
                id,
                RejectionKind::Missing,
                error_reason(item.error.as_ref()),
            )),
            _ => report.push_rejected(Rejection::new(
                id,
                RejectionKind::Other,
                error_reason(item.error.as_ref()),
            )),
        }
    }
    Ok(report)
}

fn error_reason(error: Option<&Value>) -> String {
    match error {
        Some(Value::Object(map)) => map
            .get("reason")
            .and_then(Value::as_str)
            .map_or_else(|| Value::Object(map.clone()).to_string(), String::from),
        Some(other) => other.to_string(),
        None => "document not found".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lrs_core::Document;

    fn record(id: &str) -> ValidatedRecord {
        let mut document = Document::new();
        document.insert("id".into(), json!(id));
        document.insert("timestamp".into(), json!("2024-01-01T00:00:00Z"));
        ValidatedRecord::validate(document, Operation::Create).unwrap()
    }

    #[test]
    fn test_bulk_body_per_operation() {
        let chunk = vec![record("a")];

        let create = bulk_body("statements", &chunk, Operation::Create).unwrap();
        let lines: Vec<&str> = create.lines().collect();
        assert_eq!(lines.len(), 2);
        let header: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header, json!({ "create": { "_index": "statements", "_id": "a" } }));
        assert!(create.ends_with('\n'));

        let update = bulk_body("statements", &chunk, Operation::Update).unwrap();
        let doc: Value = serde_json::from_str(update.lines().nth(1).unwrap()).unwrap();
        assert_eq!(doc["doc"]["id"], "a");

        let delete = bulk_body("statements", &chunk, Operation::Delete).unwrap();
        assert_eq!(delete.lines().count(), 1);

        assert!(bulk_body("statements", &chunk, Operation::Append)
            .unwrap_err()
            .is_parameter());
    }

    #[test]
    fn test_reconcile_mixed_outcomes() {
        let chunk = vec![record("a"), record("b"), record("c"), record("d")];
        let body = json!({
            "errors": true,
            "items": [
                { "create": { "_id": "a", "status": 201 } },
                { "create": { "_id": "b", "status": 409,
                  "error": { "type": "version_conflict_engine_exception",
                             "reason": "[b]: version conflict, document already exists" } } },
                { "update": { "_id": "c", "status": 404,
                  "error": { "type": "document_missing_exception", "reason": "[c]: document missing" } } },
                { "create": { "_id": "d", "status": 400,
                  "error": { "type": "mapper_parsing_exception", "reason": "failed to parse" } } }
            ]
        })
        .to_string();

        let report = reconcile_bulk_response(&chunk, &body).unwrap();
        assert_eq!(report.applied, 1);
        let kinds: Vec<RejectionKind> = report.rejected.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![RejectionKind::Duplicate, RejectionKind::Missing, RejectionKind::Other]
        );
        assert_eq!(report.rejected[2].reason, "failed to parse");
    }

    #[test]
    fn test_reconcile_rejects_short_response() {
        let chunk = vec![record("a"), record("b")];
        let body = json!({ "items": [{ "index": { "_id": "a", "status": 200 } }] }).to_string();
        let err = reconcile_bulk_response(&chunk, &body).unwrap_err();
        assert!(!err.is_parameter());
    }
}
