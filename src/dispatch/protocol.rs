//! Wire protocol between the orchestrator and its workers.
//!
//! Messages are JSON-serialized and newline-delimited. The orchestrator sends
//! exactly one [`WorkRequest`] on the worker's stdin; the worker answers with a
//! stream of [`Report`]s on its stdout.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Identifier of one location to inspect.
///
/// Sources may supply identifiers as JSON strings or integers; both are kept
/// as their string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkItem(String);

impl WorkItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkItem {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for WorkItem {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl<'de> Deserialize<'de> for WorkItem {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawId {
            Text(String),
            Signed(i64),
            Unsigned(u64),
        }

        Ok(match RawId::deserialize(deserializer)? {
            RawId::Text(s) => WorkItem(s),
            RawId::Signed(n) => WorkItem(n.to_string()),
            RawId::Unsigned(n) => WorkItem(n.to_string()),
        })
    }
}

/// Request from orchestrator to worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Inspect every item of `chunk` for `shared_parameter`.
    #[serde(rename = "assign", rename_all = "camelCase")]
    Assign {
        /// Read-only value handed identically to every worker (the target date).
        shared_parameter: String,
        /// Items owned by this worker, in source order.
        chunk: Vec<WorkItem>,
    },
}

/// Report from worker to orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Report {
    /// Outcome of inspecting one item.
    #[serde(rename = "item_result", rename_all = "camelCase")]
    ItemResult {
        item_id: WorkItem,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Inspection payload (available slots) on success.
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        slots: Vec<String>,
    },

    /// The worker finished its chunk and is about to exit.
    #[serde(rename = "chunk_summary")]
    ChunkSummary {
        /// Elapsed wall time for the whole chunk, in milliseconds.
        #[serde(rename = "duration")]
        duration_ms: u64,
    },
}

impl WorkRequest {
    /// Create an assignment request.
    pub fn assign(shared_parameter: impl Into<String>, chunk: Vec<WorkItem>) -> Self {
        Self::Assign {
            shared_parameter: shared_parameter.into(),
            chunk,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        to_json_line(self)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl Report {
    /// Successful inspection of `item_id`.
    pub fn success(item_id: WorkItem, room_id: Option<String>, slots: Vec<String>) -> Self {
        Self::ItemResult {
            item_id,
            room_id,
            success: true,
            error: None,
            slots,
        }
    }

    /// Failed inspection of `item_id`.
    pub fn failure(item_id: WorkItem, room_id: Option<String>, error: impl Into<String>) -> Self {
        Self::ItemResult {
            item_id,
            room_id,
            success: false,
            error: Some(error.into()),
            slots: Vec::new(),
        }
    }

    pub fn chunk_summary(duration_ms: u64) -> Self {
        Self::ChunkSummary { duration_ms }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        to_json_line(self)
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

fn to_json_line<T: Serialize>(value: &T) -> String {
    // Plain enums of strings and integers cannot fail to serialize.
    let mut json = serde_json::to_string(value).unwrap_or_default();
    json.push('\n');
    json
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_wire_format() {
        let req = WorkRequest::assign("2026-10-19", vec!["A".into(), "B".into()]);
        let line = req.to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains(r#""type":"assign""#));
        assert!(line.contains(r#""sharedParameter":"2026-10-19""#));
        assert!(line.contains(r#""chunk":["A","B"]"#));

        let parsed = WorkRequest::from_line(&line).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_work_item_accepts_integers() {
        let req = WorkRequest::from_line(
            r#"{"type":"assign","sharedParameter":"d","chunk":[1042,"x7",18446744073709551615]}"#,
        )
        .unwrap();
        let WorkRequest::Assign { chunk, .. } = req;
        assert_eq!(
            chunk,
            vec![
                WorkItem::new("1042"),
                WorkItem::new("x7"),
                WorkItem::new("18446744073709551615")
            ]
        );
    }

    #[test]
    fn test_item_success_parses_minimal_message() {
        let report = Report::from_line(
            r#"{"type":"item_result","success":true,"itemId":"A","roomId":"r1"}"#,
        )
        .unwrap();
        assert_eq!(
            report,
            Report::success("A".into(), Some("r1".to_string()), Vec::new())
        );
    }

    #[test]
    fn test_item_failure_carries_error() {
        let report = Report::failure("E".into(), None, "timeout after 30s");
        let line = report.to_line();
        assert!(line.contains(r#""success":false"#));
        assert!(!line.contains("roomId"));

        match Report::from_line(&line).unwrap() {
            Report::ItemResult {
                item_id,
                success,
                error,
                ..
            } => {
                assert_eq!(item_id.as_str(), "E");
                assert!(!success);
                assert_eq!(error.as_deref(), Some("timeout after 30s"));
            }
            other => panic!("Expected ItemResult, got {:?}", other),
        }
    }

    #[test]
    fn test_chunk_summary_uses_duration_field() {
        let line = Report::chunk_summary(1200).to_line();
        assert_eq!(line, "{\"type\":\"chunk_summary\",\"duration\":1200}\n");
        assert_eq!(
            Report::from_line(&line).unwrap(),
            Report::ChunkSummary { duration_ms: 1200 }
        );
    }

    #[test]
    fn test_untagged_report_is_rejected() {
        // Field presence alone must not decide the variant.
        assert!(Report::from_line(r#"{"duration":5}"#).is_err());
        assert!(Report::from_line(r#"{"success":true,"itemId":"A"}"#).is_err());
    }
}
