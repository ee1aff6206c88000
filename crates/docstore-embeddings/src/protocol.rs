//! Wire format spoken with the embedding worker.
//!
//! One JSON object per line in each direction. Requests carry an `id` the
//! worker echoes back next to a `StorageResult`-shaped body.

use docstore_core::StorageResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Operations the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    OpenDatabase,
    CloseDatabase,
    CreateRecord,
    ReadRecord,
    QueryRecords,
    UpdateRecord,
    DeleteRecord,
    ListCollections,
    GetStats,
    ExplainQuery,
    EmbedText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: Command,
    #[serde(default)]
    pub payload: Value,
}

impl Request {
    /// Serialize as one newline-terminated line.
    pub fn to_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(flatten)]
    pub result: StorageResult<Value>,
}

/// Body of a successful `embed_text` reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbedReply {
    pub embedding: Vec<f32>,
    #[serde(default)]
    pub model: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_line_shape() {
        let req = Request {
            id: "7".into(),
            command: Command::ReadRecord,
            payload: json!({"collection": "users", "id": "u1"}),
        };
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["command"], "read_record");
        assert_eq!(parsed["payload"]["id"], "u1");
    }

    #[test]
    fn test_response_flattens_result() {
        let raw = r#"{"id":"3","success":false,"error":"no such handle"}"#;
        let resp: Response = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.id, "3");
        assert!(!resp.result.success);
        assert_eq!(resp.result.error.as_deref(), Some("no such handle"));
    }
}
