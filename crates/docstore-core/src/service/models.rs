use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who is calling and when; required on every write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationContext {
    pub session_id: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl OperationContext {
    /// Context for `session_id`, stamped now.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Some(Utc::now()),
            user_id: None,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Fails unless both the session id and timestamp are present.
    pub fn validate(&self) -> Result<DateTime<Utc>> {
        if self.session_id.trim().is_empty() {
            return Err(Error::Validation("operation context has no session id".into()));
        }
        self.timestamp
            .ok_or_else(|| Error::Validation("operation context has no timestamp".into()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub collection: String,
    /// Generated when absent
    #[serde(default)]
    pub id: Option<String>,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,
}

impl CreateRequest {
    pub fn new(collection: impl Into<String>, data: Value) -> Self {
        Self {
            collection: collection.into(),
            id: None,
            data,
            tags: None,
            ttl: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    pub collection: String,
    pub id: String,
    pub data: Value,
    #[serde(default = "default_increment")]
    pub increment_version: bool,
}

fn default_increment() -> bool {
    true
}

impl UpdateRequest {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Value) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
            data,
            increment_version: true,
        }
    }
}
