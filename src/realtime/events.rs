//! Row-level change events delivered by the realtime channel.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One insert/update/delete notification. Consumed once, never stored.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Local identifier for log correlation.
    pub id: Uuid,
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    /// Row before the change, when the backend sends it (update/delete).
    pub old_record: Option<Value>,
    /// Row after the change (insert/update).
    pub new_record: Option<Value>,
    pub commit_timestamp: Option<OffsetDateTime>,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, table: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            schema: "public".to_string(),
            table: table.into(),
            old_record: None,
            new_record: None,
            commit_timestamp: None,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_records(mut self, old_record: Option<Value>, new_record: Option<Value>) -> Self {
        self.old_record = old_record;
        self.new_record = new_record;
        self
    }

    pub fn with_commit_timestamp(mut self, timestamp: OffsetDateTime) -> Self {
        self.commit_timestamp = Some(timestamp);
        self
    }
}
