use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

pub const MESSAGES_TABLE: &str = "messages";
pub const REFLECTIONS_TABLE: &str = "reflections";

/// One loosely-linked entry in the interaction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    #[serde(default)]
    pub author_ref: Option<String>,
    #[serde(default)]
    pub room_ref: Option<String>,
    /// Owning agent, used by stores to scope queries.
    #[serde(default)]
    pub scope_ref: Option<String>,
    /// Milliseconds since the unix epoch.
    pub created_at: i64,
    #[serde(default)]
    pub content: RecordContent,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl EventRecord {
    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at).single()
    }

    pub fn text(&self) -> &str {
        self.content.text.as_deref().unwrap_or("").trim()
    }

    pub fn kind(&self) -> Option<&str> {
        self.content
            .kind
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
    }

    /// String field from `content.data`, trimmed, empty treated as absent.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.content
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .and_then(|value| value.as_str())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Conversation the record belongs to: explicit conversation/thread id, else its room.
    pub fn conversation_key(&self) -> Option<&str> {
        self.data_str("conversationId")
            .or_else(|| self.data_str("threadId"))
            .or_else(|| {
                self.room_ref
                    .as_deref()
                    .map(str::trim)
                    .filter(|room| !room.is_empty())
            })
    }

    pub fn reply_target(&self) -> Option<&str> {
        self.content
            .in_reply_to
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub table: String,
    pub scope: Option<String>,
    pub count: usize,
}

impl RecordFilter {
    pub fn new(table: &str, scope: Option<&str>, count: usize) -> Self {
        Self {
            table: table.to_string(),
            scope: scope.map(str::to_string),
            count,
        }
    }
}

/// Storage backend for the interaction log.
///
/// Retries and connection policy live in implementations; callers treat every
/// error as the upstream being unavailable for this cycle.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Most recent records first, at most `filter.count`.
    async fn get_records(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>>;

    async fn get_record_by_id(&self, id: &str) -> Result<Option<EventRecord>>;

    /// Append a record and return its id.
    async fn append_record(&self, table: &str, record: &EventRecord) -> Result<String>;
}
