use serde::{Deserialize, Serialize};

use crate::event_store::EventRecord;

/// Record types produced by the agent's own bookkeeping rather than by speech.
pub const SYSTEM_TYPES: &[&str] = &["system", "thread", "thread_root", "self_reflection"];

/// Data keys that carry an external author's identity.
pub const COUNTERPART_SIGNATURE_KEYS: &[&str] = &["username", "handle", "authorName"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Agent,
    Counterpart,
    System,
    Unknown,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::Agent => "agent",
            TurnRole::Counterpart => "counterpart",
            TurnRole::System => "system",
            TurnRole::Unknown => "unknown",
        }
    }
}

/// Who "we" are when reading the log.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub display_name: String,
}

impl AgentIdentity {
    pub fn new(agent_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            display_name: display_name.into(),
        }
    }
}

pub fn counterpart_signature(record: &EventRecord) -> Option<&str> {
    COUNTERPART_SIGNATURE_KEYS
        .iter()
        .find_map(|key| record.data_str(key))
}

/// Classify a record's speaker.
///
/// Records filed under the agent's own id count as agent speech only when they
/// lack a counterpart signature; ingested inbound messages are sometimes stored
/// under the agent id with the sender named in `data`.
pub fn infer_role(record: &EventRecord, identity: &AgentIdentity) -> TurnRole {
    if let Some(kind) = record.kind() {
        if SYSTEM_TYPES.iter().any(|t| kind.eq_ignore_ascii_case(t)) {
            return TurnRole::System;
        }
    }

    let author = record
        .author_ref
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty());
    let signature = counterpart_signature(record);

    match (author, signature) {
        (Some(author), None) if author == identity.agent_id => TurnRole::Agent,
        (Some(author), Some(sig)) if author == identity.agent_id => {
            if sig.eq_ignore_ascii_case(&identity.display_name) {
                TurnRole::Agent
            } else {
                TurnRole::Counterpart
            }
        }
        (_, Some(_)) | (Some(_), None) => TurnRole::Counterpart,
        (None, None) => TurnRole::Unknown,
    }
}

/// Display name for a turn. Agent turns always use the agent's own name.
pub fn author_label(record: &EventRecord, role: TurnRole, identity: &AgentIdentity) -> String {
    match role {
        TurnRole::Agent => identity.display_name.clone(),
        TurnRole::Counterpart => counterpart_signature(record)
            .map(str::to_string)
            .or_else(|| record.author_ref.as_deref().map(mask_id))
            .unwrap_or_else(|| "someone".to_string()),
        TurnRole::System => "system".to_string(),
        TurnRole::Unknown => "unknown".to_string(),
    }
}

pub fn mask_id(id: &str) -> String {
    let trimmed = id.trim();
    if trimmed.chars().count() <= 6 {
        return format!("{}…", trimmed);
    }
    let prefix: String = trimmed.chars().take(6).collect();
    format!("{}…", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::RecordContent;
    use serde_json::json;

    fn identity() -> AgentIdentity {
        AgentIdentity::new("agent-1", "Ponder")
    }

    fn record(author: Option<&str>, kind: Option<&str>, data: Option<serde_json::Value>) -> EventRecord {
        EventRecord {
            id: "r".to_string(),
            author_ref: author.map(str::to_string),
            room_ref: Some("room".to_string()),
            scope_ref: None,
            created_at: 0,
            content: RecordContent {
                text: Some("hi".to_string()),
                kind: kind.map(str::to_string),
                data,
                ..RecordContent::default()
            },
        }
    }

    #[test]
    fn agent_authored_without_signature_is_agent() {
        assert_eq!(infer_role(&record(Some("agent-1"), None, None), &identity()), TurnRole::Agent);
    }

    #[test]
    fn agent_id_with_foreign_signature_is_counterpart() {
        let r = record(Some("agent-1"), None, Some(json!({ "username": "sam" })));
        assert_eq!(infer_role(&r, &identity()), TurnRole::Counterpart);
        assert_eq!(author_label(&r, TurnRole::Counterpart, &identity()), "sam");
    }

    #[test]
    fn agent_id_signed_with_own_name_stays_agent() {
        let r = record(Some("agent-1"), None, Some(json!({ "username": "ponder" })));
        assert_eq!(infer_role(&r, &identity()), TurnRole::Agent);
    }

    #[test]
    fn system_types_and_missing_authors() {
        assert_eq!(
            infer_role(&record(Some("agent-1"), Some("thread"), None), &identity()),
            TurnRole::System
        );
        assert_eq!(infer_role(&record(None, None, None), &identity()), TurnRole::Unknown);
        assert_eq!(
            infer_role(&record(Some("user-42"), None, None), &identity()),
            TurnRole::Counterpart
        );
    }

    #[test]
    fn agent_label_never_leaks_counterpart_identity() {
        let r = record(Some("agent-1"), None, Some(json!({ "username": "Ponder" })));
        assert_eq!(author_label(&r, TurnRole::Agent, &identity()), "Ponder");
    }

    #[test]
    fn mask_keeps_short_prefix() {
        assert_eq!(mask_id("user-123456"), "user-1…");
        assert_eq!(mask_id("abc"), "abc…");
    }
}
