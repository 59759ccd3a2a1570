use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::agent::critique::CritiqueRecord;
use crate::agent::interactions::{
    truncate_field, InteractionRecord, AGENT_REPLY_CAP, REFLECTION_TYPE, SIGNAL_CAP,
    TURN_TEXT_CAP, USER_MESSAGE_CAP,
};
use crate::agent::longitudinal::{aggregate, LongitudinalSummary};
use crate::event_store::{EventRecord, EventStore, RecordContent, RecordFilter, REFLECTIONS_TABLE};

/// Persisted, truncated form of one critiqued interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionSnapshot {
    pub user_message: String,
    #[serde(rename = "yourReply")]
    pub agent_reply: String,
    #[serde(default)]
    pub conversation: Vec<String>,
    #[serde(default)]
    pub feedback: Vec<String>,
    #[serde(default)]
    pub signals: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masked_author_id: Option<String>,
    pub reply_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&InteractionRecord> for InteractionSnapshot {
    fn from(record: &InteractionRecord) -> Self {
        Self {
            user_message: truncate_field(&record.user_message, USER_MESSAGE_CAP),
            agent_reply: truncate_field(&record.agent_reply, AGENT_REPLY_CAP),
            conversation: record
                .conversation_window
                .iter()
                .map(|turn| truncate_field(&format!("{}: {}", turn.author, turn.text), TURN_TEXT_CAP))
                .collect(),
            feedback: record
                .feedback
                .iter()
                .map(|turn| truncate_field(&format!("{}: {}", turn.author, turn.text), TURN_TEXT_CAP))
                .collect(),
            signals: record
                .signals
                .iter()
                .map(|signal| truncate_field(signal, SIGNAL_CAP))
                .collect(),
            masked_author_id: record.metadata.masked_author_id.clone(),
            reply_id: record.metadata.reply_id.clone(),
            created_at: record.metadata.created_at,
        }
    }
}

/// One stored reflection cycle. Never modified after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReflectionEntry {
    pub id: String,
    pub critique: CritiqueRecord,
    #[serde(default)]
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub interaction_count: usize,
    #[serde(default)]
    pub interactions: Vec<InteractionSnapshot>,
}

impl ReflectionEntry {
    pub fn new(
        critique: CritiqueRecord,
        generated_at: DateTime<Utc>,
        interactions: &[InteractionRecord],
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            critique,
            generated_at: Some(generated_at),
            interaction_count: interactions.len(),
            interactions: interactions.iter().map(InteractionSnapshot::from).collect(),
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.generated_at.or(self.critique.generated_at)
    }

    fn headline(&self) -> String {
        self.critique.narrative_summary.clone().unwrap_or_else(|| {
            format!(
                "Self-reflection over {} interaction(s): {} strength(s), {} weakness(es)",
                self.interaction_count,
                self.critique.strengths.len(),
                self.critique.weaknesses.len()
            )
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SummaryKey {
    limit: usize,
    max_age_days: i64,
}

struct CachedSummary {
    key: SummaryKey,
    newest_id: Option<String>,
    computed_at: Instant,
    summary: Option<LongitudinalSummary>,
}

/// Append-only reflection log kept in the event store.
pub struct ReflectionHistory {
    store: Arc<dyn EventStore>,
    scope: String,
    cache_ttl: std::time::Duration,
    cache: RwLock<Option<CachedSummary>>,
}

impl ReflectionHistory {
    pub fn new(store: Arc<dyn EventStore>, scope: impl Into<String>, cache_ttl: std::time::Duration) -> Self {
        Self {
            store,
            scope: scope.into(),
            cache_ttl,
            cache: RwLock::new(None),
        }
    }

    pub async fn append(&self, entry: &ReflectionEntry) -> Result<String> {
        let created_at = entry.timestamp().unwrap_or_else(Utc::now);
        let record = EventRecord {
            id: entry.id.clone(),
            author_ref: Some(self.scope.clone()),
            room_ref: None,
            scope_ref: Some(self.scope.clone()),
            created_at: created_at.timestamp_millis(),
            content: RecordContent {
                text: Some(entry.headline()),
                kind: Some(REFLECTION_TYPE.to_string()),
                data: Some(serde_json::to_value(entry).context("Failed to serialize reflection entry")?),
                ..RecordContent::default()
            },
        };

        let id = self
            .store
            .append_record(REFLECTIONS_TABLE, &record)
            .await
            .context("Failed to store reflection entry")?;
        *self.cache.write().await = None;
        tracing::debug!("Stored reflection {} ({} interactions)", id, entry.interaction_count);
        Ok(id)
    }

    /// Newest-first entries, at most `limit`, optionally no older than `max_age`.
    ///
    /// Unreadable records do not count against `limit`: the page grows until
    /// enough entries decode, the store runs out, or the page reaches past the
    /// age cutoff. An age too large to subtract from now means no cutoff.
    pub async fn get_entries(&self, limit: usize, max_age: Option<Duration>) -> Result<Vec<ReflectionEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cutoff = max_age.and_then(|age| Utc::now().checked_sub_signed(age));
        let mut fetch = limit.saturating_mul(2).max(limit.saturating_add(4));

        loop {
            let filter = RecordFilter::new(REFLECTIONS_TABLE, Some(&self.scope), fetch);
            let records = self
                .store
                .get_records(&filter)
                .await
                .context("Failed to load reflection history")?;

            let entries: Vec<ReflectionEntry> = records
                .iter()
                .filter_map(decode_entry)
                .filter(|entry| match (cutoff, entry.timestamp()) {
                    (Some(cutoff), Some(at)) => at >= cutoff,
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .take(limit)
                .collect();

            let exhausted = records.len() < fetch || fetch == usize::MAX;
            let past_cutoff = match (cutoff, records.last().and_then(EventRecord::created_at_utc)) {
                (Some(cutoff), Some(oldest)) => oldest < cutoff,
                _ => false,
            };
            if entries.len() >= limit || exhausted || past_cutoff {
                return Ok(entries);
            }
            fetch = fetch.saturating_mul(2);
        }
    }

    pub async fn get_history(&self, limit: usize, max_age_hours: Option<i64>) -> Result<Vec<CritiqueRecord>> {
        let entries = self
            .get_entries(limit, max_age_hours.and_then(Duration::try_hours))
            .await?;
        Ok(entries.into_iter().map(|entry| entry.critique).collect())
    }

    pub async fn get_latest_summary(&self, max_age_hours: Option<i64>) -> Result<Option<CritiqueRecord>> {
        Ok(self.get_history(1, max_age_hours).await?.into_iter().next())
    }

    /// Aggregate recent history, reusing the cached result while no new
    /// entry has landed and the TTL has not lapsed.
    ///
    /// If the store cannot be reached, the cached summary for the same
    /// parameters is returned instead of an error.
    pub async fn get_longitudinal_summary(
        &self,
        limit: usize,
        max_age_days: i64,
    ) -> Result<Option<LongitudinalSummary>> {
        let key = SummaryKey { limit, max_age_days };

        let newest_id = match self.newest_entry_id().await {
            Ok(id) => id,
            Err(e) => return self.cached_or(key, e).await,
        };

        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if cached.key == key
                    && cached.newest_id == newest_id
                    && cached.computed_at.elapsed() < self.cache_ttl
                {
                    return Ok(cached.summary.clone());
                }
            }
        }

        let entries = match self.get_entries(limit, Duration::try_days(max_age_days)).await {
            Ok(entries) => entries,
            Err(e) => return self.cached_or(key, e).await,
        };
        let summary = aggregate(&entries, Utc::now());
        if summary.is_none() {
            tracing::debug!(
                "Longitudinal summary unavailable: {} usable reflection(s)",
                entries.len()
            );
        }

        *self.cache.write().await = Some(CachedSummary {
            key,
            newest_id,
            computed_at: Instant::now(),
            summary: summary.clone(),
        });
        Ok(summary)
    }

    async fn newest_entry_id(&self) -> Result<Option<String>> {
        let filter = RecordFilter::new(REFLECTIONS_TABLE, Some(&self.scope), 1);
        let records = self.store.get_records(&filter).await?;
        Ok(records.into_iter().next().map(|record| record.id))
    }

    async fn cached_or(&self, key: SummaryKey, error: anyhow::Error) -> Result<Option<LongitudinalSummary>> {
        let cache = self.cache.read().await;
        match cache.as_ref().filter(|cached| cached.key == key) {
            Some(cached) => {
                tracing::warn!("Reflection store unavailable, serving cached summary: {:#}", error);
                Ok(cached.summary.clone())
            }
            None => Err(error),
        }
    }
}

fn decode_entry(record: &EventRecord) -> Option<ReflectionEntry> {
    if record.kind() != Some(REFLECTION_TYPE) {
        return None;
    }
    let data = record.content.data.clone()?;
    match serde_json::from_value::<ReflectionEntry>(data) {
        Ok(mut entry) => {
            if entry.timestamp().is_none() {
                entry.generated_at = record.created_at_utc();
            }
            Some(entry)
        }
        Err(e) => {
            tracing::debug!("Skipping unreadable reflection record {}: {}", record.id, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::interactions::{FollowupTurn, InteractionMetadata, Turn};
    use crate::agent::roles::TurnRole;
    use crate::database::AgentDatabase;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Database-backed store that counts list calls and can be switched off.
    struct CountingStore {
        inner: AgentDatabase,
        lists: AtomicUsize,
        offline: AtomicBool,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: AgentDatabase::open_in_memory().unwrap(),
                lists: AtomicUsize::new(0),
                offline: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl EventStore for CountingStore {
        async fn get_records(&self, filter: &RecordFilter) -> Result<Vec<EventRecord>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                anyhow::bail!("store offline");
            }
            self.inner.get_records(filter).await
        }

        async fn get_record_by_id(&self, id: &str) -> Result<Option<EventRecord>> {
            self.inner.get_record_by_id(id).await
        }

        async fn append_record(&self, table: &str, record: &EventRecord) -> Result<String> {
            self.inner.append_record(table, record).await
        }
    }

    fn critique(strengths: &[&str], weaknesses: &[&str]) -> CritiqueRecord {
        CritiqueRecord {
            strengths: strengths.iter().map(|s| s.to_string()).collect(),
            weaknesses: weaknesses.iter().map(|s| s.to_string()).collect(),
            ..CritiqueRecord::default()
        }
    }

    fn entry_days_ago(days: i64, weaknesses: &[&str]) -> ReflectionEntry {
        ReflectionEntry::new(
            critique(&["concise"], weaknesses),
            Utc::now() - Duration::days(days),
            &[],
        )
    }

    fn sample_interaction() -> InteractionRecord {
        let now = Utc::now();
        InteractionRecord {
            user_message: "word ".repeat(100),
            agent_reply: "short   reply".to_string(),
            conversation_window: vec![Turn {
                id: "t1".to_string(),
                role: TurnRole::Counterpart,
                author: "sam".to_string(),
                text: "x".repeat(400),
                timestamp: now,
                source_type: "message".to_string(),
            }],
            feedback: vec![FollowupTurn {
                id: "f1".to_string(),
                author: "sam".to_string(),
                text: "nice".to_string(),
                timestamp: now,
                direct_reply: true,
            }],
            signals: vec!["y".repeat(300)],
            metadata: InteractionMetadata {
                masked_author_id: Some("user-1…".to_string()),
                reply_id: "r1".to_string(),
                created_at: now,
                participants: vec!["sam".to_string()],
            },
        }
    }

    #[test]
    fn snapshot_truncates_each_field() {
        let snapshot = InteractionSnapshot::from(&sample_interaction());
        assert_eq!(snapshot.user_message.chars().count(), USER_MESSAGE_CAP + 3);
        assert!(snapshot.user_message.ends_with("..."));
        assert_eq!(snapshot.agent_reply, "short reply");
        assert_eq!(snapshot.conversation[0].chars().count(), TURN_TEXT_CAP + 3);
        assert_eq!(snapshot.feedback, vec!["sam: nice".to_string()]);
        assert_eq!(snapshot.signals[0].chars().count(), SIGNAL_CAP + 3);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["yourReply"], "short reply");
    }

    #[tokio::test]
    async fn append_then_read_back_newest_first() {
        let dir = tempdir().unwrap();
        let db = AgentDatabase::new(dir.path().join("history.db")).unwrap();
        let history = ReflectionHistory::new(Arc::new(db), "agent-1", std::time::Duration::from_secs(60));

        let older = entry_days_ago(3, &["rambles"]);
        let mut newer = ReflectionEntry::new(
            critique(&["warm"], &["abrupt"]),
            Utc::now() - Duration::hours(1),
            &[sample_interaction()],
        );
        newer.critique.narrative_summary = Some("A calmer week.".to_string());
        history.append(&older).await.unwrap();
        history.append(&newer).await.unwrap();

        let all = history.get_entries(10, None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], newer);
        assert_eq!(all[0].interaction_count, 1);

        let latest = history.get_latest_summary(None).await.unwrap().unwrap();
        assert_eq!(latest.weaknesses, vec!["abrupt".to_string()]);

        let recent = history.get_history(10, Some(24)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert!(history.get_latest_summary(Some(0)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stored_record_uses_reflection_layout() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store.clone(), "agent-1", std::time::Duration::from_secs(60));
        let mut entry = entry_days_ago(0, &["rambles"]);
        entry.critique.narrative_summary = Some("Kept it short.".to_string());
        let id = history.append(&entry).await.unwrap();

        let record = store.inner.find_record(&id).unwrap().unwrap();
        assert_eq!(record.kind(), Some(REFLECTION_TYPE));
        assert_eq!(record.text(), "Kept it short.");
        assert_eq!(record.scope_ref.as_deref(), Some("agent-1"));
        let data = record.content.data.unwrap();
        assert_eq!(data["critique"]["weaknesses"][0], "rambles");
        assert_eq!(data["interactionCount"], 0);
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        let store = Arc::new(CountingStore::new());
        let junk = EventRecord {
            id: "junk".to_string(),
            author_ref: None,
            room_ref: None,
            scope_ref: Some("agent-1".to_string()),
            created_at: Utc::now().timestamp_millis(),
            content: RecordContent {
                kind: Some(REFLECTION_TYPE.to_string()),
                data: Some(serde_json::json!({ "unexpected": true })),
                ..RecordContent::default()
            },
        };
        store.inner.insert_record(REFLECTIONS_TABLE, &junk).unwrap();
        let history = ReflectionHistory::new(store, "agent-1", std::time::Duration::from_secs(60));
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();

        assert_eq!(history.get_entries(10, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unreadable_newest_record_does_not_hide_latest() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store.clone(), "agent-1", std::time::Duration::from_secs(60));
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();
        let junk = EventRecord {
            id: "junk-newest".to_string(),
            author_ref: None,
            room_ref: None,
            scope_ref: Some("agent-1".to_string()),
            created_at: (Utc::now() + Duration::minutes(5)).timestamp_millis(),
            content: RecordContent {
                kind: Some(REFLECTION_TYPE.to_string()),
                data: Some(serde_json::json!("not an entry")),
                ..RecordContent::default()
            },
        };
        store.inner.insert_record(REFLECTIONS_TABLE, &junk).unwrap();

        let latest = history.get_latest_summary(None).await.unwrap().unwrap();
        assert_eq!(latest.weaknesses, vec!["rambles"]);
        assert_eq!(history.get_history(1, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn large_age_limits_mean_no_cutoff() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store, "agent-1", std::time::Duration::from_secs(60));
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();
        history.append(&entry_days_ago(3000, &["rambles"])).await.unwrap();

        let all = history.get_history(10, Some(i64::MAX)).await.unwrap();
        assert_eq!(all.len(), 2);

        let summary = history
            .get_longitudinal_summary(20, 1_000_000_000)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.timespan.total, 2);
    }

    #[tokio::test]
    async fn summary_cache_reuses_until_new_entry() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store.clone(), "agent-1", std::time::Duration::from_secs(600));
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();
        history.append(&entry_days_ago(40, &["rambles"])).await.unwrap();

        let first = history.get_longitudinal_summary(20, 120).await.unwrap().unwrap();
        assert_eq!(first.recurring_issues[0].occurrences, 2);
        let calls_after_first = store.lists.load(Ordering::SeqCst);

        let second = history.get_longitudinal_summary(20, 120).await.unwrap().unwrap();
        assert_eq!(second, first);
        assert_eq!(store.lists.load(Ordering::SeqCst), calls_after_first + 1);

        history.append(&entry_days_ago(0, &["rambles"])).await.unwrap();
        let third = history.get_longitudinal_summary(20, 120).await.unwrap().unwrap();
        assert_eq!(third.recurring_issues[0].occurrences, 3);
    }

    #[tokio::test]
    async fn outage_serves_cached_summary() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store.clone(), "agent-1", std::time::Duration::from_secs(600));
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();
        history.append(&entry_days_ago(9, &["rambles"])).await.unwrap();
        let cached = history.get_longitudinal_summary(20, 120).await.unwrap();
        assert!(cached.is_some());

        store.offline.store(true, Ordering::SeqCst);
        assert_eq!(history.get_longitudinal_summary(20, 120).await.unwrap(), cached);
        assert!(history.get_longitudinal_summary(5, 120).await.is_err());
    }

    #[tokio::test]
    async fn sparse_history_yields_no_summary() {
        let store = Arc::new(CountingStore::new());
        let history = ReflectionHistory::new(store, "agent-1", std::time::Duration::from_secs(600));
        assert!(history.get_longitudinal_summary(20, 120).await.unwrap().is_none());
        history.append(&entry_days_ago(1, &["rambles"])).await.unwrap();
        assert!(history.get_longitudinal_summary(20, 120).await.unwrap().is_none());
    }
}
