//! Rebuilds reply-centred conversation windows from the flat interaction log.
//!
//! The log has no first-class thread object: replies point at their parent via
//! `in_reply_to`, and conversations are grouped by an explicit conversation id
//! or the room. Every call rebuilds its own indexes from a snapshot, so results
//! are deterministic for a given log and nothing is cached between runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::agent::roles::{author_label, infer_role, mask_id, AgentIdentity, TurnRole};
use crate::config::WindowConfig;
use crate::event_store::{EventRecord, EventStore};

pub const USER_MESSAGE_CAP: usize = 280;
pub const AGENT_REPLY_CAP: usize = 280;
pub const TURN_TEXT_CAP: usize = 220;
pub const SIGNAL_CAP: usize = 220;

pub const REFLECTION_TYPE: &str = "self_reflection";
pub const APPRECIATION_TYPE: &str = "appreciation";

/// Types that never count as a cross-signal: our own reflections, thread
/// scaffolding, and ordinary speech.
const NON_SIGNAL_TYPES: &[&str] = &[
    REFLECTION_TYPE,
    "thread",
    "thread_root",
    "system",
    "message",
    "reply",
    "text",
];

const GLOBAL_SIGNAL_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub role: TurnRole,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub source_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupTurn {
    pub id: String,
    pub author: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// Replied to the agent's message directly rather than just following it.
    pub direct_reply: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionMetadata {
    pub masked_author_id: Option<String>,
    pub reply_id: String,
    pub created_at: DateTime<Utc>,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub user_message: String,
    pub agent_reply: String,
    pub conversation_window: Vec<Turn>,
    pub feedback: Vec<FollowupTurn>,
    pub signals: Vec<String>,
    pub metadata: InteractionMetadata,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconstruction {
    pub interactions: Vec<InteractionRecord>,
    pub global_signals: Vec<String>,
}

/// Collapse all whitespace runs into single spaces.
pub fn normalize_whitespace(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whitespace-normalize, then cut to `cap` chars followed by `...` when longer.
pub fn truncate_field(input: &str, cap: usize) -> String {
    let normalized = normalize_whitespace(input);
    if normalized.chars().count() <= cap {
        return normalized;
    }
    let mut out: String = normalized.chars().take(cap).collect();
    out.push_str("...");
    out
}

fn is_signal_kind(kind: &str) -> bool {
    !NON_SIGNAL_TYPES.iter().any(|t| kind.eq_ignore_ascii_case(t))
}

/// Speech or thread scaffolding, as opposed to signals and our own reflections.
fn is_conversational(record: &EventRecord) -> bool {
    match record.kind() {
        None => true,
        Some(kind) => !is_signal_kind(kind) && !kind.eq_ignore_ascii_case(REFLECTION_TYPE),
    }
}

fn sort_key(record: &EventRecord) -> (i64, &str) {
    (record.created_at, record.id.as_str())
}

/// Per-call indexes over a copy of the log.
struct LogIndex {
    records: Vec<EventRecord>,
    by_id: HashMap<String, usize>,
    by_conversation: HashMap<String, Vec<usize>>,
    children: HashMap<String, Vec<usize>>,
}

impl LogIndex {
    fn build(records: &[EventRecord]) -> Self {
        let mut sorted = records.to_vec();
        sorted.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));

        let mut index = Self {
            records: Vec::with_capacity(sorted.len()),
            by_id: HashMap::new(),
            by_conversation: HashMap::new(),
            children: HashMap::new(),
        };
        for record in sorted {
            index.insert(record);
        }
        index
    }

    /// Add a record, keeping each conversation list in time order.
    fn insert(&mut self, record: EventRecord) -> usize {
        if let Some(&existing) = self.by_id.get(&record.id) {
            return existing;
        }

        let idx = self.records.len();
        self.by_id.insert(record.id.clone(), idx);
        if let Some(parent) = record.reply_target() {
            self.children.entry(parent.to_string()).or_default().push(idx);
        }
        if let Some(key) = record.conversation_key().filter(|_| is_conversational(&record)) {
            let key = key.to_string();
            let records = &self.records;
            let list = self.by_conversation.entry(key).or_default();
            let pos = list.partition_point(|&other| sort_key(&records[other]) < sort_key(&record));
            list.insert(pos, idx);
        }
        self.records.push(record);
        idx
    }

    fn get(&self, idx: usize) -> &EventRecord {
        &self.records[idx]
    }

    fn lookup(&self, id: &str) -> Option<usize> {
        self.by_id.get(id).copied()
    }
}

pub struct Reconstructor<'a> {
    store: &'a dyn EventStore,
    identity: &'a AgentIdentity,
    window: &'a WindowConfig,
}

impl<'a> Reconstructor<'a> {
    pub fn new(
        store: &'a dyn EventStore,
        identity: &'a AgentIdentity,
        window: &'a WindowConfig,
    ) -> Self {
        Self {
            store,
            identity,
            window,
        }
    }

    /// Build up to `limit` interactions, newest reply first.
    ///
    /// Parents missing from `records` are fetched from the store once each;
    /// a failed or empty fetch drops that reply.
    pub async fn reconstruct(&self, records: &[EventRecord], limit: usize) -> Reconstruction {
        let mut index = LogIndex::build(records);
        let global_signals = self.global_signals(&index);

        let candidates: Vec<usize> = (0..index.records.len())
            .rev()
            .filter(|&idx| self.is_candidate(index.get(idx)))
            .collect();

        let mut interactions = Vec::new();
        for reply_idx in candidates {
            if interactions.len() >= limit {
                break;
            }

            let Some(parent_id) = index.get(reply_idx).reply_target().map(str::to_string) else {
                continue;
            };
            let Some(parent_idx) = self.resolve_parent(&mut index, &parent_id).await else {
                tracing::debug!(
                    "Dropping reply {}: parent {} unresolved",
                    index.get(reply_idx).id,
                    parent_id
                );
                continue;
            };

            interactions.push(self.build_interaction(&index, reply_idx, parent_idx));
        }

        tracing::debug!(
            "Reconstructed {} interactions from {} records",
            interactions.len(),
            records.len()
        );

        Reconstruction {
            interactions,
            global_signals,
        }
    }

    fn is_candidate(&self, record: &EventRecord) -> bool {
        record.reply_target().is_some()
            && !record.text().is_empty()
            && is_conversational(record)
            && infer_role(record, self.identity) == TurnRole::Agent
    }

    async fn resolve_parent(&self, index: &mut LogIndex, parent_id: &str) -> Option<usize> {
        if let Some(idx) = index.lookup(parent_id) {
            return Some(idx);
        }

        match self.store.get_record_by_id(parent_id).await {
            Ok(Some(record)) => Some(index.insert(record)),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Failed to fetch parent record {}: {}", parent_id, e);
                None
            }
        }
    }

    fn build_interaction(
        &self,
        index: &LogIndex,
        reply_idx: usize,
        parent_idx: usize,
    ) -> InteractionRecord {
        let reply = index.get(reply_idx);
        let parent = index.get(parent_idx);

        let window_idxs = self.window_indices(index, reply_idx, parent_idx);
        let conversation_window: Vec<Turn> = window_idxs
            .iter()
            .filter(|&&idx| idx == reply_idx || idx == parent_idx || !index.get(idx).text().is_empty())
            .map(|&idx| self.to_turn(index.get(idx)))
            .collect();

        let pad_ms = self.window.pad_minutes.max(0) * 60_000;
        let (min_ts, max_ts) = window_idxs.iter().fold((i64::MAX, i64::MIN), |(lo, hi), &idx| {
            let ts = index.get(idx).created_at;
            (lo.min(ts), hi.max(ts))
        });
        let time_window = (min_ts.saturating_sub(pad_ms), max_ts.saturating_add(pad_ms));

        let feedback = self.collect_feedback(index, reply_idx, time_window);
        let excluded: HashSet<usize> = window_idxs.iter().copied().collect();
        let signals = self.collect_signals(index, &excluded, time_window);

        let mut participants: Vec<String> = Vec::new();
        for turn in &conversation_window {
            if !participants.contains(&turn.author) {
                participants.push(turn.author.clone());
            }
        }

        let masked_author_id = match infer_role(parent, self.identity) {
            TurnRole::Counterpart => parent.author_ref.as_deref().map(mask_id),
            _ => None,
        };

        InteractionRecord {
            user_message: normalize_whitespace(parent.text()),
            agent_reply: normalize_whitespace(reply.text()),
            conversation_window,
            feedback,
            signals,
            metadata: InteractionMetadata {
                masked_author_id,
                reply_id: reply.id.clone(),
                created_at: reply.created_at_utc().unwrap_or_default(),
                participants,
            },
        }
    }

    /// Slice of the reply's conversation around it, parent always included.
    fn window_indices(&self, index: &LogIndex, reply_idx: usize, parent_idx: usize) -> Vec<usize> {
        let reply = index.get(reply_idx);
        let mut window: Vec<usize> = match reply
            .conversation_key()
            .and_then(|key| index.by_conversation.get(key))
        {
            Some(list) => match list.iter().position(|&idx| idx == reply_idx) {
                Some(pos) => {
                    let start = pos.saturating_sub(self.window.turns_before);
                    let end = (pos + self.window.turns_after).min(list.len() - 1);
                    list[start..=end].to_vec()
                }
                None => vec![reply_idx],
            },
            None => vec![reply_idx],
        };

        if !window.contains(&parent_idx) {
            window.push(parent_idx);
        }
        window.sort_by(|&a, &b| sort_key(index.get(a)).cmp(&sort_key(index.get(b))));
        window
    }

    fn to_turn(&self, record: &EventRecord) -> Turn {
        let role = infer_role(record, self.identity);
        Turn {
            id: record.id.clone(),
            role,
            author: author_label(record, role, self.identity),
            text: truncate_field(record.text(), TURN_TEXT_CAP),
            timestamp: record.created_at_utc().unwrap_or_default(),
            source_type: record
                .content
                .source_ref
                .clone()
                .or_else(|| record.kind().map(str::to_string))
                .unwrap_or_else(|| "message".to_string()),
        }
    }

    fn collect_feedback(
        &self,
        index: &LogIndex,
        reply_idx: usize,
        (_, window_end): (i64, i64),
    ) -> Vec<FollowupTurn> {
        let reply = index.get(reply_idx);
        let is_followup = |idx: usize| {
            let record = index.get(idx);
            record.created_at > reply.created_at
                && record.created_at <= window_end
                && !record.text().is_empty()
                && is_conversational(record)
                && infer_role(record, self.identity) == TurnRole::Counterpart
        };

        let mut direct: Vec<usize> = index
            .children
            .get(&reply.id)
            .map(|kids| kids.iter().copied().filter(|&idx| is_followup(idx)).collect())
            .unwrap_or_default();
        direct.sort_by(|&a, &b| sort_key(index.get(a)).cmp(&sort_key(index.get(b))));

        let following: Vec<usize> = reply
            .conversation_key()
            .and_then(|key| index.by_conversation.get(key))
            .map(|list| {
                list.iter()
                    .copied()
                    .filter(|&idx| is_followup(idx) && !direct.contains(&idx))
                    .collect()
            })
            .unwrap_or_default();

        direct
            .iter()
            .map(|&idx| (idx, true))
            .chain(following.iter().map(|&idx| (idx, false)))
            .take(self.window.max_feedback)
            .map(|(idx, direct_reply)| {
                let record = index.get(idx);
                FollowupTurn {
                    id: record.id.clone(),
                    author: author_label(record, TurnRole::Counterpart, self.identity),
                    text: truncate_field(record.text(), TURN_TEXT_CAP),
                    timestamp: record.created_at_utc().unwrap_or_default(),
                    direct_reply,
                }
            })
            .collect()
    }

    fn collect_signals(
        &self,
        index: &LogIndex,
        excluded: &HashSet<usize>,
        (window_start, window_end): (i64, i64),
    ) -> Vec<String> {
        let mut overlapping: Vec<usize> = (0..index.records.len())
            .filter(|idx| !excluded.contains(idx))
            .filter(|&idx| {
                let record = index.get(idx);
                record.created_at >= window_start
                    && record.created_at <= window_end
                    && record.kind().map(is_signal_kind).unwrap_or(false)
            })
            .collect();
        overlapping.sort_by(|&a, &b| sort_key(index.get(a)).cmp(&sort_key(index.get(b))));

        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut signals = Vec::new();
        for idx in overlapping {
            if signals.len() >= self.window.max_signals {
                break;
            }
            let record = index.get(idx);
            let kind = record.kind().unwrap_or_default().to_ascii_lowercase();
            let room = record.room_ref.clone().unwrap_or_default();
            if !seen.insert((kind, room)) {
                continue;
            }
            signals.push(self.describe_signal(index, record));
        }
        signals
    }

    fn describe_signal(&self, index: &LogIndex, record: &EventRecord) -> String {
        let kind = record.kind().unwrap_or("signal");
        let role = infer_role(record, self.identity);
        let author = author_label(record, role, self.identity);

        if kind.eq_ignore_ascii_case(APPRECIATION_TYPE) {
            let target_text = record
                .data_str("targetId")
                .and_then(|target| index.lookup(target))
                .map(|idx| index.get(idx).text())
                .filter(|text| !text.is_empty());
            if let Some(text) = target_text {
                return truncate_field(
                    &format!("{} from {} on \"{}\"", kind, author, text),
                    SIGNAL_CAP,
                );
            }
        }

        let text = record.text();
        let line = if text.is_empty() {
            format!("{} from {}", kind, author)
        } else {
            format!("{} from {}: {}", kind, author, text)
        };
        truncate_field(&line, SIGNAL_CAP)
    }

    /// Counts of each signal type across the whole log, most frequent first.
    fn global_signals(&self, index: &LogIndex) -> Vec<String> {
        let mut tallies: Vec<(String, usize)> = Vec::new();
        for record in &index.records {
            let Some(kind) = record.kind().filter(|k| is_signal_kind(k)) else {
                continue;
            };
            let kind = kind.to_ascii_lowercase();
            match tallies.iter_mut().find(|(k, _)| *k == kind) {
                Some((_, count)) => *count += 1,
                None => tallies.push((kind, 1)),
            }
        }
        tallies.sort_by(|a, b| b.1.cmp(&a.1));
        tallies
            .into_iter()
            .take(GLOBAL_SIGNAL_LIMIT)
            .map(|(kind, count)| format!("{}: {}", kind, count))
            .collect()
    }
}
