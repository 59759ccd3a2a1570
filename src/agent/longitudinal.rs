//! Longitudinal view over stored reflections.
//!
//! Entries are bucketed by age relative to an explicit `now`, their items are
//! normalized and tallied, and the tallies are reduced into recurring issues,
//! persistent strengths, evolving patterns and recent-versus-old trends.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

use crate::agent::history::ReflectionEntry;

const TOP_ITEMS: usize = 5;
const TOP_TRENDS: usize = 3;
const MIN_PERIODS: usize = 2;
const MIN_OCCURRENCES: usize = 3;

const TERMINAL_PUNCTUATION: &[char] = &['.', ',', ';', ':', '!', '?', '…'];

/// Age bucket of a reflection entry. Ordered newest to oldest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeriodBucket {
    Recent,
    OneWeekAgo,
    OneMonthAgo,
    Older,
}

impl PeriodBucket {
    pub const ALL: [PeriodBucket; 4] = [
        PeriodBucket::Recent,
        PeriodBucket::OneWeekAgo,
        PeriodBucket::OneMonthAgo,
        PeriodBucket::Older,
    ];

    /// Bucket for an entry generated at `at`. Timestamps after `now` are recent.
    pub fn for_timestamp(at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let age = now - at;
        if age <= Duration::days(7) {
            PeriodBucket::Recent
        } else if age <= Duration::days(14) {
            PeriodBucket::OneWeekAgo
        } else if age <= Duration::days(35) {
            PeriodBucket::OneMonthAgo
        } else {
            PeriodBucket::Older
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            PeriodBucket::Recent => "last 7 days",
            PeriodBucket::OneWeekAgo => "1-2 weeks ago",
            PeriodBucket::OneMonthAgo => "2-5 weeks ago",
            PeriodBucket::Older => "over 5 weeks ago",
        }
    }

    fn is_old(self) -> bool {
        matches!(self, PeriodBucket::OneMonthAgo | PeriodBucket::Older)
    }
}

/// Lowercase, collapse whitespace, drop trailing punctuation.
pub fn normalize_item(item: &str) -> String {
    let collapsed = item
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    collapsed
        .trim_end_matches(|c: char| TERMINAL_PUNCTUATION.contains(&c) || c.is_whitespace())
        .to_string()
}

/// How often, and in which periods, one normalized item was mentioned.
#[derive(Debug, Clone, PartialEq)]
pub struct OccurrenceTally {
    pub normalized: String,
    /// First-seen spelling.
    pub original: String,
    pub periods: BTreeSet<PeriodBucket>,
    pub count: usize,
}

impl OccurrenceTally {
    /// Seen in two periods, or three times in any.
    pub fn is_recurring(&self) -> bool {
        self.periods.len() >= MIN_PERIODS || self.count >= MIN_OCCURRENCES
    }

    fn covers(&self, bucket: PeriodBucket) -> bool {
        self.periods.contains(&bucket)
    }

    fn covers_old(&self) -> bool {
        self.periods.iter().any(|p| p.is_old())
    }
}

/// Insertion-ordered tallies keyed by normalized text.
#[derive(Debug, Default)]
struct TallyBook {
    tallies: Vec<OccurrenceTally>,
    index: HashMap<String, usize>,
}

impl TallyBook {
    /// Count each distinct item once per entry.
    fn record_entry(&mut self, items: &[String], bucket: PeriodBucket) {
        let mut seen = HashSet::new();
        for item in items {
            let normalized = normalize_item(item);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            match self.index.get(&normalized) {
                Some(&idx) => {
                    let tally = &mut self.tallies[idx];
                    tally.count += 1;
                    tally.periods.insert(bucket);
                }
                None => {
                    self.index.insert(normalized.clone(), self.tallies.len());
                    self.tallies.push(OccurrenceTally {
                        normalized,
                        original: item.trim().to_string(),
                        periods: BTreeSet::from([bucket]),
                        count: 1,
                    });
                }
            }
        }
    }

    /// Tallies matching `keep`, count descending, first-seen on ties.
    fn ranked<F>(&self, keep: F) -> Vec<&OccurrenceTally>
    where
        F: Fn(&OccurrenceTally) -> bool,
    {
        let mut ranked: Vec<&OccurrenceTally> = self.tallies.iter().filter(|t| keep(*t)).collect();
        ranked.sort_by(|a, b| b.count.cmp(&a.count));
        ranked
    }

    fn top_originals<F>(&self, limit: usize, keep: F) -> Vec<String>
    where
        F: Fn(&OccurrenceTally) -> bool,
    {
        self.ranked(keep)
            .into_iter()
            .take(limit)
            .map(|t| t.original.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Ongoing,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    Stable,
    Emerging,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringIssue {
    pub issue: String,
    pub occurrences: usize,
    pub periods: Vec<PeriodBucket>,
    pub status: IssueStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentStrength {
    pub strength: String,
    pub occurrences: usize,
    pub periods: Vec<PeriodBucket>,
    pub consistency: Consistency,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolvingPattern {
    pub pattern: String,
    pub occurrences: usize,
    pub periods: Vec<PeriodBucket>,
}

/// Recent bucket compared against everything older than two weeks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvolutionTrends {
    pub strengths_gained: Vec<String>,
    pub weaknesses_resolved: Vec<String>,
    pub new_challenges: Vec<String>,
    pub stagnant_areas: Vec<String>,
}

impl EvolutionTrends {
    pub fn is_empty(&self) -> bool {
        self.strengths_gained.is_empty()
            && self.weaknesses_resolved.is_empty()
            && self.new_challenges.is_empty()
            && self.stagnant_areas.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub period: PeriodBucket,
    pub entries: usize,
    pub top_strengths: Vec<String>,
    pub top_weaknesses: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timespan {
    pub oldest: DateTime<Utc>,
    pub newest: DateTime<Utc>,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LongitudinalSummary {
    pub timespan: Timespan,
    pub recurring_issues: Vec<RecurringIssue>,
    pub persistent_strengths: Vec<PersistentStrength>,
    pub evolving_patterns: Vec<EvolvingPattern>,
    pub evolution: EvolutionTrends,
    pub period_breakdown: Vec<PeriodSummary>,
}

/// Summarize `entries` as seen from `now`.
///
/// Returns `None` until at least two entries carry a timestamp; entries
/// without one are ignored entirely.
pub fn aggregate(entries: &[ReflectionEntry], now: DateTime<Utc>) -> Option<LongitudinalSummary> {
    let dated: Vec<(&ReflectionEntry, DateTime<Utc>, PeriodBucket)> = entries
        .iter()
        .filter_map(|entry| {
            let at = entry.timestamp()?;
            Some((entry, at, PeriodBucket::for_timestamp(at, now)))
        })
        .collect();

    if dated.len() < 2 {
        return None;
    }

    let mut strengths = TallyBook::default();
    let mut weaknesses = TallyBook::default();
    let mut patterns = TallyBook::default();
    let mut per_period: HashMap<PeriodBucket, (usize, TallyBook, TallyBook)> = HashMap::new();

    for (entry, _, bucket) in &dated {
        let critique = &entry.critique;
        strengths.record_entry(&critique.strengths, *bucket);
        weaknesses.record_entry(&critique.weaknesses, *bucket);
        patterns.record_entry(&critique.patterns, *bucket);

        let slot = per_period.entry(*bucket).or_default();
        slot.0 += 1;
        slot.1.record_entry(&critique.strengths, *bucket);
        slot.2.record_entry(&critique.weaknesses, *bucket);
    }

    let populated: BTreeSet<PeriodBucket> = per_period.keys().copied().collect();
    let newest_bucket = populated.iter().next().copied();
    let oldest_bucket = populated.iter().next_back().copied();

    let recurring_issues = weaknesses
        .ranked(OccurrenceTally::is_recurring)
        .into_iter()
        .take(TOP_ITEMS)
        .map(|t| RecurringIssue {
            issue: t.original.clone(),
            occurrences: t.count,
            periods: t.periods.iter().copied().collect(),
            status: if t.covers(PeriodBucket::Recent) {
                IssueStatus::Ongoing
            } else {
                IssueStatus::Resolved
            },
        })
        .collect();

    let persistent_strengths = strengths
        .ranked(OccurrenceTally::is_recurring)
        .into_iter()
        .take(TOP_ITEMS)
        .map(|t| {
            let spans_history = newest_bucket.map_or(false, |b| t.covers(b))
                && oldest_bucket.map_or(false, |b| t.covers(b));
            PersistentStrength {
                strength: t.original.clone(),
                occurrences: t.count,
                periods: t.periods.iter().copied().collect(),
                consistency: if spans_history {
                    Consistency::Stable
                } else {
                    Consistency::Emerging
                },
            }
        })
        .collect();

    let evolving_patterns = patterns
        .ranked(OccurrenceTally::is_recurring)
        .into_iter()
        .take(TOP_ITEMS)
        .map(|t| EvolvingPattern {
            pattern: t.original.clone(),
            occurrences: t.count,
            periods: t.periods.iter().copied().collect(),
        })
        .collect();

    let recent = |t: &OccurrenceTally| t.covers(PeriodBucket::Recent);
    let evolution = EvolutionTrends {
        strengths_gained: strengths.top_originals(TOP_TRENDS, |t| recent(t) && !t.covers_old()),
        weaknesses_resolved: weaknesses.top_originals(TOP_TRENDS, |t| !recent(t) && t.covers_old()),
        new_challenges: weaknesses.top_originals(TOP_TRENDS, |t| recent(t) && !t.covers_old()),
        stagnant_areas: weaknesses.top_originals(TOP_TRENDS, |t| recent(t) && t.covers_old()),
    };

    let period_breakdown = PeriodBucket::ALL
        .iter()
        .filter_map(|bucket| {
            let (count, bucket_strengths, bucket_weaknesses) = per_period.get(bucket)?;
            Some(PeriodSummary {
                period: *bucket,
                entries: *count,
                top_strengths: bucket_strengths.top_originals(TOP_TRENDS, |_| true),
                top_weaknesses: bucket_weaknesses.top_originals(TOP_TRENDS, |_| true),
            })
        })
        .collect();

    let oldest = dated.iter().map(|(_, at, _)| *at).min()?;
    let newest = dated.iter().map(|(_, at, _)| *at).max()?;

    Some(LongitudinalSummary {
        timespan: Timespan {
            oldest,
            newest,
            total: dated.len(),
        },
        recurring_issues,
        persistent_strengths,
        evolving_patterns,
        evolution,
        period_breakdown,
    })
}

/// Render a summary as markdown for inclusion in a prompt.
pub fn format_longitudinal_context(summary: &LongitudinalSummary) -> String {
    let mut out = format!(
        "## Longitudinal self-review ({} reflections, {} to {})\n",
        summary.timespan.total,
        summary.timespan.oldest.format("%Y-%m-%d"),
        summary.timespan.newest.format("%Y-%m-%d"),
    );

    if !summary.recurring_issues.is_empty() {
        out.push_str("\n### Recurring issues\n");
        for issue in &summary.recurring_issues {
            let status = match issue.status {
                IssueStatus::Ongoing => "ongoing",
                IssueStatus::Resolved => "not seen recently",
            };
            out.push_str(&format!(
                "- {} ({}x across {}; {})\n",
                issue.issue,
                issue.occurrences,
                period_labels(&issue.periods),
                status
            ));
        }
    }

    if !summary.persistent_strengths.is_empty() {
        out.push_str("\n### Persistent strengths\n");
        for strength in &summary.persistent_strengths {
            let consistency = match strength.consistency {
                Consistency::Stable => "stable",
                Consistency::Emerging => "emerging",
            };
            out.push_str(&format!(
                "- {} ({}x, {})\n",
                strength.strength, strength.occurrences, consistency
            ));
        }
    }

    if !summary.evolving_patterns.is_empty() {
        out.push_str("\n### Evolving patterns\n");
        for pattern in &summary.evolving_patterns {
            out.push_str(&format!(
                "- {} ({}x across {})\n",
                pattern.pattern,
                pattern.occurrences,
                period_labels(&pattern.periods)
            ));
        }
    }

    let evolution = &summary.evolution;
    if !evolution.is_empty() {
        out.push_str("\n### Trends\n");
        for (label, items) in [
            ("Strengths gained", &evolution.strengths_gained),
            ("Weaknesses resolved", &evolution.weaknesses_resolved),
            ("New challenges", &evolution.new_challenges),
            ("Still unresolved", &evolution.stagnant_areas),
        ] {
            if !items.is_empty() {
                out.push_str(&format!("- {}: {}\n", label, items.join("; ")));
            }
        }
    }

    if !summary.period_breakdown.is_empty() {
        out.push_str("\n### By period\n");
        for period in &summary.period_breakdown {
            out.push_str(&format!(
                "- {}: {} reflection(s)",
                period.period.label(),
                period.entries
            ));
            if !period.top_strengths.is_empty() {
                out.push_str(&format!("; strengths: {}", period.top_strengths.join(", ")));
            }
            if !period.top_weaknesses.is_empty() {
                out.push_str(&format!("; weaknesses: {}", period.top_weaknesses.join(", ")));
            }
            out.push('\n');
        }
    }

    out
}

fn period_labels(periods: &[PeriodBucket]) -> String {
    periods
        .iter()
        .map(|p| p.label())
        .collect::<Vec<_>>()
        .join(", ")
}
