use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::critique::{CritiqueExtractor, CritiqueRecord};
use crate::agent::history::{ReflectionEntry, ReflectionHistory};
use crate::agent::interactions::{InteractionRecord, Reconstruction, Reconstructor};
use crate::agent::longitudinal::{format_longitudinal_context, LongitudinalSummary};
use crate::agent::roles::AgentIdentity;
use crate::config::{AgentConfig, WindowConfig};
use crate::event_store::{EventStore, RecordFilter, MESSAGES_TABLE};
use crate::llm_client::{GenerationOptions, GenerativeModel, ModelTier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    NotDue { remaining_secs: u64 },
    TooFewInteractions { found: usize, required: usize },
}

/// Recoverable ways a cycle can come up empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReflectionIssue {
    /// Store or model call failed, timed out, or returned nothing.
    UpstreamUnavailable(String),
    /// Generated text matched neither critique format.
    MalformedCritique,
    /// Fewer than two usable entries to aggregate.
    InsufficientHistory,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Stored(ReflectionEntry),
    Skipped(SkipReason),
    Degraded(ReflectionIssue),
}

pub fn reflection_skip_reason(
    now: DateTime<Utc>,
    last_reflected_at: Option<DateTime<Utc>>,
    enabled: bool,
    interval_hours: u64,
) -> Option<SkipReason> {
    if !enabled {
        return Some(SkipReason::Disabled);
    }

    let Some(last_reflected) = last_reflected_at else {
        return None;
    };

    let interval_secs = interval_hours.saturating_mul(3600);
    let elapsed_secs = (now - last_reflected).num_seconds().max(0) as u64;
    if elapsed_secs >= interval_secs {
        return None;
    }

    Some(SkipReason::NotDue {
        remaining_secs: interval_secs.saturating_sub(elapsed_secs),
    })
}

/// One reflection pass: read the log, ask for a critique, store what comes back.
pub struct ReflectionEngine {
    store: Arc<dyn EventStore>,
    model: Arc<dyn GenerativeModel>,
    history: Arc<ReflectionHistory>,
    extractor: CritiqueExtractor,
    identity: AgentIdentity,
    window: WindowConfig,
    log_window: usize,
    interaction_limit: usize,
    min_interactions: usize,
    history_limit: usize,
    history_max_age_days: i64,
    generation_timeout: Duration,
    options: GenerationOptions,
}

impl ReflectionEngine {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn EventStore>,
        model: Arc<dyn GenerativeModel>,
        history: Arc<ReflectionHistory>,
    ) -> Self {
        Self {
            store,
            model,
            history,
            extractor: CritiqueExtractor::default(),
            identity: AgentIdentity::new(config.agent_id.clone(), config.agent_name.clone()),
            window: config.window.clone(),
            log_window: config.log_window,
            interaction_limit: config.interaction_limit,
            min_interactions: config.min_interactions.max(1),
            history_limit: config.history_limit,
            history_max_age_days: config.history_max_age_days,
            generation_timeout: Duration::from_secs(config.generation_timeout_secs),
            options: GenerationOptions {
                temperature: config.temperature,
                max_tokens: config.max_tokens,
            },
        }
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = timeout;
        self
    }

    pub fn history(&self) -> &Arc<ReflectionHistory> {
        &self.history
    }

    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleOutcome {
        let filter = RecordFilter::new(MESSAGES_TABLE, Some(&self.identity.agent_id), self.log_window);
        let records = match self.store.get_records(&filter).await {
            Ok(records) => records,
            Err(e) => {
                tracing::warn!("Reflection skipped, interaction log unavailable: {:#}", e);
                return CycleOutcome::Degraded(ReflectionIssue::UpstreamUnavailable(e.to_string()));
            }
        };

        let reconstruction = Reconstructor::new(self.store.as_ref(), &self.identity, &self.window)
            .reconstruct(&records, self.interaction_limit)
            .await;

        if reconstruction.interactions.len() < self.min_interactions {
            tracing::info!(
                "Reflection skipped: {} interaction(s), need {}",
                reconstruction.interactions.len(),
                self.min_interactions
            );
            return CycleOutcome::Skipped(SkipReason::TooFewInteractions {
                found: reconstruction.interactions.len(),
                required: self.min_interactions,
            });
        }

        let previous = match self.history.get_latest_summary(None).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!("Previous critique unavailable: {:#}", e);
                None
            }
        };
        let longitudinal = match self
            .history
            .get_longitudinal_summary(self.history_limit, self.history_max_age_days)
            .await
        {
            Ok(summary) => summary,
            Err(e) => {
                tracing::warn!("Longitudinal summary unavailable: {:#}", e);
                None
            }
        };

        let prompt = build_critique_prompt(
            &self.identity,
            &reconstruction,
            previous.as_ref(),
            longitudinal.as_ref(),
        );

        let generated = tokio::time::timeout(
            self.generation_timeout,
            self.model.generate(ModelTier::Large, &prompt, self.options),
        )
        .await;
        let raw = match generated {
            Ok(Ok(text)) if !text.trim().is_empty() => text,
            Ok(Ok(_)) => {
                tracing::warn!("Critique generation returned no text");
                return CycleOutcome::Degraded(ReflectionIssue::UpstreamUnavailable(
                    "empty response".to_string(),
                ));
            }
            Ok(Err(e)) => {
                tracing::warn!("Critique generation failed: {:#}", e);
                return CycleOutcome::Degraded(ReflectionIssue::UpstreamUnavailable(e.to_string()));
            }
            Err(_) => {
                tracing::warn!(
                    "Critique generation timed out after {}s",
                    self.generation_timeout.as_secs_f32()
                );
                return CycleOutcome::Degraded(ReflectionIssue::UpstreamUnavailable(format!(
                    "timed out after {:?}",
                    self.generation_timeout
                )));
            }
        };

        let Some(mut critique) = self.extractor.extract(&raw) else {
            tracing::warn!("Critique output matched no known format ({} chars)", raw.len());
            return CycleOutcome::Degraded(ReflectionIssue::MalformedCritique);
        };
        critique.generated_at.get_or_insert(now);

        let entry = ReflectionEntry::new(critique, now, &reconstruction.interactions);
        if let Err(e) = self.history.append(&entry).await {
            tracing::warn!("Failed to persist reflection: {:#}", e);
            return CycleOutcome::Degraded(ReflectionIssue::UpstreamUnavailable(e.to_string()));
        }

        tracing::info!(
            "Stored reflection {} covering {} interaction(s)",
            entry.id,
            entry.interaction_count
        );
        CycleOutcome::Stored(entry)
    }

    /// Current longitudinal summary, or why there is none.
    pub async fn longitudinal_summary(&self) -> Result<LongitudinalSummary, ReflectionIssue> {
        match self
            .history
            .get_longitudinal_summary(self.history_limit, self.history_max_age_days)
            .await
        {
            Ok(Some(summary)) => Ok(summary),
            Ok(None) => Err(ReflectionIssue::InsufficientHistory),
            Err(e) => Err(ReflectionIssue::UpstreamUnavailable(e.to_string())),
        }
    }
}

pub fn build_critique_prompt(
    identity: &AgentIdentity,
    reconstruction: &Reconstruction,
    previous: Option<&CritiqueRecord>,
    longitudinal: Option<&LongitudinalSummary>,
) -> String {
    let interactions = reconstruction
        .interactions
        .iter()
        .enumerate()
        .map(|(idx, interaction)| format_interaction(idx + 1, interaction))
        .collect::<Vec<_>>()
        .join("\n");

    let global_signals = if reconstruction.global_signals.is_empty() {
        "(none)".to_string()
    } else {
        reconstruction.global_signals.join(", ")
    };

    let previous = previous
        .map(format_previous_critique)
        .unwrap_or_else(|| "(no earlier critique)".to_string());

    let longitudinal = longitudinal
        .map(format_longitudinal_context)
        .unwrap_or_else(|| "(not enough history yet)".to_string());

    format!(
        "You are {name}, reviewing your own recent replies with honest, specific self-critique.\n\
         Judge the replies, not the people you talked to.\n\n\
         ## Recent Interactions\n{interactions}\n\
         ## Engagement Signals\n{global_signals}\n\n\
         ## Previous Critique\n{previous}\n\n\
         ## History\n{longitudinal}\n\n\
         Respond with JSON:\n\
         {{\n\
           \"strengths\": [\"...\"],\n\
           \"weaknesses\": [\"...\"],\n\
           \"patterns\": [\"...\"],\n\
           \"recommendations\": [\"...\"],\n\
           \"exampleGoodReply\": \"quote one of your replies\",\n\
           \"exampleBadReply\": \"quote one of your replies\",\n\
           \"regressions\": [\"weaknesses that returned since the previous critique\"],\n\
           \"improvements\": [\"weaknesses that improved since the previous critique\"],\n\
           \"narrativeSummary\": \"two or three sentences\",\n\
           \"keyLearnings\": [\"...\"],\n\
           \"suggestedPhase\": \"optional\"\n\
         }}",
        name = identity.display_name,
    )
}

fn format_interaction(number: usize, interaction: &InteractionRecord) -> String {
    let mut out = format!("### Interaction {}\n", number);
    if !interaction.conversation_window.is_empty() {
        out.push_str("Context:\n");
        for turn in &interaction.conversation_window {
            out.push_str(&format!("  [{}] {}: {}\n", turn.role.as_str(), turn.author, turn.text));
        }
    }
    out.push_str(&format!("They said: {}\n", interaction.user_message));
    out.push_str(&format!("You replied: {}\n", interaction.agent_reply));
    for followup in &interaction.feedback {
        let marker = if followup.direct_reply { "replied" } else { "followed up" };
        out.push_str(&format!("  {} {}: {}\n", followup.author, marker, followup.text));
    }
    if !interaction.signals.is_empty() {
        out.push_str(&format!("Signals: {}\n", interaction.signals.join("; ")));
    }
    out
}

fn format_previous_critique(critique: &CritiqueRecord) -> String {
    let mut lines = Vec::new();
    if !critique.strengths.is_empty() {
        lines.push(format!("Strengths: {}", critique.strengths.join("; ")));
    }
    if !critique.weaknesses.is_empty() {
        lines.push(format!("Weaknesses: {}", critique.weaknesses.join("; ")));
    }
    if !critique.recommendations.is_empty() {
        lines.push(format!("Recommendations: {}", critique.recommendations.join("; ")));
    }
    if lines.is_empty() {
        "(empty)".to_string()
    } else {
        lines.join("\n")
    }
}
