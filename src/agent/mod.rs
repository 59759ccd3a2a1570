pub mod critique;
pub mod history;
pub mod interactions;
pub mod longitudinal;
pub mod reflection;
pub mod roles;

use anyhow::Result;
use chrono::{DateTime, Utc};
use flume::Sender;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::llm_client::GenerativeModel;
use history::ReflectionHistory;
use reflection::{reflection_skip_reason, CycleOutcome, ReflectionEngine, ReflectionIssue};

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Observation(String),
    ReflectionStored {
        id: String,
        interaction_count: usize,
    },
    Error(String),
}

/// Periodically critiques the agent's own replies.
pub struct ReflectionAgent {
    config: Arc<RwLock<AgentConfig>>,
    database: Arc<AgentDatabase>,
    engine: ReflectionEngine,
    event_tx: Sender<AgentEvent>,
}

impl ReflectionAgent {
    pub fn new(
        config: AgentConfig,
        database: Arc<AgentDatabase>,
        model: Arc<dyn GenerativeModel>,
        event_tx: Sender<AgentEvent>,
    ) -> Self {
        let history = Arc::new(ReflectionHistory::new(
            database.clone(),
            config.agent_id.clone(),
            StdDuration::from_secs(config.summary_cache_ttl_secs),
        ));
        let engine = ReflectionEngine::new(&config, database.clone(), model, history);

        Self {
            config: Arc::new(RwLock::new(config)),
            database,
            engine,
            event_tx,
        }
    }

    pub fn engine(&self) -> &ReflectionEngine {
        &self.engine
    }

    async fn emit(&self, event: AgentEvent) {
        let _ = self.event_tx.send(event);
    }

    pub async fn run_loop(self: Arc<Self>) -> Result<()> {
        tracing::info!("Reflection loop starting...");

        self.emit(AgentEvent::Observation("Reflection agent starting up...".to_string()))
            .await;

        loop {
            self.maybe_reflect(Utc::now()).await;

            let poll_interval = {
                let config = self.config.read().await;
                config.poll_interval_secs.max(1)
            };
            sleep(Duration::from_secs(poll_interval)).await;
        }
    }

    /// Run a reflection cycle if one is due. `None` when the gate could not be read.
    pub async fn maybe_reflect(&self, now: DateTime<Utc>) -> Option<CycleOutcome> {
        let (enabled, interval_hours) = {
            let config = self.config.read().await;
            (config.enable_self_reflection, config.reflection_interval_hours)
        };

        let last_reflected_at = match self.database.get_last_reflection_time() {
            Ok(last) => last,
            Err(e) => {
                tracing::warn!("Failed to get last reflection time: {}", e);
                return None;
            }
        };

        if let Some(reason) = reflection_skip_reason(now, last_reflected_at, enabled, interval_hours) {
            tracing::debug!("Reflection not due: {:?}", reason);
            return Some(CycleOutcome::Skipped(reason));
        }

        self.emit(AgentEvent::Observation(
            "Beginning self-reflection cycle...".to_string(),
        ))
        .await;

        let outcome = self.engine.run_cycle(now).await;
        match &outcome {
            CycleOutcome::Stored(entry) => {
                if let Err(e) = self.database.set_last_reflection_time(now) {
                    tracing::warn!("Failed to record reflection time: {}", e);
                }
                self.emit(AgentEvent::ReflectionStored {
                    id: entry.id.clone(),
                    interaction_count: entry.interaction_count,
                })
                .await;
                self.report_longitudinal().await;
            }
            CycleOutcome::Skipped(reason) => {
                self.emit(AgentEvent::Observation(format!(
                    "Self-reflection skipped: {:?}",
                    reason
                )))
                .await;
            }
            CycleOutcome::Degraded(issue) => {
                tracing::error!("Self-reflection produced no critique: {:?}", issue);
                self.emit(AgentEvent::Error(format!("Self-reflection error: {:?}", issue)))
                    .await;
            }
        }

        Some(outcome)
    }

    async fn report_longitudinal(&self) {
        match self.engine.longitudinal_summary().await {
            Ok(summary) => {
                self.emit(AgentEvent::Observation(format!(
                    "Longitudinal review over {} reflections: {} recurring issue(s), {} persistent strength(s)",
                    summary.timespan.total,
                    summary.recurring_issues.len(),
                    summary.persistent_strengths.len()
                )))
                .await;
            }
            Err(ReflectionIssue::InsufficientHistory) => {
                tracing::debug!("Not enough reflections yet for a longitudinal review");
            }
            Err(issue) => {
                tracing::warn!("Longitudinal review unavailable: {:?}", issue);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::interactions::tests::{message, reply};
    use crate::agent::reflection::SkipReason;
    use crate::event_store::MESSAGES_TABLE;
    use crate::llm_client::{GenerationOptions, ModelTier};
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct FixedModel(&'static str);

    #[async_trait]
    impl GenerativeModel for FixedModel {
        async fn generate(&self, _tier: ModelTier, _prompt: &str, _options: GenerationOptions) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    fn agent(reply_text: &'static str) -> (ReflectionAgent, flume::Receiver<AgentEvent>) {
        let db = AgentDatabase::open_in_memory().unwrap();
        for record in [
            message("p1", "user-1", 1, "what did you think of it?"),
            reply("r1", "p1", 2, "I liked the pacing a lot"),
            message("p2", "user-2", 5, "any tips for a beginner?"),
            reply("r2", "p2", 6, "start small and read widely"),
        ] {
            db.insert_record(MESSAGES_TABLE, &record).unwrap();
        }
        let config = AgentConfig {
            agent_id: "agent-1".to_string(),
            agent_name: "Ponder".to_string(),
            ..AgentConfig::default()
        };
        let (tx, rx) = flume::unbounded();
        let agent = ReflectionAgent::new(config, Arc::new(db), Arc::new(FixedModel(reply_text)), tx);
        (agent, rx)
    }

    #[tokio::test]
    async fn stored_cycle_updates_gate_and_emits() {
        let (agent, rx) = agent(
            "Strengths:\n- warm and curious\nWeaknesses:\n- answers are a bit short\n",
        );
        let now = Utc::now();

        let outcome = agent.maybe_reflect(now).await;
        assert!(matches!(outcome, Some(CycleOutcome::Stored(_))));
        let last = agent.database.get_last_reflection_time().unwrap().unwrap();
        assert_eq!(last.timestamp(), now.timestamp());

        let events: Vec<AgentEvent> = rx.drain().collect();
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ReflectionStored { interaction_count: 2, .. }
        )));

        let again = agent.maybe_reflect(now + ChronoDuration::hours(1)).await;
        assert!(matches!(
            again,
            Some(CycleOutcome::Skipped(SkipReason::NotDue { .. }))
        ));
    }

    #[tokio::test]
    async fn degraded_cycle_emits_error_and_stays_due() {
        let (agent, rx) = agent("no structure here at all");
        let now = Utc::now();

        assert_eq!(
            agent.maybe_reflect(now).await,
            Some(CycleOutcome::Degraded(ReflectionIssue::MalformedCritique))
        );
        assert!(agent.database.get_last_reflection_time().unwrap().is_none());
        assert!(rx.drain().any(|e| matches!(e, AgentEvent::Error(_))));
    }

    #[tokio::test]
    async fn disabled_reflection_never_calls_out() {
        let (agent, _rx) = agent("unused");
        agent.config.write().await.enable_self_reflection = false;
        assert_eq!(
            agent.maybe_reflect(Utc::now()).await,
            Some(CycleOutcome::Skipped(SkipReason::Disabled))
        );
    }
}
