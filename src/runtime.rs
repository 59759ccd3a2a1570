use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use flume::Sender;

use crate::agent::{AgentEvent, ReflectionAgent};
use crate::config::AgentConfig;
use crate::database::AgentDatabase;
use crate::llm_client::{GenerativeModel, LlmClient};

const CRITIC_SYSTEM_PROMPT: &str =
    "You review a conversational agent's own replies. Be concrete, quote sparingly, and follow the requested output format.";

pub struct BackendRuntime {
    pub config: AgentConfig,
    pub agent: Arc<ReflectionAgent>,
    pub database: Arc<AgentDatabase>,
}

impl BackendRuntime {
    pub fn bootstrap(config: AgentConfig, event_tx: Sender<AgentEvent>) -> Result<Self> {
        let database = Arc::new(
            AgentDatabase::new(&config.database_path)
                .with_context(|| format!("Failed to open database at {}", config.database_path))?,
        );

        let model: Arc<dyn GenerativeModel> = Arc::new(
            LlmClient::new(
                config.llm_api_url.clone(),
                config.llm_api_key.clone().unwrap_or_default(),
                config.llm_model.clone(),
            )
            .with_large_model(config.reflection_model.clone())
            .with_system_prompt(CRITIC_SYSTEM_PROMPT),
        );

        tracing::info!(
            "Reflection runtime ready (agent: {}, model: {}, database: {})",
            config.agent_id,
            config.large_model(),
            config.database_path
        );

        let agent = Arc::new(ReflectionAgent::new(
            config.clone(),
            database.clone(),
            model,
            event_tx,
        ));

        Ok(BackendRuntime {
            config,
            agent,
            database,
        })
    }

    pub fn spawn_agent_loop(&self) -> JoinHandle<()> {
        let agent = self.agent.clone();
        std::thread::spawn(move || {
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!("Failed to start reflection runtime: {}", e);
                    return;
                }
            };
            rt.block_on(async {
                if let Err(e) = agent.run_loop().await {
                    tracing::error!("Reflection loop error: {}", e);
                }
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn bootstrap_opens_database_at_configured_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("runtime.db");
        let config = AgentConfig {
            database_path: path.to_string_lossy().to_string(),
            ..AgentConfig::default()
        };
        let (tx, _rx) = flume::unbounded();

        let runtime = BackendRuntime::bootstrap(config, tx).unwrap();
        assert!(path.exists());
        assert_eq!(runtime.database.count_records("messages").unwrap(), 0);
    }
}
