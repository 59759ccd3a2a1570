use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Shape of the conversation windows built from the interaction log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_turns_before")]
    pub turns_before: usize,
    #[serde(default = "default_turns_after")]
    pub turns_after: usize,
    #[serde(default = "default_pad_minutes")]
    pub pad_minutes: i64,
    #[serde(default = "default_max_feedback")]
    pub max_feedback: usize,
    #[serde(default = "default_max_signals")]
    pub max_signals: usize,
}

fn default_turns_before() -> usize {
    4
}

fn default_turns_after() -> usize {
    3
}

fn default_pad_minutes() -> i64 {
    15
}

fn default_max_feedback() -> usize {
    3
}

fn default_max_signals() -> usize {
    5
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            turns_before: default_turns_before(),
            turns_after: default_turns_after(),
            pad_minutes: default_pad_minutes(),
            max_feedback: default_max_feedback(),
            max_signals: default_max_signals(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    // Identity of the agent whose replies are critiqued
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_agent_name", alias = "username")]
    pub agent_name: String,

    // LLM configuration (OpenAI-compatible: Ollama, LM Studio, vLLM, OpenAI, etc.)
    #[serde(default = "default_llm_url")]
    pub llm_api_url: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    #[serde(default)]
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub reflection_model: Option<String>,

    // Scheduling
    #[serde(default = "default_poll_interval", alias = "check_interval_seconds")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_true")]
    pub enable_self_reflection: bool,
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval_hours: u64,
    #[serde(default = "default_min_interactions")]
    pub min_interactions: usize,

    // Reconstruction
    #[serde(default = "default_log_window")]
    pub log_window: usize,
    #[serde(default = "default_interaction_limit")]
    pub interaction_limit: usize,
    #[serde(default)]
    pub window: WindowConfig,

    // Critique generation
    #[serde(default = "default_generation_timeout_secs")]
    pub generation_timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    // Longitudinal history
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_history_max_age_days")]
    pub history_max_age_days: i64,
    #[serde(default = "default_summary_cache_ttl_secs")]
    pub summary_cache_ttl_secs: u64,

    // Storage
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

fn default_agent_id() -> String {
    "agent".to_string()
}

fn default_agent_name() -> String {
    "Agent".to_string()
}

fn default_llm_url() -> String {
    "http://localhost:11434/v1".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_reflection_interval() -> u64 {
    6
}

fn default_min_interactions() -> usize {
    2
}

fn default_log_window() -> usize {
    400
}

fn default_interaction_limit() -> usize {
    8
}

fn default_generation_timeout_secs() -> u64 {
    90
}

fn default_temperature() -> f32 {
    0.4
}

fn default_max_tokens() -> u32 {
    1500
}

fn default_history_limit() -> usize {
    60
}

fn default_history_max_age_days() -> i64 {
    120
}

fn default_summary_cache_ttl_secs() -> u64 {
    3600
}

fn default_database_path() -> String {
    "retrospect.db".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            agent_name: default_agent_name(),
            llm_api_url: default_llm_url(),
            llm_model: default_llm_model(),
            llm_api_key: None,
            reflection_model: None,
            poll_interval_secs: default_poll_interval(),
            enable_self_reflection: true,
            reflection_interval_hours: default_reflection_interval(),
            min_interactions: default_min_interactions(),
            log_window: default_log_window(),
            interaction_limit: default_interaction_limit(),
            window: WindowConfig::default(),
            generation_timeout_secs: default_generation_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            history_limit: default_history_limit(),
            history_max_age_days: default_history_max_age_days(),
            summary_cache_ttl_secs: default_summary_cache_ttl_secs(),
            database_path: default_database_path(),
        }
    }
}

impl AgentConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    /// Get the path to the config file (relative to executable)
    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("retrospect_config.toml")
    }

    /// Load config from retrospect_config.toml (next to executable), falling back to env vars
    pub fn load() -> Self {
        let path = Self::config_path();

        if let Ok(contents) = fs::read_to_string(&path) {
            match Self::from_toml_str(&contents) {
                Ok(config) => {
                    tracing::info!("Loaded config from {:?}", path);
                    return config;
                }
                Err(e) => {
                    tracing::error!("Failed to parse {:?}: {}", path, e);
                }
            }
        }

        tracing::warn!("No config file found, using defaults + env vars");
        Self::from_env()
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        toml::from_str::<AgentConfig>(contents).context("Invalid retrospect config")
    }

    /// Save config to file (next to executable)
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(id) = env::var("AGENT_ID") {
            if !id.trim().is_empty() {
                config.agent_id = id;
            }
        }

        if let Ok(name) = env::var("AGENT_NAME") {
            config.agent_name = name;
        }

        if let Ok(url) = env::var("LLM_API_URL") {
            config.llm_api_url = url;
        }

        if let Ok(model) = env::var("LLM_MODEL") {
            config.llm_model = model;
        }

        if let Ok(key) = env::var("LLM_API_KEY") {
            config.llm_api_key = Some(key);
        }

        if let Ok(model) = env::var("RETROSPECT_REFLECTION_MODEL") {
            if !model.trim().is_empty() {
                config.reflection_model = Some(model);
            }
        }

        if let Ok(enabled) = env::var("RETROSPECT_ENABLE_REFLECTION") {
            config.enable_self_reflection = parse_flag(&enabled);
        }

        if let Ok(hours) = env::var("RETROSPECT_REFLECTION_INTERVAL_HOURS") {
            if let Ok(hours) = hours.parse() {
                config.reflection_interval_hours = hours;
            }
        }

        if let Ok(path) = env::var("RETROSPECT_DATABASE_PATH") {
            if !path.trim().is_empty() {
                config.database_path = path;
            }
        }

        config
    }

    pub fn large_model(&self) -> String {
        self.reflection_model
            .clone()
            .unwrap_or_else(|| self.llm_model.clone())
    }
}

fn parse_flag(raw: &str) -> bool {
    raw.eq_ignore_ascii_case("1") || raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("yes")
}
