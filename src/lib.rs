pub mod agent;
pub mod config;
pub mod database;
pub mod event_store;
pub mod llm_client;
pub mod runtime;
