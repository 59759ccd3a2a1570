use anyhow::{Context, Result};
use chrono::Utc;
use flume::unbounded;
use retrospect::agent::longitudinal::format_longitudinal_context;
use retrospect::agent::reflection::CycleOutcome;
use retrospect::agent::AgentEvent;
use retrospect::config::AgentConfig;
use retrospect::runtime::BackendRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,retrospect=debug")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let run_once = args.iter().any(|arg| arg == "--once");

    let config = AgentConfig::load();
    if args.iter().any(|arg| arg == "--write-config") {
        return config.save();
    }
    let (event_tx, event_rx) = unbounded();
    let runtime = BackendRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap reflection runtime")?;

    if run_once {
        let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
        return rt.block_on(run_single_cycle(&runtime));
    }

    tracing::info!("Starting reflection service (pass --once for a single cycle)");
    let handle = runtime.spawn_agent_loop();
    drop(runtime);

    for event in event_rx.iter() {
        log_event(&event);
    }

    if handle.join().is_err() {
        anyhow::bail!("reflection loop thread panicked");
    }
    Ok(())
}

async fn run_single_cycle(runtime: &BackendRuntime) -> Result<()> {
    match runtime.agent.maybe_reflect(Utc::now()).await {
        Some(CycleOutcome::Stored(entry)) => {
            println!("{}", serde_json::to_string_pretty(&entry.critique)?);
        }
        Some(other) => tracing::info!("No reflection stored: {:?}", other),
        None => anyhow::bail!("could not read reflection state"),
    }

    match runtime.agent.engine().longitudinal_summary().await {
        Ok(summary) => println!("\n{}", format_longitudinal_context(&summary)),
        Err(issue) => tracing::info!("No longitudinal summary: {:?}", issue),
    }
    Ok(())
}

fn log_event(event: &AgentEvent) {
    match event {
        AgentEvent::Observation(text) => tracing::info!("{}", text),
        AgentEvent::ReflectionStored {
            id,
            interaction_count,
        } => tracing::info!(
            "Reflection {} stored ({} interactions)",
            id,
            interaction_count
        ),
        AgentEvent::Error(text) => tracing::error!("{}", text),
    }
}
