use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use lead_phase::automation::Orchestrator;
use lead_phase::config::EngineConfig;
use lead_phase::llm::{LlmConfig, create_provider};
use lead_phase::retag::RetagService;
use lead_phase::store::{Database, LibSqlBackend};
use lead_phase::sweep::{self, Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing; optional daily log file alongside stderr
    let log_dir = std::env::var("LEAD_PHASE_LOG_DIR").ok();
    let (file_layer, _log_guard) = match log_dir {
        Some(ref dir) => {
            let appender = tracing_appender::rolling::daily(dir, "lead-phase.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    // Read API key from environment
    let api_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_else(|_| {
        eprintln!("Error: ANTHROPIC_API_KEY not set");
        eprintln!("  export ANTHROPIC_API_KEY=sk-ant-...");
        std::process::exit(1);
    });
    let model = std::env::var("LEAD_PHASE_MODEL")
        .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string());

    let config = EngineConfig::from_env().context("invalid LEAD_PHASE_* configuration")?;

    eprintln!("Lead Phase v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", model);
    eprintln!("   Sweep every {}s", config.sweep_interval.as_secs());

    let mut llm_config = LlmConfig::anthropic(api_key, model);
    if let Ok(base_url) = std::env::var("LEAD_PHASE_LLM_BASE_URL") {
        llm_config.base_url = Some(base_url);
    }
    let llm = create_provider(&llm_config).context("failed to create classification provider")?;

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("LEAD_PHASE_DB_PATH").unwrap_or_else(|_| "./data/lead-phase.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .with_context(|| format!("failed to open database at {db_path}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Sweep loop ───────────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&db),
        Arc::clone(&llm),
        config.clone(),
    ));
    let retag = Arc::new(RetagService::new(Arc::clone(&db), llm, config.clone()));
    let sweeper = Arc::new(Sweeper::new(orchestrator, retag));

    // Run once at startup, then on the interval
    if let Err(e) = sweeper.sweep_once().await {
        tracing::warn!(error = %e, "Initial sweep failed");
    }
    let handle = sweep::spawn_sweep_ticker(Arc::clone(&sweeper), config.sweep_interval);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");
    handle.abort();
    Ok(())
}
