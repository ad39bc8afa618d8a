use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use inbox_assist::approval::approval_routes;
use inbox_assist::config::EngineConfig;
use inbox_assist::pipeline::{LogOutbox, RulesClassifier, TemplateDrafter, WorkflowEngine};
use inbox_assist::store::LibSqlBackend;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing: stderr always, plus a daily file when configured.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, _file_guard) = match std::env::var("INBOX_ASSIST_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-assist.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    let db_path = std::env::var("INBOX_ASSIST_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/inbox-assist.db"));
    let port: u16 = match std::env::var("INBOX_ASSIST_PORT") {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("INBOX_ASSIST_PORT is not a port: {raw}"))?,
        Err(_) => 8080,
    };
    let config = EngineConfig::from_env().context("invalid configuration")?;
    let signature = std::env::var("INBOX_ASSIST_SIGNATURE").ok();

    let store = Arc::new(
        LibSqlBackend::new_local(&db_path)
            .await
            .context("failed to open database")?,
    );
    let drafter = match signature {
        Some(name) => TemplateDrafter::with_signature(name),
        None => TemplateDrafter::default(),
    };
    let engine = Arc::new(WorkflowEngine::new(
        store,
        Arc::new(RulesClassifier::default_rules().context("invalid triage rules")?),
        Arc::new(drafter),
        Arc::new(LogOutbox),
        config,
    ));

    // Pick up anything a previous run left in flight.
    let report = engine.recover().await.context("recovery failed")?;
    tracing::info!(
        pending = report.pending_checkpoints,
        resumed = report.triaged + report.drafted + report.delivered + report.relearned,
        "Startup recovery finished"
    );

    let app = approval_routes(engine);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .with_context(|| format!("failed to bind port {port}"))?;
    tracing::info!(port, db = %db_path.display(), "Inbox Assist listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
