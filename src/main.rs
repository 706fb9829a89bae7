use handle_verifier::audit::AuditLog;
use handle_verifier::config::Config;
use handle_verifier::content::HttpContentClient;
use handle_verifier::http_server::{self, ServerState};
use handle_verifier::pipeline::Pipeline;
use handle_verifier::store::KvStore;
use handle_verifier::verification::Verifier;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("handle-verifier: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), String> {
    let config = Config::from_env().map_err(|e| e.to_string())?;

    let store = open_store("state", &config).await?;
    let audit = if config.audit_enabled {
        let sink = open_store("audit", &config).await?;
        let existing = sink.keys().await;
        AuditLog::new(sink).with_existing(existing)
    } else {
        AuditLog::disabled()
    };

    let content = HttpContentClient::new(
        config.content_api_base_url.clone(),
        config.content_api_token.clone(),
        config.fetch_timeout,
    )
    .map_err(|e| format!("failed to build content client: {e}"))?;

    let pipeline = Pipeline::new(
        Verifier::new(config.signature_scheme.clone(), config.signature_tolerance_secs),
        store.clone(),
        Arc::new(content),
        &config.proof_marker,
    );

    let state = ServerState {
        pipeline: Arc::new(pipeline),
        store,
        audit: Arc::new(audit),
        webhook_secret: Arc::from(config.webhook_secret.as_str()),
        signature_header: Arc::from(config.signature_header.as_str()),
        payment_link: Arc::from(config.payment_link.as_str()),
        allowed_origin: Arc::from(config.allowed_origin.as_str()),
    };

    let (addr, server) = http_server::start(&config.bind_addr, state)
        .await
        .map_err(|e| format!("failed to bind {}: {e}", config.bind_addr))?;
    info!(%addr, "accepting webhooks on http://{addr}/webhooks/payment");

    tokio::select! {
        _ = server => warn!("HTTP server stopped"),
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn open_store(name: &str, config: &Config) -> Result<Arc<KvStore>, String> {
    let store = match &config.data_dir {
        Some(dir) => KvStore::persistent(name, dir.clone()),
        None => KvStore::in_memory(name),
    };
    let loaded = store
        .load()
        .await
        .map_err(|e| format!("failed to load {name} store: {e}"))?;
    info!(store = store.name(), entries = loaded, "store ready");
    Ok(Arc::new(store))
}
