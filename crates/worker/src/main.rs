use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reelforge_agent::{HealthRegistry, ProcessAgent};
use reelforge_core::types::SlotId;
use reelforge_db::JobStore;
use reelforge_events::{EventBus, EventReporter};
use reelforge_pipeline::{AgentSlot, ChatRewriter, DisabledRewriter, Rewriter};
use reelforge_worker::{ScanOptions, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "reelforge_worker=info,reelforge_agent=info,reelforge_pipeline=info".into()
            }),
        )
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        worker = %config.worker_name,
        master = %config.master_dir.display(),
        agents = config.agent_count,
        "Loaded worker configuration"
    );
    let single_job = std::env::args().nth(1);

    // --- Event bus ---
    let event_bus = Arc::new(EventBus::default());
    let reporter_cancel = CancellationToken::new();
    let reporter_handle = tokio::spawn(EventReporter::run(
        event_bus.subscribe(),
        reporter_cancel.clone(),
    ));

    // --- Health registry ---
    let registry = Arc::new(
        HealthRegistry::new(config.health_policy()).with_events(Arc::clone(&event_bus)),
    );
    registry.start_monitor(config.monitor_interval).await;

    // --- Agents ---
    let (program, args) = config
        .driver_command
        .split_first()
        .context("AGENT_DRIVER_CMD is empty")?;
    let slots: Vec<AgentSlot> = (0..config.agent_count)
        .map(|slot: SlotId| {
            let agent = ProcessAgent::new(program, slot)
                .with_args(args.to_vec())
                .with_timeout(config.agent_timeout);
            AgentSlot::new(slot, Arc::new(agent))
        })
        .collect();

    // --- Rewriter ---
    let rewriter: Arc<dyn Rewriter> = match &config.rewrite_api_key {
        Some(key) => Arc::new(ChatRewriter::new(
            config.rewrite_url.clone(),
            key.clone(),
            config.rewrite_model.clone(),
        )),
        None => {
            tracing::warn!("REWRITE_API_KEY not set, policy violations cannot be fixed");
            Arc::new(DisabledRewriter)
        }
    };

    // --- Worker ---
    let store = JobStore::new(config.layout()).with_channel(config.channel.clone());
    let options = ScanOptions {
        worker_name: config.worker_name.clone(),
        claim_leases: config.claim_leases,
        lease_ttl: config.lease_ttl,
        validate_references: config.validate_references,
        validator: config.validator_config(),
        scan_interval: config.scan_interval,
    };
    let worker = Worker::new(
        store,
        Arc::clone(&registry),
        config.runner_config(),
        slots,
        rewriter,
        options,
    )
    .with_events(Arc::clone(&event_bus));

    let cancel = CancellationToken::new();
    match single_job {
        Some(code) => {
            tokio::select! {
                result = worker.process_job(&code) => match result {
                    Ok(outcome) => tracing::info!(code = %code, outcome = ?outcome, "Job processed"),
                    Err(e) => tracing::error!(code = %code, error = %e, "Job failed"),
                },
                _ = shutdown_signal() => tracing::info!("Shutdown requested"),
            }
        }
        None => {
            let loop_cancel = cancel.clone();
            tokio::select! {
                _ = worker.run(loop_cancel) => {}
                _ = shutdown_signal() => {
                    tracing::info!("Shutdown requested");
                    cancel.cancel();
                }
            }
        }
    }

    // --- Shutdown ---
    registry.close_all().await;
    tracing::info!("Agents closed");

    reporter_cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), reporter_handle).await;
    tracing::info!("Worker stopped");
    Ok(())
}

/// Wait for Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
