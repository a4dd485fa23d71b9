use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use logrep_config::{
    to_context_config, to_server_capabilities, to_startup_params, to_subscriptions,
    InstanceConfig,
};
use logrep_proto::negotiate;

use super::print_stats;
use crate::stream::load_events;
use crate::supervisor::{Supervisor, WorkerSettings};

pub async fn cmd_run(
    config: InstanceConfig,
    stream: Option<&Path>,
    duration_secs: Option<u64>,
    sync_copy_ms: u64,
) -> Result<()> {
    let context_config = to_context_config(&config)?;
    let subscriptions = to_subscriptions(&config)?;
    if subscriptions.is_empty() {
        warn!("No subscriptions configured, only the supervisor will run");
    }

    let negotiated = negotiate(&to_startup_params(&config)?, &to_server_capabilities(&config)?)
        .context("Protocol negotiation failed")?;

    let stream = stream.map(load_events).transpose()?.map(Arc::new);
    if let Some(events) = &stream {
        info!(events = events.len(), "Loaded change stream");
    }

    let settings = WorkerSettings {
        naptime: Duration::from_secs(config.replication.naptime_secs),
        restart_delay: Duration::from_secs(config.replication.restart_delay_secs),
        sync_copy_time: Duration::from_millis(sync_copy_ms),
        negotiated,
        stream,
    };

    let supervisor = Supervisor::new(&context_config, subscriptions, settings);
    let ctx = Arc::clone(supervisor.context());

    let shutdown = async move {
        match duration_secs {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                    _ = tokio::signal::ctrl_c() => {}
                }
            }
            None => {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "Failed to listen for ctrl-c");
                }
            }
        }
        info!("Shutdown requested");
    };

    supervisor.run(shutdown).await?;
    print_stats(ctx.stats().snapshot());
    Ok(())
}
