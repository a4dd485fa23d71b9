use anyhow::Result;
use colored::Colorize;

use logrep_config::{
    to_context_config, to_server_capabilities, to_startup_params, to_subscriptions,
    InstanceConfig,
};
use logrep_core::{format_lsn, stats_max_entries};
use logrep_proto::negotiate;

/// Summarize a validated config and check that its own protocol settings
/// negotiate.
pub fn cmd_check(config: InstanceConfig) -> Result<()> {
    let context = to_context_config(&config)?;
    let subscriptions = to_subscriptions(&config)?;

    println!("\n{}", "Replication:".bold());
    println!("  max_workers:        {}", context.max_workers);
    println!(
        "  stats entries:      {}",
        stats_max_entries(context.stats_max_entries, context.max_workers)
    );
    match context.prune_interval {
        Some(interval) => println!("  stats prune:        every {}s", interval.as_secs()),
        None => println!("  stats prune:        {}", "disabled".yellow()),
    }
    println!("  restart delay:      {}s", config.replication.restart_delay_secs);

    println!("\n{}", "Protocol:".bold());
    let result = negotiate(&to_startup_params(&config)?, &to_server_capabilities(&config)?);
    match &result {
        Ok(negotiated) => println!(
            "  {} version {} ({}), forward origins: {}",
            "ok".green(),
            negotiated.proto_version,
            negotiated.proto_format,
            negotiated.forward_changeset_origins
        ),
        Err(e) => println!("  {} {}", "error".red(), e),
    }

    if subscriptions.is_empty() {
        println!("\nNo subscriptions configured.");
    } else {
        println!("\n{}", "Subscriptions:".bold());
        println!(
            "{:<8} {:<20} {:>8} {:>9} {:>7} {:>6} {:>14}",
            "Id", "Name", "Database", "Enabled", "Origin", "Sync", "Stop LSN"
        );
        println!("{:-<78}", "");

        for sub in &subscriptions {
            let enabled = if sub.enabled {
                format!("{:>9}", "yes").green()
            } else {
                format!("{:>9}", "no").yellow()
            };
            println!(
                "{:<8} {:<20} {:>8} {} {:>7} {:>6} {:>14}",
                sub.id,
                sub.name,
                sub.dboid,
                enabled,
                sub.origin,
                sub.pending_sync.len(),
                sub.replay_stop_lsn.map(format_lsn).unwrap_or_else(|| "-".to_string())
            );
        }
    }
    println!();

    result?;
    Ok(())
}
