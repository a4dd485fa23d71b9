use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod config;
mod stream;
mod supervisor;

use config::{load_config, load_config_or_default};
use logrep_proto::ProtoFormat;

#[derive(Parser)]
#[command(name = "logrep")]
#[command(about = "Logical replication worker supervisor and change-stream codec")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to logrep.toml config file
    #[arg(short, long, default_value = "logrep.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the supervisor and keep subscription workers running
    Run {
        /// Change stream (JSON) every apply worker replays through the codec
        #[arg(long)]
        stream: Option<PathBuf>,

        /// Stop after this many seconds instead of waiting for ctrl-c
        #[arg(long)]
        duration_secs: Option<u64>,

        /// Simulated duration of a table's initial copy in milliseconds
        #[arg(long, default_value = "500")]
        sync_copy_ms: u64,
    },

    /// Validate the config and show what it sets up
    Check,

    /// Negotiate a client's startup parameters against this instance
    Negotiate {
        /// Startup parameters as key=value, e.g. proto_format=json
        params: Vec<String>,
    },

    /// Encode a change stream and print the protocol frames
    Encode {
        /// Change stream file (JSON array of events, or an object with "events")
        path: PathBuf,

        /// Wire format: native or json
        #[arg(long, default_value = "native")]
        format: ProtoFormat,

        /// Forward origin information of replicated transactions
        #[arg(long)]
        forward_origins: bool,

        /// Decode and apply the frames to an in-memory table store
        #[arg(long)]
        apply: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("logrep=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            stream,
            duration_secs,
            sync_copy_ms,
        } => {
            let config = load_config(&cli.config)?;
            commands::cmd_run(config, stream.as_deref(), duration_secs, sync_copy_ms).await
        }
        Commands::Check => {
            let config = load_config(&cli.config)?;
            commands::cmd_check(config)
        }
        Commands::Negotiate { params } => {
            let config = load_config_or_default(&cli.config)?;
            commands::cmd_negotiate(config, &params)
        }
        Commands::Encode {
            path,
            format,
            forward_origins,
            apply,
        } => commands::cmd_encode(&path, format, forward_origins, apply),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_encode_args() {
        let cli = Cli::try_parse_from(["logrep", "encode", "stream.json", "--format", "JSON", "--apply"])
            .unwrap();
        match cli.command {
            Commands::Encode { format, apply, .. } => {
                assert_eq!(format, ProtoFormat::Json);
                assert!(apply);
            }
            _ => panic!("expected encode"),
        }
    }
}
