use anyhow::{Context, Result};
use bytes::BytesMut;
use colored::Colorize;

use logrep_config::{to_server_capabilities, InstanceConfig};
use logrep_proto::{negotiate, StartupParams};

/// Parse "key=value" arguments into startup parameter pairs.
pub(crate) fn parse_params(args: &[String]) -> Result<Vec<(String, String)>> {
    args.iter()
        .map(|arg| {
            let (key, value) = arg
                .split_once('=')
                .with_context(|| format!("Expected key=value, got '{}'", arg))?;
            Ok((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Run the startup handshake of a client sending `args` against this
/// instance's protocol settings.
pub fn cmd_negotiate(config: InstanceConfig, args: &[String]) -> Result<()> {
    let client = StartupParams::parse(&parse_params(args)?)?;
    let server = to_server_capabilities(&config)?;

    let negotiated = match negotiate(&client, &server) {
        Ok(negotiated) => negotiated,
        Err(e) => {
            eprintln!("{}", format!("Negotiation failed: {}", e).red());
            return Err(e.into());
        }
    };

    println!("\n{}", "Startup reply:".bold());
    let reply = negotiated.reply_params();
    for (key, value) in &reply {
        println!("  {:<28} {}", key, value);
    }

    let mut out = BytesMut::new();
    negotiated.api().write_startup_message(&mut out, &reply)?;
    println!("\n{} ({} bytes)", "Startup message:".bold(), out.len());
    println!("  {}\n", hex::encode(&out));
    Ok(())
}
