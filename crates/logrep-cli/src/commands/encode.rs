use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::Bytes;
use colored::Colorize;

use logrep_core::{
    ChangeEvent, ContextConfig, Error as CoreError, ProcessControl, ProcessHandle,
    ReplicationContext, WorkerDescriptor, WorkerRef,
};
use logrep_proto::{
    negotiate, ApplyProgress, ApplySession, MemorySink, Negotiated, OutputSession, ProtoFormat,
    ServerCapabilities, StartupParams,
};

use super::print_stats;
use crate::stream::load_events;

const DBOID: u32 = 1;
const SUBID: u32 = 1;

/// Registry backend for offline runs: nothing is ever started.
struct Offline;

impl ProcessControl for Offline {
    fn spawn(&self, _worker: WorkerRef, _desc: &WorkerDescriptor) -> logrep_core::Result<ProcessHandle> {
        Err(CoreError::Spawn("no processes in offline mode".to_string()))
    }

    fn is_alive(&self, _handle: ProcessHandle) -> bool {
        false
    }

    fn terminate(&self, _handle: ProcessHandle) {}
}

/// Frames of a change stream, startup message first.
pub(crate) fn encode_stream(
    ctx: &Arc<ReplicationContext>,
    negotiated: &Negotiated,
    events: &[ChangeEvent],
) -> Result<Vec<Bytes>> {
    let mut output = OutputSession::new(Arc::clone(ctx), DBOID, negotiated);
    let mut frames = vec![output.startup_message(negotiated)?];

    for (i, event) in events.iter().enumerate() {
        let encoded = output
            .encode(event)
            .with_context(|| format!("Failed to encode event {}", i))?;
        frames.extend(encoded);
    }
    Ok(frames)
}

fn frame_type(format: ProtoFormat, frame: &[u8]) -> String {
    match format {
        ProtoFormat::Native => frame.first().map(|b| (*b as char).to_string()).unwrap_or_default(),
        ProtoFormat::Json => serde_json::from_slice::<serde_json::Value>(frame)
            .ok()
            .and_then(|v| v["action"].as_str().map(str::to_string))
            .unwrap_or_default(),
    }
}

fn print_frame(index: usize, format: ProtoFormat, frame: &[u8]) {
    let header = format!("{:>4} {} ({} bytes)", index, frame_type(format, frame), frame.len());
    match format {
        ProtoFormat::Native => println!("{}  {}", header.cyan(), hex::encode(frame)),
        ProtoFormat::Json => println!("{}  {}", header.cyan(), String::from_utf8_lossy(frame)),
    }
}

/// Encode a change-stream file and print every frame. With `apply`, the
/// frames are also decoded and applied to an in-memory table store.
pub fn cmd_encode(path: &Path, format: ProtoFormat, forward_origins: bool, apply: bool) -> Result<()> {
    let events = load_events(path)?;

    let client = StartupParams {
        proto_format: format,
        forward_changeset_origins: forward_origins,
        ..Default::default()
    };
    let negotiated = negotiate(&client, &ServerCapabilities::default())?;

    let ctx = Arc::new(ReplicationContext::new(&ContextConfig::default(), Arc::new(Offline)));
    let frames = encode_stream(&ctx, &negotiated, &events)?;

    println!(
        "\n{} {} events, {} frames ({})\n",
        "Encoded".bold(),
        events.len(),
        frames.len(),
        format
    );
    for (i, frame) in frames.iter().enumerate() {
        print_frame(i, format, frame);
    }

    if apply {
        let worker = ctx.register(WorkerDescriptor::apply(DBOID, SUBID))?;
        let mut session = ApplySession::new(Arc::clone(&ctx), worker, &negotiated, MemorySink::new())?;

        // The startup message belongs to the handshake, not the stream.
        for frame in frames.iter().skip(1) {
            if let ApplyProgress::StopReached(_) = session.apply(frame)? {
                break;
            }
        }

        let relids: BTreeSet<u32> = events
            .iter()
            .filter_map(|e| match e {
                ChangeEvent::Change { relation, .. } => Some(relation.relid),
                _ => None,
            })
            .collect();

        println!("\n{}", "Applied rows:".bold());
        for relid in relids {
            println!("  relation {:<10} {} rows", relid, session.sink().rows(relid).len());
        }
    }

    print_stats(ctx.stats().snapshot());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const STREAM: &str = r#"[
        {"type": "begin", "xid": 5, "final_lsn": 4096, "commit_time": "2024-03-01T12:00:00Z"},
        {
            "type": "change",
            "kind": "insert",
            "relation": {
                "relid": 16384,
                "namespace": "public",
                "name": "users",
                "columns": [{"name": "id", "type_oid": 23, "is_key": true}]
            },
            "new": [{"text": "1"}]
        },
        {
            "type": "commit",
            "txn": {"xid": 5, "final_lsn": 4096, "commit_time": "2024-03-01T12:00:00Z"},
            "commit_lsn": 4200
        }
    ]"#;

    fn frame_types(format: ProtoFormat) -> Vec<String> {
        let events = crate::stream::parse_events(STREAM).unwrap();
        let negotiated = negotiate(
            &StartupParams {
                proto_format: format,
                ..Default::default()
            },
            &ServerCapabilities::default(),
        )
        .unwrap();
        let ctx = Arc::new(ReplicationContext::new(&ContextConfig::default(), Arc::new(Offline)));

        encode_stream(&ctx, &negotiated, &events)
            .unwrap()
            .iter()
            .map(|f| frame_type(format, f))
            .collect()
    }

    #[test]
    fn test_encode_stream_frames() {
        let expected = vec!["S", "B", "R", "I", "C"];
        assert_eq!(frame_types(ProtoFormat::Native), expected);
        assert_eq!(frame_types(ProtoFormat::Json), expected);
    }

    #[test]
    fn test_cmd_encode_with_apply() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stream.json");
        fs::write(&path, STREAM).unwrap();

        assert!(cmd_encode(&path, ProtoFormat::Native, false, true).is_ok());
        assert!(cmd_encode(&dir.path().join("missing.json"), ProtoFormat::Json, false, false).is_err());
    }
}
