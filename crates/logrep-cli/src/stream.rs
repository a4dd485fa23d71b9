use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use logrep_core::ChangeEvent;

/// A change-stream file: either a bare array of events or an object with
/// an `events` array (extra fields are ignored).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StreamFile {
    Events(Vec<ChangeEvent>),
    Wrapped { events: Vec<ChangeEvent> },
}

pub fn parse_events(content: &str) -> Result<Vec<ChangeEvent>> {
    let file: StreamFile = serde_json::from_str(content).context("Failed to parse change stream")?;
    Ok(match file {
        StreamFile::Events(events) | StreamFile::Wrapped { events } => events,
    })
}

pub fn load_events(path: &Path) -> Result<Vec<ChangeEvent>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read change stream: {}", path.display()))?;
    parse_events(&content).with_context(|| format!("Invalid change stream: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BEGIN: &str = r#"{
        "type": "begin",
        "xid": 1,
        "final_lsn": 100,
        "commit_time": "2024-03-01T12:00:00Z"
    }"#;

    #[test]
    fn test_parse_bare_array() {
        let events = parse_events(&format!("[{}]", BEGIN)).unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChangeEvent::Begin(_)));
    }

    #[test]
    fn test_parse_wrapped() {
        let content = format!(r#"{{"name": "demo", "events": [{}]}}"#, BEGIN);
        assert_eq!(parse_events(&content).unwrap().len(), 1);
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_events(r#"{"frames": []}"#).is_err());
    }
}
