use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `instance_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
///
/// A writer built with [`EventWriter::discard`] builds the event but never
/// touches the filesystem.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: Option<PathBuf>,
    instance_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: Some(path.into()),
                instance_id: instance_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn discard() -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: None,
                instance_id: "discard".to_string(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "instance_id".to_string(),
            Value::String(self.inner.instance_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        let Some(path) = self.inner.path.as_ref() else {
            return Ok(Value::Object(event));
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono::DateTime;

    use super::*;

    #[test]
    fn emit_writes_compact_jsonl_line() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "vesper-123");

        let mut payload = EventPayload::new();
        payload.insert("session_id".to_string(), Value::String("s-1".to_string()));
        let emitted = writer.emit("session_created", payload)?;

        let content = fs::read_to_string(&path)?;
        let line = content.lines().next().unwrap_or("");
        let parsed: Value = serde_json::from_str(line)?;

        assert_eq!(parsed, emitted);
        assert_eq!(parsed["type"], Value::String("session_created".to_string()));
        assert_eq!(
            parsed["instance_id"],
            Value::String("vesper-123".to_string())
        );
        assert_eq!(parsed["session_id"], Value::String("s-1".to_string()));

        let ts = parsed["ts"].as_str().unwrap_or("");
        DateTime::parse_from_rfc3339(ts)?;
        Ok(())
    }

    #[test]
    fn payload_can_override_default_keys() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("events.jsonl");
        let writer = EventWriter::new(&path, "vesper-123");

        let mut payload = EventPayload::new();
        payload.insert("type".to_string(), Value::String("override".to_string()));
        let emitted = writer.emit("chat_turn", payload)?;

        assert_eq!(emitted["type"], Value::String("override".to_string()));
        Ok(())
    }

    #[test]
    fn emit_appends_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "vesper-123");

        writer.emit("one", EventPayload::new())?;
        writer.emit("two", EventPayload::new())?;

        let content = fs::read_to_string(&path)?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0])?;
        let second: Value = serde_json::from_str(lines[1])?;
        assert_eq!(first["type"], Value::String("one".to_string()));
        assert_eq!(second["type"], Value::String("two".to_string()));
        Ok(())
    }

    #[test]
    fn discard_writer_builds_event_without_file() -> anyhow::Result<()> {
        let writer = EventWriter::discard();
        let emitted = writer.emit("chat_turn", EventPayload::new())?;
        assert_eq!(emitted["type"], Value::String("chat_turn".to_string()));
        assert!(writer.path().is_none());
        Ok(())
    }
}
