//! Decoder for the engine's `key=value` event stream.
//!
//! The engine prints one field per line. A line whose key is `EventType`
//! opens a new event; every following `key=value` line belongs to it until the
//! next `EventType` line or the end of output. Lines without `=` and lines
//! seen before the first `EventType` are dropped.

use std::collections::HashMap;

use futures::{Stream, StreamExt};

pub const EVENT_TYPE_KEY: &str = "EventType";

/// Event kinds the orchestrator reacts to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventKind {
    TaskStateChanged,
    ThreatDetected,
    ObjectProcessingError,
    Other(String),
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        match value {
            "TaskStateChanged" => EventKind::TaskStateChanged,
            "ThreatDetected" => EventKind::ThreatDetected,
            "ObjectProcessingError" => EventKind::ObjectProcessingError,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// One decoded engine event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanEvent {
    event_type: String,
    fields: HashMap<String, String>,
}

impl ScanEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            fields: HashMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from(self.event_type.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn fields(&self) -> &HashMap<String, String> {
        &self.fields
    }
}

/// Line-at-a-time accumulator behind [`decode_events`].
#[derive(Debug, Default)]
pub struct EventStreamParser {
    current: Option<ScanEvent>,
}

impl EventStreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one raw line. Returns the previous event when `line` opens a new
    /// one.
    pub fn push_line(&mut self, line: &str) -> Option<ScanEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value),
            None if line == EVENT_TYPE_KEY => (line, ""),
            None => return None,
        };

        if key == EVENT_TYPE_KEY {
            return self.current.replace(ScanEvent::new(value));
        }

        if let Some(event) = self.current.as_mut() {
            event.fields.insert(key.to_string(), value.to_string());
        }
        None
    }

    /// Flushes the open event at end of output.
    pub fn finish(&mut self) -> Option<ScanEvent> {
        self.current.take()
    }
}

/// Decodes a stream of output lines into events. The returned stream is a
/// single pass over its input; it ends when `lines` ends.
pub fn decode_events<S>(lines: S) -> impl Stream<Item = ScanEvent>
where
    S: Stream<Item = String>,
{
    async_stream::stream! {
        let mut parser = EventStreamParser::new();
        let mut lines = Box::pin(lines);
        while let Some(line) = lines.next().await {
            if let Some(event) = parser.push_line(&line) {
                yield event;
            }
        }
        if let Some(event) = parser.finish() {
            yield event;
        }
    }
}

/// Convenience for already buffered output.
pub fn decode_str(output: &str) -> Vec<ScanEvent> {
    let mut parser = EventStreamParser::new();
    let mut events: Vec<ScanEvent> = output.lines().filter_map(|line| parser.push_line(line)).collect();
    events.extend(parser.finish());
    events
}
