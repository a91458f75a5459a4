use serde_json::Value;

/// A parsed Server-Sent Event. `data` is `None` for the `[DONE]` sentinel
/// and for payloads that are not valid JSON.
#[derive(Debug)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: Option<Value>,
    pub done: bool,
}

/// Incremental SSE decoder. Network chunks do not align with event
/// boundaries, so bytes are buffered until a blank line closes an event.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every event it completed.
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));
        let mut events = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let raw: String = self.buffer.drain(..end + 2).collect();
            if let Some(event) = parse_event(&raw) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.buffer);
        parse_event(&raw)
    }
}

fn parse_event(raw: &str) -> Option<SseEvent> {
    let mut event_type = None;
    let mut data = String::new();

    for line in raw.lines() {
        if let Some(t) = line.strip_prefix("event:") {
            event_type = Some(t.trim().to_string());
        } else if let Some(d) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(d.strip_prefix(' ').unwrap_or(d));
        }
    }

    if data.is_empty() {
        return None;
    }
    let data = data.trim();
    if data == "[DONE]" {
        return Some(SseEvent {
            event_type,
            data: None,
            done: true,
        });
    }
    Some(SseEvent {
        event_type,
        data: serde_json::from_str::<Value>(data).ok(),
        done: false,
    })
}
