//! Incremental delivery of a reply through an editable transport message.

use crate::agent::subagent::{Announcer, RunStatus, SubagentRun};
use crate::agent::tool_loop::StreamSink;
use crate::channels::{OutboundMessage, Transport};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Default)]
struct ReplyState {
    buffer: String,
    message_id: Option<String>,
    /// Bytes of `buffer` the user has already seen.
    delivered: usize,
    last_flush: Option<Instant>,
}

/// Buffers streamed text and pushes it to the transport at most once per
/// flush interval: the first chunk is sent as a new message, later chunks
/// edit it in place.
pub struct StreamingReply {
    transport: Arc<dyn Transport>,
    session_id: String,
    flush_interval: Duration,
    state: Mutex<ReplyState>,
}

impl StreamingReply {
    pub fn new(transport: Arc<dyn Transport>, session_id: &str, flush_interval: Duration) -> Self {
        Self {
            transport,
            session_id: session_id.to_string(),
            flush_interval,
            state: Mutex::new(ReplyState::default()),
        }
    }

    async fn flush(&self, state: &mut ReplyState) {
        if state.delivered == state.buffer.len() {
            return;
        }
        let result = match state.message_id.clone() {
            Some(id) => {
                self.transport
                    .edit_message(&self.session_id, &id, &state.buffer)
                    .await
            }
            None if state.delivered == 0 => {
                let msg = OutboundMessage::new(&self.session_id, state.buffer.clone());
                match self.transport.send_and_get_id(&msg).await {
                    Ok(id) => {
                        state.message_id = id;
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            // no editable message; the remainder goes out as a new message
            None => {
                let rest = state.buffer[state.delivered..].to_string();
                self.transport
                    .send(&OutboundMessage::new(&self.session_id, rest))
                    .await
            }
        };
        match result {
            Ok(()) => state.delivered = state.buffer.len(),
            Err(e) => warn!(session_id = %self.session_id, "stream flush failed: {}", e),
        }
        state.last_flush = Some(Instant::now());
    }

    /// Deliver whatever is still buffered. Returns whether the final segment,
    /// the one holding the terminal answer, reached the transport.
    pub async fn finish(&self) -> bool {
        let mut state = self.state.lock().await;
        self.flush(&mut state).await;
        state.delivered > 0
    }
}

#[async_trait]
impl StreamSink for StreamingReply {
    async fn push_text(&self, delta: &str) {
        let mut state = self.state.lock().await;
        state.buffer.push_str(delta);
        let due = state
            .last_flush
            .is_none_or(|t| t.elapsed() >= self.flush_interval);
        if due {
            self.flush(&mut state).await;
        }
    }

    /// Close the current message; text after a tool call starts a new one.
    async fn end_segment(&self) {
        let mut state = self.state.lock().await;
        self.flush(&mut state).await;
        *state = ReplyState::default();
    }

    async fn notice(&self, text: &str) {
        let msg = OutboundMessage::new(&self.session_id, text);
        if let Err(e) = self.transport.send(&msg).await {
            warn!(session_id = %self.session_id, "tool notice failed: {}", e);
        }
    }
}

/// Posts subagent progress and results to the parent session's transport.
pub struct TransportAnnouncer {
    transport: Arc<dyn Transport>,
}

impl TransportAnnouncer {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn post(&self, run: &SubagentRun, text: String) {
        let msg = OutboundMessage::new(&run.parent_session_id, text);
        if let Err(e) = self.transport.send(&msg).await {
            warn!(run_id = %run.id, "subagent announcement failed: {}", e);
        }
    }
}

#[async_trait]
impl Announcer for TransportAnnouncer {
    async fn progress(&self, run: &SubagentRun) {
        let Some(progress) = &run.progress else {
            return;
        };
        let text = match progress.percent {
            Some(p) => format!("[subagent {}] {} ({}%)", run.id, progress.message, p),
            None => format!("[subagent {}] {}", run.id, progress.message),
        };
        self.post(run, text).await;
    }

    async fn finished(&self, run: &SubagentRun) {
        let text = match run.status {
            RunStatus::Completed => format!(
                "[subagent {}] finished: {}",
                run.id,
                run.result.as_deref().unwrap_or("(no report)")
            ),
            _ => format!(
                "[subagent {}] failed: {}",
                run.id,
                run.error.as_deref().unwrap_or("unknown error")
            ),
        };
        self.post(run, text).await;
    }
}
