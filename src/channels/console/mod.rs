use crate::channels::{OutboundMessage, Transport};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Writes replies to a terminal. Edits that extend a message print only the
/// new suffix, so streamed replies read as continuous text.
pub struct ConsoleTransport<W = tokio::io::Stdout> {
    out: Mutex<W>,
    printed: Mutex<HashMap<String, String>>,
    next_id: AtomicU64,
}

impl ConsoleTransport {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

impl<W: AsyncWrite + Unpin + Send> ConsoleTransport<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
            printed: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    async fn write(&self, text: &str) -> anyhow::Result<()> {
        let mut out = self.out.lock().await;
        out.write_all(text.as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> Transport for ConsoleTransport<W> {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        self.write(&format!("{}\n", msg.content)).await
    }

    async fn send_and_get_id(&self, msg: &OutboundMessage) -> anyhow::Result<Option<String>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        self.write(&msg.content).await?;
        self.printed
            .lock()
            .await
            .insert(id.clone(), msg.content.clone());
        Ok(Some(id))
    }

    async fn edit_message(
        &self,
        _session_id: &str,
        message_id: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let mut printed = self.printed.lock().await;
        let previous = printed.get(message_id).map_or("", String::as_str);
        let text = match content.strip_prefix(previous) {
            Some(suffix) => suffix.to_string(),
            None => format!("\n{}", content),
        };
        printed.insert(message_id.to_string(), content.to_string());
        drop(printed);
        self.write(&text).await
    }

    fn supports_editing(&self) -> bool {
        true
    }
}
