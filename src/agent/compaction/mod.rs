//! Context window accounting and compaction.
//!
//! The transcript is split into a verbatim head (the most recent turns) and
//! an older tail. The tail is optionally de-duplicated by embedding
//! similarity, summarized, and replaced by a single summary turn. A failed
//! summary leaves the transcript untouched.

use crate::agent::embeddings::{Embedder, cosine_similarity};
use crate::agent::tokens::{chars_per_token, estimate_tokens};
use crate::agent::truncation::truncate_tool_result;
use crate::config::ContextConfig;
use crate::providers::base::{ChatRequest, LLMProvider, Message};
use crate::session::{Role, Turn};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, info, warn};

const COMPACTION_PROMPT: &str = "Summarize this conversation history concisely while preserving:\n1. Key decisions made and their reasoning\n2. Important facts, names, amounts, addresses, and numbers mentioned\n3. User preferences and requests\n4. Pending tasks or commitments\n5. Results of tool calls that later turns may rely on\n\nIf the history starts with an earlier summary, fold it into the new one.\n\nConversation:\n{messages}\n\nWrite a concise summary (max 500 words) that captures the essential context. Do not include preamble - just the summary.";

const COMPACTION_MAX_TOKENS: u32 = 2000;
const COMPACTION_TEMPERATURE: f32 = 0.3;
/// Per-turn character cap when formatting tool output for the summarizer.
const SUMMARY_TOOL_RESULT_CHARS: usize = 1500;

#[derive(Debug, Clone, PartialEq)]
pub struct CompactionResult {
    pub tokens_before: usize,
    pub tokens_after: usize,
    pub removed_turn_count: usize,
    pub summary_text: String,
    pub success: bool,
    /// Tail turns dropped as near-duplicates before summarizing.
    pub deduplicated: usize,
    pub error: Option<String>,
}

impl CompactionResult {
    fn unchanged(tokens: usize, error: impl Into<String>) -> Self {
        Self {
            tokens_before: tokens,
            tokens_after: tokens,
            removed_turn_count: 0,
            summary_text: String::new(),
            success: false,
            deduplicated: 0,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuardStatus {
    pub should_compact: bool,
    /// Fraction of the usable budget in use, `1.0` meaning full.
    pub percent_used: f64,
}

/// Compresses a block of transcript text into a synopsis.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, text: &str) -> Result<String>;
}

/// Summarizer backed by the chat model.
pub struct ProviderSummarizer {
    provider: Arc<dyn LLMProvider>,
    model: Option<String>,
}

impl ProviderSummarizer {
    pub fn new(provider: Arc<dyn LLMProvider>, model: Option<String>) -> Self {
        Self { provider, model }
    }
}

#[async_trait]
impl Summarizer for ProviderSummarizer {
    async fn summarize(&self, text: &str) -> Result<String> {
        let prompt = COMPACTION_PROMPT.replace("{messages}", text);
        let response = self
            .provider
            .chat_with_retry(
                ChatRequest {
                    messages: vec![Message::user(prompt)],
                    tools: None,
                    model: self.model.as_deref(),
                    max_tokens: COMPACTION_MAX_TOKENS,
                    temperature: COMPACTION_TEMPERATURE,
                },
                None,
            )
            .await?;
        let summary = response.content.unwrap_or_default();
        if summary.trim().is_empty() {
            anyhow::bail!("compaction produced empty summary");
        }
        Ok(summary.trim().to_string())
    }
}

pub struct ContextWindowManager {
    config: ContextConfig,
    model: String,
    summarizer: Arc<dyn Summarizer>,
    embedder: Option<Arc<dyn Embedder>>,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig, model: impl Into<String>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            model: model.into(),
            summarizer,
            embedder: None,
        }
    }

    #[must_use]
    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Whether adding `extra_tokens` to `turns` crosses the compaction threshold.
    pub fn check_guard(&self, turns: &[Turn], extra_tokens: usize) -> GuardStatus {
        let usable = self.config.usable_tokens();
        if usable == 0 {
            return GuardStatus {
                should_compact: true,
                percent_used: 1.0,
            };
        }
        let current: usize = turns.iter().map(|t| t.approx_tokens).sum();
        let percent_used = (current + extra_tokens) as f64 / usable as f64;
        GuardStatus {
            should_compact: percent_used >= self.config.compact_threshold,
            percent_used,
        }
    }

    /// Token ceiling for one tool result.
    pub fn max_tool_result_tokens(&self) -> usize {
        ((self.config.usable_tokens() as f64) * self.config.max_tool_result_share) as usize
    }

    /// Truncate a tool payload that alone would take more than its share of
    /// the budget. Smaller payloads pass through unchanged.
    pub fn fit_tool_result(&self, payload: &str) -> String {
        let max_tokens = self.max_tool_result_tokens();
        if estimate_tokens(payload, &self.model) <= max_tokens {
            return payload.to_string();
        }
        let max_chars = (max_tokens as f64 * chars_per_token(&self.model)) as usize;
        warn!(
            "tool result of ~{} tokens exceeds per-result ceiling of {}, truncating",
            estimate_tokens(payload, &self.model),
            max_tokens
        );
        truncate_tool_result(payload, max_chars)
    }

    /// Index where the verbatim head starts, or 0 when there is nothing to
    /// summarize. The head never holds fewer than `min_recent_turns` turns and
    /// never begins with a tool result whose request would be summarized away.
    pub fn split_point(&self, turns: &[Turn]) -> usize {
        let min_keep = self.config.min_recent_turns.max(1);
        if turns.len() <= min_keep {
            return 0;
        }
        let preferred = self.config.keep_recent_turns.max(min_keep);
        let keep = if turns.len() > preferred {
            preferred
        } else {
            min_keep
        };
        let mut split = turns.len() - keep;
        while split > 0 && turns[split].role == Role::ToolResult {
            split -= 1;
        }
        split
    }

    /// Indices of tail turns that survive near-duplicate filtering.
    async fn dedup(&self, tail: &[Turn]) -> Vec<usize> {
        let all: Vec<usize> = (0..tail.len()).collect();
        let dedup = &self.config.dedup;
        let Some(embedder) = self.embedder.as_ref().filter(|_| dedup.enabled) else {
            return all;
        };
        let texts: Vec<String> = tail.iter().map(|t| t.content.clone()).collect();
        let embeddings = match embedder.embed_batch(&texts).await {
            Ok(e) if e.len() == tail.len() => e,
            Ok(_) => {
                warn!("embedder returned a mismatched batch, skipping dedup");
                return all;
            }
            Err(e) => {
                warn!("embedding failed, skipping dedup: {}", e);
                return all;
            }
        };

        let mut kept: Vec<usize> = Vec::with_capacity(tail.len());
        for (i, emb) in embeddings.iter().enumerate() {
            let window_start = kept.len().saturating_sub(dedup.window.max(1));
            let duplicate = tail[i].role != Role::Summary
                && kept[window_start..].iter().any(|&k| {
                    tail[k].role == tail[i].role
                        && cosine_similarity(&embeddings[k], emb) >= dedup.similarity_threshold
                });
            if duplicate {
                debug!("dropping near-duplicate turn {} before summarizing", i);
            } else {
                kept.push(i);
            }
        }
        kept
    }

    /// Summarize the tail of `turns` in place. On failure `turns` is not
    /// modified and `success` is false.
    pub async fn compact(&self, turns: &mut Vec<Turn>) -> CompactionResult {
        let tokens_before: usize = turns.iter().map(|t| t.approx_tokens).sum();
        let split = self.split_point(turns);
        if split == 0 {
            debug!("compaction skipped: {} turns, nothing beyond the recent window", turns.len());
            return CompactionResult::unchanged(tokens_before, "nothing to compact");
        }

        let tail = &turns[..split];
        let kept = self.dedup(tail).await;
        let deduplicated = tail.len() - kept.len();
        let text = format_for_summary(kept.iter().map(|&i| &tail[i]));

        let summary = match self.summarizer.summarize(&text).await {
            Ok(s) if !s.trim().is_empty() => s,
            Ok(_) => {
                warn!("compaction failed: summarizer returned empty text");
                metrics::counter!("parlance_compactions_total", "outcome" => "failed").increment(1);
                return CompactionResult::unchanged(tokens_before, "empty summary");
            }
            Err(e) => {
                warn!("compaction failed, transcript left intact: {}", e);
                metrics::counter!("parlance_compactions_total", "outcome" => "failed").increment(1);
                return CompactionResult::unchanged(tokens_before, e.to_string());
            }
        };

        let head = turns.split_off(split);
        turns.clear();
        turns.push(Turn::summary(summary.clone(), &self.model));
        turns.extend(head);

        let tokens_after: usize = turns.iter().map(|t| t.approx_tokens).sum();
        info!(
            "compaction: {} turns -> summary, tokens {} -> {} ({} near-duplicates dropped)",
            split, tokens_before, tokens_after, deduplicated
        );
        metrics::counter!("parlance_compactions_total", "outcome" => "success").increment(1);

        CompactionResult {
            tokens_before,
            tokens_after,
            removed_turn_count: split,
            summary_text: summary,
            success: true,
            deduplicated,
            error: None,
        }
    }
}

/// Render turns as `role: content` lines for the summarizer.
pub fn format_for_summary<'a>(turns: impl IntoIterator<Item = &'a Turn>) -> String {
    let mut out = String::new();
    for turn in turns {
        match turn.role {
            Role::User => {
                let _ = writeln!(out, "user: {}", turn.content);
            }
            Role::Assistant => {
                let _ = write!(out, "assistant: {}", turn.content);
                for tc in &turn.tool_calls {
                    let _ = write!(out, " [called {}({})]", tc.name, tc.arguments);
                }
                out.push('\n');
            }
            Role::ToolResult => {
                let body = truncate_tool_result(&turn.content, SUMMARY_TOOL_RESULT_CHARS);
                let label = if turn.is_error { "tool error" } else { "tool result" };
                let _ = writeln!(out, "{}: {}", label, body);
            }
            Role::Summary => {
                let _ = writeln!(out, "earlier summary: {}", turn.content);
            }
        }
    }
    out
}
