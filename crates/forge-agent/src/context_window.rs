//! Context window management
//!
//! Before each request the outbound copy of the conversation is reduced in
//! two passes:
//!
//! 1. Oversized tool results are replaced with a structural summary (code)
//!    or a marked truncation (everything else).
//! 2. If that is not enough, everything between the first message and the
//!    most recent messages is collapsed into one synthetic summary listing
//!    the tools that ran and a few key findings.
//!
//! The caller's history is never modified.

use crate::summary::{self, preview};
use crate::types::{ContentBlock, Message, Role};
use forge_core::ContextConfig;
use std::collections::HashMap;
use tracing::{debug, info};

const CHARS_PER_TOKEN: usize = 4;
const MAX_KEY_FINDINGS: usize = 5;
const TOOL_ARGS_PREVIEW: usize = 80;
const FINDING_PREVIEW: usize = 160;

/// Estimated tokens for a piece of text
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

fn estimate_block_tokens(block: &ContentBlock) -> usize {
    match block {
        ContentBlock::Text { text } => estimate_tokens(text),
        ContentBlock::ToolUse { name, input, .. } => {
            estimate_tokens(name) + estimate_tokens(&input.to_string())
        }
        ContentBlock::ToolResult { content, .. } => estimate_tokens(content),
    }
}

/// Estimated tokens for a conversation
pub fn estimate_message_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .flat_map(|message| message.content.iter())
        .map(estimate_block_tokens)
        .sum()
}

/// Outbound conversation plus what was done to it
#[derive(Debug, Clone)]
pub struct PreparedContext {
    pub messages: Vec<Message>,
    pub original_tokens: usize,
    pub final_tokens: usize,
    /// Tool results replaced in pass 1
    pub compressed_results: usize,
    /// Messages folded into the summary in pass 2
    pub collapsed_messages: usize,
}

impl PreparedContext {
    pub fn was_reduced(&self) -> bool {
        self.compressed_results > 0 || self.collapsed_messages > 0
    }
}

/// Keeps outbound conversations under the configured token ceiling
#[derive(Debug, Clone)]
pub struct ContextWindowManager {
    config: ContextConfig,
}

impl ContextWindowManager {
    pub fn new(config: ContextConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Build the copy of `history` to send to the model
    pub fn prepare(&self, history: &[Message]) -> PreparedContext {
        let original_tokens = estimate_message_tokens(history);
        let mut messages = history.to_vec();
        let mut compressed_results = 0;
        let mut collapsed_messages = 0;

        if self.config.summarization_enabled && original_tokens > self.config.summarize_threshold {
            let mut compressed = messages.clone();
            let count = self.compress_tool_results(&mut compressed);
            if count > 0 && estimate_message_tokens(&compressed) <= original_tokens {
                messages = compressed;
                compressed_results = count;
            }

            let after_pass_one = estimate_message_tokens(&messages);
            if after_pass_one > self.config.max_context_tokens {
                if let Some((collapsed, count)) = self.collapse_middle(&messages) {
                    if estimate_message_tokens(&collapsed) < after_pass_one {
                        messages = collapsed;
                        collapsed_messages = count;
                    } else {
                        debug!("Collapsing would not shrink the conversation; skipping");
                    }
                }
            }
        }

        let final_tokens = estimate_message_tokens(&messages);

        if compressed_results > 0 || collapsed_messages > 0 {
            info!(
                "Context reduced from ~{} to ~{} tokens ({} results compressed, {} messages collapsed)",
                original_tokens, final_tokens, compressed_results, collapsed_messages
            );
        }

        PreparedContext {
            messages,
            original_tokens,
            final_tokens,
            compressed_results,
            collapsed_messages,
        }
    }

    /// Pass 1: shrink every tool result over the per-result cap
    fn compress_tool_results(&self, messages: &mut [Message]) -> usize {
        // Tool results carry no path, so recover it from the matching tool use
        let paths: HashMap<String, String> = messages
            .iter()
            .flat_map(|message| message.tool_uses())
            .filter_map(|(id, _, input)| {
                input
                    .get("path")
                    .and_then(|p| p.as_str())
                    .map(|path| (id.to_string(), path.to_string()))
            })
            .collect();

        let mut compressed = 0;
        for block in messages.iter_mut().flat_map(|m| m.content.iter_mut()) {
            if let ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } = block
            {
                let path = paths.get(tool_use_id.as_str()).map(String::as_str);
                if let Some(shorter) = summary::compress(
                    content,
                    path,
                    self.config.max_tool_result_chars,
                    self.config.max_summary_lines,
                ) {
                    *content = shorter;
                    compressed += 1;
                }
            }
        }
        compressed
    }

    /// Pass 2: fold the middle of the conversation into one summary message
    ///
    /// Returns the new conversation and how many messages were folded, or
    /// `None` when there is nothing that can be collapsed.
    fn collapse_middle(&self, messages: &[Message]) -> Option<(Vec<Message>, usize)> {
        let len = messages.len();
        let keep = self.config.keep_recent_messages.max(1);
        if len <= keep + 1 {
            return None;
        }

        let tail_start = Self::tail_boundary(messages, len - keep)?;
        let span = &messages[1..tail_start];
        if span.is_empty() {
            return None;
        }

        let summary = self.summarize_span(span);

        let mut collapsed = Vec::with_capacity(len - span.len() + 1);
        collapsed.push(messages[0].clone());
        collapsed.push(Message::user(summary));
        collapsed.extend_from_slice(&messages[tail_start..]);

        Some((collapsed, span.len()))
    }

    /// First assistant message at or after `start`, else the nearest before it
    fn tail_boundary(messages: &[Message], start: usize) -> Option<usize> {
        let start = start.max(1);
        (start..messages.len())
            .find(|&i| messages[i].role == Role::Assistant)
            .or_else(|| (2..start).rev().find(|&i| messages[i].role == Role::Assistant))
    }

    fn summarize_span(&self, span: &[Message]) -> String {
        let tool_lines: Vec<String> = span
            .iter()
            .flat_map(|message| message.tool_uses())
            .map(|(_, name, input)| {
                format!("- {}({})", name, preview(&input.to_string(), TOOL_ARGS_PREVIEW))
            })
            .collect();

        let mut findings: Vec<String> = span
            .iter()
            .filter(|message| message.role == Role::Assistant)
            .flat_map(|message| {
                message
                    .text()
                    .lines()
                    .map(str::trim)
                    .filter(|line| line.len() >= 20)
                    .map(|line| preview(line, FINDING_PREVIEW))
                    .collect::<Vec<_>>()
            })
            .collect();
        // Most recent findings are the most relevant
        if findings.len() > MAX_KEY_FINDINGS {
            findings.drain(..findings.len() - MAX_KEY_FINDINGS);
        }

        let mut out = String::new();
        out.push_str(&format!(
            "[Earlier conversation summarized: {} messages collapsed to fit the context window]\n",
            span.len()
        ));

        if !tool_lines.is_empty() {
            out.push_str("\nTools invoked:\n");
            let cap = self.config.max_summary_lines.max(1);
            for line in tool_lines.iter().take(cap) {
                out.push_str(line);
                out.push('\n');
            }
            if tool_lines.len() > cap {
                out.push_str(&format!("... and {} more\n", tool_lines.len() - cap));
            }
        }

        if !findings.is_empty() {
            out.push_str("\nKey findings:\n");
            for finding in &findings {
                out.push_str(&format!("- {}\n", finding));
            }
        }

        out
    }
}
