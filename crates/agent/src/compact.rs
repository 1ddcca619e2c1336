//! Token-budget-driven message-history compaction.
//!
//! Token counts are estimated at roughly four characters per token plus a
//! fixed per-message overhead. When a session crosses the compression
//! threshold of its model's context window, one of three strategies reduces
//! the history. System messages are never dropped.

use serde::Deserialize;

use valet_domain::message::{Message, Role};

/// Approximate characters per token.
const CHARS_PER_TOKEN: usize = 4;

/// Structural overhead per message, in tokens.
const PER_MESSAGE_OVERHEAD: usize = 50;

/// Fraction of the window at which compaction should run.
const COMPRESS_THRESHOLD: f64 = 0.70;

/// Fraction of the window considered "near the limit".
const NEAR_LIMIT_THRESHOLD: f64 = 0.80;

/// Context-window limits for known model families, matched by substring on
/// the lowercased model name.
const MODEL_LIMITS: &[(&str, usize)] = &[
    ("claude-opus-4", 200_000),
    ("claude-sonnet-4", 200_000),
    ("claude-3-5-sonnet", 200_000),
    ("gpt-4o", 128_000),
    ("gpt-4-turbo", 128_000),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo", 16_385),
    ("gemini", 128_000),
];

const DEFAULT_LIMIT: usize = 128_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Token estimation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn estimate_tokens(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

pub fn estimate_messages_tokens(messages: &[Message]) -> usize {
    messages
        .iter()
        .map(|m| {
            let mut tokens = estimate_tokens(&m.content) + PER_MESSAGE_OVERHEAD;
            for tc in &m.tool_calls {
                tokens += estimate_tokens(&tc.arguments.to_string());
            }
            tokens
        })
        .sum()
}

/// Context window limit for a model, by substring match.
pub fn model_context_limit(model: &str) -> usize {
    let lower = model.to_lowercase();
    for (needle, limit) in MODEL_LIMITS {
        if lower.contains(needle) {
            return *limit;
        }
    }
    tracing::warn!(model, "unknown model, assuming 128k context window");
    DEFAULT_LIMIT
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Window check
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Snapshot of context-window pressure.
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub total_tokens: usize,
    pub used_tokens: usize,
    pub remaining_tokens: usize,
    pub is_near_limit: bool,
    pub should_compress: bool,
}

pub fn check_context(model: &str, current_tokens: usize) -> ContextWindow {
    let total = model_context_limit(model);
    let used_fraction = current_tokens as f64 / total as f64;
    ContextWindow {
        total_tokens: total,
        used_tokens: current_tokens,
        remaining_tokens: total.saturating_sub(current_tokens),
        is_near_limit: used_fraction > NEAR_LIMIT_THRESHOLD,
        should_compress: used_fraction > COMPRESS_THRESHOLD,
    }
}

/// The default compaction budget: 70% of the model's window.
pub fn default_target_tokens(model: &str) -> usize {
    (model_context_limit(model) as f64 * COMPRESS_THRESHOLD) as usize
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Strategies
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompactionStrategy {
    /// System prefix plus the largest suffix that fits.
    KeepRecent,
    /// Score-based pruning; lowest-value messages dropped first.
    #[default]
    KeepImportant,
    /// System prefix + fixed head + fixed tail, middle elided.
    SlidingWindow,
}

impl CompactionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompactionStrategy::KeepRecent => "keep-recent",
            CompactionStrategy::KeepImportant => "keep-important",
            CompactionStrategy::SlidingWindow => "sliding-window",
        }
    }
}

/// Messages kept by the sliding window on each side of the elision.
const WINDOW_HEAD: usize = 2;
const WINDOW_TAIL: usize = 10;

pub fn compact(
    messages: &[Message],
    target_tokens: usize,
    strategy: CompactionStrategy,
) -> Vec<Message> {
    if estimate_messages_tokens(messages) <= target_tokens {
        return messages.to_vec();
    }
    match strategy {
        CompactionStrategy::KeepRecent => keep_recent(messages, target_tokens),
        CompactionStrategy::KeepImportant => keep_important(messages, target_tokens),
        CompactionStrategy::SlidingWindow => sliding_window(messages),
    }
}

fn keep_recent(messages: &[Message], target_tokens: usize) -> Vec<Message> {
    let mut result: Vec<Message> = Vec::new();
    let mut budget = target_tokens;

    // The leading system message, if present, is never pruned.
    let body_start = if messages.first().is_some_and(|m| m.role == Role::System) {
        let system = messages[0].clone();
        budget = budget.saturating_sub(estimate_messages_tokens(std::slice::from_ref(&system)));
        result.push(system);
        1
    } else {
        0
    };

    // Largest suffix of the remainder that fits the leftover budget.
    let body = &messages[body_start..];
    let mut suffix_start = body.len();
    let mut used = 0;
    for (index, msg) in body.iter().enumerate().rev() {
        let cost = estimate_messages_tokens(std::slice::from_ref(msg));
        if used + cost > budget {
            break;
        }
        used += cost;
        suffix_start = index;
    }

    result.extend(body[suffix_start..].iter().cloned());
    result
}

/// Importance score per message. Within a score, older messages drop first.
fn score(msg: &Message) -> u32 {
    match msg.role {
        Role::System => 100,
        Role::Assistant if !msg.tool_calls.is_empty() => 80,
        Role::User => 60,
        Role::Assistant => 50,
        Role::Tool => 30,
    }
}

fn keep_important(messages: &[Message], target_tokens: usize) -> Vec<Message> {
    let mut kept: Vec<(usize, &Message)> = messages.iter().enumerate().collect();

    loop {
        let current: Vec<Message> = kept.iter().map(|(_, m)| (*m).clone()).collect();
        if estimate_messages_tokens(&current) <= target_tokens {
            return current;
        }

        // Lowest score first; ties drop the oldest. System messages are
        // unconditionally preserved.
        let victim = kept
            .iter()
            .enumerate()
            .filter(|(_, (_, m))| m.role != Role::System)
            .min_by_key(|(_, (original_index, m))| (score(m), *original_index))
            .map(|(kept_index, _)| kept_index);

        match victim {
            Some(index) => {
                kept.remove(index);
            }
            // Only system messages remain: the smallest feasible list.
            None => return kept.iter().map(|(_, m)| (*m).clone()).collect(),
        }
    }
}

fn sliding_window(messages: &[Message]) -> Vec<Message> {
    // Leading run of system messages is the preserved prefix.
    let prefix_len = messages
        .iter()
        .take_while(|m| m.role == Role::System)
        .count();
    let body = &messages[prefix_len..];

    if body.len() <= WINDOW_HEAD + WINDOW_TAIL {
        return messages.to_vec();
    }

    let elided = body.len() - WINDOW_HEAD - WINDOW_TAIL;
    let mut summary = Message::system(format!(
        "[{elided} earlier messages elided to fit the context window]"
    ));
    // Tagged so consumers can tell the placeholder from real history.
    summary
        .metadata
        .insert("compaction".into(), serde_json::json!(true));

    let mut result: Vec<Message> = messages[..prefix_len + WINDOW_HEAD].to_vec();
    result.push(summary);
    result.extend(body[body.len() - WINDOW_TAIL..].iter().cloned());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(text: &str) -> Message {
        Message::user(text)
    }

    fn long_user(index: usize) -> Message {
        Message::user(format!("message {index}: {}", "x".repeat(400)))
    }

    #[test]
    fn estimates_scale_with_length() {
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        let msgs = vec![user("12345678")];
        assert_eq!(estimate_messages_tokens(&msgs), 2 + PER_MESSAGE_OVERHEAD);
    }

    #[test]
    fn model_limits_match_by_substring() {
        assert_eq!(model_context_limit("claude-sonnet-4-20250514"), 200_000);
        assert_eq!(model_context_limit("gpt-4o-mini"), 128_000);
        assert_eq!(model_context_limit("gpt-4"), 8_192);
        assert_eq!(model_context_limit("some-new-model"), 128_000);
    }

    #[test]
    fn check_context_thresholds() {
        let window = check_context("claude-sonnet-4", 150_000);
        assert!(window.should_compress);
        assert!(!window.is_near_limit);

        let window = check_context("claude-sonnet-4", 170_000);
        assert!(window.should_compress);
        assert!(window.is_near_limit);

        let window = check_context("claude-sonnet-4", 100_000);
        assert!(!window.should_compress);
    }

    #[test]
    fn under_budget_input_is_untouched() {
        let msgs = vec![user("a"), user("b")];
        let out = compact(&msgs, 10_000, CompactionStrategy::KeepRecent);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn keep_recent_preserves_system_and_suffix() {
        let mut msgs = vec![Message::system("rules")];
        for i in 0..20 {
            msgs.push(long_user(i));
        }
        let target = 600;
        let out = compact(&msgs, target, CompactionStrategy::KeepRecent);

        assert!(estimate_messages_tokens(&out) <= target);
        assert_eq!(out[0].role, Role::System);
        // The survivors are the most recent messages, in order.
        let last = &out[out.len() - 1];
        assert!(last.content.starts_with("message 19"));
    }

    #[test]
    fn keep_important_drops_tool_results_first() {
        let msgs = vec![
            Message::system("rules"),
            Message::user("question"),
            Message::tool_result("t1", "y".repeat(400), None),
            Message::assistant("answer"),
        ];
        let target = estimate_messages_tokens(&msgs) - 50;
        let out = compact(&msgs, target, CompactionStrategy::KeepImportant);

        assert!(estimate_messages_tokens(&out) <= target);
        assert!(out.iter().all(|m| m.role != Role::Tool));
        assert!(out.iter().any(|m| m.role == Role::System));
    }

    #[test]
    fn keep_important_never_drops_system() {
        let msgs = vec![Message::system("s".repeat(4000)), user("a"), user("b")];
        // Target below even the system message alone: smallest feasible
        // result is the system messages.
        let out = compact(&msgs, 10, CompactionStrategy::KeepImportant);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::System);
    }

    #[test]
    fn keep_important_ties_drop_oldest_first() {
        let mut msgs = vec![Message::system("rules")];
        for i in 0..10 {
            msgs.push(long_user(i));
        }
        let target = estimate_messages_tokens(&msgs) - 200;
        let out = compact(&msgs, target, CompactionStrategy::KeepImportant);

        // All user messages score equally, so the oldest went first.
        assert!(!out.iter().any(|m| m.content.starts_with("message 0")));
        assert!(out.iter().any(|m| m.content.starts_with("message 9")));
    }

    #[test]
    fn sliding_window_elides_the_middle() {
        let mut msgs = vec![Message::system("rules")];
        for i in 0..30 {
            msgs.push(long_user(i));
        }
        let out = compact(&msgs, 100, CompactionStrategy::SlidingWindow);

        assert_eq!(out[0].role, Role::System);
        // system + head + placeholder + tail
        assert_eq!(out.len(), 1 + WINDOW_HEAD + 1 + WINDOW_TAIL);
        let placeholder = &out[1 + WINDOW_HEAD];
        assert_eq!(placeholder.role, Role::System);
        assert_eq!(
            placeholder.metadata.get("compaction"),
            Some(&serde_json::json!(true))
        );
        assert!(placeholder.content.contains("elided"));
        // Original timestamps survive on kept messages.
        assert!(out.last().unwrap().content.starts_with("message 29"));
    }

    #[test]
    fn default_target_is_seventy_percent() {
        assert_eq!(default_target_tokens("claude-sonnet-4"), 140_000);
    }
}
