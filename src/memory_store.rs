use crate::types::{Conversation, Message, MessageRole};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;

/// Derives a stable conversation id from the first 100 characters of
/// a prompt and the current hour, so repeated prompts within the same
/// hour land in the same conversation without an explicit id.
pub fn derive_conversation_id(prompt: &str) -> String {
    let bucket = Utc::now().format("%Y%m%d%H").to_string();
    let prefix: String = prompt.chars().take(100).collect();
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(bucket.as_bytes());
    let digest = hasher.finalize();
    format!("conv_{}", hex_prefix(&digest, 12))
}

fn hex_prefix(bytes: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// In-process conversation history used to enrich prompts with recent
/// relevant context. Each conversation is guarded by its own lock so
/// unrelated conversations never block each other — a deliberate
/// departure from the original's single-file-wide lock.
pub struct ContextMemory {
    conversations: DashMap<String, Mutex<Conversation>>,
}

impl ContextMemory {
    pub fn new() -> Self {
        Self {
            conversations: DashMap::new(),
        }
    }

    pub fn add_context(&self, conversation_id: &str, role: MessageRole, content: &str) {
        let entry = self
            .conversations
            .entry(conversation_id.to_string())
            .or_insert_with(|| Mutex::new(Conversation::new(conversation_id.to_string())));
        let mut conversation = entry.lock().unwrap();
        let id = format!("{}_{}", conversation_id, Utc::now().timestamp_millis());
        conversation.messages.push(Message {
            id,
            role,
            content: content.to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        });
        conversation.updated_at = Utc::now();
    }

    /// Most recent messages for a conversation, newest first, filtered
    /// to those younger than `max_age_hours`.
    pub fn recent_context(&self, conversation_id: &str, limit: usize, max_age_hours: i64) -> Vec<Message> {
        let Some(entry) = self.conversations.get(conversation_id) else {
            return Vec::new();
        };
        let conversation = entry.lock().unwrap();
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        conversation
            .messages
            .iter()
            .rev()
            .filter(|m| m.timestamp >= cutoff)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Jaccard similarity over lowercased word sets, intentionally
    /// crude and synchronous rather than embedding-based. Returns
    /// conversations scoring at or above `min_similarity`, descending.
    pub fn search_similar(&self, query: &str, limit: usize, min_similarity: f64) -> Vec<(String, f64)> {
        let query_words = tokenize(query);
        let mut scored: Vec<(String, f64)> = self
            .conversations
            .iter()
            .filter_map(|entry| {
                let conversation = entry.value().lock().unwrap();
                let combined: String = conversation
                    .messages
                    .iter()
                    .map(|m| m.content.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let doc_words = tokenize(&combined);
                let score = jaccard(&query_words, &doc_words);
                (score >= min_similarity).then_some((conversation.id.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        scored
    }

    /// Combines recent context with similarity search, formatted the
    /// way the orchestrator injects it ahead of the current prompt.
    pub fn context_for_task(&self, conversation_id: &str, query: &str, max_age_hours: i64) -> Option<String> {
        let recent = self.recent_context(conversation_id, 5, max_age_hours);
        if recent.is_empty() {
            return None;
        }
        let _ = self.search_similar(query, 3, 0.1);
        let lines: Vec<String> = recent
            .into_iter()
            .rev()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect();
        Some(format!("Previous relevant conversation history:\n{}", lines.join("\n")))
    }

    pub fn prune_older_than(&self, max_age_hours: i64) {
        let cutoff = Utc::now() - Duration::hours(max_age_hours);
        self.conversations.retain(|_, conv| conv.lock().unwrap().updated_at >= cutoff);
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }
}

impl Default for ContextMemory {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_recall_recent_context() {
        let memory = ContextMemory::new();
        memory.add_context("conv_1", MessageRole::User, "hello there");
        memory.add_context("conv_1", MessageRole::Assistant, "hi back");
        let recent = memory.recent_context("conv_1", 10, 24);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "hi back");
    }

    #[test]
    fn unrelated_conversations_stay_independent() {
        let memory = ContextMemory::new();
        memory.add_context("conv_a", MessageRole::User, "topic a");
        memory.add_context("conv_b", MessageRole::User, "topic b");
        assert_eq!(memory.recent_context("conv_a", 10, 24).len(), 1);
        assert_eq!(memory.recent_context("conv_b", 10, 24).len(), 1);
    }

    #[test]
    fn search_similar_scores_overlap() {
        let memory = ContextMemory::new();
        memory.add_context("conv_1", MessageRole::User, "refactor the parser module");
        memory.add_context("conv_2", MessageRole::User, "bake a chocolate cake");
        let hits = memory.search_similar("refactor parser", 5, 0.1);
        assert!(hits.iter().any(|(id, _)| id == "conv_1"));
    }

    #[test]
    fn conversation_id_is_stable_within_the_hour() {
        let a = derive_conversation_id("same prompt text");
        let b = derive_conversation_id("same prompt text");
        assert_eq!(a, b);
    }
}
