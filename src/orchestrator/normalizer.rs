// Copyright 2025 Assistance Micro Design
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event stream normalizer.
//!
//! Translates raw provider events into content-part mutations and
//! subscription events. Provider text is cumulative per part id; the
//! normalizer stores the full text and derives deltas. Parts arriving
//! before their message's role is known are quarantined when they look
//! like an echo of the user's input, and replayed once the role resolves
//! to assistant.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::constants::{generation, normalizer};
use crate::integrations;
use crate::models::{ContentPart, GenerationEvent, MessageRole};
use crate::provider::{
    MessagePart, PartBody, PermissionRequest, ProviderEvent, QuestionRequest, ToolStatus,
};

/// Effect of one provider event on the generation.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizerAction {
    /// Content parts changed; broadcast this event.
    Emit(GenerationEvent),
    /// The provider suspended on a permission decision.
    Permission(PermissionRequest),
    /// The provider suspended on question answers.
    Question(QuestionRequest),
    /// Token usage snapshot.
    Usage { tokens_input: u64, tokens_output: u64 },
    /// The session finished producing for this turn.
    Idle,
    /// Fatal session failure.
    Error { message: String },
}

/// Per-generation normalizer state.
pub struct EventNormalizer {
    parts: Vec<ContentPart>,
    /// part id -> index into `parts` for cumulative text parts
    text_index: HashMap<String, usize>,
    /// part id -> index into `parts` for cumulative thinking parts
    thinking_index: HashMap<String, usize>,
    current_text_part_id: Option<String>,
    /// message id -> role, from `message_updated` events
    roles: HashMap<String, MessageRole>,
    /// unknown-role parts that look like user echo, keyed by message id
    quarantine: HashMap<String, VecDeque<MessagePart>>,
    quarantine_since: HashMap<String, Instant>,
    seen_tool_running: HashSet<String>,
    seen_tool_finished: HashSet<String>,
    user_text: String,
    dirty: bool,
}

impl EventNormalizer {
    /// `user_text` is the triggering user message, used by the echo guard.
    pub fn new(user_text: String) -> Self {
        Self {
            parts: Vec::new(),
            text_index: HashMap::new(),
            thinking_index: HashMap::new(),
            current_text_part_id: None,
            roles: HashMap::new(),
            quarantine: HashMap::new(),
            quarantine_since: HashMap::new(),
            seen_tool_running: HashSet::new(),
            seen_tool_finished: HashSet::new(),
            user_text,
            dirty: false,
        }
    }

    /// Resumes with parts persisted by an earlier runner.
    pub fn with_parts(user_text: String, parts: Vec<ContentPart>) -> Self {
        let mut normalizer = Self::new(user_text);
        for (index, part) in parts.iter().enumerate() {
            match part {
                ContentPart::Thinking { id, .. } => {
                    normalizer.thinking_index.insert(id.clone(), index);
                }
                ContentPart::ToolUse { id, .. } => {
                    normalizer.seen_tool_running.insert(id.clone());
                }
                ContentPart::ToolResult { tool_use_id, .. } => {
                    normalizer.seen_tool_finished.insert(tool_use_id.clone());
                }
                _ => {}
            }
        }
        normalizer.parts = parts;
        normalizer
    }

    pub fn parts(&self) -> &[ContentPart] {
        &self.parts
    }

    /// Appends an orchestrator-produced part (approval, system marker).
    pub fn push_part(&mut self, part: ContentPart) {
        self.parts.push(part);
        self.dirty = true;
    }

    /// Returns and clears the parts-changed flag.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    /// Applies one provider event.
    pub fn apply(&mut self, event: ProviderEvent) -> Vec<NormalizerAction> {
        self.expire_quarantine();

        match event {
            ProviderEvent::MessageUpdated { id, role } => {
                self.roles.insert(id.clone(), role);
                if role == MessageRole::Assistant {
                    self.replay_quarantined(&id)
                } else {
                    // Parts held for a non-assistant message stay dropped
                    self.quarantine.remove(&id);
                    self.quarantine_since.remove(&id);
                    Vec::new()
                }
            }
            ProviderEvent::PartUpdated { part } => self.handle_part_update(part),
            ProviderEvent::PermissionRequested(request) => {
                vec![NormalizerAction::Permission(request)]
            }
            ProviderEvent::QuestionRequested(request) => {
                vec![NormalizerAction::Question(request)]
            }
            ProviderEvent::Usage {
                tokens_input,
                tokens_output,
            } => vec![NormalizerAction::Usage {
                tokens_input,
                tokens_output,
            }],
            ProviderEvent::SessionIdle => vec![NormalizerAction::Idle],
            ProviderEvent::SessionError { message } => vec![NormalizerAction::Error { message }],
            ProviderEvent::Other => Vec::new(),
        }
    }

    fn handle_part_update(&mut self, part: MessagePart) -> Vec<NormalizerAction> {
        match self.roles.get(&part.message_id).copied() {
            // A part of the user's own message must never replay as
            // assistant output.
            Some(MessageRole::User) => {
                debug!(part_id = %part.id, "Dropping user-message part");
                Vec::new()
            }
            Some(_) => self.handle_part(part),
            None => {
                if self.looks_like_user_echo(&part) {
                    self.enqueue_quarantine(part);
                    Vec::new()
                } else {
                    self.handle_part(part)
                }
            }
        }
    }

    fn handle_part(&mut self, part: MessagePart) -> Vec<NormalizerAction> {
        match part.body {
            PartBody::Text { text } => self.apply_text(part.id, text),
            PartBody::Reasoning { text } => self.apply_reasoning(part.id, text),
            PartBody::Tool {
                name,
                status,
                input,
                output,
                error,
            } => self.apply_tool(part.id, name, status, input, output, error),
        }
    }

    fn apply_text(&mut self, part_id: String, full: String) -> Vec<NormalizerAction> {
        let delta = match self.text_index.get(&part_id).copied() {
            Some(index) => {
                let stored = match &mut self.parts[index] {
                    ContentPart::Text { text } => text,
                    _ => unreachable!("text index always points at a text part"),
                };
                let delta = if full.len() >= stored.len() && full.starts_with(stored.as_str()) {
                    full[stored.len()..].to_string()
                } else {
                    // Non-monotone update: replace wholesale
                    warn!(part_id = %part_id, "Non-cumulative text update, replacing part");
                    full.clone()
                };
                *stored = full;
                delta
            }
            None => {
                self.parts.push(ContentPart::Text { text: full.clone() });
                self.text_index.insert(part_id.clone(), self.parts.len() - 1);
                full
            }
        };
        self.current_text_part_id = Some(part_id);

        if delta.is_empty() {
            return Vec::new();
        }
        self.dirty = true;
        vec![NormalizerAction::Emit(GenerationEvent::Text { delta })]
    }

    fn apply_reasoning(&mut self, part_id: String, full: String) -> Vec<NormalizerAction> {
        let delta = match self.thinking_index.get(&part_id).copied() {
            Some(index) => {
                let stored = match &mut self.parts[index] {
                    ContentPart::Thinking { content, .. } => content,
                    _ => unreachable!("thinking index always points at a thinking part"),
                };
                let delta = if full.len() >= stored.len() && full.starts_with(stored.as_str()) {
                    full[stored.len()..].to_string()
                } else {
                    warn!(part_id = %part_id, "Non-cumulative reasoning update, replacing part");
                    full.clone()
                };
                *stored = full;
                delta
            }
            None => {
                self.parts.push(ContentPart::Thinking {
                    id: part_id.clone(),
                    content: full.clone(),
                });
                self.thinking_index
                    .insert(part_id.clone(), self.parts.len() - 1);
                full
            }
        };

        if delta.is_empty() {
            return Vec::new();
        }
        self.dirty = true;
        vec![NormalizerAction::Emit(GenerationEvent::Thinking {
            id: part_id,
            delta,
        })]
    }

    fn apply_tool(
        &mut self,
        part_id: String,
        name: String,
        status: ToolStatus,
        input: Option<Value>,
        output: Option<Value>,
        error: Option<String>,
    ) -> Vec<NormalizerAction> {
        match status {
            ToolStatus::Pending => Vec::new(),
            ToolStatus::Running => {
                let Some(input) = input else {
                    return Vec::new();
                };
                if !self.seen_tool_running.insert(part_id.clone()) {
                    // Duplicate running events for the same tool are noise
                    return Vec::new();
                }
                vec![self.append_tool_use(part_id, name, input)]
            }
            ToolStatus::Completed => {
                let content = cap_tool_result(output.unwrap_or(Value::Null));
                self.finish_tool(part_id, name, input, content)
            }
            ToolStatus::Error => {
                let message = error.unwrap_or_else(|| "tool failed".to_string());
                let content = cap_tool_result(json!({ "error": message }));
                self.finish_tool(part_id, name, input, content)
            }
        }
    }

    fn append_tool_use(
        &mut self,
        part_id: String,
        name: String,
        input: Value,
    ) -> NormalizerAction {
        // bash commands against a known integration carry extra metadata
        let (integration, operation) = if name == "bash" {
            let parsed = input
                .get("command")
                .and_then(Value::as_str)
                .and_then(integrations::parse_command);
            match parsed {
                Some(parsed) => (Some(parsed.integration), parsed.operation),
                None => (None, None),
            }
        } else {
            (None, None)
        };

        let part = ContentPart::ToolUse {
            id: part_id.clone(),
            name: name.clone(),
            input: input.clone(),
            integration: integration.clone(),
            operation: operation.clone(),
        };
        self.parts.push(part);
        self.dirty = true;

        NormalizerAction::Emit(GenerationEvent::ToolUse {
            id: part_id,
            name,
            input,
            integration,
            operation,
        })
    }

    fn finish_tool(
        &mut self,
        part_id: String,
        name: String,
        input: Option<Value>,
        content: Value,
    ) -> Vec<NormalizerAction> {
        if !self.seen_tool_finished.insert(part_id.clone()) {
            return Vec::new();
        }

        let mut actions = Vec::new();
        // A result must always follow a tool_use part in the same
        // generation; synthesize one when running never arrived.
        if self.seen_tool_running.insert(part_id.clone()) {
            actions.push(self.append_tool_use(
                part_id.clone(),
                name,
                input.unwrap_or_else(|| json!({})),
            ));
        }

        self.parts.push(ContentPart::ToolResult {
            tool_use_id: part_id.clone(),
            content: content.clone(),
        });
        self.dirty = true;
        actions.push(NormalizerAction::Emit(GenerationEvent::ToolResult {
            tool_use_id: part_id,
            content,
        }));
        actions
    }

    // =====================================================
    // User-echo quarantine
    // =====================================================

    fn looks_like_user_echo(&self, part: &MessagePart) -> bool {
        let PartBody::Text { text } = &part.body else {
            return false;
        };
        let text = text.trim();
        let user = self.user_text.trim();
        if text.is_empty() || user.is_empty() {
            return false;
        }
        text == user || user.starts_with(text) || user.ends_with(text)
    }

    fn enqueue_quarantine(&mut self, part: MessagePart) {
        let message_id = part.message_id.clone();
        let queue = self.quarantine.entry(message_id.clone()).or_default();
        self.quarantine_since
            .entry(message_id.clone())
            .or_insert_with(Instant::now);

        if queue.len() >= normalizer::PART_QUEUE_MAX {
            queue.pop_front();
            warn!(message_id = %message_id, "Part quarantine overflow, dropped oldest");
        }
        queue.push_back(part);
    }

    fn replay_quarantined(&mut self, message_id: &str) -> Vec<NormalizerAction> {
        self.quarantine_since.remove(message_id);
        let Some(queue) = self.quarantine.remove(message_id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for part in queue {
            actions.extend(self.handle_part(part));
        }
        actions
    }

    fn expire_quarantine(&mut self) {
        let ttl = Duration::from_secs(normalizer::PART_QUEUE_TTL_SECS);
        let expired: Vec<String> = self
            .quarantine_since
            .iter()
            .filter(|(_, since)| since.elapsed() > ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in expired {
            self.quarantine.remove(&message_id);
            self.quarantine_since.remove(&message_id);
            debug!(message_id = %message_id, "Quarantined parts expired");
        }
    }
}

/// Caps a tool result at the configured size; oversized payloads collapse
/// into a truncated string form.
fn cap_tool_result(value: Value) -> Value {
    let serialized = value.to_string();
    if serialized.len() <= generation::TOOL_RESULT_MAX_BYTES {
        return value;
    }
    let mut cut = generation::TOOL_RESULT_MAX_BYTES;
    while !serialized.is_char_boundary(cut) {
        cut -= 1;
    }
    Value::String(format!("{}… (truncated)", &serialized[..cut]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_part(id: &str, message_id: &str, text: &str) -> ProviderEvent {
        ProviderEvent::PartUpdated {
            part: MessagePart {
                id: id.to_string(),
                message_id: message_id.to_string(),
                body: PartBody::Text {
                    text: text.to_string(),
                },
            },
        }
    }

    fn tool_part(
        id: &str,
        message_id: &str,
        status: ToolStatus,
        input: Option<Value>,
        output: Option<Value>,
        error: Option<&str>,
    ) -> ProviderEvent {
        ProviderEvent::PartUpdated {
            part: MessagePart {
                id: id.to_string(),
                message_id: message_id.to_string(),
                body: PartBody::Tool {
                    name: "bash".to_string(),
                    status,
                    input,
                    output,
                    error: error.map(String::from),
                },
            },
        }
    }

    fn assistant(normalizer: &mut EventNormalizer, message_id: &str) {
        normalizer.apply(ProviderEvent::MessageUpdated {
            id: message_id.to_string(),
            role: MessageRole::Assistant,
        });
    }

    #[test]
    fn test_cumulative_text_deltas() {
        let mut n = EventNormalizer::new("write a poem".to_string());
        assistant(&mut n, "m1");

        let actions = n.apply(text_part("p1", "m1", "Hello"));
        assert_eq!(
            actions,
            vec![NormalizerAction::Emit(GenerationEvent::Text {
                delta: "Hello".to_string()
            })]
        );

        let actions = n.apply(text_part("p1", "m1", "Hello world"));
        assert_eq!(
            actions,
            vec![NormalizerAction::Emit(GenerationEvent::Text {
                delta: " world".to_string()
            })]
        );

        // Full text is stored, deltas are derived
        assert_eq!(
            n.parts(),
            &[ContentPart::Text {
                text: "Hello world".to_string()
            }]
        );
        assert!(n.take_dirty());
    }

    #[test]
    fn test_identical_update_emits_nothing() {
        let mut n = EventNormalizer::new(String::new());
        assistant(&mut n, "m1");
        n.apply(text_part("p1", "m1", "same"));
        n.take_dirty();

        let actions = n.apply(text_part("p1", "m1", "same"));
        assert!(actions.is_empty());
        assert!(!n.take_dirty());
    }

    #[test]
    fn test_new_part_id_starts_new_text_part() {
        let mut n = EventNormalizer::new(String::new());
        assistant(&mut n, "m1");
        n.apply(text_part("p1", "m1", "first"));
        n.apply(text_part("p2", "m1", "second"));

        assert_eq!(n.parts().len(), 2);
        assert_eq!(
            n.parts()[1],
            ContentPart::Text {
                text: "second".to_string()
            }
        );
    }

    #[test]
    fn test_tool_lifecycle_with_bash_metadata() {
        let mut n = EventNormalizer::new(String::new());
        assistant(&mut n, "m1");

        // Pending carries nothing
        assert!(n
            .apply(tool_part("t1", "m1", ToolStatus::Pending, None, None, None))
            .is_empty());

        let input = json!({"command": "slack send -c C123 -t hi"});
        let actions = n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Running,
            Some(input.clone()),
            None,
            None,
        ));
        match &actions[0] {
            NormalizerAction::Emit(GenerationEvent::ToolUse {
                integration,
                operation,
                ..
            }) => {
                assert_eq!(integration.as_deref(), Some("slack"));
                assert_eq!(operation.as_deref(), Some("send"));
            }
            other => panic!("Unexpected action: {:?}", other),
        }

        // Duplicate running is ignored
        assert!(n
            .apply(tool_part(
                "t1",
                "m1",
                ToolStatus::Running,
                Some(input),
                None,
                None
            ))
            .is_empty());

        let actions = n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Completed,
            None,
            Some(json!({"ok": true})),
            None,
        ));
        assert_eq!(
            actions,
            vec![NormalizerAction::Emit(GenerationEvent::ToolResult {
                tool_use_id: "t1".to_string(),
                content: json!({"ok": true}),
            })]
        );

        assert!(ContentPart::tool_results_consistent(n.parts()));
    }

    #[test]
    fn test_tool_error_produces_error_result() {
        let mut n = EventNormalizer::new(String::new());
        assistant(&mut n, "m1");
        n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Running,
            Some(json!({"command": "ls"})),
            None,
            None,
        ));
        let actions = n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Error,
            None,
            None,
            Some("exit 1"),
        ));
        assert_eq!(
            actions,
            vec![NormalizerAction::Emit(GenerationEvent::ToolResult {
                tool_use_id: "t1".to_string(),
                content: json!({"error": "exit 1"}),
            })]
        );
    }

    #[test]
    fn test_completed_without_running_synthesizes_tool_use() {
        let mut n = EventNormalizer::new(String::new());
        assistant(&mut n, "m1");
        let actions = n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Completed,
            Some(json!({"command": "ls"})),
            Some(json!("ok")),
            None,
        ));
        assert_eq!(actions.len(), 2, "tool_use then tool_result");
        assert!(ContentPart::tool_results_consistent(n.parts()));
    }

    #[test]
    fn test_user_echo_quarantined_until_role_known() {
        let mut n = EventNormalizer::new("Write a status update".to_string());

        // Echo of the user text with unknown role: quarantined
        let actions = n.apply(text_part("p1", "m9", "Write a status update"));
        assert!(actions.is_empty());
        assert!(n.parts().is_empty());

        // Role resolves to assistant: replayed
        let actions = n.apply(ProviderEvent::MessageUpdated {
            id: "m9".to_string(),
            role: MessageRole::Assistant,
        });
        assert_eq!(actions.len(), 1);
        assert_eq!(n.parts().len(), 1);
    }

    #[test]
    fn test_user_role_parts_dropped() {
        let mut n = EventNormalizer::new("hello".to_string());
        n.apply(ProviderEvent::MessageUpdated {
            id: "m1".to_string(),
            role: MessageRole::User,
        });

        let actions = n.apply(text_part("p1", "m1", "hello"));
        assert!(actions.is_empty());
        assert!(n.parts().is_empty());
    }

    #[test]
    fn test_non_echo_unknown_role_processes_immediately() {
        let mut n = EventNormalizer::new("Write a status update".to_string());
        let actions = n.apply(text_part("p1", "m1", "Here is your update:"));
        assert_eq!(actions.len(), 1, "Non-echo text should not be quarantined");
    }

    #[test]
    fn test_quarantine_overflow_drops_oldest() {
        let mut n = EventNormalizer::new("abc".to_string());
        for i in 0..(normalizer::PART_QUEUE_MAX + 5) {
            // "a" is a prefix of the user text, so every one quarantines
            n.apply(text_part(&format!("p{}", i), "m1", "a"));
        }
        let queued = n.quarantine.get("m1").expect("Queue should exist");
        assert_eq!(queued.len(), normalizer::PART_QUEUE_MAX);
        assert_eq!(queued.front().unwrap().id, "p5", "Oldest entries dropped");
    }

    #[test]
    fn test_session_control_events() {
        let mut n = EventNormalizer::new(String::new());
        assert_eq!(n.apply(ProviderEvent::SessionIdle), vec![NormalizerAction::Idle]);
        assert_eq!(
            n.apply(ProviderEvent::SessionError {
                message: "boom".to_string()
            }),
            vec![NormalizerAction::Error {
                message: "boom".to_string()
            }]
        );
        assert_eq!(
            n.apply(ProviderEvent::Usage {
                tokens_input: 10,
                tokens_output: 20
            }),
            vec![NormalizerAction::Usage {
                tokens_input: 10,
                tokens_output: 20
            }]
        );
        assert!(n.apply(ProviderEvent::Other).is_empty());
    }

    #[test]
    fn test_cap_tool_result() {
        let small = json!({"ok": true});
        assert_eq!(cap_tool_result(small.clone()), small);

        let big = Value::String("x".repeat(generation::TOOL_RESULT_MAX_BYTES * 2));
        let capped = cap_tool_result(big);
        let s = capped.as_str().expect("Capped result should be a string");
        assert!(s.ends_with("… (truncated)"));
        assert!(s.len() < generation::TOOL_RESULT_MAX_BYTES + 64);
    }

    #[test]
    fn test_resume_with_existing_parts() {
        let parts = vec![
            ContentPart::Text {
                text: "partial".to_string(),
            },
            ContentPart::ToolUse {
                id: "t1".to_string(),
                name: "bash".to_string(),
                input: json!({}),
                integration: None,
                operation: None,
            },
            ContentPart::ToolResult {
                tool_use_id: "t1".to_string(),
                content: json!("done"),
            },
        ];
        let mut n = EventNormalizer::with_parts(String::new(), parts);
        assistant(&mut n, "m1");

        // A finished tool must not re-finish after resume
        let actions = n.apply(tool_part(
            "t1",
            "m1",
            ToolStatus::Completed,
            None,
            Some(json!("done")),
            None,
        ));
        assert!(actions.is_empty());
        assert_eq!(n.parts().len(), 3);
    }
}
