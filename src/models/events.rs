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

//! Subscription event types for real-time generation streaming.
//!
//! Subscribers receive these by diffing durable state; text and thinking
//! events carry deltas whose concatenation equals the stored full text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::content_part::{ApprovalStatus, ContentPart};
use super::generation::{FileAttachment, GenerationStatus, GenerationTimings};
use super::message::SandboxFile;
use super::pending::{PendingApproval, PendingAuth};

/// Artifacts attached to the terminal `done` event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DonePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<GenerationTimings>,
    #[serde(default)]
    pub attachments: Vec<FileAttachment>,
    #[serde(default)]
    pub sandbox_files: Vec<SandboxFile>,
}

/// One event on a generation subscription stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GenerationEvent {
    /// Assistant text delta.
    Text { delta: String },
    /// Reasoning delta for one thinking part.
    Thinking { id: String, delta: String },
    /// A tool invocation was issued.
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        integration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },
    /// A tool invocation finished.
    ToolResult { tool_use_id: String, content: Value },
    /// A previously pending approval resolved.
    Approval {
        tool_use_id: String,
        tool_name: String,
        status: ApprovalStatus,
    },
    /// An orchestrator-inserted marker part.
    System { content: String },
    /// A tool call suspended awaiting user decision.
    PendingApproval { approval: PendingApproval },
    /// The run suspended awaiting integration auth.
    AuthNeeded { auth: PendingAuth },
    /// One of the requested integrations connected.
    AuthProgress {
        integration: String,
        connected_integrations: Vec<String>,
    },
    /// Status heartbeat / transition.
    StatusChange { status: GenerationStatus },
    /// Terminal success with assistant message artifacts.
    Done { payload: DonePayload },
    /// Terminal or retryable failure.
    Error { message: String, retryable: bool },
}

impl GenerationEvent {
    /// Replays a stored content part as the event a live subscriber would
    /// have seen (full text rather than deltas).
    pub fn from_part(part: &ContentPart) -> Self {
        match part {
            ContentPart::Text { text } => GenerationEvent::Text {
                delta: text.clone(),
            },
            ContentPart::Thinking { id, content } => GenerationEvent::Thinking {
                id: id.clone(),
                delta: content.clone(),
            },
            ContentPart::ToolUse {
                id,
                name,
                input,
                integration,
                operation,
            } => GenerationEvent::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
                integration: integration.clone(),
                operation: operation.clone(),
            },
            ContentPart::ToolResult {
                tool_use_id,
                content,
            } => GenerationEvent::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
            },
            ContentPart::Approval {
                tool_use_id,
                tool_name,
                status,
                ..
            } => GenerationEvent::Approval {
                tool_use_id: tool_use_id.clone(),
                tool_name: tool_name.clone(),
                status: *status,
            },
            ContentPart::System { content } => GenerationEvent::System {
                content: content.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event = GenerationEvent::Text {
            delta: "hi".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"text\""));

        let event = GenerationEvent::StatusChange {
            status: GenerationStatus::Completed,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"status_change\""));
        assert!(json.contains("\"status\":\"completed\""));
    }

    #[test]
    fn test_replay_from_parts() {
        let parts = vec![
            ContentPart::Text {
                text: "Hello world".to_string(),
            },
            ContentPart::ToolUse {
                id: "tu_1".to_string(),
                name: "bash".to_string(),
                input: json!({"command": "ls"}),
                integration: None,
                operation: None,
            },
            ContentPart::ToolResult {
                tool_use_id: "tu_1".to_string(),
                content: json!("ok"),
            },
        ];

        let events: Vec<GenerationEvent> = parts.iter().map(GenerationEvent::from_part).collect();
        assert_eq!(
            events[0],
            GenerationEvent::Text {
                delta: "Hello world".to_string()
            }
        );
        assert!(matches!(events[1], GenerationEvent::ToolUse { .. }));
        assert!(matches!(events[2], GenerationEvent::ToolResult { .. }));
    }

    #[test]
    fn test_done_payload_roundtrip() {
        let event = GenerationEvent::Done {
            payload: DonePayload {
                message_id: Some("msg_1".to_string()),
                tokens_input: 100,
                tokens_output: 42,
                timing: None,
                attachments: vec![],
                sandbox_files: vec![],
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: GenerationEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_error_event_retryable_flag() {
        let event = GenerationEvent::Error {
            message: "still preparing".to_string(),
            retryable: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"retryable\":true"));
    }
}
