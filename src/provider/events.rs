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

//! Raw provider event feed.
//!
//! The upstream event vocabulary is larger than what the orchestrator
//! consumes; the `Other` variant absorbs unknown event types so new
//! provider releases cannot break ingestion.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::MessageRole;

/// Status of a tool part reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// Body of a message part. Text and reasoning are cumulative: each update
/// carries the full accumulated text, not a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "part_type", rename_all = "snake_case")]
pub enum PartBody {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    Tool {
        name: String,
        status: ToolStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// One message part update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePart {
    pub id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub body: PartBody,
}

/// A permission prompt raised by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    /// Provider-side permission category, e.g. `external_directory`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_type: Option<String>,
    /// Filesystem patterns for directory permissions.
    #[serde(default)]
    pub patterns: Vec<String>,
}

/// A question prompt raised by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub tool_input: Value,
    #[serde(default)]
    pub questions: Vec<String>,
    #[serde(default)]
    pub default_answers: Vec<String>,
}

/// One event from the provider's session feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    /// Role metadata for a message; may arrive after its parts.
    MessageUpdated { id: String, role: MessageRole },
    /// A part was created or updated.
    PartUpdated { part: MessagePart },
    /// The provider requires a permission decision before continuing.
    PermissionRequested(PermissionRequest),
    /// The provider requires question answers before continuing.
    QuestionRequested(QuestionRequest),
    /// Token usage snapshot for the turn.
    Usage { tokens_input: u64, tokens_output: u64 },
    /// The session finished producing for this turn.
    SessionIdle,
    /// Fatal session failure for this turn.
    SessionError { message: String },
    /// Any event type this version does not consume.
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_part_updated_deserialization() {
        let raw = json!({
            "type": "part_updated",
            "part": {
                "id": "prt_1",
                "message_id": "msg_1",
                "part_type": "text",
                "text": "Hello wo"
            }
        });
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        match event {
            ProviderEvent::PartUpdated { part } => {
                assert_eq!(part.id, "prt_1");
                assert_eq!(
                    part.body,
                    PartBody::Text {
                        text: "Hello wo".to_string()
                    }
                );
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_tool_part_status() {
        let raw = json!({
            "id": "prt_2",
            "message_id": "msg_1",
            "part_type": "tool",
            "name": "bash",
            "status": "running",
            "input": {"command": "ls"}
        });
        let part: MessagePart = serde_json::from_value(raw).unwrap();
        match part.body {
            PartBody::Tool { status, input, .. } => {
                assert_eq!(status, ToolStatus::Running);
                assert_eq!(input.unwrap()["command"], "ls");
            }
            other => panic!("Unexpected body: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_maps_to_other() {
        let raw = json!({"type": "storage.write", "path": "/tmp/x"});
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event, ProviderEvent::Other);
    }

    #[test]
    fn test_message_updated_role() {
        let raw = json!({"type": "message_updated", "id": "msg_1", "role": "assistant"});
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(
            event,
            ProviderEvent::MessageUpdated {
                id: "msg_1".to_string(),
                role: MessageRole::Assistant,
            }
        );
    }

    #[test]
    fn test_permission_request_defaults() {
        let raw = json!({
            "type": "permission_requested",
            "request_id": "req_1",
            "tool_name": "bash"
        });
        let event: ProviderEvent = serde_json::from_value(raw).unwrap();
        match event {
            ProviderEvent::PermissionRequested(req) => {
                assert!(req.tool_use_id.is_none());
                assert!(req.patterns.is_empty());
                assert!(req.permission_type.is_none());
            }
            other => panic!("Unexpected event: {:?}", other),
        }
    }
}
