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

//! Typed content parts accumulated by a generation.
//!
//! Parts are append-only during a run; a part that arrives again with the
//! same provider id reconciles into the existing entry in place. The
//! serialized shape is a compatibility surface for persisted generations.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome recorded on an approval content part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    /// User allowed the operation
    Approved,
    /// User denied the operation
    Denied,
}

/// One tagged entry in a generation's produced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain assistant text. Stored as the full accumulated text; deltas
    /// are derived by subscribers.
    Text { text: String },
    /// A tool invocation the model issued.
    ToolUse {
        id: String,
        name: String,
        input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        integration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
    },
    /// Result for a prior tool invocation in the same generation.
    ToolResult { tool_use_id: String, content: Value },
    /// Model reasoning. Cumulative like text.
    Thinking { id: String, content: String },
    /// A resolved approval prompt.
    Approval {
        tool_use_id: String,
        tool_name: String,
        tool_input: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        integration: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        operation: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        command: Option<String>,
        status: ApprovalStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        question_answers: Option<Vec<String>>,
    },
    /// Orchestrator-inserted marker (e.g. interruption).
    System { content: String },
}

impl ContentPart {
    /// Concatenated text of all `text` parts, in order.
    pub fn join_text(parts: &[ContentPart]) -> String {
        let mut out = String::new();
        for part in parts {
            if let ContentPart::Text { text } = part {
                out.push_str(text);
            }
        }
        out
    }

    /// Checks the tool-result referential invariant: every
    /// `tool_result.tool_use_id` names a prior `tool_use.id`.
    pub fn tool_results_consistent(parts: &[ContentPart]) -> bool {
        let mut seen = std::collections::HashSet::new();
        for part in parts {
            match part {
                ContentPart::ToolUse { id, .. } => {
                    seen.insert(id.as_str());
                }
                ContentPart::ToolResult { tool_use_id, .. } => {
                    if !seen.contains(tool_use_id.as_str()) {
                        return false;
                    }
                }
                _ => {}
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_part_tagging() {
        let part = ContentPart::Text {
            text: "Hello".to_string(),
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"text\""));

        let part = ContentPart::ToolUse {
            id: "tu_001".to_string(),
            name: "bash".to_string(),
            input: json!({"command": "ls"}),
            integration: None,
            operation: None,
        };
        let json = serde_json::to_string(&part).unwrap();
        assert!(json.contains("\"type\":\"tool_use\""));
        // Absent metadata must not serialize
        assert!(!json.contains("integration"));
    }

    #[test]
    fn test_content_part_roundtrip() {
        let parts = vec![
            ContentPart::Text {
                text: "working on it".to_string(),
            },
            ContentPart::ToolUse {
                id: "tu_001".to_string(),
                name: "bash".to_string(),
                input: json!({"command": "slack send -c C1 -t hi"}),
                integration: Some("slack".to_string()),
                operation: Some("send".to_string()),
            },
            ContentPart::ToolResult {
                tool_use_id: "tu_001".to_string(),
                content: json!({"ok": true}),
            },
            ContentPart::Thinking {
                id: "th_001".to_string(),
                content: "considering".to_string(),
            },
            ContentPart::System {
                content: "Interrupted by user".to_string(),
            },
        ];

        let json = serde_json::to_string(&parts).unwrap();
        let back: Vec<ContentPart> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, parts);
    }

    #[test]
    fn test_approval_status_serialization() {
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::Approved).unwrap(),
            "\"approved\""
        );
        assert_eq!(
            serde_json::to_string(&ApprovalStatus::Denied).unwrap(),
            "\"denied\""
        );
    }

    #[test]
    fn test_join_text() {
        let parts = vec![
            ContentPart::Text {
                text: "Hello ".to_string(),
            },
            ContentPart::ToolUse {
                id: "tu".to_string(),
                name: "bash".to_string(),
                input: json!({}),
                integration: None,
                operation: None,
            },
            ContentPart::Text {
                text: "world".to_string(),
            },
        ];
        assert_eq!(ContentPart::join_text(&parts), "Hello world");
    }

    #[test]
    fn test_tool_results_consistent() {
        let ok = vec![
            ContentPart::ToolUse {
                id: "a".to_string(),
                name: "bash".to_string(),
                input: json!({}),
                integration: None,
                operation: None,
            },
            ContentPart::ToolResult {
                tool_use_id: "a".to_string(),
                content: json!("done"),
            },
        ];
        assert!(ContentPart::tool_results_consistent(&ok));

        let orphan = vec![ContentPart::ToolResult {
            tool_use_id: "missing".to_string(),
            content: json!("done"),
        }];
        assert!(!ContentPart::tool_results_consistent(&orphan));
    }
}
