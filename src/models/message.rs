// Copyright 2025 Ripple Contributors
// SPDX-License-Identifier: Apache-2.0

//! Message models for conversation persistence.
//!
//! This module provides types for storing and retrieving conversation turns
//! with associated metrics (tokens, phase timings) for analytics and recovery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content_part::ContentPart;
use super::generation::{FileAttachment, GenerationTimings};

/// Message role in the conversation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// User message
    User,
    /// Assistant response
    Assistant,
    /// System message (session boundaries, interruptions)
    System,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
            MessageRole::System => write!(f, "system"),
        }
    }
}

/// A sandbox-produced file surfaced on the finished message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxFile {
    /// Object-store key for the uploaded copy
    pub id: String,
    /// Absolute path inside the sandbox
    pub path: String,
    pub name: String,
}

/// Message entity representing a persisted chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Ordered content parts; only assistant messages carry these.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_parts: Option<Vec<ContentPart>>,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    /// Phase timeline for assistant messages.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<GenerationTimings>,
    #[serde(default)]
    pub attachments: Vec<FileAttachment>,
    #[serde(default)]
    pub sandbox_files: Vec<SandboxFile>,
    pub created_at: DateTime<Utc>,
}

/// Payload for creating a new message.
///
/// ID and timestamp are generated server-side.
#[derive(Debug, Clone, Serialize)]
pub struct MessageCreate {
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_parts: Option<Vec<ContentPart>>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<GenerationTimings>,
    pub attachments: Vec<FileAttachment>,
    pub sandbox_files: Vec<SandboxFile>,
}

impl MessageCreate {
    /// Creates a new user message.
    pub fn user(
        conversation_id: String,
        content: String,
        attachments: Vec<FileAttachment>,
    ) -> Self {
        Self {
            conversation_id,
            role: MessageRole::User,
            content,
            content_parts: None,
            tokens_input: 0,
            tokens_output: 0,
            timing: None,
            attachments,
            sandbox_files: Vec::new(),
        }
    }

    /// Creates a new assistant message with content parts and metrics.
    pub fn assistant(
        conversation_id: String,
        content: String,
        content_parts: Vec<ContentPart>,
        tokens_input: u64,
        tokens_output: u64,
        timing: GenerationTimings,
    ) -> Self {
        Self {
            conversation_id,
            role: MessageRole::Assistant,
            content,
            content_parts: Some(content_parts),
            tokens_input,
            tokens_output,
            timing: Some(timing),
            attachments: Vec::new(),
            sandbox_files: Vec::new(),
        }
    }

    /// Creates a new system message (session boundaries, notifications).
    pub fn system(conversation_id: String, content: String) -> Self {
        Self {
            conversation_id,
            role: MessageRole::System,
            content,
            content_parts: None,
            tokens_input: 0,
            tokens_output: 0,
            timing: None,
            attachments: Vec::new(),
            sandbox_files: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_role_serialization() {
        let role = MessageRole::Assistant;
        let json = serde_json::to_string(&role).unwrap();
        assert_eq!(json, "\"assistant\"");

        let deserialized: MessageRole = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, MessageRole::Assistant);
    }

    #[test]
    fn test_message_role_display() {
        assert_eq!(MessageRole::User.to_string(), "user");
        assert_eq!(MessageRole::Assistant.to_string(), "assistant");
        assert_eq!(MessageRole::System.to_string(), "system");
    }

    #[test]
    fn test_message_create_user() {
        let create = MessageCreate::user("conv_001".to_string(), "Hello".to_string(), vec![]);
        assert_eq!(create.role, MessageRole::User);
        assert!(create.content_parts.is_none());
        assert!(create.timing.is_none());
    }

    #[test]
    fn test_message_create_assistant() {
        let parts = vec![ContentPart::Text {
            text: "Done.".to_string(),
        }];
        let create = MessageCreate::assistant(
            "conv_001".to_string(),
            "Done.".to_string(),
            parts.clone(),
            120,
            40,
            GenerationTimings::default(),
        );
        assert_eq!(create.role, MessageRole::Assistant);
        assert_eq!(create.content_parts, Some(parts));
        assert_eq!(create.tokens_input, 120);
        assert_eq!(create.tokens_output, 40);
    }

    #[test]
    fn test_message_serialization_roundtrip() {
        let message = Message {
            id: "msg_001".to_string(),
            conversation_id: "conv_001".to_string(),
            role: MessageRole::Assistant,
            content: "Hello!".to_string(),
            content_parts: Some(vec![ContentPart::Text {
                text: "Hello!".to_string(),
            }]),
            tokens_input: 50,
            tokens_output: 10,
            timing: None,
            attachments: vec![],
            sandbox_files: vec![SandboxFile {
                id: "obj_1".to_string(),
                path: "/app/report.md".to_string(),
                name: "report.md".to_string(),
            }],
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&message).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, message.id);
        assert_eq!(back.sandbox_files, message.sandbox_files);
        assert_eq!(back.content_parts, message.content_parts);
    }
}
