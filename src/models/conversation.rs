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

//! Conversation entity: a thread of generations sharing model and
//! sandbox/session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::generation::GenerationStatus;

/// Conversation flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Chat,
    Workflow,
}

/// Generation status mirrored onto the conversation for list views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Idle,
    Generating,
    AwaitingApproval,
    AwaitingAuth,
    Paused,
    Complete,
    Error,
}

impl ConversationStatus {
    /// Mirror mapping from a generation status.
    pub fn from_generation(status: GenerationStatus) -> Self {
        match status {
            GenerationStatus::Running => ConversationStatus::Generating,
            GenerationStatus::AwaitingApproval => ConversationStatus::AwaitingApproval,
            GenerationStatus::AwaitingAuth => ConversationStatus::AwaitingAuth,
            GenerationStatus::Paused => ConversationStatus::Paused,
            GenerationStatus::Completed => ConversationStatus::Complete,
            GenerationStatus::Cancelled => ConversationStatus::Idle,
            GenerationStatus::Error => ConversationStatus::Error,
        }
    }
}

/// Conversation record as persisted in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_generation_id: Option<String>,
    pub generation_status: ConversationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating a conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationCreate {
    pub user_id: String,
    pub kind: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub auto_approve: bool,
    pub generation_status: ConversationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ConversationCreate {
    pub fn chat(user_id: String, model: Option<String>, auto_approve: bool) -> Self {
        Self {
            user_id,
            kind: ConversationKind::Chat,
            model,
            auto_approve,
            generation_status: ConversationStatus::Idle,
            title: None,
        }
    }

    pub fn workflow(user_id: String, title: String, auto_approve: bool) -> Self {
        Self {
            user_id,
            kind: ConversationKind::Workflow,
            model: None,
            auto_approve,
            generation_status: ConversationStatus::Idle,
            title: Some(title),
        }
    }
}

/// Partial update applied to a conversation with a single MERGE.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_status: Option<ConversationStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_generation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_approve: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip)]
    pub clear_agent_session_id: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_serialization() {
        assert_eq!(
            serde_json::to_string(&ConversationKind::Chat).unwrap(),
            "\"chat\""
        );
        assert_eq!(
            serde_json::to_string(&ConversationKind::Workflow).unwrap(),
            "\"workflow\""
        );
    }

    #[test]
    fn test_status_mirror_mapping() {
        assert_eq!(
            ConversationStatus::from_generation(GenerationStatus::Running),
            ConversationStatus::Generating
        );
        assert_eq!(
            ConversationStatus::from_generation(GenerationStatus::Completed),
            ConversationStatus::Complete
        );
        assert_eq!(
            ConversationStatus::from_generation(GenerationStatus::Cancelled),
            ConversationStatus::Idle
        );
        assert_eq!(
            ConversationStatus::from_generation(GenerationStatus::AwaitingAuth),
            ConversationStatus::AwaitingAuth
        );
        assert_eq!(
            ConversationStatus::from_generation(GenerationStatus::Error),
            ConversationStatus::Error
        );
    }

    #[test]
    fn test_conversation_create_chat() {
        let create = ConversationCreate::chat("user_1".to_string(), None, true);
        assert_eq!(create.kind, ConversationKind::Chat);
        assert!(create.auto_approve);
        assert!(create.title.is_none());
    }

    #[test]
    fn test_patch_serializes_only_set_fields() {
        let patch = ConversationPatch {
            generation_status: Some(ConversationStatus::Generating),
            current_generation_id: Some("gen_1".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_value(&patch).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 2);
        assert_eq!(obj["generation_status"], "generating");
    }
}
