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

//! Queued messages: user turns buffered while a prior generation runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::generation::FileAttachment;

/// Lifecycle of a queued message row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedMessageStatus {
    /// Waiting for the conversation to go idle
    Queued,
    /// Claimed by the processor (CAS from queued)
    Processing,
    /// A generation was started from this row
    Sent,
    /// Start failed for a non-retryable reason
    Failed,
}

/// A buffered outgoing user turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: String,
    pub conversation_id: String,
    pub user_id: String,
    pub content: String,
    #[serde(default)]
    pub file_attachments: Vec<FileAttachment>,
    #[serde(default)]
    pub selected_platform_skills: Vec<String>,
    pub status: QueuedMessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payload for enqueuing a queued message.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedMessageCreate {
    pub conversation_id: String,
    pub user_id: String,
    pub content: String,
    pub file_attachments: Vec<FileAttachment>,
    pub selected_platform_skills: Vec<String>,
    pub status: QueuedMessageStatus,
}

impl QueuedMessageCreate {
    pub fn new(
        conversation_id: String,
        user_id: String,
        content: String,
        file_attachments: Vec<FileAttachment>,
        selected_platform_skills: Vec<String>,
    ) -> Self {
        Self {
            conversation_id,
            user_id,
            content,
            file_attachments,
            selected_platform_skills,
            status: QueuedMessageStatus::Queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&QueuedMessageStatus::Queued).unwrap(),
            "\"queued\""
        );
        assert_eq!(
            serde_json::to_string(&QueuedMessageStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&QueuedMessageStatus::Sent).unwrap(),
            "\"sent\""
        );
        assert_eq!(
            serde_json::to_string(&QueuedMessageStatus::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn test_create_defaults_to_queued() {
        let create = QueuedMessageCreate::new(
            "conv_001".to_string(),
            "user_1".to_string(),
            "follow-up question".to_string(),
            vec![],
            vec![],
        );
        assert_eq!(create.status, QueuedMessageStatus::Queued);
    }
}
