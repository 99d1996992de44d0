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

//! Generation entity: one end-to-end run through the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::content_part::ContentPart;
use super::pending::{PendingApproval, PendingAuth};

/// Lifecycle status of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Running,
    AwaitingApproval,
    AwaitingAuth,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl GenerationStatus {
    /// Terminal statuses permit no further content-part mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GenerationStatus::Completed | GenerationStatus::Cancelled | GenerationStatus::Error
        )
    }
}

impl std::fmt::Display for GenerationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GenerationStatus::Running => "running",
            GenerationStatus::AwaitingApproval => "awaiting_approval",
            GenerationStatus::AwaitingAuth => "awaiting_auth",
            GenerationStatus::Paused => "paused",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Cancelled => "cancelled",
            GenerationStatus::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// A user-staged file carried by a generation or message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// Object-store key
    pub id: String,
    pub name: String,
    pub content_type: String,
}

impl FileAttachment {
    /// Image attachments are passed inline in the prompt; everything else
    /// is staged into the sandbox uploads directory.
    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// Immutable per-generation execution configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPolicy {
    #[serde(default)]
    pub allowed_integrations: Vec<String>,
    #[serde(default)]
    pub allowed_custom_integrations: Vec<String>,
    #[serde(default)]
    pub auto_approve: bool,
    #[serde(default)]
    pub selected_platform_skills: Vec<String>,
    #[serde(default)]
    pub file_attachments: Vec<FileAttachment>,
}

/// Per-phase timestamps recorded by the runner and persisted on the
/// assistant message for latency analysis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationTimings {
    pub marks: Vec<PhaseMark>,
}

/// One phase-timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseMark {
    pub phase: String,
    pub at: DateTime<Utc>,
}

impl GenerationTimings {
    /// Records a phase mark at the current instant.
    pub fn mark(&mut self, phase: &str) {
        self.marks.push(PhaseMark {
            phase: phase.to_string(),
            at: Utc::now(),
        });
    }

    /// Whether a phase has been recorded.
    pub fn has(&self, phase: &str) -> bool {
        self.marks.iter().any(|m| m.phase == phase)
    }
}

/// Generation record as persisted in the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub id: String,
    pub conversation_id: String,
    pub status: GenerationStatus,
    #[serde(default)]
    pub content_parts: Vec<ContentPart>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_approval: Option<PendingApproval>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_auth: Option<PendingAuth>,
    #[serde(default)]
    pub execution_policy: ExecutionPolicy,
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancel_requested_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    /// Assistant message produced on finish.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    #[serde(default)]
    pub is_paused: bool,
}

impl Generation {
    /// Pending-payload/status coherence invariant: exactly one of
    /// `pending_approval`, `pending_auth`, or neither is set, matching status.
    pub fn pending_state_consistent(&self) -> bool {
        match self.status {
            GenerationStatus::AwaitingApproval => {
                self.pending_approval.is_some() && self.pending_auth.is_none()
            }
            GenerationStatus::AwaitingAuth => {
                self.pending_auth.is_some() && self.pending_approval.is_none()
            }
            _ => self.pending_approval.is_none() && self.pending_auth.is_none(),
        }
    }
}

/// Payload for inserting a new generation.
///
/// `started_at` is set by the store's clock, not the payload.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationCreate {
    pub conversation_id: String,
    pub status: GenerationStatus,
    pub content_parts: Vec<ContentPart>,
    pub execution_policy: ExecutionPolicy,
    pub tokens_input: u64,
    pub tokens_output: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_run_id: Option<String>,
    pub is_paused: bool,
}

impl GenerationCreate {
    pub fn new(conversation_id: String, policy: ExecutionPolicy) -> Self {
        Self {
            conversation_id,
            status: GenerationStatus::Running,
            content_parts: Vec::new(),
            execution_policy: policy,
            tokens_input: 0,
            tokens_output: 0,
            workflow_run_id: None,
            is_paused: false,
        }
    }
}

/// Partial update applied to a generation record as one atomic UPDATE.
///
/// Timestamp flags (`complete_now`, `cancel_requested_now`) and `clear_*`
/// flags are expanded by the store into SurrealQL expressions so that a
/// status transition and its payload clear land in a single statement.
#[derive(Debug, Clone, Default)]
pub struct GenerationPatch {
    pub status: Option<GenerationStatus>,
    pub content_parts: Option<Vec<ContentPart>>,
    pub pending_approval: Option<PendingApproval>,
    pub pending_auth: Option<PendingAuth>,
    pub tokens_input: Option<u64>,
    pub tokens_output: Option<u64>,
    pub error_message: Option<String>,
    pub sandbox_id: Option<String>,
    pub message_id: Option<String>,
    pub is_paused: Option<bool>,
    /// Sets `completed_at` to the store's clock.
    pub complete_now: bool,
    /// Sets `cancel_requested_at` to the store's clock.
    pub cancel_requested_now: bool,
    pub clear_pending_approval: bool,
    pub clear_pending_auth: bool,
}

impl GenerationPatch {
    pub fn status(status: GenerationStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// True when the patch carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.content_parts.is_none()
            && self.pending_approval.is_none()
            && self.pending_auth.is_none()
            && self.tokens_input.is_none()
            && self.tokens_output.is_none()
            && self.error_message.is_none()
            && self.sandbox_id.is_none()
            && self.message_id.is_none()
            && self.is_paused.is_none()
            && !self.complete_now
            && !self.cancel_requested_now
            && !self.clear_pending_approval
            && !self.clear_pending_auth
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::pending::{PendingApproval, PendingAuth};
    use serde_json::json;

    #[test]
    fn test_status_terminal() {
        assert!(GenerationStatus::Completed.is_terminal());
        assert!(GenerationStatus::Cancelled.is_terminal());
        assert!(GenerationStatus::Error.is_terminal());
        assert!(!GenerationStatus::Running.is_terminal());
        assert!(!GenerationStatus::AwaitingApproval.is_terminal());
        assert!(!GenerationStatus::Paused.is_terminal());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(
            serde_json::to_string(&GenerationStatus::AwaitingApproval).unwrap(),
            "\"awaiting_approval\""
        );
        assert_eq!(
            serde_json::to_string(&GenerationStatus::Running).unwrap(),
            "\"running\""
        );
    }

    fn base_generation() -> Generation {
        Generation {
            id: "gen_001".to_string(),
            conversation_id: "conv_001".to_string(),
            status: GenerationStatus::Running,
            content_parts: vec![],
            pending_approval: None,
            pending_auth: None,
            execution_policy: ExecutionPolicy::default(),
            tokens_input: 0,
            tokens_output: 0,
            started_at: Utc::now(),
            completed_at: None,
            cancel_requested_at: None,
            error_message: None,
            sandbox_id: None,
            message_id: None,
            workflow_run_id: None,
            is_paused: false,
        }
    }

    #[test]
    fn test_pending_state_consistency() {
        let mut g = base_generation();
        assert!(g.pending_state_consistent());

        let now = Utc::now();
        g.status = GenerationStatus::AwaitingApproval;
        assert!(!g.pending_state_consistent());

        g.pending_approval = Some(PendingApproval {
            tool_use_id: "tu".to_string(),
            tool_name: "bash".to_string(),
            tool_input: json!({}),
            requested_at: now,
            expires_at: now,
            integration: None,
            operation: None,
            command: None,
            decision: None,
            question_answers: None,
            provider_request_kind: None,
            provider_request_id: None,
            provider_default_answers: None,
        });
        assert!(g.pending_state_consistent());

        // Both payloads set at once is always inconsistent
        g.pending_auth = Some(PendingAuth {
            integrations: vec![],
            connected_integrations: vec![],
            requested_at: now,
            expires_at: now,
            reason: None,
        });
        assert!(!g.pending_state_consistent());
    }

    #[test]
    fn test_patch_emptiness() {
        assert!(GenerationPatch::default().is_empty());

        let patch = GenerationPatch::status(GenerationStatus::Completed);
        assert!(!patch.is_empty());

        let patch = GenerationPatch {
            clear_pending_auth: true,
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_timings_mark() {
        let mut timings = GenerationTimings::default();
        timings.mark("generation_started");
        timings.mark("prompt_sent");
        assert!(timings.has("generation_started"));
        assert!(timings.has("prompt_sent"));
        assert!(!timings.has("generation_completed"));
        assert_eq!(timings.marks.len(), 2);
    }

    #[test]
    fn test_attachment_is_image() {
        let img = FileAttachment {
            id: "a".to_string(),
            name: "shot.png".to_string(),
            content_type: "image/png".to_string(),
        };
        let doc = FileAttachment {
            id: "b".to_string(),
            name: "notes.pdf".to_string(),
            content_type: "application/pdf".to_string(),
        };
        assert!(img.is_image());
        assert!(!doc.is_image());
    }
}
