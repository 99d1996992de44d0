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

//! Workflow run status mirror.
//!
//! Workflow execution itself lives outside the orchestrator; this record
//! only mirrors the generation lifecycle so workflow views stay coherent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::generation::GenerationStatus;

/// Status mirrored from the workflow run's generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    AwaitingApproval,
    AwaitingAuth,
    Completed,
    Cancelled,
    Error,
}

impl WorkflowRunStatus {
    /// Mirror mapping from a generation status. Approval timeouts cancel a
    /// workflow run outright (there is no resumable paused state for runs).
    pub fn from_generation(status: GenerationStatus) -> Self {
        match status {
            GenerationStatus::Running => WorkflowRunStatus::Running,
            GenerationStatus::AwaitingApproval => WorkflowRunStatus::AwaitingApproval,
            GenerationStatus::AwaitingAuth => WorkflowRunStatus::AwaitingAuth,
            GenerationStatus::Paused => WorkflowRunStatus::Cancelled,
            GenerationStatus::Completed => WorkflowRunStatus::Completed,
            GenerationStatus::Cancelled => WorkflowRunStatus::Cancelled,
            GenerationStatus::Error => WorkflowRunStatus::Error,
        }
    }
}

/// Workflow run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub status: WorkflowRunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_generation_cancels_run() {
        assert_eq!(
            WorkflowRunStatus::from_generation(GenerationStatus::Paused),
            WorkflowRunStatus::Cancelled
        );
    }

    #[test]
    fn test_mirror_mapping() {
        assert_eq!(
            WorkflowRunStatus::from_generation(GenerationStatus::Running),
            WorkflowRunStatus::Running
        );
        assert_eq!(
            WorkflowRunStatus::from_generation(GenerationStatus::Completed),
            WorkflowRunStatus::Completed
        );
        assert_eq!(
            WorkflowRunStatus::from_generation(GenerationStatus::Error),
            WorkflowRunStatus::Error
        );
    }
}
