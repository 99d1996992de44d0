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

//! # Centralized Query Constants
//!
//! SurrealQL SELECT templates shared by the typed store adapter, so field
//! selection stays consistent across read paths.
//!
//! `meta::id(id)` is used everywhere to get plain string ids instead of the
//! SDK's Thing enum.

/// Generation query constants.
pub mod generation {
    /// Base SELECT fields for generation lookups.
    /// Use with `format!("{} WHERE …", SELECT_BASE)`.
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        conversation_id,
        status,
        content_parts,
        pending_approval,
        pending_auth,
        execution_policy,
        tokens_input,
        tokens_output,
        started_at,
        completed_at,
        cancel_requested_at,
        error_message,
        sandbox_id,
        message_id,
        workflow_run_id,
        is_paused
    FROM generation"#;

    /// Statuses treated as non-terminal by admission and the queued
    /// processor. Mirrors `GenerationStatus::is_terminal`.
    pub const ACTIVE_STATUSES: &str =
        "['running', 'awaiting_approval', 'awaiting_auth', 'paused']";
}

/// Conversation query constants.
pub mod conversation {
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        user_id,
        kind,
        model,
        auto_approve,
        current_generation_id,
        generation_status,
        sandbox_id,
        agent_session_id,
        title,
        created_at,
        updated_at
    FROM conversation"#;
}

/// Message query constants.
pub mod message {
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        conversation_id,
        role,
        content,
        content_parts,
        tokens_input,
        tokens_output,
        timing,
        attachments,
        sandbox_files,
        created_at
    FROM message"#;
}

/// Queued-message query constants.
pub mod queued_message {
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        conversation_id,
        user_id,
        content,
        file_attachments,
        selected_platform_skills,
        status,
        generation_id,
        error_message,
        created_at,
        updated_at
    FROM queued_message"#;
}

/// Workflow-run query constants.
pub mod workflow_run {
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        user_id,
        name,
        status,
        conversation_id,
        created_at,
        updated_at
    FROM workflow_run"#;
}

/// Job query constants.
pub mod job {
    pub const SELECT_BASE: &str = r#"SELECT
        meta::id(id) AS id,
        kind,
        payload,
        status,
        run_at,
        created_at
    FROM job"#;
}
