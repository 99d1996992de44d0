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

//! Typed store adapter over [`DBClient`].
//!
//! Every mutating call is a single atomic statement; the store is the
//! source of truth for all cross-process state. No in-memory state in the
//! orchestrator is authoritative.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use super::client::DBClient;
use super::queries;
use crate::models::{
    Conversation, ConversationCreate, ConversationPatch, Generation, GenerationCreate,
    GenerationPatch, GenerationStatus, Message, MessageCreate, QueuedMessage, QueuedMessageCreate,
    QueuedMessageStatus, WorkflowRun, WorkflowRunStatus,
};

/// Typed read/write operations used by the orchestrator.
#[derive(Clone)]
pub struct GenerationStore {
    db: Arc<DBClient>,
}

fn rows_to<T: serde::de::DeserializeOwned>(rows: Vec<Value>) -> Result<Vec<T>> {
    rows.into_iter()
        .map(|v| serde_json::from_value(v).map_err(Into::into))
        .collect()
}

/// Incrementally builds a parameterized `UPDATE … SET` statement.
struct SetClause {
    assignments: Vec<String>,
    params: Vec<(String, Value)>,
}

impl SetClause {
    fn new() -> Self {
        Self {
            assignments: Vec::new(),
            params: Vec::new(),
        }
    }

    fn bind<T: serde::Serialize>(&mut self, field: &str, value: &T) -> Result<()> {
        let name = format!("p{}", self.params.len());
        self.assignments.push(format!("{} = ${}", field, name));
        self.params.push((name, serde_json::to_value(value)?));
        Ok(())
    }

    fn raw(&mut self, assignment: &str) {
        self.assignments.push(assignment.to_string());
    }

    fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    fn render(&self, table: &str, id: &str) -> String {
        format!(
            "UPDATE {}:`{}` SET {}",
            table,
            id,
            self.assignments.join(", ")
        )
    }
}

impl GenerationStore {
    pub fn new(db: Arc<DBClient>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &Arc<DBClient> {
        &self.db
    }

    // =====================================================
    // Conversations
    // =====================================================

    pub async fn insert_conversation(&self, id: &str, create: ConversationCreate) -> Result<()> {
        self.db.create("conversation", id, create).await?;
        Ok(())
    }

    pub async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let query = format!(
            "{} WHERE meta::id(id) = $id",
            queries::conversation::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("id".to_string(), json!(id))])
            .await?;
        Ok(rows_to::<Conversation>(rows)?.into_iter().next())
    }

    #[instrument(name = "store_update_conversation", skip(self, patch), fields(conversation_id = %id))]
    pub async fn update_conversation(&self, id: &str, patch: ConversationPatch) -> Result<()> {
        let mut set = SetClause::new();
        if let Some(ref status) = patch.generation_status {
            set.bind("generation_status", status)?;
        }
        if let Some(ref generation_id) = patch.current_generation_id {
            set.bind("current_generation_id", generation_id)?;
        }
        if let Some(auto_approve) = patch.auto_approve {
            set.bind("auto_approve", &auto_approve)?;
        }
        if let Some(ref model) = patch.model {
            set.bind("model", model)?;
        }
        if let Some(ref sandbox_id) = patch.sandbox_id {
            set.bind("sandbox_id", sandbox_id)?;
        }
        if let Some(ref session_id) = patch.agent_session_id {
            set.bind("agent_session_id", session_id)?;
        }
        if let Some(ref title) = patch.title {
            set.bind("title", title)?;
        }
        if patch.clear_agent_session_id {
            set.raw("agent_session_id = NONE");
        }
        if set.is_empty() {
            return Ok(());
        }
        set.raw("updated_at = time::now()");

        let query = set.render("conversation", id);
        self.db.execute_with_params(&query, set.params).await
    }

    // =====================================================
    // Generations
    // =====================================================

    pub async fn insert_generation(&self, id: &str, create: GenerationCreate) -> Result<()> {
        self.db.create("generation", id, create).await?;
        Ok(())
    }

    pub async fn find_generation(&self, id: &str) -> Result<Option<Generation>> {
        let query = format!(
            "{} WHERE meta::id(id) = $id",
            queries::generation::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("id".to_string(), json!(id))])
            .await?;
        Ok(rows_to::<Generation>(rows)?.into_iter().next())
    }

    /// Resume reads include the conversation so owner checks and mirrors
    /// need no second round-trip.
    pub async fn find_generation_with_conversation(
        &self,
        id: &str,
    ) -> Result<Option<(Generation, Conversation)>> {
        let Some(generation) = self.find_generation(id).await? else {
            return Ok(None);
        };
        let Some(conversation) = self.find_conversation(&generation.conversation_id).await? else {
            warn!(
                generation_id = %id,
                conversation_id = %generation.conversation_id,
                "Generation references a missing conversation"
            );
            return Ok(None);
        };
        Ok(Some((generation, conversation)))
    }

    /// The admission invariant read: at most one non-terminal generation
    /// per conversation.
    pub async fn find_active_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Generation>> {
        let query = format!(
            "{} WHERE conversation_id = $cid AND status IN {} LIMIT 1",
            queries::generation::SELECT_BASE,
            queries::generation::ACTIVE_STATUSES
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("cid".to_string(), json!(conversation_id))])
            .await?;
        Ok(rows_to::<Generation>(rows)?.into_iter().next())
    }

    /// Applies a partial update as one atomic UPDATE statement.
    #[instrument(name = "store_update_generation", skip(self, patch), fields(generation_id = %id))]
    pub async fn update_generation(&self, id: &str, patch: GenerationPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut set = SetClause::new();
        if let Some(ref status) = patch.status {
            set.bind("status", status)?;
        }
        if let Some(ref parts) = patch.content_parts {
            set.bind("content_parts", parts)?;
        }
        if let Some(ref approval) = patch.pending_approval {
            set.bind("pending_approval", approval)?;
        }
        if let Some(ref auth) = patch.pending_auth {
            set.bind("pending_auth", auth)?;
        }
        if let Some(tokens) = patch.tokens_input {
            set.bind("tokens_input", &tokens)?;
        }
        if let Some(tokens) = patch.tokens_output {
            set.bind("tokens_output", &tokens)?;
        }
        if let Some(ref message) = patch.error_message {
            set.bind("error_message", message)?;
        }
        if let Some(ref sandbox_id) = patch.sandbox_id {
            set.bind("sandbox_id", sandbox_id)?;
        }
        if let Some(ref message_id) = patch.message_id {
            set.bind("message_id", message_id)?;
        }
        if let Some(is_paused) = patch.is_paused {
            set.bind("is_paused", &is_paused)?;
        }
        if patch.complete_now {
            set.raw("completed_at = time::now()");
        }
        if patch.cancel_requested_now {
            set.raw("cancel_requested_at = time::now()");
        }
        if patch.clear_pending_approval {
            set.raw("pending_approval = NONE");
        }
        if patch.clear_pending_auth {
            set.raw("pending_auth = NONE");
        }

        let query = set.render("generation", id);
        self.db.execute_with_params(&query, set.params).await
    }

    /// Generations stuck in `status` whose `started_at` is older than
    /// `max_age_secs`, for the stale reaper.
    pub async fn find_stale_generations(
        &self,
        status: GenerationStatus,
        max_age_secs: i64,
    ) -> Result<Vec<Generation>> {
        let query = format!(
            "{} WHERE status = $status AND started_at < time::now() - {}s",
            queries::generation::SELECT_BASE,
            max_age_secs
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("status".to_string(), json!(status))])
            .await?;
        rows_to(rows)
    }

    // =====================================================
    // Messages
    // =====================================================

    pub async fn insert_message(&self, id: &str, create: MessageCreate) -> Result<()> {
        self.db.create("message", id, create).await?;
        Ok(())
    }

    pub async fn find_message(&self, id: &str) -> Result<Option<Message>> {
        let query = format!("{} WHERE meta::id(id) = $id", queries::message::SELECT_BASE);
        let rows = self
            .db
            .query_json_with_params(&query, vec![("id".to_string(), json!(id))])
            .await?;
        Ok(rows_to::<Message>(rows)?.into_iter().next())
    }

    /// Latest user message of a conversation (the triggering turn for a
    /// resumed runner).
    pub async fn find_latest_user_message(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Message>> {
        let query = format!(
            "{} WHERE conversation_id = $cid AND role = 'user' ORDER BY created_at DESC LIMIT 1",
            queries::message::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("cid".to_string(), json!(conversation_id))])
            .await?;
        Ok(rows_to::<Message>(rows)?.into_iter().next())
    }

    /// All messages of a conversation, oldest first.
    pub async fn list_messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let query = format!(
            "{} WHERE conversation_id = $cid ORDER BY created_at ASC",
            queries::message::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("cid".to_string(), json!(conversation_id))])
            .await?;
        rows_to(rows)
    }

    pub async fn count_messages(&self, conversation_id: &str) -> Result<usize> {
        let rows = self
            .db
            .query_json_with_params(
                "SELECT count() AS total FROM message WHERE conversation_id = $cid GROUP ALL",
                vec![("cid".to_string(), json!(conversation_id))],
            )
            .await?;
        Ok(rows
            .first()
            .and_then(|r| r.get("total"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize)
    }

    // =====================================================
    // Queued messages
    // =====================================================

    pub async fn insert_queued_message(&self, id: &str, create: QueuedMessageCreate) -> Result<()> {
        self.db.create("queued_message", id, create).await?;
        Ok(())
    }

    pub async fn find_queued_message(&self, id: &str) -> Result<Option<QueuedMessage>> {
        let query = format!(
            "{} WHERE meta::id(id) = $id",
            queries::queued_message::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("id".to_string(), json!(id))])
            .await?;
        Ok(rows_to::<QueuedMessage>(rows)?.into_iter().next())
    }

    pub async fn list_queued_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<QueuedMessage>> {
        let query = format!(
            "{} WHERE conversation_id = $cid AND status IN ['queued', 'processing'] ORDER BY created_at ASC",
            queries::queued_message::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("cid".to_string(), json!(conversation_id))])
            .await?;
        rows_to(rows)
    }

    /// Deletes a queued row, but only while still `queued`.
    pub async fn remove_queued_message(&self, id: &str) -> Result<bool> {
        let rows = self
            .db
            .query_json_with_params(
                "DELETE queued_message WHERE meta::id(id) = $id AND status = 'queued' RETURN BEFORE",
                vec![("id".to_string(), json!(id))],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    /// Atomically claims the oldest `queued` row by CAS
    /// (`queued → processing`). Retries when another process wins the race.
    #[instrument(name = "store_claim_next_queued", skip(self), fields(conversation_id = %conversation_id))]
    pub async fn claim_next_queued(
        &self,
        conversation_id: &str,
    ) -> Result<Option<QueuedMessage>> {
        loop {
            let query = format!(
                "{} WHERE conversation_id = $cid AND status = 'queued' ORDER BY created_at ASC LIMIT 1",
                queries::queued_message::SELECT_BASE
            );
            let rows = self
                .db
                .query_json_with_params(&query, vec![("cid".to_string(), json!(conversation_id))])
                .await?;
            let Some(candidate) = rows_to::<QueuedMessage>(rows)?.into_iter().next() else {
                return Ok(None);
            };

            let claimed = self
                .db
                .query_json_with_params(
                    &format!(
                        "UPDATE queued_message:`{}` SET status = 'processing', updated_at = time::now() \
                         WHERE status = 'queued' RETURN AFTER",
                        candidate.id
                    ),
                    vec![],
                )
                .await?;
            if !claimed.is_empty() {
                debug!(queued_message_id = %candidate.id, "Claimed queued message");
                return Ok(Some(QueuedMessage {
                    status: QueuedMessageStatus::Processing,
                    ..candidate
                }));
            }
            // Another process claimed it first; try the next row.
        }
    }

    pub async fn mark_queued_message(
        &self,
        id: &str,
        status: QueuedMessageStatus,
        generation_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        let mut set = SetClause::new();
        set.bind("status", &status)?;
        if let Some(generation_id) = generation_id {
            set.bind("generation_id", &generation_id)?;
        }
        if let Some(error_message) = error_message {
            set.bind("error_message", &error_message)?;
        }
        set.raw("updated_at = time::now()");

        let query = set.render("queued_message", id);
        self.db.execute_with_params(&query, set.params).await
    }

    // =====================================================
    // Workflow runs
    // =====================================================

    pub async fn insert_workflow_run(&self, id: &str, user_id: &str, name: &str) -> Result<()> {
        self.db
            .create(
                "workflow_run",
                id,
                json!({
                    "user_id": user_id,
                    "name": name,
                    "status": WorkflowRunStatus::Running,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn find_workflow_run(&self, id: &str) -> Result<Option<WorkflowRun>> {
        let query = format!(
            "{} WHERE meta::id(id) = $id",
            queries::workflow_run::SELECT_BASE
        );
        let rows = self
            .db
            .query_json_with_params(&query, vec![("id".to_string(), json!(id))])
            .await?;
        Ok(rows_to::<WorkflowRun>(rows)?.into_iter().next())
    }

    pub async fn update_workflow_run_status(
        &self,
        id: &str,
        status: WorkflowRunStatus,
    ) -> Result<()> {
        self.db
            .execute_with_params(
                &format!(
                    "UPDATE workflow_run:`{}` SET status = $status, updated_at = time::now()",
                    id
                ),
                vec![("status".to_string(), json!(status))],
            )
            .await
    }

    pub async fn set_workflow_run_conversation(
        &self,
        id: &str,
        conversation_id: &str,
    ) -> Result<()> {
        self.db
            .execute_with_params(
                &format!(
                    "UPDATE workflow_run:`{}` SET conversation_id = $cid, updated_at = time::now()",
                    id
                ),
                vec![("cid".to_string(), json!(conversation_id))],
            )
            .await
    }

    // =====================================================
    // Skill drafts
    // =====================================================

    pub async fn insert_skill_draft(
        &self,
        id: &str,
        user_id: &str,
        generation_id: &str,
        draft: Value,
    ) -> Result<()> {
        self.db
            .create(
                "skill_draft",
                id,
                json!({
                    "user_id": user_id,
                    "generation_id": generation_id,
                    "draft": draft,
                }),
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConversationStatus, ExecutionPolicy};
    use tempfile::tempdir;

    async fn test_store(name: &str) -> GenerationStore {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(name);
        let endpoint = format!("rocksdb://{}", db_path.display());
        std::mem::forget(temp_dir);

        let db = Arc::new(
            DBClient::connect(&endpoint)
                .await
                .expect("Failed to create test DB"),
        );
        db.initialize_schema().await.expect("Schema init failed");
        GenerationStore::new(db)
    }

    async fn seed_conversation(store: &GenerationStore, id: &str) {
        store
            .insert_conversation(
                id,
                ConversationCreate::chat("user_1".to_string(), None, false),
            )
            .await
            .expect("Conversation insert failed");
    }

    #[tokio::test]
    async fn test_generation_insert_and_find() {
        let store = test_store("gen_crud").await;
        seed_conversation(&store, "conv_1").await;

        store
            .insert_generation(
                "gen_1",
                GenerationCreate::new("conv_1".to_string(), ExecutionPolicy::default()),
            )
            .await
            .expect("Generation insert failed");

        let generation = store
            .find_generation("gen_1")
            .await
            .expect("Find failed")
            .expect("Generation should exist");
        assert_eq!(generation.id, "gen_1");
        assert_eq!(generation.conversation_id, "conv_1");
        assert_eq!(generation.status, GenerationStatus::Running);
        assert!(generation.content_parts.is_empty());
        assert!(generation.pending_approval.is_none());

        assert!(store
            .find_generation("missing")
            .await
            .expect("Find failed")
            .is_none());
    }

    #[tokio::test]
    async fn test_find_active_for_conversation() {
        let store = test_store("gen_active").await;
        seed_conversation(&store, "conv_1").await;

        assert!(store
            .find_active_for_conversation("conv_1")
            .await
            .expect("Query failed")
            .is_none());

        store
            .insert_generation(
                "gen_1",
                GenerationCreate::new("conv_1".to_string(), ExecutionPolicy::default()),
            )
            .await
            .expect("Insert failed");

        let active = store
            .find_active_for_conversation("conv_1")
            .await
            .expect("Query failed");
        assert!(active.is_some(), "Running generation should be active");

        // Terminal status drops it out of the active set
        store
            .update_generation(
                "gen_1",
                GenerationPatch {
                    status: Some(GenerationStatus::Completed),
                    complete_now: true,
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        assert!(store
            .find_active_for_conversation("conv_1")
            .await
            .expect("Query failed")
            .is_none());

        let generation = store
            .find_generation("gen_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert!(generation.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_generation_atomic_status_and_clear() {
        use crate::models::PendingAuth;
        use chrono::{Duration, Utc};

        let store = test_store("gen_patch").await;
        seed_conversation(&store, "conv_1").await;
        store
            .insert_generation(
                "gen_1",
                GenerationCreate::new("conv_1".to_string(), ExecutionPolicy::default()),
            )
            .await
            .expect("Insert failed");

        let now = Utc::now();
        store
            .update_generation(
                "gen_1",
                GenerationPatch {
                    status: Some(GenerationStatus::AwaitingAuth),
                    pending_auth: Some(PendingAuth {
                        integrations: vec!["slack".to_string()],
                        connected_integrations: vec![],
                        requested_at: now,
                        expires_at: now + Duration::seconds(600),
                        reason: None,
                    }),
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        let generation = store
            .find_generation("gen_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(generation.status, GenerationStatus::AwaitingAuth);
        assert!(generation.pending_auth.is_some());
        assert!(generation.pending_state_consistent());

        store
            .update_generation(
                "gen_1",
                GenerationPatch {
                    status: Some(GenerationStatus::Cancelled),
                    complete_now: true,
                    clear_pending_auth: true,
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        let generation = store
            .find_generation("gen_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(generation.status, GenerationStatus::Cancelled);
        assert!(generation.pending_auth.is_none());
        assert!(generation.completed_at.is_some());
        assert!(generation.pending_state_consistent());
    }

    #[tokio::test]
    async fn test_content_parts_roundtrip_through_store() {
        use crate::models::ContentPart;
        use serde_json::json;

        let store = test_store("gen_parts").await;
        seed_conversation(&store, "conv_1").await;
        store
            .insert_generation(
                "gen_1",
                GenerationCreate::new("conv_1".to_string(), ExecutionPolicy::default()),
            )
            .await
            .expect("Insert failed");

        let parts = vec![
            ContentPart::Text {
                text: "Working on it".to_string(),
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
                content: json!({"stdout": "file.txt"}),
            },
        ];

        store
            .update_generation(
                "gen_1",
                GenerationPatch {
                    content_parts: Some(parts.clone()),
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        let generation = store
            .find_generation("gen_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(generation.content_parts, parts);
    }

    #[tokio::test]
    async fn test_queued_message_claim_cas() {
        let store = test_store("queued_cas").await;
        seed_conversation(&store, "conv_1").await;

        // Claiming an empty queue yields nothing
        assert!(store
            .claim_next_queued("conv_1")
            .await
            .expect("Claim failed")
            .is_none());

        store
            .insert_queued_message(
                "qm_1",
                QueuedMessageCreate::new(
                    "conv_1".to_string(),
                    "user_1".to_string(),
                    "first".to_string(),
                    vec![],
                    vec![],
                ),
            )
            .await
            .expect("Insert failed");
        store
            .insert_queued_message(
                "qm_2",
                QueuedMessageCreate::new(
                    "conv_1".to_string(),
                    "user_1".to_string(),
                    "second".to_string(),
                    vec![],
                    vec![],
                ),
            )
            .await
            .expect("Insert failed");

        let claimed = store
            .claim_next_queued("conv_1")
            .await
            .expect("Claim failed")
            .expect("Should claim the oldest row");
        assert_eq!(claimed.content, "first");
        assert_eq!(claimed.status, QueuedMessageStatus::Processing);

        // The claimed row is no longer claimable; next claim gets qm_2
        let next = store
            .claim_next_queued("conv_1")
            .await
            .expect("Claim failed")
            .expect("Second row should claim");
        assert_eq!(next.content, "second");

        assert!(store
            .claim_next_queued("conv_1")
            .await
            .expect("Claim failed")
            .is_none());
    }

    #[tokio::test]
    async fn test_mark_queued_message() {
        let store = test_store("queued_mark").await;
        seed_conversation(&store, "conv_1").await;
        store
            .insert_queued_message(
                "qm_1",
                QueuedMessageCreate::new(
                    "conv_1".to_string(),
                    "user_1".to_string(),
                    "buffered".to_string(),
                    vec![],
                    vec![],
                ),
            )
            .await
            .expect("Insert failed");

        store
            .mark_queued_message("qm_1", QueuedMessageStatus::Sent, Some("gen_9"), None)
            .await
            .expect("Mark failed");

        let row = store
            .find_queued_message("qm_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(row.status, QueuedMessageStatus::Sent);
        assert_eq!(row.generation_id.as_deref(), Some("gen_9"));
    }

    #[tokio::test]
    async fn test_remove_queued_only_while_queued() {
        let store = test_store("queued_remove").await;
        seed_conversation(&store, "conv_1").await;
        store
            .insert_queued_message(
                "qm_1",
                QueuedMessageCreate::new(
                    "conv_1".to_string(),
                    "user_1".to_string(),
                    "buffered".to_string(),
                    vec![],
                    vec![],
                ),
            )
            .await
            .expect("Insert failed");

        store
            .mark_queued_message("qm_1", QueuedMessageStatus::Processing, None, None)
            .await
            .expect("Mark failed");

        assert!(
            !store
                .remove_queued_message("qm_1")
                .await
                .expect("Remove failed"),
            "Processing rows must not be removable"
        );
    }

    #[tokio::test]
    async fn test_conversation_patch_and_session_clear() {
        let store = test_store("conv_patch").await;
        seed_conversation(&store, "conv_1").await;

        store
            .update_conversation(
                "conv_1",
                ConversationPatch {
                    generation_status: Some(ConversationStatus::Generating),
                    agent_session_id: Some("sess_1".to_string()),
                    current_generation_id: Some("gen_1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        let conversation = store
            .find_conversation("conv_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(
            conversation.generation_status,
            ConversationStatus::Generating
        );
        assert_eq!(conversation.agent_session_id.as_deref(), Some("sess_1"));

        store
            .update_conversation(
                "conv_1",
                ConversationPatch {
                    clear_agent_session_id: true,
                    ..Default::default()
                },
            )
            .await
            .expect("Update failed");

        let conversation = store
            .find_conversation("conv_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert!(conversation.agent_session_id.is_none());
    }

    #[tokio::test]
    async fn test_messages_and_latest_user_lookup() {
        let store = test_store("messages").await;
        seed_conversation(&store, "conv_1").await;

        store
            .insert_message(
                "msg_1",
                MessageCreate::user("conv_1".to_string(), "first".to_string(), vec![]),
            )
            .await
            .expect("Insert failed");
        // Spacing the rows out keeps created_at ordering deterministic
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        store
            .insert_message(
                "msg_2",
                MessageCreate::user("conv_1".to_string(), "second".to_string(), vec![]),
            )
            .await
            .expect("Insert failed");

        let latest = store
            .find_latest_user_message("conv_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(latest.content, "second");

        assert_eq!(
            store.count_messages("conv_1").await.expect("Count failed"),
            2
        );
    }

    #[tokio::test]
    async fn test_workflow_run_mirror() {
        let store = test_store("wf_run").await;
        store
            .insert_workflow_run("run_1", "user_1", "Nightly digest")
            .await
            .expect("Insert failed");

        store
            .update_workflow_run_status("run_1", WorkflowRunStatus::Cancelled)
            .await
            .expect("Update failed");

        let run = store
            .find_workflow_run("run_1")
            .await
            .expect("Find failed")
            .expect("Should exist");
        assert_eq!(run.status, WorkflowRunStatus::Cancelled);
        assert_eq!(run.name, "Nightly digest");
    }

    #[tokio::test]
    async fn test_find_stale_generations() {
        let store = test_store("stale").await;
        seed_conversation(&store, "conv_1").await;
        store
            .insert_generation(
                "gen_1",
                GenerationCreate::new("conv_1".to_string(), ExecutionPolicy::default()),
            )
            .await
            .expect("Insert failed");

        // Fresh generation is not stale at any sane threshold
        let stale = store
            .find_stale_generations(GenerationStatus::Running, 3600)
            .await
            .expect("Query failed");
        assert!(stale.is_empty());

        // With a zero-age threshold everything running qualifies
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let stale = store
            .find_stale_generations(GenerationStatus::Running, 1)
            .await
            .expect("Query failed");
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "gen_1");
    }
}
