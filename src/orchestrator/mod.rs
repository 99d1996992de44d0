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

//! # Generation Orchestrator
//!
//! The durable, multi-process state machine that drives one conversational
//! generation from admission through sandbox preparation, prompt
//! streaming, interactive approval/auth suspensions, and finalize.
//!
//! [`Orchestrator`] is the transport-neutral operation surface; routing,
//! authentication middleware, and UI live outside this crate.

pub mod admission;
pub mod approval;
pub mod normalizer;
pub mod postprocess;
pub mod prep;
pub mod queued;
pub mod reaper;
pub mod runner;
pub mod subscription;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult, TimeoutKind};
use crate::models::{
    ApprovalDecision, Conversation, Generation, GenerationEvent, GenerationPatch,
    GenerationStatus, QueuedMessage, QueuedMessageCreate,
};
use crate::queue::{Job, JobKind};
use crate::state::OrchestratorState;

pub use admission::{
    FileUpload, StartGenerationRequest, StartGenerationResponse, StartWorkflowGenerationRequest,
};
pub use approval::{ApprovalManager, ApprovalRequest, ApprovalWait, AuthWait};
pub use reaper::ReapCounts;

/// Transport-neutral orchestrator operations.
#[derive(Clone)]
pub struct Orchestrator {
    state: Arc<OrchestratorState>,
}

impl Orchestrator {
    pub fn new(state: Arc<OrchestratorState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<OrchestratorState> {
        &self.state
    }

    // =====================================================
    // Start / cancel / resume
    // =====================================================

    /// Admits a chat generation. See [`admission::start_generation`].
    pub async fn start_generation(
        &self,
        request: StartGenerationRequest,
    ) -> OrchestratorResult<StartGenerationResponse> {
        admission::start_generation(self.state.clone(), request).await
    }

    /// Admits a workflow generation.
    pub async fn start_workflow_generation(
        &self,
        request: StartWorkflowGenerationRequest,
    ) -> OrchestratorResult<StartGenerationResponse> {
        admission::start_workflow_generation(self.state.clone(), request).await
    }

    /// Requests cancellation: writes the durable flag and aborts any
    /// local context. The runner observes the flag within one poll.
    #[instrument(name = "cancel_generation", skip(self), fields(generation_id = %generation_id))]
    pub async fn cancel_generation(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<bool> {
        let Some((generation, _conversation)) =
            self.owned_generation(generation_id, user_id).await?
        else {
            return Ok(false);
        };

        if !generation.status.is_terminal() {
            self.state
                .store
                .update_generation(
                    generation_id,
                    GenerationPatch {
                        cancel_requested_now: true,
                        ..Default::default()
                    },
                )
                .await?;
        }
        self.state.cancel_active(generation_id).await;
        info!("Cancellation requested");
        Ok(true)
    }

    /// Resumes a paused or orphaned generation by handing it back to a
    /// runner.
    #[instrument(name = "resume_generation", skip(self), fields(generation_id = %generation_id))]
    pub async fn resume_generation(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<bool> {
        let Some((generation, conversation)) =
            self.owned_generation(generation_id, user_id).await?
        else {
            return Ok(false);
        };

        if generation.status.is_terminal() {
            return Ok(false);
        }
        if self.state.is_active(generation_id).await {
            debug!("Generation already active in this process");
            return Ok(true);
        }

        if generation.status == GenerationStatus::Paused {
            self.state
                .store
                .update_generation(
                    generation_id,
                    GenerationPatch {
                        status: Some(GenerationStatus::Running),
                        is_paused: Some(false),
                        ..Default::default()
                    },
                )
                .await?;
            approval::mirror_status(&self.state, &generation, GenerationStatus::Running).await?;
        }

        if self.state.config.defer_to_worker {
            let kind = match conversation.kind {
                crate::models::ConversationKind::Chat => JobKind::RunChat,
                crate::models::ConversationKind::Workflow => JobKind::RunWorkflow,
            };
            self.state
                .queue
                .enqueue(
                    kind,
                    json!({ "generation_id": generation_id }),
                    &format!("resume:{}:{}", generation_id, Uuid::new_v4()),
                    Duration::ZERO,
                )
                .await?;
        } else {
            let state = self.state.clone();
            let generation_id = generation_id.to_string();
            tokio::spawn(async move {
                runner::run(state, &generation_id).await;
            });
        }
        info!("Generation resumed");
        Ok(true)
    }

    /// Worker entry: runs a generation under the lease.
    pub async fn run_generation(&self, generation_id: &str) {
        runner::run(self.state.clone(), generation_id).await;
    }

    // =====================================================
    // Approvals / auth
    // =====================================================

    /// Records a user decision on the pending approval. Returns whether
    /// the submission matched the open request.
    pub async fn submit_approval(
        &self,
        generation_id: &str,
        tool_use_id: &str,
        decision: ApprovalDecision,
        user_id: &str,
        question_answers: Option<Vec<String>>,
    ) -> OrchestratorResult<bool> {
        ApprovalManager::new(self.state.clone())
            .submit_approval(
                generation_id,
                tool_use_id,
                decision,
                user_id,
                question_answers,
            )
            .await
    }

    /// Records an integration auth outcome.
    pub async fn submit_auth_result(
        &self,
        generation_id: &str,
        integration: &str,
        success: bool,
        user_id: &str,
    ) -> OrchestratorResult<bool> {
        ApprovalManager::new(self.state.clone())
            .submit_auth_result(generation_id, integration, success, user_id)
            .await
    }

    /// Internal (plugin-facing): persists a pending approval for the
    /// given surface and blocks until it resolves.
    pub async fn wait_for_approval(
        &self,
        generation_id: &str,
        request: ApprovalRequest,
    ) -> OrchestratorResult<ApprovalWait> {
        let manager = ApprovalManager::new(self.state.clone());
        let Some(generation) = self.state.store.find_generation(generation_id).await? else {
            return Err(OrchestratorError::NotFound(generation_id.to_string()));
        };
        let tool_use_id = request.tool_use_id.clone();
        manager.request_approval(&generation, &request).await?;
        manager
            .wait_for_approval(generation_id, &tool_use_id, &CancellationToken::new())
            .await
    }

    /// Internal (plugin-facing): persists pending auth for the given
    /// integrations and blocks until it resolves.
    pub async fn wait_for_auth(
        &self,
        generation_id: &str,
        integrations: Vec<String>,
        reason: Option<String>,
    ) -> OrchestratorResult<AuthWait> {
        let manager = ApprovalManager::new(self.state.clone());
        let Some(generation) = self.state.store.find_generation(generation_id).await? else {
            return Err(OrchestratorError::NotFound(generation_id.to_string()));
        };
        manager
            .wait_for_auth(&generation, integrations, reason, &CancellationToken::new())
            .await
    }

    // =====================================================
    // Subscriptions
    // =====================================================

    /// Subscribes to a generation's replayable event stream.
    pub async fn subscribe_to_generation(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<ReceiverStream<GenerationEvent>> {
        subscription::subscribe(self.state.clone(), generation_id, user_id).await
    }

    // =====================================================
    // Queued messages
    // =====================================================

    /// Buffers a user turn behind the conversation's active generation.
    #[instrument(name = "enqueue_conversation_message", skip(self, content, uploads), fields(conversation_id = %conversation_id))]
    pub async fn enqueue_conversation_message(
        &self,
        conversation_id: &str,
        user_id: &str,
        content: String,
        uploads: Vec<FileUpload>,
        selected_platform_skills: Vec<String>,
    ) -> OrchestratorResult<String> {
        let conversation = self.owned_conversation(conversation_id, user_id).await?;

        let mut attachments = Vec::with_capacity(uploads.len());
        for upload in &uploads {
            let id = Uuid::new_v4().to_string();
            self.state
                .objects
                .put(&id, &upload.data, &upload.content_type)
                .await?;
            attachments.push(crate::models::FileAttachment {
                id,
                name: upload.name.clone(),
                content_type: upload.content_type.clone(),
            });
        }

        let queued_id = Uuid::new_v4().to_string();
        self.state
            .store
            .insert_queued_message(
                &queued_id,
                QueuedMessageCreate::new(
                    conversation.id.clone(),
                    user_id.to_string(),
                    content,
                    attachments,
                    selected_platform_skills,
                ),
            )
            .await?;

        // Kick the processor; it exits immediately when a generation is
        // still active.
        self.state
            .queue
            .enqueue(
                JobKind::QueuedMessageProcess,
                json!({ "conversation_id": conversation.id }),
                &format!("queued:{}:{}", conversation.id, queued_id),
                Duration::ZERO,
            )
            .await?;

        info!(queued_message_id = %queued_id, "Message queued");
        Ok(queued_id)
    }

    /// Lists the pending queued rows of a conversation.
    pub async fn list_conversation_queued_messages(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<Vec<QueuedMessage>> {
        self.owned_conversation(conversation_id, user_id).await?;
        Ok(self.state.store.list_queued_messages(conversation_id).await?)
    }

    /// Removes a queued row that has not been claimed yet.
    pub async fn remove_conversation_queued_message(
        &self,
        queued_id: &str,
        conversation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<bool> {
        self.owned_conversation(conversation_id, user_id).await?;
        let Some(row) = self.state.store.find_queued_message(queued_id).await? else {
            return Ok(false);
        };
        if row.conversation_id != conversation_id {
            return Err(OrchestratorError::AccessDenied);
        }
        Ok(self.state.store.remove_queued_message(queued_id).await?)
    }

    /// Worker entry: drains the conversation's queued rows.
    pub async fn process_conversation_queued_messages(
        &self,
        conversation_id: &str,
    ) -> OrchestratorResult<()> {
        queued::process_queued_messages(self.state.clone(), conversation_id).await
    }

    // =====================================================
    // Background maintenance
    // =====================================================

    /// Worker entry: approval/auth expiry.
    pub async fn process_generation_timeout(
        &self,
        generation_id: &str,
        kind: TimeoutKind,
    ) -> OrchestratorResult<()> {
        ApprovalManager::new(self.state.clone())
            .process_generation_timeout(generation_id, kind)
            .await
    }

    /// Worker entry: fires when preparation should long be over; emits an
    /// observability signal when the generation never got a sandbox.
    #[instrument(name = "preparing_stuck_check", skip(self), fields(generation_id = %generation_id))]
    pub async fn process_preparing_stuck_check(
        &self,
        generation_id: &str,
    ) -> OrchestratorResult<()> {
        let Some(generation) = self.state.store.find_generation(generation_id).await? else {
            return Ok(());
        };
        if generation.status != GenerationStatus::Running || generation.sandbox_id.is_some() {
            debug!("Generation progressed past preparation");
            return Ok(());
        }

        warn!(
            generation_id = %generation_id,
            conversation_id = %generation.conversation_id,
            "Generation stuck in preparation"
        );

        if let Some(ref monitor_url) = self.state.config.monitor_url {
            let body = json!({
                "kind": "generation:preparing-stuck",
                "generation_id": generation_id,
                "conversation_id": generation.conversation_id,
            });
            let result = reqwest::Client::new()
                .post(monitor_url)
                .json(&body)
                .timeout(Duration::from_secs(10))
                .send()
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Stuck-check monitor ping failed");
            }
        }
        Ok(())
    }

    /// Worker entry: finalizes abandoned generations.
    pub async fn reap_stale_generations(&self) -> OrchestratorResult<ReapCounts> {
        reaper::reap_stale_generations(self.state.clone()).await
    }

    // =====================================================
    // Worker dispatch
    // =====================================================

    /// Dispatches a claimed queue job to its handler.
    #[instrument(name = "dispatch_job", skip(self, job), fields(job_id = %job.id, kind = %job.kind))]
    pub async fn dispatch_job(&self, job: &Job) -> OrchestratorResult<()> {
        match job.kind {
            JobKind::RunChat | JobKind::RunWorkflow => {
                let generation_id = payload_str(&job.payload, "generation_id")?;
                self.run_generation(&generation_id).await;
                Ok(())
            }
            JobKind::ApprovalTimeout => {
                let generation_id = payload_str(&job.payload, "generation_id")?;
                self.process_generation_timeout(&generation_id, TimeoutKind::Approval)
                    .await
            }
            JobKind::AuthTimeout => {
                let generation_id = payload_str(&job.payload, "generation_id")?;
                self.process_generation_timeout(&generation_id, TimeoutKind::Auth)
                    .await
            }
            JobKind::PreparingStuckCheck => {
                let generation_id = payload_str(&job.payload, "generation_id")?;
                self.process_preparing_stuck_check(&generation_id).await
            }
            JobKind::QueuedMessageProcess => {
                let conversation_id = payload_str(&job.payload, "conversation_id")?;
                self.process_conversation_queued_messages(&conversation_id)
                    .await
            }
        }
    }

    // =====================================================
    // Helpers
    // =====================================================

    /// Owner-checked generation lookup: `Ok(None)` for unknown ids,
    /// `AccessDenied` for foreign ones.
    async fn owned_generation(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<Option<(Generation, Conversation)>> {
        let Some((generation, conversation)) = self
            .state
            .store
            .find_generation_with_conversation(generation_id)
            .await?
        else {
            return Ok(None);
        };
        if conversation.user_id != user_id {
            return Err(OrchestratorError::AccessDenied);
        }
        Ok(Some((generation, conversation)))
    }

    async fn owned_conversation(
        &self,
        conversation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<Conversation> {
        let Some(conversation) = self.state.store.find_conversation(conversation_id).await? else {
            return Err(OrchestratorError::NotFound(conversation_id.to_string()));
        };
        if conversation.user_id != user_id {
            return Err(OrchestratorError::AccessDenied);
        }
        Ok(conversation)
    }
}

fn payload_str(payload: &serde_json::Value, field: &str) -> OrchestratorResult<String> {
    payload
        .get(field)
        .and_then(serde_json::Value::as_str)
        .map(String::from)
        .ok_or_else(|| {
            OrchestratorError::NotFound(format!("job payload field `{}` missing", field))
        })
}
