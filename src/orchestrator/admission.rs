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

//! Admission: validating and persisting a new generation, then handing it
//! to a runner (in-process or via the worker queue).

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    Conversation, ConversationCreate, ConversationKind, ConversationPatch, ConversationStatus,
    ExecutionPolicy, FileAttachment, GenerationCreate, MessageCreate,
};
use crate::queue::JobKind;
use crate::state::OrchestratorState;

use super::runner;

/// A file carried with a start request, not yet in the object store.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Input for `start_generation`.
#[derive(Debug, Clone, Default)]
pub struct StartGenerationRequest {
    pub conversation_id: Option<String>,
    pub content: String,
    pub model: Option<String>,
    pub user_id: String,
    pub auto_approve: Option<bool>,
    pub allowed_integrations: Option<Vec<String>>,
    pub allowed_custom_integrations: Option<Vec<String>>,
    /// New files to upload and attach.
    pub uploads: Vec<FileUpload>,
    /// Already-uploaded attachments (queued messages carry these).
    pub attachments: Vec<FileAttachment>,
    pub selected_platform_skills: Vec<String>,
}

/// Input for `start_workflow_generation`.
#[derive(Debug, Clone)]
pub struct StartWorkflowGenerationRequest {
    pub workflow_run_id: String,
    pub content: String,
    pub model: Option<String>,
    pub user_id: String,
    pub auto_approve: bool,
    pub allowed_integrations: Vec<String>,
    pub allowed_custom_integrations: Option<Vec<String>>,
}

/// Identifiers of the admitted generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartGenerationResponse {
    pub generation_id: String,
    pub conversation_id: String,
}

/// Admits a chat generation.
#[instrument(name = "start_generation", skip(state, request), fields(user_id = %request.user_id, conversation_id = ?request.conversation_id))]
pub async fn start_generation(
    state: Arc<OrchestratorState>,
    request: StartGenerationRequest,
) -> OrchestratorResult<StartGenerationResponse> {
    validate_model(&state, request.model.as_deref())?;

    // Load-or-create the conversation, with the single-active invariant
    // checked against durable state before anything is written.
    let conversation = match request.conversation_id {
        Some(ref conversation_id) => {
            let Some(conversation) = state.store.find_conversation(conversation_id).await? else {
                return Err(OrchestratorError::AccessDenied);
            };
            if conversation.user_id != request.user_id {
                return Err(OrchestratorError::AccessDenied);
            }
            if state
                .store
                .find_active_for_conversation(conversation_id)
                .await?
                .is_some()
            {
                return Err(OrchestratorError::ActiveExists(conversation_id.clone()));
            }
            conversation
        }
        None => {
            let conversation_id = Uuid::new_v4().to_string();
            state
                .store
                .insert_conversation(
                    &conversation_id,
                    ConversationCreate::chat(
                        request.user_id.clone(),
                        request.model.clone(),
                        request.auto_approve.unwrap_or(false),
                    ),
                )
                .await?;
            state
                .store
                .find_conversation(&conversation_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(conversation_id.clone()))?
        }
    };

    // Persist settings the caller changed on an existing conversation
    let mut conversation_patch = ConversationPatch::default();
    if let Some(auto_approve) = request.auto_approve {
        if auto_approve != conversation.auto_approve {
            conversation_patch.auto_approve = Some(auto_approve);
        }
    }
    if let Some(ref model) = request.model {
        if conversation.model.as_deref() != Some(model.as_str()) {
            conversation_patch.model = Some(model.clone());
        }
    }

    let auto_approve = request.auto_approve.unwrap_or(conversation.auto_approve);
    let mut attachments = request.attachments.clone();
    attachments.extend(upload_files(&state, &request.uploads).await?);

    // User turn goes in first so a crashed runner can still see it
    let message_id = Uuid::new_v4().to_string();
    state
        .store
        .insert_message(
            &message_id,
            MessageCreate::user(
                conversation.id.clone(),
                request.content.clone(),
                attachments.clone(),
            ),
        )
        .await?;

    let policy = ExecutionPolicy {
        allowed_integrations: request.allowed_integrations.unwrap_or_default(),
        allowed_custom_integrations: request.allowed_custom_integrations.unwrap_or_default(),
        auto_approve,
        selected_platform_skills: request.selected_platform_skills.clone(),
        file_attachments: attachments,
    };

    let generation_id = Uuid::new_v4().to_string();
    state
        .store
        .insert_generation(
            &generation_id,
            GenerationCreate::new(conversation.id.clone(), policy),
        )
        .await?;

    conversation_patch.generation_status = Some(ConversationStatus::Generating);
    conversation_patch.current_generation_id = Some(generation_id.clone());
    state
        .store
        .update_conversation(&conversation.id, conversation_patch)
        .await?;

    schedule_run(&state, &generation_id, ConversationKind::Chat).await?;

    info!(generation_id = %generation_id, "Generation admitted");
    Ok(StartGenerationResponse {
        generation_id,
        conversation_id: conversation.id,
    })
}

/// Admits a workflow generation. Analogous to the chat path, but the
/// conversation is of workflow type, auto-approve is a required input,
/// and the title comes from the workflow run.
#[instrument(name = "start_workflow_generation", skip(state, request), fields(workflow_run_id = %request.workflow_run_id))]
pub async fn start_workflow_generation(
    state: Arc<OrchestratorState>,
    request: StartWorkflowGenerationRequest,
) -> OrchestratorResult<StartGenerationResponse> {
    validate_model(&state, request.model.as_deref())?;

    let Some(run) = state
        .store
        .find_workflow_run(&request.workflow_run_id)
        .await?
    else {
        return Err(OrchestratorError::NotFound(request.workflow_run_id));
    };
    if run.user_id != request.user_id {
        return Err(OrchestratorError::AccessDenied);
    }

    let conversation: Conversation = match run.conversation_id {
        Some(ref conversation_id) => state
            .store
            .find_conversation(conversation_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(conversation_id.clone()))?,
        None => {
            let conversation_id = Uuid::new_v4().to_string();
            state
                .store
                .insert_conversation(
                    &conversation_id,
                    ConversationCreate::workflow(
                        request.user_id.clone(),
                        run.name.clone(),
                        request.auto_approve,
                    ),
                )
                .await?;
            state
                .store
                .set_workflow_run_conversation(&run.id, &conversation_id)
                .await?;
            state
                .store
                .find_conversation(&conversation_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(conversation_id.clone()))?
        }
    };

    if state
        .store
        .find_active_for_conversation(&conversation.id)
        .await?
        .is_some()
    {
        return Err(OrchestratorError::ActiveExists(conversation.id.clone()));
    }

    let message_id = Uuid::new_v4().to_string();
    state
        .store
        .insert_message(
            &message_id,
            MessageCreate::user(conversation.id.clone(), request.content.clone(), vec![]),
        )
        .await?;

    let policy = ExecutionPolicy {
        allowed_integrations: request.allowed_integrations,
        allowed_custom_integrations: request.allowed_custom_integrations.unwrap_or_default(),
        auto_approve: request.auto_approve,
        selected_platform_skills: Vec::new(),
        file_attachments: Vec::new(),
    };

    let generation_id = Uuid::new_v4().to_string();
    let mut create = GenerationCreate::new(conversation.id.clone(), policy);
    create.workflow_run_id = Some(run.id.clone());
    state
        .store
        .insert_generation(&generation_id, create)
        .await?;

    state
        .store
        .update_conversation(
            &conversation.id,
            ConversationPatch {
                generation_status: Some(ConversationStatus::Generating),
                current_generation_id: Some(generation_id.clone()),
                ..Default::default()
            },
        )
        .await?;

    schedule_run(&state, &generation_id, ConversationKind::Workflow).await?;

    info!(generation_id = %generation_id, "Workflow generation admitted");
    Ok(StartGenerationResponse {
        generation_id,
        conversation_id: conversation.id,
    })
}

/// Schedules the stuck-check and hands the generation to a runner.
async fn schedule_run(
    state: &Arc<OrchestratorState>,
    generation_id: &str,
    kind: ConversationKind,
) -> OrchestratorResult<()> {
    state
        .queue
        .enqueue(
            JobKind::PreparingStuckCheck,
            json!({ "generation_id": generation_id }),
            &format!("stuck:{}", generation_id),
            state.config.preparing_timeout,
        )
        .await?;

    if state.config.defer_to_worker {
        let job_kind = match kind {
            ConversationKind::Chat => JobKind::RunChat,
            ConversationKind::Workflow => JobKind::RunWorkflow,
        };
        state
            .queue
            .enqueue(
                job_kind,
                json!({ "generation_id": generation_id }),
                &format!("run:{}", generation_id),
                Duration::ZERO,
            )
            .await?;
    } else {
        let state = state.clone();
        let generation_id = generation_id.to_string();
        tokio::spawn(async move {
            runner::run(state, &generation_id).await;
        });
    }
    Ok(())
}

async fn upload_files(
    state: &Arc<OrchestratorState>,
    uploads: &[FileUpload],
) -> OrchestratorResult<Vec<FileAttachment>> {
    let mut attachments = Vec::with_capacity(uploads.len());
    for upload in uploads {
        let id = Uuid::new_v4().to_string();
        state
            .objects
            .put(&id, &upload.data, &upload.content_type)
            .await?;
        attachments.push(FileAttachment {
            id,
            name: upload.name.clone(),
            content_type: upload.content_type.clone(),
        });
    }
    Ok(attachments)
}

fn validate_model(state: &OrchestratorState, model: Option<&str>) -> OrchestratorResult<()> {
    let Some(model) = model else {
        return Ok(());
    };
    if model.is_empty() {
        return Err(OrchestratorError::ModelNotAllowed(model.to_string()));
    }
    let allowed = &state.config.allowed_models;
    if !allowed.is_empty() && !allowed.iter().any(|m| m == model) {
        warn!(model = %model, "Rejected model outside the allow-list");
        return Err(OrchestratorError::ModelNotAllowed(model.to_string()));
    }
    Ok(())
}
