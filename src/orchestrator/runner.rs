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

//! Generation runner: the per-generation phase state machine.
//!
//! One runner owns a generation's live execution, guarded by the
//! distributed lease. Everything that matters survives in the durable
//! store; the runner can die at any await point and a successor resumes
//! from the persisted state.
//!
//! Phases: preparation (agent init) → pre-prompt setup → prompt + event
//! ingest (two tasks joined by `select!`) → post-processing → finalize.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{generation as gen_const, lease as lease_const};
use crate::error::OrchestratorResult;
use crate::integrations;
use crate::lease::generation_lease_key;
use crate::models::{
    ApprovalStatus, ContentPart, Conversation, ConversationKind, ConversationPatch, DonePayload,
    Generation, GenerationEvent, GenerationPatch, GenerationStatus, GenerationTimings,
    MessageCreate, ProviderRequestKind, SandboxFile,
};
use crate::provider::{
    AgentSession, InitStage, PermissionReply, PermissionRequest, PromptPart, PromptRequest,
    QuestionRequest, SessionOptions, SessionRequest,
};
use crate::queue::JobKind;
use crate::state::OrchestratorState;

use super::approval::{mirror_status, ApprovalManager, ApprovalRequest, ApprovalWait, AuthWait};
use super::normalizer::{EventNormalizer, NormalizerAction};
use super::{postprocess, prep};

// Phase timeline marks
const GENERATION_STARTED: &str = "generation_started";
const AGENT_INIT_STARTED: &str = "agent_init_started";
const AGENT_INIT_READY: &str = "agent_init_ready";
const AGENT_INIT_FAILED: &str = "agent_init_failed";
const PRE_PROMPT_SETUP_STARTED: &str = "pre_prompt_setup_started";
const PROMPT_SENT: &str = "prompt_sent";
const FIRST_EVENT_RECEIVED: &str = "first_event_received";
const PROMPT_COMPLETED: &str = "prompt_completed";
const POST_PROCESSING_STARTED: &str = "post_processing_started";
const POST_PROCESSING_COMPLETED: &str = "post_processing_completed";

const PROMPT_TIMEOUT_MESSAGE: &str =
    "The model took too long to respond and the run was stopped.";

type SharedTimings = Arc<Mutex<GenerationTimings>>;

fn mark(timings: &SharedTimings, phase: &str) {
    if let Ok(mut guard) = timings.lock() {
        guard.mark(phase);
    }
}

fn snapshot(timings: &SharedTimings) -> GenerationTimings {
    timings.lock().map(|g| g.clone()).unwrap_or_default()
}

/// How the event loop ended.
enum LoopOutcome {
    Idle,
    Cancelled,
    SessionError(String),
    PromptTimeout,
    Paused,
}

/// Resolution of one approval surface inside the event loop.
enum PromptFlow {
    Continue,
    Paused,
    Cancelled,
}

/// Worker entry point: acquire the lease and drive the generation to a
/// durable state. Silently returns when another worker holds the lease.
#[instrument(name = "generation_run", skip(state), fields(generation_id = %generation_id))]
pub async fn run(state: Arc<OrchestratorState>, generation_id: &str) {
    let key = generation_lease_key(generation_id);
    let ttl = Duration::from_secs(lease_const::TTL_SECS);

    let token = match state.lease.try_acquire(&key, ttl).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("Lease held elsewhere, skipping run");
            return;
        }
        Err(e) => {
            warn!(error = %e, "Lease acquisition failed");
            return;
        }
    };

    let cancel = state.register_active(generation_id).await;
    let renew_task = tokio::spawn(renew_loop(
        state.lease.clone(),
        key.clone(),
        token.clone(),
        ttl,
        cancel.clone(),
    ));
    let poll_task = tokio::spawn(cancel_poll_loop(
        state.clone(),
        generation_id.to_string(),
        cancel.clone(),
    ));

    let timings: SharedTimings = Arc::new(Mutex::new(GenerationTimings::default()));
    let result = execute(state.clone(), generation_id, cancel.clone(), timings.clone()).await;

    renew_task.abort();
    poll_task.abort();

    if let Err(e) = result {
        // Funnel any uncaught failure into a terminal error state
        warn!(error = %e, "Runner failed, finalizing as error");
        let parts = state
            .store
            .find_generation(generation_id)
            .await
            .ok()
            .flatten()
            .map(|g| g.content_parts)
            .unwrap_or_default();
        let _ = finalize(
            &state,
            generation_id,
            GenerationStatus::Error,
            Some(e.to_string()),
            parts,
            snapshot(&timings),
            0,
            0,
            Vec::new(),
        )
        .await;
    }

    state.remove_active(generation_id).await;
    if let Err(e) = state.lease.release(&key, &token).await {
        warn!(error = %e, "Lease release failed");
    }
}

/// Renews the lease on cadence; loses the run if renewal fails.
async fn renew_loop(
    lease: Arc<dyn crate::lease::LeaseService>,
    key: String,
    token: String,
    ttl: Duration,
    cancel: CancellationToken,
) {
    let cadence = Duration::from_secs(lease_const::RENEW_INTERVAL_SECS);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(cadence) => {}
        }
        match lease.renew(&key, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(key = %key, "Lease lost, aborting run");
                cancel.cancel();
                return;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Lease renewal failed, aborting run");
                cancel.cancel();
                return;
            }
        }
    }
}

/// Background poll that propagates a durable cancellation flag into the
/// local token within one interval plus a store round-trip.
async fn cancel_poll_loop(
    state: Arc<OrchestratorState>,
    generation_id: String,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(gen_const::CANCEL_POLL_INTERVAL_SECS);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match state.store.find_generation(&generation_id).await {
            Ok(Some(generation)) => {
                if generation.cancel_requested_at.is_some()
                    || generation.status == GenerationStatus::Cancelled
                {
                    debug!(generation_id = %generation_id, "Durable cancellation observed");
                    cancel.cancel();
                    return;
                }
                if generation.status.is_terminal() {
                    return;
                }
            }
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "Cancellation poll read failed");
            }
        }
    }
}

async fn execute(
    state: Arc<OrchestratorState>,
    generation_id: &str,
    cancel: CancellationToken,
    timings: SharedTimings,
) -> OrchestratorResult<()> {
    let Some((generation, conversation)) = state
        .store
        .find_generation_with_conversation(generation_id)
        .await?
    else {
        debug!("Generation vanished before the run started");
        return Ok(());
    };
    if generation.status.is_terminal() {
        debug!("Generation already terminal");
        return Ok(());
    }

    mark(&timings, GENERATION_STARTED);

    let user_text = state
        .store
        .find_latest_user_message(&conversation.id)
        .await?
        .map(|m| m.content)
        .unwrap_or_default();

    if generation.cancel_requested_at.is_some() {
        return finalize(
            &state,
            generation_id,
            GenerationStatus::Cancelled,
            None,
            generation.content_parts,
            snapshot(&timings),
            generation.tokens_input,
            generation.tokens_output,
            Vec::new(),
        )
        .await;
    }

    // A bare `/new` resets the session instead of prompting
    if conversation.kind == ConversationKind::Chat
        && user_text.trim() == gen_const::SESSION_RESET_COMMAND
    {
        return session_reset(&state, &generation, &conversation, timings).await;
    }

    // Resume path: a prior worker died with a suspension persisted
    let manager = ApprovalManager::new(state.clone());
    if let Some(ref pending) = generation.pending_approval {
        let tool_use_id = pending.tool_use_id.clone();
        info!("Resuming with a pending approval, awaiting its decision");
        match manager
            .wait_for_approval(generation_id, &tool_use_id, &cancel)
            .await?
        {
            ApprovalWait::Allow { .. } | ApprovalWait::Deny => {}
            ApprovalWait::Paused => return Ok(()),
        }
    } else if generation.pending_auth.is_some() {
        info!("Resuming with pending auth, awaiting its completion");
        match manager.poll_auth(generation_id, &cancel).await? {
            AuthWait::Success => {}
            // The auth timeout path already finalized durably
            AuthWait::Failed => return Ok(()),
        }
    }

    // Re-read: suspension resolution may have advanced the record
    let Some(generation) = state.store.find_generation(generation_id).await? else {
        return Ok(());
    };
    if generation.status.is_terminal() {
        return Ok(());
    }
    // A suspension denied by cancellation leaves the flag set; finalize
    // instead of re-prompting
    if generation.cancel_requested_at.is_some() {
        return finalize(
            &state,
            generation_id,
            GenerationStatus::Cancelled,
            None,
            generation.content_parts,
            snapshot(&timings),
            generation.tokens_input,
            generation.tokens_output,
            Vec::new(),
        )
        .await;
    }

    // ===== Agent init =====
    mark(&timings, AGENT_INIT_STARTED);
    let lifecycle_timings = timings.clone();
    let lifecycle: crate::provider::LifecycleHook = Arc::new(move |stage: InitStage| {
        if let Ok(mut guard) = lifecycle_timings.lock() {
            guard.mark(&format!("agent_init_{}", stage.as_str()));
        }
    });

    let fresh_session =
        conversation.kind == ConversationKind::Workflow && state.config.workflow_fresh_session;
    let session_request = SessionRequest {
        conversation_id: conversation.id.clone(),
        generation_id: generation_id.to_string(),
        user_id: conversation.user_id.clone(),
        model: conversation.model.clone(),
        reuse_session_id: if fresh_session {
            None
        } else {
            conversation.agent_session_id.clone()
        },
        reuse_sandbox_id: if fresh_session {
            None
        } else {
            conversation.sandbox_id.clone()
        },
    };
    let session_options = SessionOptions {
        title: conversation.title.clone(),
        replay_history: !fresh_session,
        on_lifecycle: Some(lifecycle),
    };

    let session = match tokio::time::timeout(
        state.config.preparing_timeout,
        state
            .provider
            .get_or_create_session(session_request, session_options),
    )
    .await
    {
        Ok(Ok(session)) => {
            mark(&timings, AGENT_INIT_READY);
            session
        }
        Ok(Err(e)) => {
            mark(&timings, AGENT_INIT_FAILED);
            return finalize(
                &state,
                generation_id,
                GenerationStatus::Error,
                Some(format!("Agent initialization failed: {}", e)),
                generation.content_parts,
                snapshot(&timings),
                generation.tokens_input,
                generation.tokens_output,
                Vec::new(),
            )
            .await;
        }
        Err(_) => {
            mark(&timings, AGENT_INIT_FAILED);
            return finalize(
                &state,
                generation_id,
                GenerationStatus::Error,
                Some("Timed out preparing the execution environment.".to_string()),
                generation.content_parts,
                snapshot(&timings),
                generation.tokens_input,
                generation.tokens_output,
                Vec::new(),
            )
            .await;
        }
    };

    // Persist handles so resume and stuck-checks can see them
    state
        .store
        .update_generation(
            generation_id,
            GenerationPatch {
                sandbox_id: Some(session.sandbox.id().to_string()),
                ..Default::default()
            },
        )
        .await?;
    state
        .store
        .update_conversation(
            &conversation.id,
            ConversationPatch {
                sandbox_id: Some(session.sandbox.id().to_string()),
                agent_session_id: Some(session.session_id.clone()),
                ..Default::default()
            },
        )
        .await?;

    // ===== Pre-prompt setup =====
    mark(&timings, PRE_PROMPT_SETUP_STARTED);
    let prep_outcome = match prep::run(
        &state.objects,
        &session.sandbox,
        &conversation.user_id,
        &generation,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            return finalize(
                &state,
                generation_id,
                GenerationStatus::Error,
                Some(format!("Pre-prompt setup failed: {}", e)),
                generation.content_parts,
                snapshot(&timings),
                generation.tokens_input,
                generation.tokens_output,
                Vec::new(),
            )
            .await;
        }
    };

    // ===== Prompt + event ingest =====
    let marker_unix = Utc::now().timestamp();
    let mut normalizer =
        EventNormalizer::with_parts(user_text.clone(), generation.content_parts.clone());
    let prompt_parts =
        build_prompt_parts(&state, &generation, &user_text, &prep_outcome.staged_paths).await?;

    let stream_cancel = cancel.child_token();
    let mut stream = match session.client.subscribe(stream_cancel.clone()).await {
        Ok(stream) => stream,
        Err(e) => {
            return finalize(
                &state,
                generation_id,
                GenerationStatus::Error,
                Some(format!("Event subscription failed: {}", e)),
                generation.content_parts,
                snapshot(&timings),
                generation.tokens_input,
                generation.tokens_output,
                Vec::new(),
            )
            .await;
        }
    };

    mark(&timings, PROMPT_SENT);
    let prompt_client = session.client.clone();
    let prompt_request = PromptRequest {
        session_id: session.session_id.clone(),
        parts: prompt_parts,
        system: None,
        model: conversation.model.clone(),
    };
    let mut prompt_task = tokio::spawn(async move { prompt_client.prompt(prompt_request).await });
    let mut prompt_done = false;

    let deadline = tokio::time::Instant::now() + state.config.prompt_timeout;
    let mut first_event = false;
    let mut tokens_input = generation.tokens_input;
    let mut tokens_output = generation.tokens_output;
    let mut outcome = LoopOutcome::Idle;

    'event_loop: loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                outcome = LoopOutcome::Cancelled;
                break 'event_loop;
            }
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Prompt budget exhausted, aborting session");
                let _ = session.client.abort().await;
                outcome = LoopOutcome::PromptTimeout;
                break 'event_loop;
            }
            joined = &mut prompt_task, if !prompt_done => {
                prompt_done = true;
                if let Ok(Err(e)) = joined {
                    warn!(error = %e, "Prompt submission failed");
                    outcome = LoopOutcome::SessionError(e.to_string());
                    break 'event_loop;
                }
                // Producer finished; keep draining events until idle
            }
            event = stream.next() => {
                let Some(event) = event else {
                    debug!("Event stream closed");
                    break 'event_loop;
                };
                if !first_event {
                    first_event = true;
                    mark(&timings, FIRST_EVENT_RECEIVED);
                }

                let actions = normalizer.apply(event);
                if normalizer.take_dirty() {
                    persist_parts(&state, generation_id, &normalizer).await?;
                }
                for action in actions {
                    match action {
                        NormalizerAction::Emit(event) => {
                            state.publish(generation_id, event).await;
                        }
                        NormalizerAction::Usage { tokens_input: i, tokens_output: o } => {
                            tokens_input = i;
                            tokens_output = o;
                        }
                        NormalizerAction::Idle => {
                            outcome = LoopOutcome::Idle;
                            break 'event_loop;
                        }
                        NormalizerAction::Error { message } => {
                            outcome = LoopOutcome::SessionError(message);
                            break 'event_loop;
                        }
                        NormalizerAction::Permission(request) => {
                            match handle_permission(
                                &state, &manager, &session, &conversation,
                                generation_id, &mut normalizer, &cancel, request,
                            )
                            .await?
                            {
                                PromptFlow::Continue => {}
                                PromptFlow::Paused => {
                                    outcome = LoopOutcome::Paused;
                                    break 'event_loop;
                                }
                                PromptFlow::Cancelled => {
                                    outcome = LoopOutcome::Cancelled;
                                    break 'event_loop;
                                }
                            }
                        }
                        NormalizerAction::Question(request) => {
                            match handle_question(
                                &state, &manager, &session, &conversation,
                                generation_id, &mut normalizer, &cancel, request,
                            )
                            .await?
                            {
                                PromptFlow::Continue => {}
                                PromptFlow::Paused => {
                                    outcome = LoopOutcome::Paused;
                                    break 'event_loop;
                                }
                                PromptFlow::Cancelled => {
                                    outcome = LoopOutcome::Cancelled;
                                    break 'event_loop;
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    stream_cancel.cancel();
    if !prompt_done {
        prompt_task.abort();
    }

    match outcome {
        LoopOutcome::Idle => {
            mark(&timings, PROMPT_COMPLETED);
            mark(&timings, POST_PROCESSING_STARTED);
            let final_text = ContentPart::join_text(normalizer.parts());
            let sandbox_files = postprocess::run(
                &state.store,
                &state.objects,
                &session.sandbox,
                generation_id,
                &conversation.user_id,
                &final_text,
                &prep_outcome.staged_paths,
                marker_unix,
            )
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Post-processing failed, continuing without artifacts");
                Vec::new()
            });
            mark(&timings, POST_PROCESSING_COMPLETED);

            finalize(
                &state,
                generation_id,
                GenerationStatus::Completed,
                None,
                normalizer.parts().to_vec(),
                snapshot(&timings),
                tokens_input,
                tokens_output,
                sandbox_files,
            )
            .await
        }
        LoopOutcome::Cancelled => {
            let _ = session.client.abort().await;
            normalizer.push_part(ContentPart::System {
                content: gen_const::INTERRUPTED_MESSAGE.to_string(),
            });
            finalize(
                &state,
                generation_id,
                GenerationStatus::Cancelled,
                None,
                normalizer.parts().to_vec(),
                snapshot(&timings),
                tokens_input,
                tokens_output,
                Vec::new(),
            )
            .await
        }
        LoopOutcome::SessionError(message) => finalize(
            &state,
            generation_id,
            GenerationStatus::Error,
            Some(message),
            normalizer.parts().to_vec(),
            snapshot(&timings),
            tokens_input,
            tokens_output,
            Vec::new(),
        )
        .await,
        LoopOutcome::PromptTimeout => finalize(
            &state,
            generation_id,
            GenerationStatus::Error,
            Some(PROMPT_TIMEOUT_MESSAGE.to_string()),
            normalizer.parts().to_vec(),
            snapshot(&timings),
            tokens_input,
            tokens_output,
            Vec::new(),
        )
        .await,
        // Paused is not terminal: the record stays paused and a resume
        // or the reaper takes it from here.
        LoopOutcome::Paused => {
            let _ = session.client.abort().await;
            Ok(())
        }
    }
}

/// Builds the prompt parts: user text, inline images, and a listing of
/// staged sandbox paths for non-image attachments.
async fn build_prompt_parts(
    state: &Arc<OrchestratorState>,
    generation: &Generation,
    user_text: &str,
    staged_paths: &[String],
) -> OrchestratorResult<Vec<PromptPart>> {
    let mut parts = vec![PromptPart::Text {
        text: user_text.to_string(),
    }];

    for attachment in &generation.execution_policy.file_attachments {
        if !attachment.is_image() {
            continue;
        }
        match state.objects.get(&attachment.id).await {
            Ok(data) => parts.push(PromptPart::Image {
                name: attachment.name.clone(),
                content_type: attachment.content_type.clone(),
                data,
            }),
            Err(e) => {
                warn!(attachment = %attachment.name, error = %e, "Image attachment unavailable");
            }
        }
    }

    if !staged_paths.is_empty() {
        parts.push(PromptPart::Text {
            text: format!(
                "The user attached files, available in the sandbox at:\n{}",
                staged_paths.join("\n")
            ),
        });
    }

    Ok(parts)
}

async fn persist_parts(
    state: &Arc<OrchestratorState>,
    generation_id: &str,
    normalizer: &EventNormalizer,
) -> OrchestratorResult<()> {
    state
        .store
        .update_generation(
            generation_id,
            GenerationPatch {
                content_parts: Some(normalizer.parts().to_vec()),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_permission(
    state: &Arc<OrchestratorState>,
    manager: &ApprovalManager,
    session: &AgentSession,
    conversation: &Conversation,
    generation_id: &str,
    normalizer: &mut EventNormalizer,
    cancel: &CancellationToken,
    request: PermissionRequest,
) -> OrchestratorResult<PromptFlow> {
    let command = request
        .tool_input
        .get("command")
        .and_then(Value::as_str)
        .map(String::from);
    let parsed = command.as_deref().and_then(integrations::parse_command);

    let approval_request = ApprovalRequest {
        tool_use_id: request
            .tool_use_id
            .clone()
            .unwrap_or_else(|| request.request_id.clone()),
        tool_name: request.tool_name.clone(),
        tool_input: request.tool_input.clone(),
        integration: parsed.as_ref().map(|p| p.integration.clone()),
        operation: parsed.as_ref().and_then(|p| p.operation.clone()),
        command,
        kind: ProviderRequestKind::Permission,
        provider_request_id: request.request_id.clone(),
        default_answers: Vec::new(),
        permission_type: request.permission_type.clone(),
        patterns: request.patterns.clone(),
    };

    resolve_approval(
        state,
        manager,
        session,
        conversation,
        generation_id,
        normalizer,
        cancel,
        approval_request,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn handle_question(
    state: &Arc<OrchestratorState>,
    manager: &ApprovalManager,
    session: &AgentSession,
    conversation: &Conversation,
    generation_id: &str,
    normalizer: &mut EventNormalizer,
    cancel: &CancellationToken,
    request: QuestionRequest,
) -> OrchestratorResult<PromptFlow> {
    let command = request
        .tool_input
        .get("command")
        .and_then(Value::as_str)
        .map(String::from);
    let parsed = command.as_deref().and_then(integrations::parse_command);

    let approval_request = ApprovalRequest {
        tool_use_id: request
            .tool_use_id
            .clone()
            .unwrap_or_else(|| request.request_id.clone()),
        tool_name: request.tool_name.clone(),
        tool_input: request.tool_input.clone(),
        integration: parsed.as_ref().map(|p| p.integration.clone()),
        operation: parsed.as_ref().and_then(|p| p.operation.clone()),
        command,
        kind: ProviderRequestKind::Question,
        provider_request_id: request.request_id.clone(),
        default_answers: request.default_answers.clone(),
        permission_type: None,
        patterns: Vec::new(),
    };

    resolve_approval(
        state,
        manager,
        session,
        conversation,
        generation_id,
        normalizer,
        cancel,
        approval_request,
    )
    .await
}

/// Shared resolution path for permission and question surfaces.
#[allow(clippy::too_many_arguments)]
async fn resolve_approval(
    state: &Arc<OrchestratorState>,
    manager: &ApprovalManager,
    session: &AgentSession,
    conversation: &Conversation,
    generation_id: &str,
    normalizer: &mut EventNormalizer,
    cancel: &CancellationToken,
    request: ApprovalRequest,
) -> OrchestratorResult<PromptFlow> {
    if manager
        .auto_approval(conversation.auto_approve, &request)
        .is_some()
    {
        debug!(tool_use_id = %request.tool_use_id, "Auto-approved without surfacing");
        let reply = match request.kind {
            ProviderRequestKind::Permission => {
                session
                    .client
                    .reply_permission(&request.provider_request_id, PermissionReply::Always)
                    .await
            }
            ProviderRequestKind::Question => {
                session
                    .client
                    .reply_question(
                        &request.provider_request_id,
                        request.default_answers.clone(),
                    )
                    .await
            }
        };
        if let Err(e) = reply {
            warn!(error = %e, "Auto-approval reply failed");
        }
        return Ok(PromptFlow::Continue);
    }

    let Some(generation) = state.store.find_generation(generation_id).await? else {
        return Ok(PromptFlow::Cancelled);
    };
    manager.request_approval(&generation, &request).await?;

    match manager
        .wait_for_approval(generation_id, &request.tool_use_id, cancel)
        .await?
    {
        ApprovalWait::Allow { question_answers } => {
            let reply = match request.kind {
                ProviderRequestKind::Permission => {
                    session
                        .client
                        .reply_permission(&request.provider_request_id, PermissionReply::Always)
                        .await
                }
                ProviderRequestKind::Question => {
                    let answers = question_answers
                        .clone()
                        .filter(|a| !a.is_empty())
                        .unwrap_or_else(|| request.default_answers.clone());
                    session
                        .client
                        .reply_question(&request.provider_request_id, answers)
                        .await
                }
            };
            if let Err(e) = reply {
                warn!(error = %e, "Approval reply failed");
            }

            record_approval_part(
                state,
                generation_id,
                normalizer,
                &request,
                ApprovalStatus::Approved,
                question_answers,
            )
            .await?;
            Ok(PromptFlow::Continue)
        }
        ApprovalWait::Deny => {
            let reply = match request.kind {
                ProviderRequestKind::Permission => {
                    session
                        .client
                        .reply_permission(&request.provider_request_id, PermissionReply::Reject)
                        .await
                }
                ProviderRequestKind::Question => {
                    session
                        .client
                        .reject_question(&request.provider_request_id)
                        .await
                }
            };
            if let Err(e) = reply {
                warn!(error = %e, "Denial reply failed");
            }

            record_approval_part(
                state,
                generation_id,
                normalizer,
                &request,
                ApprovalStatus::Denied,
                None,
            )
            .await?;
            Ok(PromptFlow::Continue)
        }
        ApprovalWait::Paused => Ok(PromptFlow::Paused),
    }
}

async fn record_approval_part(
    state: &Arc<OrchestratorState>,
    generation_id: &str,
    normalizer: &mut EventNormalizer,
    request: &ApprovalRequest,
    status: ApprovalStatus,
    question_answers: Option<Vec<String>>,
) -> OrchestratorResult<()> {
    normalizer.push_part(ContentPart::Approval {
        tool_use_id: request.tool_use_id.clone(),
        tool_name: request.tool_name.clone(),
        tool_input: request.tool_input.clone(),
        integration: request.integration.clone(),
        operation: request.operation.clone(),
        command: request.command.clone(),
        status,
        question_answers: question_answers.clone(),
    });
    normalizer.take_dirty();
    persist_parts(state, generation_id, normalizer).await?;
    state
        .publish(
            generation_id,
            GenerationEvent::Approval {
                tool_use_id: request.tool_use_id.clone(),
                tool_name: request.tool_name.clone(),
                status,
            },
        )
        .await;
    Ok(())
}

/// `/new`: archive the session and complete without prompting.
async fn session_reset(
    state: &Arc<OrchestratorState>,
    generation: &Generation,
    conversation: &Conversation,
    timings: SharedTimings,
) -> OrchestratorResult<()> {
    info!(conversation_id = %conversation.id, "Session reset requested");

    // Archive the transcript before dropping the session handle
    let messages = state.store.list_messages(&conversation.id).await?;
    let transcript = serde_json::to_vec(&messages).unwrap_or_default();
    let transcript_key = format!("transcript-{}", generation.id);
    if let Err(e) = state
        .objects
        .put(&transcript_key, &transcript, "application/json")
        .await
    {
        warn!(error = %e, "Transcript archive failed");
    }

    let boundary_id = Uuid::new_v4().to_string();
    state
        .store
        .insert_message(
            &boundary_id,
            MessageCreate::system(
                conversation.id.clone(),
                gen_const::SESSION_BOUNDARY_MARKER.to_string(),
            ),
        )
        .await?;

    state
        .store
        .update_conversation(
            &conversation.id,
            ConversationPatch {
                clear_agent_session_id: true,
                ..Default::default()
            },
        )
        .await?;

    finalize(
        state,
        &generation.id,
        GenerationStatus::Completed,
        None,
        vec![ContentPart::Text {
            text: gen_const::SESSION_RESET_REPLY.to_string(),
        }],
        snapshot(&timings),
        0,
        0,
        Vec::new(),
    )
    .await
}

/// Finalizes the generation under a single-entry guard. Idempotent: a
/// terminal record is never touched again.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn finalize(
    state: &Arc<OrchestratorState>,
    generation_id: &str,
    status: GenerationStatus,
    error_message: Option<String>,
    parts: Vec<ContentPart>,
    timings: GenerationTimings,
    tokens_input: u64,
    tokens_output: u64,
    sandbox_files: Vec<SandboxFile>,
) -> OrchestratorResult<()> {
    if !state.begin_finalize(generation_id).await {
        debug!(generation_id = %generation_id, "Finalize already in progress");
        return Ok(());
    }
    let result = finalize_inner(
        state,
        generation_id,
        status,
        error_message,
        parts,
        timings,
        tokens_input,
        tokens_output,
        sandbox_files,
    )
    .await;
    state.end_finalize(generation_id).await;
    result
}

#[allow(clippy::too_many_arguments)]
async fn finalize_inner(
    state: &Arc<OrchestratorState>,
    generation_id: &str,
    status: GenerationStatus,
    error_message: Option<String>,
    parts: Vec<ContentPart>,
    mut timings: GenerationTimings,
    tokens_input: u64,
    tokens_output: u64,
    sandbox_files: Vec<SandboxFile>,
) -> OrchestratorResult<()> {
    let Some((generation, conversation)) = state
        .store
        .find_generation_with_conversation(generation_id)
        .await?
    else {
        return Ok(());
    };
    if generation.status.is_terminal() {
        debug!("Generation already finalized");
        return Ok(());
    }

    timings.mark(&format!("generation_{}", status));

    let mut content = ContentPart::join_text(&parts);
    if content.is_empty() {
        content = match status {
            GenerationStatus::Error => gen_const::ERROR_FALLBACK_MESSAGE.to_string(),
            GenerationStatus::Cancelled => gen_const::INTERRUPTED_MESSAGE.to_string(),
            _ => content,
        };
    }

    let message_id = Uuid::new_v4().to_string();
    let mut message = MessageCreate::assistant(
        conversation.id.clone(),
        content,
        parts.clone(),
        tokens_input,
        tokens_output,
        timings.clone(),
    );
    message.attachments = generation.execution_policy.file_attachments.clone();
    message.sandbox_files = sandbox_files.clone();
    state.store.insert_message(&message_id, message).await?;

    // First completed chat turn names the conversation
    if conversation.kind == ConversationKind::Chat && conversation.title.is_none() {
        if let Some(user_message) = state
            .store
            .find_latest_user_message(&conversation.id)
            .await?
        {
            state
                .store
                .update_conversation(
                    &conversation.id,
                    ConversationPatch {
                        title: Some(derive_title(&user_message.content)),
                        ..Default::default()
                    },
                )
                .await?;
        }
    }

    state
        .store
        .update_generation(
            generation_id,
            GenerationPatch {
                status: Some(status),
                content_parts: Some(parts),
                tokens_input: Some(tokens_input),
                tokens_output: Some(tokens_output),
                message_id: Some(message_id.clone()),
                error_message,
                complete_now: true,
                clear_pending_approval: true,
                clear_pending_auth: true,
                ..Default::default()
            },
        )
        .await?;
    mirror_status(state, &generation, status).await?;

    state
        .queue
        .enqueue(
            JobKind::QueuedMessageProcess,
            json!({ "conversation_id": conversation.id }),
            &format!("queued:{}:{}", conversation.id, generation_id),
            Duration::ZERO,
        )
        .await?;

    state
        .publish(generation_id, GenerationEvent::StatusChange { status })
        .await;
    state
        .publish(
            generation_id,
            GenerationEvent::Done {
                payload: DonePayload {
                    message_id: Some(message_id),
                    tokens_input,
                    tokens_output,
                    timing: Some(timings),
                    attachments: generation.execution_policy.file_attachments,
                    sandbox_files,
                },
            },
        )
        .await;

    state.remove_active(generation_id).await;
    state.drop_channel(generation_id).await;

    info!(
        generation_id = %generation_id,
        status = %status,
        "Generation finalized"
    );
    Ok(())
}

/// Derives a conversation title from the first turn: first line,
/// truncated on a word boundary.
fn derive_title(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New conversation".to_string();
    }
    if line.chars().count() <= gen_const::TITLE_MAX_CHARS {
        return line.to_string();
    }

    let cut: String = line.chars().take(gen_const::TITLE_MAX_CHARS).collect();
    let trimmed = match cut.rfind(' ') {
        Some(space) if space > 0 => &cut[..space],
        _ => cut.as_str(),
    };
    format!("{}…", trimmed.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title_short_line() {
        assert_eq!(derive_title("Write a status update"), "Write a status update");
        assert_eq!(derive_title("  spaced  \nsecond line"), "spaced");
    }

    #[test]
    fn test_derive_title_empty() {
        assert_eq!(derive_title(""), "New conversation");
        assert_eq!(derive_title("\n\n"), "New conversation");
    }

    #[test]
    fn test_derive_title_truncates_on_word_boundary() {
        let long = "Summarize the quarterly revenue figures for every region and draft a detailed breakdown email to leadership";
        let title = derive_title(long);
        assert!(title.ends_with('…'));
        assert!(title.chars().count() <= gen_const::TITLE_MAX_CHARS + 1);
        // The cut lands between words, never mid-word
        let without_ellipsis = title.trim_end_matches('…');
        assert!(long.starts_with(without_ellipsis));
        assert!(long[without_ellipsis.len()..].starts_with(' '));
    }

    #[test]
    fn test_timings_mark_helpers() {
        let timings: SharedTimings = Arc::new(Mutex::new(GenerationTimings::default()));
        mark(&timings, GENERATION_STARTED);
        mark(&timings, PROMPT_SENT);
        let snap = snapshot(&timings);
        assert!(snap.has(GENERATION_STARTED));
        assert!(snap.has(PROMPT_SENT));
        assert_eq!(snap.marks.len(), 2);
    }
}
