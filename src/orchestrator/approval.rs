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

//! Pending-approval and pending-auth management.
//!
//! A suspension is a durable payload on the generation record, never an
//! in-memory handoff: any process can persist the request, any process can
//! resolve it, and the waiting runner observes the decision by polling the
//! store. Timeout jobs re-read state before acting, so late or duplicate
//! firings are no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::constants::approval as approval_const;
use crate::error::{OrchestratorError, OrchestratorResult, TimeoutKind};
use crate::integrations;
use crate::models::{
    ApprovalDecision, Conversation, ConversationPatch, ConversationStatus, Generation,
    GenerationEvent, GenerationPatch, GenerationStatus, PendingApproval, PendingAuth,
    ProviderRequestKind, WorkflowRunStatus,
};
use crate::queue::JobKind;
use crate::state::OrchestratorState;

/// Approval surface built from a provider permission/question request.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub tool_use_id: String,
    pub tool_name: String,
    pub tool_input: Value,
    pub integration: Option<String>,
    pub operation: Option<String>,
    pub command: Option<String>,
    pub kind: ProviderRequestKind,
    pub provider_request_id: String,
    pub default_answers: Vec<String>,
    /// Provider-side permission category (e.g. `external_directory`).
    pub permission_type: Option<String>,
    /// Filesystem patterns for directory permissions.
    pub patterns: Vec<String>,
}

/// Outcome of waiting on a pending approval.
///
/// Cancellation observed while waiting denies the open request; there is
/// no separate cancelled outcome. The runner replies and records the
/// denial like any other, then finalizes the run.
#[derive(Debug, Clone, PartialEq)]
pub enum ApprovalWait {
    Allow { question_answers: Option<Vec<String>> },
    Deny,
    /// Approval expired; the generation paused.
    Paused,
}

/// Outcome of waiting on pending auth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthWait {
    Success,
    Failed,
}

/// Pending-approval/auth manager.
pub struct ApprovalManager {
    state: Arc<OrchestratorState>,
}

impl ApprovalManager {
    pub fn new(state: Arc<OrchestratorState>) -> Self {
        Self { state }
    }

    // =====================================================
    // Auto-approval policy
    // =====================================================

    /// Decides whether a request bypasses the interactive surface.
    ///
    /// Two rules:
    /// - external-directory permissions whose patterns all lie under the
    ///   configured upload prefixes auto-approve unconditionally;
    /// - conversation auto-approve covers everything except the exempt
    ///   operations (Slack `send`, including bash-parsed sends).
    pub fn auto_approval(
        &self,
        conversation_auto_approve: bool,
        request: &ApprovalRequest,
    ) -> Option<ApprovalDecision> {
        if request.permission_type.as_deref() == Some("external_directory")
            && !request.patterns.is_empty()
        {
            let prefixes = &self.state.config.auto_approve_dir_prefixes;
            let all_allowed = request
                .patterns
                .iter()
                .all(|p| prefixes.iter().any(|prefix| p.starts_with(prefix.as_str())));
            if all_allowed {
                debug!(tool_use_id = %request.tool_use_id, "Auto-approving upload-directory permission");
                return Some(ApprovalDecision::Allow);
            }
        }

        if !conversation_auto_approve {
            return None;
        }

        let exempt_by_config = match (&request.integration, &request.operation) {
            (Some(integration), Some(operation)) => self
                .state
                .config
                .is_auto_approve_exempt(integration, operation),
            _ => false,
        };
        let slack_send = integrations::is_slack_send(
            request.integration.as_deref(),
            request.operation.as_deref(),
            request.command.as_deref(),
        );
        if exempt_by_config || slack_send {
            debug!(tool_use_id = %request.tool_use_id, "Operation exempt from auto-approve");
            return None;
        }

        Some(ApprovalDecision::Allow)
    }

    // =====================================================
    // Write path
    // =====================================================

    /// Persists a pending approval and schedules its timeout.
    #[instrument(name = "approval_request", skip(self, generation, request), fields(generation_id = %generation.id, tool_use_id = %request.tool_use_id))]
    pub async fn request_approval(
        &self,
        generation: &Generation,
        request: &ApprovalRequest,
    ) -> OrchestratorResult<PendingApproval> {
        let now = Utc::now();
        let timeout = self.state.config.approval_timeout;
        let pending = PendingApproval {
            tool_use_id: request.tool_use_id.clone(),
            tool_name: request.tool_name.clone(),
            tool_input: request.tool_input.clone(),
            requested_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            integration: request.integration.clone(),
            operation: request.operation.clone(),
            command: request.command.clone(),
            decision: None,
            question_answers: None,
            provider_request_kind: Some(request.kind),
            provider_request_id: Some(request.provider_request_id.clone()),
            provider_default_answers: if request.default_answers.is_empty() {
                None
            } else {
                Some(request.default_answers.clone())
            },
        };

        self.state
            .store
            .update_generation(
                &generation.id,
                GenerationPatch {
                    status: Some(GenerationStatus::AwaitingApproval),
                    pending_approval: Some(pending.clone()),
                    ..Default::default()
                },
            )
            .await?;
        mirror_status(&self.state, generation, GenerationStatus::AwaitingApproval).await?;

        self.state
            .queue
            .enqueue(
                JobKind::ApprovalTimeout,
                json!({ "generation_id": generation.id }),
                &format!(
                    "timeout:approval:{}:{}",
                    generation.id,
                    now.timestamp_millis()
                ),
                timeout,
            )
            .await?;

        self.state
            .publish(
                &generation.id,
                GenerationEvent::PendingApproval {
                    approval: pending.clone(),
                },
            )
            .await;

        info!("Pending approval persisted");
        Ok(pending)
    }

    // =====================================================
    // Resolve path
    // =====================================================

    /// Polls durable state until the approval resolves or expires.
    ///
    /// Cancellation observed while waiting (local token, durable flag, or
    /// a terminal status) denies the open request: a `deny` decision is
    /// written into the payload and resolved through the same path a user
    /// denial takes.
    #[instrument(name = "approval_wait", skip(self, cancel), fields(generation_id = %generation_id, tool_use_id = %tool_use_id))]
    pub async fn wait_for_approval(
        &self,
        generation_id: &str,
        tool_use_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<ApprovalWait> {
        let poll = Duration::from_millis(approval_const::DECISION_POLL_INTERVAL_MS);

        loop {
            let Some(generation) = self.state.store.find_generation(generation_id).await? else {
                warn!("Generation disappeared while awaiting approval");
                return Ok(ApprovalWait::Deny);
            };

            let cancel_observed = cancel.is_cancelled()
                || generation.cancel_requested_at.is_some()
                || matches!(
                    generation.status,
                    GenerationStatus::Cancelled | GenerationStatus::Error
                );
            if generation.status == GenerationStatus::Paused {
                return Ok(ApprovalWait::Paused);
            }

            match generation.pending_approval {
                None => {
                    // Another process already resolved and cleared it;
                    // the current status carries the verdict.
                    return Ok(match generation.status {
                        GenerationStatus::Running => ApprovalWait::Allow {
                            question_answers: None,
                        },
                        _ => ApprovalWait::Deny,
                    });
                }
                Some(ref pending) if pending.tool_use_id != tool_use_id => {
                    debug!("Pending approval replaced, reconciling from status");
                    return Ok(match generation.status {
                        GenerationStatus::Running => ApprovalWait::Allow {
                            question_answers: None,
                        },
                        _ => ApprovalWait::Deny,
                    });
                }
                Some(ref pending) => {
                    if let Some(decision) = pending.decision {
                        // Clear the payload and resume in one update;
                        // terminal records keep their status (finalize
                        // owns those).
                        if generation.status.is_terminal() {
                            self.state
                                .store
                                .update_generation(
                                    generation_id,
                                    GenerationPatch {
                                        clear_pending_approval: true,
                                        ..Default::default()
                                    },
                                )
                                .await?;
                        } else {
                            self.state
                                .store
                                .update_generation(
                                    generation_id,
                                    GenerationPatch {
                                        status: Some(GenerationStatus::Running),
                                        clear_pending_approval: true,
                                        ..Default::default()
                                    },
                                )
                                .await?;
                            mirror_status(&self.state, &generation, GenerationStatus::Running)
                                .await?;
                            self.state
                                .publish(
                                    generation_id,
                                    GenerationEvent::StatusChange {
                                        status: GenerationStatus::Running,
                                    },
                                )
                                .await;
                        }
                        return Ok(match decision {
                            ApprovalDecision::Allow => ApprovalWait::Allow {
                                question_answers: pending.question_answers.clone(),
                            },
                            ApprovalDecision::Deny => ApprovalWait::Deny,
                        });
                    }

                    // A cancel during a pending approval denies the open
                    // request; the decision path above then resolves it.
                    if cancel_observed {
                        let mut denied = pending.clone();
                        denied.decision = Some(ApprovalDecision::Deny);
                        self.state
                            .store
                            .update_generation(
                                generation_id,
                                GenerationPatch {
                                    pending_approval: Some(denied),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        continue;
                    }

                    // Past the deadline with no decision: apply the
                    // timeout transition (idempotent with the job).
                    if Utc::now() >= pending.expires_at {
                        self.apply_approval_timeout(&generation).await?;
                        return Ok(ApprovalWait::Paused);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Persists pending auth and polls until every integration connects,
    /// the budget expires, or the run is cancelled.
    #[instrument(name = "auth_wait", skip(self, cancel), fields(generation_id = %generation.id))]
    pub async fn wait_for_auth(
        &self,
        generation: &Generation,
        integrations_needed: Vec<String>,
        reason: Option<String>,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<AuthWait> {
        let now = Utc::now();
        let timeout = self.state.config.auth_timeout;
        let pending = PendingAuth {
            integrations: integrations_needed,
            connected_integrations: Vec::new(),
            requested_at: now,
            expires_at: now + chrono::Duration::from_std(timeout).unwrap_or_default(),
            reason,
        };

        self.state
            .store
            .update_generation(
                &generation.id,
                GenerationPatch {
                    status: Some(GenerationStatus::AwaitingAuth),
                    pending_auth: Some(pending.clone()),
                    ..Default::default()
                },
            )
            .await?;
        mirror_status(&self.state, generation, GenerationStatus::AwaitingAuth).await?;

        self.state
            .queue
            .enqueue(
                JobKind::AuthTimeout,
                json!({ "generation_id": generation.id }),
                &format!("timeout:auth:{}:{}", generation.id, now.timestamp_millis()),
                timeout,
            )
            .await?;

        self.state
            .publish(
                &generation.id,
                GenerationEvent::AuthNeeded {
                    auth: pending.clone(),
                },
            )
            .await;

        self.poll_auth(&generation.id, cancel).await
    }

    /// Polls an already-persisted pending auth to resolution. Used by the
    /// write path above and by runners resuming an orphaned generation.
    pub async fn poll_auth(
        &self,
        generation_id: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<AuthWait> {
        let poll = Duration::from_millis(approval_const::DECISION_POLL_INTERVAL_MS);
        loop {
            if cancel.is_cancelled() {
                return Ok(AuthWait::Failed);
            }

            let Some(current) = self.state.store.find_generation(generation_id).await? else {
                return Ok(AuthWait::Failed);
            };

            if current.cancel_requested_at.is_some() || current.status.is_terminal() {
                return Ok(AuthWait::Failed);
            }

            match current.pending_auth {
                None => {
                    // submit_auth_result satisfied the set and resumed
                    return Ok(match current.status {
                        GenerationStatus::Running => AuthWait::Success,
                        _ => AuthWait::Failed,
                    });
                }
                Some(ref auth) if Utc::now() >= auth.expires_at => {
                    self.apply_auth_timeout(&current).await?;
                    return Ok(AuthWait::Failed);
                }
                Some(_) => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(AuthWait::Failed),
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    // =====================================================
    // External-facing submissions
    // =====================================================

    /// Writes a decision into the pending approval. Does not transition
    /// status: the polling resolver does, after reading the decision.
    #[instrument(name = "approval_submit", skip(self, question_answers), fields(generation_id = %generation_id, tool_use_id = %tool_use_id))]
    pub async fn submit_approval(
        &self,
        generation_id: &str,
        tool_use_id: &str,
        decision: ApprovalDecision,
        user_id: &str,
        question_answers: Option<Vec<String>>,
    ) -> OrchestratorResult<bool> {
        let (generation, conversation) = self.owned_generation(generation_id, user_id).await?;

        let Some(mut pending) = generation.pending_approval else {
            debug!("No pending approval to decide");
            return Ok(false);
        };
        if pending.tool_use_id != tool_use_id {
            debug!(
                expected = %pending.tool_use_id,
                "Approval submission does not match the pending tool use"
            );
            return Ok(false);
        }

        pending.decision = Some(decision);
        pending.question_answers = question_answers.map(normalize_answers);

        self.state
            .store
            .update_generation(
                generation_id,
                GenerationPatch {
                    pending_approval: Some(pending),
                    ..Default::default()
                },
            )
            .await?;

        info!(
            conversation_id = %conversation.id,
            decision = ?decision,
            "Approval decision recorded"
        );
        Ok(true)
    }

    /// Records one integration's auth outcome; resumes the run when the
    /// requested set is fully connected.
    #[instrument(name = "auth_submit", skip(self), fields(generation_id = %generation_id, integration = %integration, success = success))]
    pub async fn submit_auth_result(
        &self,
        generation_id: &str,
        integration: &str,
        success: bool,
        user_id: &str,
    ) -> OrchestratorResult<bool> {
        let (generation, _conversation) = self.owned_generation(generation_id, user_id).await?;

        let Some(mut pending) = generation.pending_auth.clone() else {
            debug!("No pending auth to update");
            return Ok(false);
        };

        if !success {
            warn!("Integration auth failed; leaving pending auth open");
            return Ok(true);
        }

        if !pending
            .connected_integrations
            .iter()
            .any(|i| i == integration)
        {
            pending.connected_integrations.push(integration.to_string());
        }

        if pending.is_satisfied() {
            self.state
                .store
                .update_generation(
                    generation_id,
                    GenerationPatch {
                        status: Some(GenerationStatus::Running),
                        clear_pending_auth: true,
                        ..Default::default()
                    },
                )
                .await?;
            mirror_status(&self.state, &generation, GenerationStatus::Running).await?;
            self.state
                .publish(
                    generation_id,
                    GenerationEvent::StatusChange {
                        status: GenerationStatus::Running,
                    },
                )
                .await;
            info!("Auth set satisfied, generation resumed");
        } else {
            self.state
                .store
                .update_generation(
                    generation_id,
                    GenerationPatch {
                        pending_auth: Some(pending.clone()),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.state
            .publish(
                generation_id,
                GenerationEvent::AuthProgress {
                    integration: integration.to_string(),
                    connected_integrations: pending.connected_integrations,
                },
            )
            .await;
        Ok(true)
    }

    // =====================================================
    // Timeout handlers
    // =====================================================

    /// Delayed-job entry point. Re-reads durable state and verifies the
    /// deadline so stale firings (already resolved, rescheduled) no-op.
    #[instrument(name = "generation_timeout", skip(self), fields(generation_id = %generation_id, kind = %kind))]
    pub async fn process_generation_timeout(
        &self,
        generation_id: &str,
        kind: TimeoutKind,
    ) -> OrchestratorResult<()> {
        let Some(generation) = self.state.store.find_generation(generation_id).await? else {
            return Ok(());
        };

        match kind {
            TimeoutKind::Approval => {
                let expired = generation
                    .pending_approval
                    .as_ref()
                    .map(|p| Utc::now() >= p.expires_at)
                    .unwrap_or(false);
                if generation.status == GenerationStatus::AwaitingApproval && expired {
                    self.apply_approval_timeout(&generation).await?;
                } else {
                    debug!("Approval timeout no longer applies");
                }
            }
            TimeoutKind::Auth => {
                let expired = generation
                    .pending_auth
                    .as_ref()
                    .map(|p| Utc::now() >= p.expires_at)
                    .unwrap_or(false);
                if generation.status == GenerationStatus::AwaitingAuth && expired {
                    self.apply_auth_timeout(&generation).await?;
                } else {
                    debug!("Auth timeout no longer applies");
                }
            }
            other => {
                warn!(kind = %other, "Unexpected timeout kind for generation timeout");
            }
        }
        Ok(())
    }

    /// Approval expiry: pause the generation. A paused run is resumable
    /// by the user; its workflow run (if any) is cancelled outright.
    async fn apply_approval_timeout(&self, generation: &Generation) -> OrchestratorResult<()> {
        self.state
            .store
            .update_generation(
                &generation.id,
                GenerationPatch {
                    status: Some(GenerationStatus::Paused),
                    is_paused: Some(true),
                    clear_pending_approval: true,
                    ..Default::default()
                },
            )
            .await?;
        mirror_status(&self.state, generation, GenerationStatus::Paused).await?;
        self.state
            .publish(
                &generation.id,
                GenerationEvent::StatusChange {
                    status: GenerationStatus::Paused,
                },
            )
            .await;
        info!(generation_id = %generation.id, "Approval expired, generation paused");
        Ok(())
    }

    /// Auth expiry: cancel the generation and let the queued-message
    /// processor move the conversation along.
    async fn apply_auth_timeout(&self, generation: &Generation) -> OrchestratorResult<()> {
        self.state
            .store
            .update_generation(
                &generation.id,
                GenerationPatch {
                    status: Some(GenerationStatus::Cancelled),
                    clear_pending_auth: true,
                    complete_now: true,
                    ..Default::default()
                },
            )
            .await?;
        mirror_status(&self.state, generation, GenerationStatus::Cancelled).await?;
        self.state
            .queue
            .enqueue(
                JobKind::QueuedMessageProcess,
                json!({ "conversation_id": generation.conversation_id }),
                &format!("queued:{}:{}", generation.conversation_id, generation.id),
                Duration::ZERO,
            )
            .await?;
        self.state
            .publish(
                &generation.id,
                GenerationEvent::StatusChange {
                    status: GenerationStatus::Cancelled,
                },
            )
            .await;
        info!(generation_id = %generation.id, "Auth expired, generation cancelled");
        Ok(())
    }

    // =====================================================
    // Helpers
    // =====================================================

    async fn owned_generation(
        &self,
        generation_id: &str,
        user_id: &str,
    ) -> OrchestratorResult<(Generation, Conversation)> {
        let Some((generation, conversation)) = self
            .state
            .store
            .find_generation_with_conversation(generation_id)
            .await?
        else {
            return Err(OrchestratorError::AccessDenied);
        };
        if conversation.user_id != user_id {
            return Err(OrchestratorError::AccessDenied);
        }
        Ok((generation, conversation))
    }
}

/// Mirrors a generation status onto its conversation and workflow run.
pub(crate) async fn mirror_status(
    state: &OrchestratorState,
    generation: &Generation,
    status: GenerationStatus,
) -> OrchestratorResult<()> {
    state
        .store
        .update_conversation(
            &generation.conversation_id,
            ConversationPatch {
                generation_status: Some(ConversationStatus::from_generation(status)),
                ..Default::default()
            },
        )
        .await?;
    if let Some(ref run_id) = generation.workflow_run_id {
        state
            .store
            .update_workflow_run_status(run_id, WorkflowRunStatus::from_generation(status))
            .await?;
    }
    Ok(())
}

fn normalize_answers(answers: Vec<String>) -> Vec<String> {
    answers
        .into_iter()
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}
