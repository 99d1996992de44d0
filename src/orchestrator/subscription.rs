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

//! Generation subscription stream.
//!
//! Subscribers never read runner memory: the stream is re-derived from
//! durable state with adaptive polling, so it works identically for the
//! process that runs the generation and for any other process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

use crate::constants::subscription as sub_const;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::{
    ContentPart, ConversationKind, DonePayload, Generation, GenerationEvent, GenerationStatus,
};
use crate::state::OrchestratorState;

/// Subscribes to a generation's event sequence.
///
/// The stream replays stored content for terminal generations and polls
/// durable state for live ones, emitting text deltas, new parts, status
/// changes, pending prompts, heartbeats, and a terminal `done`/`error`.
#[instrument(name = "generation_subscribe", skip(state), fields(generation_id = %generation_id, user_id = %user_id))]
pub async fn subscribe(
    state: Arc<OrchestratorState>,
    generation_id: &str,
    user_id: &str,
) -> OrchestratorResult<ReceiverStream<GenerationEvent>> {
    let Some((generation, conversation)) = state
        .store
        .find_generation_with_conversation(generation_id)
        .await?
    else {
        return Err(OrchestratorError::AccessDenied);
    };
    if conversation.user_id != user_id {
        return Err(OrchestratorError::AccessDenied);
    }

    let (tx, rx) = mpsc::channel(sub_const::CHANNEL_CAPACITY);
    let generation_id = generation_id.to_string();
    let user_id = user_id.to_string();
    let kind = conversation.kind;

    state.subscriber_begin(&generation_id, &user_id).await;
    tokio::spawn(async move {
        if let Err(e) = pump(state.clone(), &generation_id, kind, generation, &tx).await {
            warn!(error = %e, "Subscription pump failed");
            let _ = tx
                .send(GenerationEvent::Error {
                    message: "Streaming failed, please retry".to_string(),
                    retryable: true,
                })
                .await;
        }
        state.subscriber_end(&generation_id, &user_id).await;
    });

    Ok(ReceiverStream::new(rx))
}

/// Tracks what the subscriber has already observed.
struct Cursor {
    parts: Vec<ContentPart>,
    status: GenerationStatus,
    pending_approval_id: Option<String>,
    auth_connected: usize,
    auth_announced: bool,
}

async fn pump(
    state: Arc<OrchestratorState>,
    generation_id: &str,
    kind: ConversationKind,
    initial: Generation,
    tx: &mpsc::Sender<GenerationEvent>,
) -> anyhow::Result<()> {
    // Terminal from the start: replay and finish
    if initial.status.is_terminal() {
        for part in &initial.content_parts {
            send(tx, GenerationEvent::from_part(part)).await?;
        }
        send_terminal(&state, &initial, tx).await?;
        return Ok(());
    }

    let (max_interval, max_wait) = match kind {
        ConversationKind::Chat => (
            sub_const::CHAT_MAX_INTERVAL_MS,
            sub_const::CHAT_MAX_WAIT_SECS,
        ),
        ConversationKind::Workflow => (
            sub_const::WORKFLOW_MAX_INTERVAL_MS,
            sub_const::WORKFLOW_MAX_WAIT_SECS,
        ),
    };

    let mut cursor = Cursor {
        parts: Vec::new(),
        status: GenerationStatus::Running,
        pending_approval_id: None,
        auth_connected: 0,
        auth_announced: false,
    };
    let mut interval_ms = sub_const::BASE_POLL_INTERVAL_MS;
    let started = Instant::now();
    let mut last_emit = Instant::now();

    loop {
        let Some(generation) = state.store.find_generation(generation_id).await? else {
            send(
                tx,
                GenerationEvent::Error {
                    message: "Generation no longer exists".to_string(),
                    retryable: false,
                },
            )
            .await?;
            return Ok(());
        };

        let mut activity = emit_diff(&mut cursor, &generation, tx).await?;

        if generation.status.is_terminal() {
            // emit_diff already announced the terminal status change
            send_artifacts(&state, &generation, tx).await?;
            return Ok(());
        }

        if started.elapsed() >= Duration::from_secs(max_wait) {
            debug!("Subscription exceeded its maximum wait");
            send(
                tx,
                GenerationEvent::Error {
                    message: "Generation is taking longer than expected, please retry".to_string(),
                    retryable: true,
                },
            )
            .await?;
            return Ok(());
        }

        // Heartbeat even without change
        if last_emit.elapsed() >= Duration::from_secs(sub_const::HEARTBEAT_INTERVAL_SECS) {
            send(
                tx,
                GenerationEvent::StatusChange {
                    status: generation.status,
                },
            )
            .await?;
            activity = true;
        }
        if activity {
            last_emit = Instant::now();
        }

        // Adaptive cadence: reset on activity, back off on idle; never
        // poll an awaiting generation faster than the floor.
        interval_ms = if activity {
            sub_const::BASE_POLL_INTERVAL_MS
        } else {
            (interval_ms * 2).min(max_interval)
        };
        let awaiting = matches!(
            generation.status,
            GenerationStatus::AwaitingApproval | GenerationStatus::AwaitingAuth
        );
        let effective = if awaiting {
            interval_ms.max(sub_const::AWAITING_MIN_INTERVAL_MS)
        } else {
            interval_ms
        };

        tokio::time::sleep(Duration::from_millis(effective)).await;
    }
}

/// Diffs durable state against the cursor and emits the difference.
async fn emit_diff(
    cursor: &mut Cursor,
    generation: &Generation,
    tx: &mpsc::Sender<GenerationEvent>,
) -> anyhow::Result<bool> {
    let mut activity = false;

    for (index, part) in generation.content_parts.iter().enumerate() {
        match cursor.parts.get(index) {
            None => {
                send(tx, GenerationEvent::from_part(part)).await?;
                activity = true;
            }
            Some(seen) if seen == part => {}
            Some(seen) => {
                // In-place reconciliation: cumulative text/thinking parts
                // grow, everything else is replaced wholesale (rare).
                match (seen, part) {
                    (ContentPart::Text { text: old }, ContentPart::Text { text: new })
                        if new.starts_with(old.as_str()) =>
                    {
                        let delta = new[old.len()..].to_string();
                        if !delta.is_empty() {
                            send(tx, GenerationEvent::Text { delta }).await?;
                            activity = true;
                        }
                    }
                    (
                        ContentPart::Thinking { content: old, .. },
                        ContentPart::Thinking { id, content: new },
                    ) if new.starts_with(old.as_str()) => {
                        let delta = new[old.len()..].to_string();
                        if !delta.is_empty() {
                            send(
                                tx,
                                GenerationEvent::Thinking {
                                    id: id.clone(),
                                    delta,
                                },
                            )
                            .await?;
                            activity = true;
                        }
                    }
                    _ => {
                        send(tx, GenerationEvent::from_part(part)).await?;
                        activity = true;
                    }
                }
            }
        }
    }
    cursor.parts = generation.content_parts.clone();

    if generation.status != cursor.status {
        send(
            tx,
            GenerationEvent::StatusChange {
                status: generation.status,
            },
        )
        .await?;
        cursor.status = generation.status;
        activity = true;
    }

    // Surface a newly persisted pending approval exactly once
    let pending_id = generation
        .pending_approval
        .as_ref()
        .map(|p| p.tool_use_id.clone());
    if pending_id != cursor.pending_approval_id {
        if let Some(ref approval) = generation.pending_approval {
            send(
                tx,
                GenerationEvent::PendingApproval {
                    approval: approval.clone(),
                },
            )
            .await?;
            activity = true;
        }
        cursor.pending_approval_id = pending_id;
    }

    // Surface pending auth once, then progress as integrations connect
    match generation.pending_auth {
        Some(ref auth) => {
            if !cursor.auth_announced {
                send(tx, GenerationEvent::AuthNeeded { auth: auth.clone() }).await?;
                cursor.auth_announced = true;
                cursor.auth_connected = auth.connected_integrations.len();
                activity = true;
            } else if auth.connected_integrations.len() > cursor.auth_connected {
                let newly = auth.connected_integrations[cursor.auth_connected..].to_vec();
                for integration in newly {
                    send(
                        tx,
                        GenerationEvent::AuthProgress {
                            integration,
                            connected_integrations: auth.connected_integrations.clone(),
                        },
                    )
                    .await?;
                }
                cursor.auth_connected = auth.connected_integrations.len();
                activity = true;
            }
        }
        None => {
            cursor.auth_announced = false;
            cursor.auth_connected = 0;
        }
    }

    Ok(activity)
}

/// Emits the terminal tail: status change plus `done`/`error` artifacts.
async fn send_terminal(
    state: &OrchestratorState,
    generation: &Generation,
    tx: &mpsc::Sender<GenerationEvent>,
) -> anyhow::Result<()> {
    send(
        tx,
        GenerationEvent::StatusChange {
            status: generation.status,
        },
    )
    .await?;
    send_artifacts(state, generation, tx).await
}

/// Emits the `error` (when applicable) and `done` artifact events.
async fn send_artifacts(
    state: &OrchestratorState,
    generation: &Generation,
    tx: &mpsc::Sender<GenerationEvent>,
) -> anyhow::Result<()> {
    if generation.status == GenerationStatus::Error {
        send(
            tx,
            GenerationEvent::Error {
                message: generation
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "Generation failed".to_string()),
                retryable: false,
            },
        )
        .await?;
    }

    let mut payload = DonePayload {
        message_id: generation.message_id.clone(),
        tokens_input: generation.tokens_input,
        tokens_output: generation.tokens_output,
        timing: None,
        attachments: Vec::new(),
        sandbox_files: Vec::new(),
    };
    if let Some(ref message_id) = generation.message_id {
        if let Some(message) = state.store.find_message(message_id).await? {
            payload.timing = message.timing;
            payload.attachments = message.attachments;
            payload.sandbox_files = message.sandbox_files;
        }
    }
    send(tx, GenerationEvent::Done { payload }).await?;
    Ok(())
}

async fn send(tx: &mpsc::Sender<GenerationEvent>, event: GenerationEvent) -> anyhow::Result<()> {
    tx.send(event)
        .await
        .map_err(|_| anyhow::anyhow!("subscriber dropped"))
}
