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

//! Queued-message processor.
//!
//! Buffered user turns drain sequentially per conversation: the processor
//! claims the oldest `queued` row by CAS, starts a generation from it, and
//! stops as soon as the conversation has an active generation again.

use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::models::QueuedMessageStatus;
use crate::state::OrchestratorState;

use super::admission::{self, StartGenerationRequest};

/// Drains queued rows for a conversation until one starts a generation or
/// the queue is empty.
#[instrument(name = "queued_process", skip(state), fields(conversation_id = %conversation_id))]
pub async fn process_queued_messages(
    state: Arc<OrchestratorState>,
    conversation_id: &str,
) -> OrchestratorResult<()> {
    loop {
        if state
            .store
            .find_active_for_conversation(conversation_id)
            .await?
            .is_some()
        {
            debug!("Active generation present, leaving queue untouched");
            return Ok(());
        }

        let Some(row) = state.store.claim_next_queued(conversation_id).await? else {
            debug!("No queued messages remain");
            return Ok(());
        };

        let request = StartGenerationRequest {
            conversation_id: Some(row.conversation_id.clone()),
            content: row.content.clone(),
            model: None,
            user_id: row.user_id.clone(),
            auto_approve: None,
            allowed_integrations: None,
            allowed_custom_integrations: None,
            uploads: Vec::new(),
            attachments: row.file_attachments.clone(),
            selected_platform_skills: row.selected_platform_skills.clone(),
        };

        match admission::start_generation(state.clone(), request).await {
            Ok(response) => {
                state
                    .store
                    .mark_queued_message(
                        &row.id,
                        QueuedMessageStatus::Sent,
                        Some(&response.generation_id),
                        None,
                    )
                    .await?;
                info!(
                    queued_message_id = %row.id,
                    generation_id = %response.generation_id,
                    "Queued message sent"
                );
            }
            Err(OrchestratorError::ActiveExists(_)) => {
                // Lost the race to another writer; put the row back and
                // let the next finalize retry.
                state
                    .store
                    .mark_queued_message(&row.id, QueuedMessageStatus::Queued, None, None)
                    .await?;
                debug!(queued_message_id = %row.id, "Generation already active, row requeued");
                return Ok(());
            }
            Err(e) => {
                warn!(
                    queued_message_id = %row.id,
                    error = %e,
                    "Queued message failed to start a generation"
                );
                state
                    .store
                    .mark_queued_message(
                        &row.id,
                        QueuedMessageStatus::Failed,
                        None,
                        Some(&e.to_string()),
                    )
                    .await?;
                // Continue with the next row
            }
        }
    }
}
