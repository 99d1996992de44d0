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

//! Stale generation reaper.
//!
//! Generations orphaned by crashed workers eventually stop matching any
//! live lease or subscriber; the reaper finalizes them so conversations
//! unblock. Running generations error out, suspended ones cancel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{info, instrument, warn};

use crate::constants::reaper as reaper_const;
use crate::error::OrchestratorResult;
use crate::models::{GenerationEvent, GenerationPatch, GenerationStatus};
use crate::queue::JobKind;
use crate::state::OrchestratorState;

use super::approval::mirror_status;

/// Outcome counts of one reaper scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapCounts {
    pub errored: u64,
    pub cancelled: u64,
}

const STALE_RUNNING_MESSAGE: &str = "Generation abandoned by its worker";

/// Scans for non-terminal generations past their age threshold and
/// finalizes them.
#[instrument(name = "reap_stale_generations", skip(state))]
pub async fn reap_stale_generations(
    state: Arc<OrchestratorState>,
) -> OrchestratorResult<ReapCounts> {
    let thresholds: [(GenerationStatus, i64, GenerationStatus); 4] = [
        (
            GenerationStatus::Running,
            reaper_const::RUNNING_MAX_AGE_SECS,
            GenerationStatus::Error,
        ),
        (
            GenerationStatus::AwaitingApproval,
            reaper_const::AWAITING_APPROVAL_MAX_AGE_SECS,
            GenerationStatus::Cancelled,
        ),
        (
            GenerationStatus::AwaitingAuth,
            reaper_const::AWAITING_AUTH_MAX_AGE_SECS,
            GenerationStatus::Cancelled,
        ),
        (
            GenerationStatus::Paused,
            reaper_const::PAUSED_MAX_AGE_SECS,
            GenerationStatus::Cancelled,
        ),
    ];

    let mut counts = ReapCounts::default();

    for (status, max_age, terminal) in thresholds {
        let stale = state.store.find_stale_generations(status, max_age).await?;
        for generation in stale {
            warn!(
                generation_id = %generation.id,
                status = %generation.status,
                "Reaping stale generation"
            );

            state
                .store
                .update_generation(
                    &generation.id,
                    GenerationPatch {
                        status: Some(terminal),
                        error_message: (terminal == GenerationStatus::Error)
                            .then(|| STALE_RUNNING_MESSAGE.to_string()),
                        complete_now: true,
                        clear_pending_approval: true,
                        clear_pending_auth: true,
                        ..Default::default()
                    },
                )
                .await?;
            mirror_status(&state, &generation, terminal).await?;

            state
                .queue
                .enqueue(
                    JobKind::QueuedMessageProcess,
                    json!({ "conversation_id": generation.conversation_id }),
                    &format!("queued:{}:{}", generation.conversation_id, generation.id),
                    Duration::ZERO,
                )
                .await?;

            state
                .publish(
                    &generation.id,
                    GenerationEvent::StatusChange { status: terminal },
                )
                .await;

            match terminal {
                GenerationStatus::Error => counts.errored += 1,
                _ => counts.cancelled += 1,
            }
        }
    }

    if counts.errored + counts.cancelled > 0 {
        info!(
            errored = counts.errored,
            cancelled = counts.cancelled,
            "Reaper finalized stale generations"
        );
    }
    Ok(counts)
}
