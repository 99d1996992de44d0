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

//! Worker binary: claims queue jobs and runs the stale-generation reaper.
//!
//! The sandbox/agent provider is deployment-specific and wired in by the
//! embedding service; this binary covers the durable maintenance surface
//! (timeouts, queued messages, stuck checks, reaping) that needs no
//! provider at all.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use ripple::config::OrchestratorConfig;
use ripple::constants::{queue as queue_const, reaper as reaper_const};
use ripple::db::DBClient;
use ripple::lease::SurrealLease;
use ripple::objectstore::FsObjectStore;
use ripple::orchestrator::Orchestrator;
use ripple::provider::{
    AgentSession, AgentSessionProvider, ProviderError, SessionOptions, SessionRequest,
};
use ripple::queue::SurrealQueue;
use ripple::state::OrchestratorState;

/// Provider stub for maintenance-only workers. Run jobs that reach a
/// worker without a wired provider fail fast into a terminal error state
/// instead of hanging.
struct UnconfiguredProvider;

#[async_trait::async_trait]
impl AgentSessionProvider for UnconfiguredProvider {
    async fn get_or_create_session(
        &self,
        _request: SessionRequest,
        _options: SessionOptions,
    ) -> Result<AgentSession, ProviderError> {
        Err(ProviderError::SessionInit(
            "no agent session provider configured on this worker".to_string(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs with env-filter, like every other service of ours
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = OrchestratorConfig::from_env();
    info!(db_url = %config.db_url, "Starting ripple worker");

    let db = Arc::new(DBClient::connect(&config.db_url).await?);
    db.initialize_schema().await?;

    let queue = Arc::new(SurrealQueue::new(db.clone()));
    let objects_root =
        std::env::var("RIPPLE_OBJECTS_DIR").unwrap_or_else(|_| "ripple-objects".to_string());

    let state = Arc::new(OrchestratorState::new(
        config,
        db.clone(),
        queue.clone(),
        Arc::new(SurrealLease::new(db.clone())),
        Arc::new(UnconfiguredProvider),
        Arc::new(FsObjectStore::new(objects_root)),
    ));
    let orchestrator = Orchestrator::new(state);

    // Periodic reaper
    let reaper = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(reaper_const::SCAN_INTERVAL_SECS));
        loop {
            interval.tick().await;
            match reaper.reap_stale_generations().await {
                Ok(counts) if counts.errored + counts.cancelled > 0 => {
                    info!(
                        errored = counts.errored,
                        cancelled = counts.cancelled,
                        "Reaper pass finished"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Reaper pass failed"),
            }
        }
    });

    // Claim loop until shutdown
    let poll = Duration::from_millis(queue_const::POLL_INTERVAL_MS);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                return Ok(());
            }
            _ = tokio::time::sleep(poll) => {}
        }

        let jobs = match queue.claim_due(queue_const::CLAIM_BATCH).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Job claim failed");
                continue;
            }
        };

        for job in jobs {
            if let Err(e) = orchestrator.dispatch_job(&job).await {
                // Handlers are idempotent; the job still completes and
                // durable state decides what happens next.
                warn!(job_id = %job.id, error = %e, "Job handler failed");
            }
            if let Err(e) = queue.complete(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Job completion write failed");
            }
        }
    }
}
