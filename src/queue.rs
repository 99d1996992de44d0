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

//! Background job queue client.
//!
//! Jobs carry a caller-chosen `job_id`: enqueuing twice with the same id has
//! the effect of one enqueue. Delivery is at-least-once; every handler
//! re-reads durable state and no-ops when the condition no longer holds.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, instrument};

use crate::db::{queries, DBClient};

/// Worker job kinds used by the orchestrator core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    RunChat,
    RunWorkflow,
    ApprovalTimeout,
    AuthTimeout,
    PreparingStuckCheck,
    QueuedMessageProcess,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::RunChat => "generation:run:chat",
            JobKind::RunWorkflow => "generation:run:workflow",
            JobKind::ApprovalTimeout => "generation:timeout:approval",
            JobKind::AuthTimeout => "generation:timeout:auth",
            JobKind::PreparingStuckCheck => "generation:preparing-stuck-check",
            JobKind::QueuedMessageProcess => "conversation:queued-message:process",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "generation:run:chat" => Ok(JobKind::RunChat),
            "generation:run:workflow" => Ok(JobKind::RunWorkflow),
            "generation:timeout:approval" => Ok(JobKind::ApprovalTimeout),
            "generation:timeout:auth" => Ok(JobKind::AuthTimeout),
            "generation:preparing-stuck-check" => Ok(JobKind::PreparingStuckCheck),
            "conversation:queued-message:process" => Ok(JobKind::QueuedMessageProcess),
            other => Err(anyhow::anyhow!("Unknown job kind: {}", other)),
        }
    }
}

impl Serialize for JobKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        JobKind::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A claimed job handed to the worker dispatch loop.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: Value,
    pub run_at: DateTime<Utc>,
}

/// Enqueue interface used throughout the orchestrator.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueues a job. `delay` postpones eligibility; `job_id` deduplicates.
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        job_id: &str,
        delay: Duration,
    ) -> Result<()>;
}

/// Durable queue on the shared store, claimed by worker processes.
pub struct SurrealQueue {
    db: Arc<DBClient>,
}

impl SurrealQueue {
    pub fn new(db: Arc<DBClient>) -> Self {
        Self { db }
    }

    /// Claims up to `limit` due jobs by CAS (`queued → running`).
    #[instrument(name = "queue_claim_due", skip(self))]
    pub async fn claim_due(&self, limit: usize) -> Result<Vec<Job>> {
        let query = format!(
            "{} WHERE status = 'queued' AND run_at <= time::now() ORDER BY run_at ASC LIMIT {}",
            queries::job::SELECT_BASE,
            limit
        );
        let rows = self.db.query_json(&query).await?;

        let mut claimed = Vec::new();
        for row in rows {
            let job: Job = match serde_json::from_value(row) {
                Ok(job) => job,
                Err(e) => {
                    debug!(error = %e, "Skipping malformed job row");
                    continue;
                }
            };
            let won = self
                .db
                .query_json(&format!(
                    "UPDATE job:`{}` SET status = 'running' WHERE status = 'queued' RETURN AFTER",
                    job.id
                ))
                .await?;
            if !won.is_empty() {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    /// Marks a claimed job finished.
    pub async fn complete(&self, job_id: &str) -> Result<()> {
        self.db
            .execute(&format!("UPDATE job:`{}` SET status = 'done'", job_id))
            .await
    }
}

#[async_trait]
impl JobQueue for SurrealQueue {
    #[instrument(name = "queue_enqueue", skip(self, payload), fields(kind = %kind, job_id = %job_id))]
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        job_id: &str,
        delay: Duration,
    ) -> Result<()> {
        let query = format!(
            "CREATE job:`{}` SET kind = $kind, payload = $payload, status = 'queued', \
             run_at = time::now() + {}ms",
            job_id,
            delay.as_millis()
        );
        match self
            .db
            .execute_with_params(
                &query,
                vec![
                    ("kind".to_string(), json!(kind)),
                    ("payload".to_string(), payload),
                ],
            )
            .await
        {
            Ok(()) => {
                debug!("Job enqueued");
                Ok(())
            }
            Err(_) => {
                // Duplicate job_id: the enqueue collapses into the prior one
                debug!("Job id already enqueued, deduplicated");
                Ok(())
            }
        }
    }
}

/// In-memory queue recording enqueues, for tests.
pub struct MemoryQueue {
    jobs: std::sync::Mutex<Vec<(JobKind, Value, String, Duration)>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            jobs: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Recorded enqueues, oldest first.
    pub fn recorded(&self) -> Vec<(JobKind, Value, String, Duration)> {
        self.jobs.lock().unwrap().clone()
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        kind: JobKind,
        payload: Value,
        job_id: &str,
        delay: Duration,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.iter().any(|(_, _, id, _)| id == job_id) {
            return Ok(());
        }
        jobs.push((kind, payload, job_id.to_string(), delay));
        Ok(())
    }
}
