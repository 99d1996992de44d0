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

//! Shared orchestrator state.
//!
//! Everything in here other than the store handles is a per-process soft
//! cache: cancellation tokens, event fan-out, subscriber counters, the
//! finalize guard. Correctness never depends on it; the durable store is
//! authoritative.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::OrchestratorConfig;
use crate::db::{DBClient, GenerationStore};
use crate::lease::LeaseService;
use crate::models::GenerationEvent;
use crate::objectstore::ObjectStore;
use crate::provider::AgentSessionProvider;
use crate::queue::JobQueue;

const BUS_CAPACITY: usize = 256;

/// Shared state threaded through orchestrator operations.
pub struct OrchestratorState {
    pub config: OrchestratorConfig,
    pub db: Arc<DBClient>,
    pub store: GenerationStore,
    pub queue: Arc<dyn JobQueue>,
    pub lease: Arc<dyn LeaseService>,
    pub provider: Arc<dyn AgentSessionProvider>,
    pub objects: Arc<dyn ObjectStore>,
    /// Cancellation tokens of generations running in this process.
    active: Mutex<HashMap<String, CancellationToken>>,
    /// Per-generation event fan-out (lossy, derived from durable state).
    bus: Mutex<HashMap<String, broadcast::Sender<GenerationEvent>>>,
    /// Active subscriber keys, for the duplicate-subscription counter.
    subscribers: Mutex<HashSet<(String, String)>>,
    /// Observability: subscriptions arriving while one was already active.
    pub duplicate_subscriptions: AtomicU64,
    /// Single-entry guard for finalize within this process.
    finalizing: Mutex<HashSet<String>>,
}

impl OrchestratorState {
    pub fn new(
        config: OrchestratorConfig,
        db: Arc<DBClient>,
        queue: Arc<dyn JobQueue>,
        lease: Arc<dyn LeaseService>,
        provider: Arc<dyn AgentSessionProvider>,
        objects: Arc<dyn ObjectStore>,
    ) -> Self {
        let store = GenerationStore::new(db.clone());
        Self {
            config,
            db,
            store,
            queue,
            lease,
            provider,
            objects,
            active: Mutex::new(HashMap::new()),
            bus: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashSet::new()),
            duplicate_subscriptions: AtomicU64::new(0),
            finalizing: Mutex::new(HashSet::new()),
        }
    }

    // =====================================================
    // Active generation contexts
    // =====================================================

    /// Registers a generation as running in this process and returns its
    /// cancellation token.
    pub async fn register_active(&self, generation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.active
            .lock()
            .await
            .insert(generation_id.to_string(), token.clone());
        token
    }

    /// Cancels the local context, when this process owns one.
    pub async fn cancel_active(&self, generation_id: &str) -> bool {
        match self.active.lock().await.get(generation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, generation_id: &str) -> bool {
        self.active.lock().await.contains_key(generation_id)
    }

    /// Evicts the local context after finalize.
    pub async fn remove_active(&self, generation_id: &str) {
        self.active.lock().await.remove(generation_id);
    }

    // =====================================================
    // Event bus (soft, per-process)
    // =====================================================

    /// Publishes an event for local listeners. Losing these is safe: the
    /// subscription stream re-derives everything from durable state.
    pub async fn publish(&self, generation_id: &str, event: GenerationEvent) {
        let bus = self.bus.lock().await;
        if let Some(sender) = bus.get(generation_id) {
            // Send fails when no receiver is attached; that is fine
            let _ = sender.send(event);
        }
    }

    /// Attaches a local listener to a generation's event fan-out.
    pub async fn attach_listener(
        &self,
        generation_id: &str,
    ) -> broadcast::Receiver<GenerationEvent> {
        let mut bus = self.bus.lock().await;
        bus.entry(generation_id.to_string())
            .or_insert_with(|| broadcast::channel(BUS_CAPACITY).0)
            .subscribe()
    }

    /// Drops the fan-out channel after finalize.
    pub async fn drop_channel(&self, generation_id: &str) {
        self.bus.lock().await.remove(generation_id);
    }

    // =====================================================
    // Subscriber tracking (observability only)
    // =====================================================

    /// Marks a subscriber active; bumps the duplicate counter when one
    /// with the same key already is.
    pub async fn subscriber_begin(&self, generation_id: &str, user_id: &str) {
        let key = (generation_id.to_string(), user_id.to_string());
        let mut subscribers = self.subscribers.lock().await;
        if !subscribers.insert(key) {
            let total = self.duplicate_subscriptions.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(
                generation_id = %generation_id,
                user_id = %user_id,
                duplicate_subscriptions = total,
                "Duplicate subscription"
            );
        }
    }

    pub async fn subscriber_end(&self, generation_id: &str, user_id: &str) {
        let key = (generation_id.to_string(), user_id.to_string());
        self.subscribers.lock().await.remove(&key);
    }

    // =====================================================
    // Finalize guard
    // =====================================================

    /// Enters the finalize critical section; false when another task in
    /// this process is already finalizing the generation.
    pub async fn begin_finalize(&self, generation_id: &str) -> bool {
        self.finalizing
            .lock()
            .await
            .insert(generation_id.to_string())
    }

    pub async fn end_finalize(&self, generation_id: &str) {
        self.finalizing.lock().await.remove(generation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // State construction needs the full collaborator set; these tests use
    // the lightweight doubles from the sibling modules.
    use crate::lease::MemoryLease;
    use crate::queue::MemoryQueue;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct NoProvider;

    #[async_trait]
    impl AgentSessionProvider for NoProvider {
        async fn get_or_create_session(
            &self,
            _request: crate::provider::SessionRequest,
            _options: crate::provider::SessionOptions,
        ) -> Result<crate::provider::AgentSession, crate::provider::ProviderError> {
            Err(crate::provider::ProviderError::SessionInit(
                "not available in tests".to_string(),
            ))
        }
    }

    async fn test_state(name: &str) -> OrchestratorState {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(name);
        let endpoint = format!("rocksdb://{}", db_path.display());
        let objects_root = temp_dir.path().join("objects");
        std::mem::forget(temp_dir);

        let db = Arc::new(
            DBClient::connect(&endpoint)
                .await
                .expect("Failed to create test DB"),
        );
        db.initialize_schema().await.expect("Schema init failed");

        OrchestratorState::new(
            OrchestratorConfig::default(),
            db,
            Arc::new(MemoryQueue::new()),
            Arc::new(MemoryLease::new()),
            Arc::new(NoProvider),
            Arc::new(crate::objectstore::FsObjectStore::new(objects_root)),
        )
    }

    #[tokio::test]
    async fn test_active_context_lifecycle() {
        let state = test_state("state_active").await;

        assert!(!state.is_active("gen_1").await);
        assert!(!state.cancel_active("gen_1").await);

        let token = state.register_active("gen_1").await;
        assert!(state.is_active("gen_1").await);
        assert!(!token.is_cancelled());

        assert!(state.cancel_active("gen_1").await);
        assert!(token.is_cancelled());

        state.remove_active("gen_1").await;
        assert!(!state.is_active("gen_1").await);
    }

    #[tokio::test]
    async fn test_event_bus_fanout() {
        let state = test_state("state_bus").await;

        let mut listener = state.attach_listener("gen_1").await;
        state
            .publish(
                "gen_1",
                GenerationEvent::Text {
                    delta: "hi".to_string(),
                },
            )
            .await;

        let event = listener.recv().await.expect("Event should arrive");
        assert_eq!(
            event,
            GenerationEvent::Text {
                delta: "hi".to_string()
            }
        );

        // Publishing without listeners must not error
        state.drop_channel("gen_1").await;
        state
            .publish(
                "gen_1",
                GenerationEvent::Text {
                    delta: "lost".to_string(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_duplicate_subscriber_counter() {
        let state = test_state("state_subs").await;

        state.subscriber_begin("gen_1", "user_1").await;
        assert_eq!(state.duplicate_subscriptions.load(Ordering::Relaxed), 0);

        state.subscriber_begin("gen_1", "user_1").await;
        assert_eq!(state.duplicate_subscriptions.load(Ordering::Relaxed), 1);

        // Different user is not a duplicate
        state.subscriber_begin("gen_1", "user_2").await;
        assert_eq!(state.duplicate_subscriptions.load(Ordering::Relaxed), 1);

        state.subscriber_end("gen_1", "user_1").await;
        state.subscriber_begin("gen_1", "user_1").await;
        assert_eq!(state.duplicate_subscriptions.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_finalize_guard_single_entry() {
        let state = test_state("state_finalize").await;

        assert!(state.begin_finalize("gen_1").await);
        assert!(
            !state.begin_finalize("gen_1").await,
            "Second finalize entry must be rejected"
        );

        state.end_finalize("gen_1").await;
        assert!(state.begin_finalize("gen_1").await);
    }
}
