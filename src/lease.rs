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

//! Distributed lease service: the single-writer guard per generation.
//!
//! Tokens are opaque and unique per acquisition. Renew and release are
//! no-ops when the token no longer matches the current holder (CAS on the
//! owner column), so a crashed worker's stale token can never disturb a
//! successor.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::constants::lease;
use crate::db::DBClient;

/// Lease key for a generation's live execution.
pub fn generation_lease_key(generation_id: &str) -> String {
    format!("{}{}", lease::GENERATION_KEY_PREFIX, generation_id)
}

/// TTL-based named leases with owner-token CAS.
#[async_trait]
pub trait LeaseService: Send + Sync {
    /// Attempts to acquire `key`; returns the owner token on success,
    /// `None` when another holder is alive.
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>>;

    /// Extends the lease iff `token` still owns it.
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool>;

    /// Releases the lease iff `token` still owns it.
    async fn release(&self, key: &str, token: &str) -> Result<()>;
}

/// Durable lease implementation on the shared store.
pub struct SurrealLease {
    db: Arc<DBClient>,
}

impl SurrealLease {
    pub fn new(db: Arc<DBClient>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl LeaseService for SurrealLease {
    #[instrument(name = "lease_try_acquire", skip(self), fields(key = %key))]
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        // Expired holders are garbage; clear before attempting the CREATE.
        self.db
            .execute_with_params(
                "DELETE lease WHERE meta::id(id) = $key AND expires_at < time::now()",
                vec![("key".to_string(), json!(key))],
            )
            .await?;

        let token = Uuid::new_v4().to_string();
        let query = format!(
            "CREATE lease:`{}` SET owner = $token, expires_at = time::now() + {}ms",
            key,
            ttl.as_millis()
        );
        // CREATE fails on an existing record: that is the "someone else
        // holds it" signal, not an error.
        match self
            .db
            .execute_with_params(&query, vec![("token".to_string(), json!(token))])
            .await
        {
            Ok(()) => {
                // The SDK surfaces statement errors on result take, but
                // execute() discards result sets; verify ownership.
                let rows = self
                    .db
                    .query_json_with_params(
                        "SELECT owner FROM lease WHERE meta::id(id) = $key",
                        vec![("key".to_string(), json!(key))],
                    )
                    .await?;
                let owned = rows
                    .first()
                    .and_then(|r| r.get("owner"))
                    .and_then(|o| o.as_str())
                    == Some(token.as_str());
                if owned {
                    debug!("Lease acquired");
                    Ok(Some(token))
                } else {
                    debug!("Lease held by another worker");
                    Ok(None)
                }
            }
            Err(_) => {
                debug!("Lease held by another worker");
                Ok(None)
            }
        }
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let rows = self
            .db
            .query_json_with_params(
                &format!(
                    "UPDATE lease SET expires_at = time::now() + {}ms \
                     WHERE meta::id(id) = $key AND owner = $token RETURN AFTER",
                    ttl.as_millis()
                ),
                vec![
                    ("key".to_string(), json!(key)),
                    ("token".to_string(), json!(token)),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        self.db
            .execute_with_params(
                "DELETE lease WHERE meta::id(id) = $key AND owner = $token",
                vec![
                    ("key".to_string(), json!(key)),
                    ("token".to_string(), json!(token)),
                ],
            )
            .await
    }
}

/// Non-distributed lease for tests and single-process deployments.
pub struct MemoryLease {
    held: std::sync::Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLease {
    pub fn new() -> Self {
        Self {
            held: std::sync::Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryLease {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseService for MemoryLease {
    async fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<String>> {
        let mut held = self.held.lock().unwrap();
        if let Some((_, expires)) = held.get(key) {
            if *expires > Instant::now() {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        held.insert(key.to_string(), (token.clone(), Instant::now() + ttl));
        Ok(Some(token))
    }

    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<bool> {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(key) {
            Some((owner, expires)) if owner == token => {
                *expires = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, token: &str) -> Result<()> {
        let mut held = self.held.lock().unwrap();
        let owned = held
            .get(key)
            .map(|(owner, _)| owner == token)
            .unwrap_or(false);
        if owned {
            held.remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generation_lease_key() {
        assert_eq!(
            generation_lease_key("gen_001"),
            "locks:generation:gen_001"
        );
    }

    #[tokio::test]
    async fn test_memory_lease_single_holder() {
        let lease = MemoryLease::new();
        let ttl = Duration::from_secs(60);

        let token = lease
            .try_acquire("locks:generation:g1", ttl)
            .await
            .unwrap()
            .expect("First acquire should succeed");

        assert!(
            lease
                .try_acquire("locks:generation:g1", ttl)
                .await
                .unwrap()
                .is_none(),
            "Second acquire must fail while held"
        );

        assert!(lease.renew("locks:generation:g1", &token, ttl).await.unwrap());
        assert!(
            !lease
                .renew("locks:generation:g1", "wrong-token", ttl)
                .await
                .unwrap(),
            "Renew with a stale token must be a no-op"
        );

        lease.release("locks:generation:g1", &token).await.unwrap();
        assert!(
            lease
                .try_acquire("locks:generation:g1", ttl)
                .await
                .unwrap()
                .is_some(),
            "Released lease must be acquirable again"
        );
    }

    #[tokio::test]
    async fn test_memory_lease_expiry() {
        let lease = MemoryLease::new();
        let _token = lease
            .try_acquire("k", Duration::from_millis(20))
            .await
            .unwrap()
            .expect("Acquire should succeed");

        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(
            lease
                .try_acquire("k", Duration::from_secs(60))
                .await
                .unwrap()
                .is_some(),
            "Expired lease must be acquirable"
        );
    }

    #[tokio::test]
    async fn test_memory_release_with_wrong_token_keeps_lease() {
        let lease = MemoryLease::new();
        let ttl = Duration::from_secs(60);
        let _token = lease.try_acquire("k", ttl).await.unwrap().unwrap();

        lease.release("k", "someone-else").await.unwrap();
        assert!(
            lease.try_acquire("k", ttl).await.unwrap().is_none(),
            "Release with a stale token must be a no-op"
        );
    }

    async fn surreal_lease(name: &str) -> SurrealLease {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(name);
        let endpoint = format!("rocksdb://{}", db_path.display());
        std::mem::forget(temp_dir);

        let db = Arc::new(
            DBClient::connect(&endpoint)
                .await
                .expect("Failed to create test DB"),
        );
        db.initialize_schema().await.expect("Schema init failed");
        SurrealLease::new(db)
    }

    #[tokio::test]
    async fn test_surreal_lease_mutual_exclusion() {
        let lease = surreal_lease("lease_db").await;
        let ttl = Duration::from_secs(60);
        let key = generation_lease_key("gen_1");

        let token = lease
            .try_acquire(&key, ttl)
            .await
            .unwrap()
            .expect("First acquire should succeed");

        assert!(
            lease.try_acquire(&key, ttl).await.unwrap().is_none(),
            "Held lease must not be re-acquirable"
        );

        assert!(lease.renew(&key, &token, ttl).await.unwrap());
        assert!(!lease.renew(&key, "stale", ttl).await.unwrap());

        lease.release(&key, &token).await.unwrap();
        assert!(lease.try_acquire(&key, ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_surreal_lease_expired_takeover() {
        let lease = surreal_lease("lease_exp_db").await;
        let key = generation_lease_key("gen_2");

        let _old = lease
            .try_acquire(&key, Duration::from_millis(30))
            .await
            .unwrap()
            .expect("Acquire should succeed");

        tokio::time::sleep(Duration::from_millis(80)).await;

        let new = lease
            .try_acquire(&key, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(new.is_some(), "Expired lease must be claimable");
    }
}
