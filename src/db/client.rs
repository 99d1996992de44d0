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

use anyhow::Result;
use surrealdb::engine::any::{connect, Any};
use surrealdb::Surreal;
use tracing::{debug, error, info, instrument};

/// Database client for SurrealDB operations.
///
/// Built on the `any` engine: `rocksdb://path` for embedded deployments and
/// tests, `http://host:port` or `ws://host:port` for a shared server in
/// multi-process deployments.
pub struct DBClient {
    pub db: Surreal<Any>,
}

impl DBClient {
    /// Creates a new database client and connects to the given endpoint.
    #[instrument(name = "db_client_connect", skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &str) -> Result<Self> {
        info!("Connecting to SurrealDB");

        let db = connect(endpoint).await.map_err(|e| {
            error!(error = %e, "Failed to connect to SurrealDB");
            e
        })?;

        db.use_ns("ripple")
            .use_db("orchestrator")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to select namespace/database");
                e
            })?;

        info!("SurrealDB connection established");
        Ok(Self { db })
    }

    /// Initializes the database schema.
    #[instrument(name = "db_initialize_schema", skip(self))]
    pub async fn initialize_schema(&self) -> Result<()> {
        use super::schema::SCHEMA_SQL;

        info!("Initializing database schema");

        self.db.query(SCHEMA_SQL).await.map_err(|e| {
            error!(error = %e, "Failed to initialize schema");
            e
        })?;

        info!("Database schema initialized successfully");
        Ok(())
    }

    /// Executes a query and deserializes the first result set.
    #[instrument(name = "db_query", skip(self), fields(query_len = query.len()))]
    pub async fn query<T>(&self, query: &str) -> Result<Vec<T>>
    where
        T: serde::de::DeserializeOwned,
    {
        debug!(query_preview = %query.chars().take(100).collect::<String>(), "Executing query");

        let mut result = self.db.query(query).await.map_err(|e| {
            error!(error = %e, "Query execution failed");
            e
        })?;

        let data: Vec<T> = result.take(0).map_err(|e| {
            error!(error = %e, "Failed to deserialize query results");
            e
        })?;

        debug!(result_count = data.len(), "Query completed");
        Ok(data)
    }

    /// Executes a raw query and returns results as JSON Values.
    /// Use this when the standard query method fails due to SurrealDB SDK
    /// serialization issues.
    #[instrument(name = "db_query_json", skip(self), fields(query_len = query.len()))]
    pub async fn query_json(&self, query: &str) -> Result<Vec<serde_json::Value>> {
        debug!(query_preview = %query.chars().take(100).collect::<String>(), "Executing JSON query");

        let mut result = self.db.query(query).await.map_err(|e| {
            error!(error = %e, "Query execution failed");
            e
        })?;

        let data: Vec<serde_json::Value> = result.take(0).map_err(|e| {
            error!(error = %e, "Failed to extract query results");
            e
        })?;

        debug!(result_count = data.len(), "Query completed");
        Ok(data)
    }

    /// Executes a parameterized query and returns results as JSON Values.
    ///
    /// Parameters bind through the SDK so caller-supplied values never end
    /// up concatenated into SurrealQL.
    #[instrument(name = "db_query_json_with_params", skip(self, params), fields(query_len = query.len()))]
    pub async fn query_json_with_params(
        &self,
        query: &str,
        params: Vec<(String, serde_json::Value)>,
    ) -> Result<Vec<serde_json::Value>> {
        debug!(query_preview = %query.chars().take(100).collect::<String>(), "Executing parameterized JSON query");

        let mut query_builder = self.db.query(query);

        for (name, value) in params {
            query_builder = query_builder.bind((name, value));
        }

        let mut result = query_builder.await.map_err(|e| {
            error!(error = %e, "Parameterized query execution failed");
            e
        })?;

        let data: Vec<serde_json::Value> = result.take(0).map_err(|e| {
            error!(error = %e, "Failed to extract parameterized query results");
            e
        })?;

        debug!(
            result_count = data.len(),
            "Parameterized JSON query completed"
        );
        Ok(data)
    }

    /// Executes a query without deserializing the result.
    ///
    /// Use this for UPSERT, CREATE, UPDATE, DELETE operations where you
    /// don't need the returned data.
    #[instrument(name = "db_execute", skip(self), fields(query_len = query.len()))]
    pub async fn execute(&self, query: &str) -> Result<()> {
        debug!(query_preview = %query.chars().take(100).collect::<String>(), "Executing query (no result)");

        self.db.query(query).await.map_err(|e| {
            error!(error = %e, "Query execution failed");
            e
        })?;

        debug!("Query executed successfully");
        Ok(())
    }

    /// Executes a parameterized mutation without returning results.
    #[instrument(name = "db_execute_with_params", skip(self, params), fields(query_len = query.len()))]
    pub async fn execute_with_params(
        &self,
        query: &str,
        params: Vec<(String, serde_json::Value)>,
    ) -> Result<()> {
        debug!(query_preview = %query.chars().take(100).collect::<String>(), "Executing parameterized mutation");

        let mut query_builder = self.db.query(query);

        for (name, value) in params {
            query_builder = query_builder.bind((name, value));
        }

        query_builder.await.map_err(|e| {
            error!(error = %e, "Parameterized mutation execution failed");
            e
        })?;

        debug!("Parameterized mutation executed successfully");
        Ok(())
    }

    /// Creates a new record in the specified table with a specific ID.
    ///
    /// Uses a SurrealQL CREATE query with CONTENT to avoid SDK serialization
    /// issues. The data should NOT contain an `id` field (it's set via the
    /// record ID). Returns an error when the record already exists, which
    /// callers use for id-based deduplication.
    #[instrument(name = "db_create", skip(self, data), fields(table = %table, record_id = %id))]
    pub async fn create<T>(&self, table: &str, id: &str, data: T) -> Result<String>
    where
        T: serde::Serialize + Send + Sync + 'static,
    {
        debug!("Creating record");

        let json_data = serde_json::to_value(&data).map_err(|e| {
            error!(error = %e, "Failed to serialize data to JSON");
            anyhow::anyhow!("Serialization error: {}", e)
        })?;

        // RETURN meta::id(id) yields a plain string instead of a Thing enum
        // (SurrealDB SDK 2.x serialization issue)
        let query = format!(
            "CREATE {}:`{}` CONTENT $data RETURN meta::id(id) AS created_id",
            table, id
        );
        let mut result = self
            .db
            .query(&query)
            .bind(("data", json_data))
            .await
            .map_err(|e| {
                debug!(error = %e, "Failed to create record");
                e
            })?;

        let created: Option<serde_json::Value> = result.take(0).map_err(|e| {
            debug!(error = %e, "Failed to get create result");
            anyhow::anyhow!("Failed to get create result: {}", e)
        })?;

        match created {
            Some(_) => {
                debug!(record_id = %id, "Record created successfully");
                Ok(id.to_string())
            }
            None => {
                // Not created - ASSERT constraint violation or duplicate id
                debug!(
                    table = %table,
                    record_id = %id,
                    "Record was NOT created - constraint violation or duplicate"
                );
                Err(anyhow::anyhow!(
                    "Failed to create record in {}: record was silently rejected",
                    table
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_client(name: &str) -> DBClient {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join(name);
        let endpoint = format!("rocksdb://{}", db_path.display());
        // Directory must outlive the test body
        std::mem::forget(temp_dir);

        DBClient::connect(&endpoint)
            .await
            .expect("DBClient creation should succeed")
    }

    #[tokio::test]
    async fn test_db_client_connect() {
        let db = test_client("connect_db").await;
        let result: Vec<serde_json::Value> = db.query("INFO FOR DB").await.expect("Query failed");
        assert!(!result.is_empty(), "INFO query should return database info");
    }

    #[tokio::test]
    async fn test_db_initialize_schema() {
        let db = test_client("schema_db").await;
        let result = db.initialize_schema().await;
        assert!(result.is_ok(), "Schema initialization should succeed");
    }

    #[tokio::test]
    async fn test_db_query_empty_result() {
        let db = test_client("query_db").await;
        db.initialize_schema().await.expect("Schema init failed");

        let result: Vec<serde_json::Value> = db
            .query("SELECT * FROM generation")
            .await
            .expect("Query failed");

        assert!(result.is_empty(), "Empty table should return empty result");
    }

    #[tokio::test]
    async fn test_db_create_duplicate_id_rejected() {
        let db = test_client("dup_db").await;
        db.initialize_schema().await.expect("Schema init failed");

        let data = serde_json::json!({
            "kind": "generation:run:chat",
            "payload": {},
            "status": "queued",
        });

        let first = db.create("job", "job_1", data.clone()).await;
        assert!(first.is_ok(), "First create should succeed");

        let second = db.create("job", "job_1", data).await;
        assert!(second.is_err(), "Duplicate id should be rejected");
    }
}
