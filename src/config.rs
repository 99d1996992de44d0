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

//! Environment-driven orchestrator configuration.

use std::time::Duration;

use crate::constants::{approval, generation};

/// An `integration/operation` pair that stays interactive even under
/// conversation-level auto-approve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExemptOperation {
    pub integration: String,
    pub operation: String,
}

/// Runtime configuration for the orchestrator and its worker.
///
/// Every field has a production default; `from_env` overrides from the
/// process environment so deployments configure via env only.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Durable store URL (e.g. `rocksdb://var/ripple/db` or `http://…`).
    pub db_url: String,
    /// Budget for sandbox/session preparation.
    pub preparing_timeout: Duration,
    /// Budget for end-to-end upstream prompt processing.
    pub prompt_timeout: Duration,
    /// Budget for a pending approval before the run pauses.
    pub approval_timeout: Duration,
    /// Budget for a pending auth before the run cancels.
    pub auth_timeout: Duration,
    /// When true, `start_generation` enqueues the run job instead of
    /// executing in-process.
    pub defer_to_worker: bool,
    /// Optional external monitor pinged by the preparing stuck-check.
    pub monitor_url: Option<String>,
    /// Operations exempt from auto-approval (default: Slack `send`).
    pub auto_approve_exempt: Vec<ExemptOperation>,
    /// Directory prefixes whose external-directory permission requests
    /// auto-approve without a user prompt.
    pub auto_approve_dir_prefixes: Vec<String>,
    /// Workflow generations get a fresh provider session per run.
    pub workflow_fresh_session: bool,
    /// Models accepted by admission; empty means any model passes.
    pub allowed_models: Vec<String>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            db_url: "rocksdb://ripple-data".to_string(),
            preparing_timeout: Duration::from_secs(generation::PREPARING_TIMEOUT_SECS),
            prompt_timeout: Duration::from_secs(generation::PROMPT_TIMEOUT_SECS),
            approval_timeout: Duration::from_secs(approval::APPROVAL_TIMEOUT_SECS),
            auth_timeout: Duration::from_secs(approval::AUTH_TIMEOUT_SECS),
            defer_to_worker: false,
            monitor_url: None,
            auto_approve_exempt: vec![ExemptOperation {
                integration: "slack".to_string(),
                operation: "send".to_string(),
            }],
            auto_approve_dir_prefixes: vec![generation::UPLOADS_DIR.to_string()],
            workflow_fresh_session: true,
            allowed_models: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Builds a configuration from the process environment.
    ///
    /// Recognized variables:
    /// - `RIPPLE_DB_URL`
    /// - `RIPPLE_PREPARING_TIMEOUT_SECS`
    /// - `RIPPLE_PROMPT_TIMEOUT_SECS`
    /// - `RIPPLE_DEFER_TO_WORKER` (booleanish: `1`, `true`, `yes`)
    /// - `RIPPLE_MONITOR_URL`
    /// - `RIPPLE_ALLOWED_MODELS` (comma-separated)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("RIPPLE_DB_URL") {
            if !url.is_empty() {
                config.db_url = url;
            }
        }
        if let Some(secs) = env_u64("RIPPLE_PREPARING_TIMEOUT_SECS") {
            config.preparing_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("RIPPLE_PROMPT_TIMEOUT_SECS") {
            config.prompt_timeout = Duration::from_secs(secs);
        }
        if let Ok(flag) = std::env::var("RIPPLE_DEFER_TO_WORKER") {
            config.defer_to_worker = is_truthy(&flag);
        }
        if let Ok(url) = std::env::var("RIPPLE_MONITOR_URL") {
            if !url.is_empty() {
                config.monitor_url = Some(url);
            }
        }
        if let Ok(models) = std::env::var("RIPPLE_ALLOWED_MODELS") {
            config.allowed_models = models
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }

        config
    }

    /// Returns true when `integration`/`operation` must stay interactive
    /// even with conversation auto-approve enabled.
    pub fn is_auto_approve_exempt(&self, integration: &str, operation: &str) -> bool {
        self.auto_approve_exempt
            .iter()
            .any(|e| e.integration == integration && e.operation == operation)
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.preparing_timeout, Duration::from_secs(300));
        assert_eq!(config.prompt_timeout, Duration::from_secs(1500));
        assert_eq!(config.approval_timeout, Duration::from_secs(300));
        assert_eq!(config.auth_timeout, Duration::from_secs(600));
        assert!(!config.defer_to_worker);
        assert!(config.workflow_fresh_session);
    }

    #[test]
    fn test_slack_send_exempt_by_default() {
        let config = OrchestratorConfig::default();
        assert!(config.is_auto_approve_exempt("slack", "send"));
        assert!(!config.is_auto_approve_exempt("slack", "read"));
        assert!(!config.is_auto_approve_exempt("github", "send"));
    }

    #[test]
    fn test_is_truthy() {
        assert!(is_truthy("1"));
        assert!(is_truthy("true"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("yes"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("false"));
        assert!(!is_truthy(""));
    }

    #[test]
    fn test_uploads_prefix_default() {
        let config = OrchestratorConfig::default();
        assert_eq!(
            config.auto_approve_dir_prefixes,
            vec!["/home/user/uploads".to_string()]
        );
    }
}
