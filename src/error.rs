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

//! Orchestrator error types.

use thiserror::Error;

/// Which budget a [`OrchestratorError::Timeout`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// Sandbox/session preparation exceeded its budget
    Preparation,
    /// End-to-end upstream prompt processing exceeded its budget
    Prompt,
    /// Pending approval expired without a decision
    Approval,
    /// Pending auth expired without the integrations connecting
    Auth,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Preparation => write!(f, "preparation"),
            TimeoutKind::Prompt => write!(f, "prompt"),
            TimeoutKind::Approval => write!(f, "approval"),
            TimeoutKind::Auth => write!(f, "auth"),
        }
    }
}

/// Error kinds surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Owner mismatch or missing conversation/generation
    #[error("Access denied")]
    AccessDenied,

    /// A non-terminal generation already exists on the conversation
    #[error("Generation already in progress for conversation {0}")]
    ActiveExists(String),

    /// Requested model fails the provider access check
    #[error("Model not allowed: {0}")]
    ModelNotAllowed(String),

    /// One of the layered phase budgets expired
    #[error("Timed out waiting for {0}")]
    Timeout(TimeoutKind),

    /// Upstream session error; fatal for the turn
    #[error("Provider session error: {0}")]
    ProviderSession(String),

    /// Cancellation observed via durable flag or local abort
    #[error("Cancellation requested")]
    CancellationRequested,

    /// Referenced record does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Durable store failure; callers rely on worker retry, not bespoke loops
    #[error("Store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Convenience alias used across the orchestrator modules.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_kind_display() {
        assert_eq!(TimeoutKind::Preparation.to_string(), "preparation");
        assert_eq!(TimeoutKind::Prompt.to_string(), "prompt");
        assert_eq!(TimeoutKind::Approval.to_string(), "approval");
        assert_eq!(TimeoutKind::Auth.to_string(), "auth");
    }

    #[test]
    fn test_error_display() {
        let err = OrchestratorError::ActiveExists("conv_001".to_string());
        assert!(err.to_string().contains("already in progress"));

        let err = OrchestratorError::Timeout(TimeoutKind::Approval);
        assert!(err.to_string().contains("approval"));

        let err = OrchestratorError::ModelNotAllowed("gpt-99".to_string());
        assert!(err.to_string().contains("gpt-99"));
    }

    #[test]
    fn test_store_error_from_anyhow() {
        let err: OrchestratorError = anyhow::anyhow!("db unreachable").into();
        assert!(matches!(err, OrchestratorError::Store(_)));
        assert!(err.to_string().contains("db unreachable"));
    }
}
