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

//! Sandbox/agent session provider boundary.
//!
//! The orchestrator never talks to a vendor SDK directly; everything
//! upstream sits behind these traits. Implementations live outside this
//! crate (and in test doubles).

pub mod events;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use events::{
    MessagePart, PartBody, PermissionRequest, ProviderEvent, QuestionRequest, ToolStatus,
};

/// Provider boundary errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Session initialization failed: {0}")]
    SessionInit(String),

    #[error("Event stream error: {0}")]
    Stream(String),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("Sandbox operation failed: {0}")]
    Sandbox(String),

    #[error("Reply failed: {0}")]
    Reply(String),
}

/// Stages reported by session preparation, in logical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStage {
    SandboxCheckingCache,
    SandboxReused,
    SandboxCreated,
    OpencodeStarting,
    OpencodeReady,
    SessionCreating,
    SessionReused,
    SessionInitCompleted,
}

impl InitStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            InitStage::SandboxCheckingCache => "sandbox_checking_cache",
            InitStage::SandboxReused => "sandbox_reused",
            InitStage::SandboxCreated => "sandbox_created",
            InitStage::OpencodeStarting => "opencode_starting",
            InitStage::OpencodeReady => "opencode_ready",
            InitStage::SessionCreating => "session_creating",
            InitStage::SessionReused => "session_reused",
            InitStage::SessionInitCompleted => "session_init_completed",
        }
    }
}

/// Callback invoked as preparation progresses.
pub type LifecycleHook = Arc<dyn Fn(InitStage) + Send + Sync>;

/// Identity of the session being created or reused.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub conversation_id: String,
    pub generation_id: String,
    pub user_id: String,
    pub model: Option<String>,
    /// Existing session handle to reuse, when the conversation has one.
    pub reuse_session_id: Option<String>,
    /// Existing sandbox handle to reuse, when the conversation has one.
    pub reuse_sandbox_id: Option<String>,
}

/// Behavior knobs for session preparation.
pub struct SessionOptions {
    pub title: Option<String>,
    pub replay_history: bool,
    pub on_lifecycle: Option<LifecycleHook>,
}

/// A prepared session: provider client, session handle, sandbox.
pub struct AgentSession {
    pub client: Arc<dyn SessionClient>,
    pub session_id: String,
    pub sandbox: Arc<dyn Sandbox>,
}

/// One part of a prompt submission.
#[derive(Debug, Clone)]
pub enum PromptPart {
    Text { text: String },
    Image {
        name: String,
        content_type: String,
        data: Vec<u8>,
    },
}

/// Prompt submission for one turn.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    pub session_id: String,
    pub parts: Vec<PromptPart>,
    pub system: Option<String>,
    pub model: Option<String>,
}

/// Reply to a provider permission prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionReply {
    Always,
    Reject,
}

/// Output of a sandbox command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Creates or reuses the per-conversation execution environment.
#[async_trait]
pub trait AgentSessionProvider: Send + Sync {
    async fn get_or_create_session(
        &self,
        request: SessionRequest,
        options: SessionOptions,
    ) -> Result<AgentSession, ProviderError>;
}

/// Chat-session operations. One event subscription per session; dropping
/// the cancel token terminates the stream.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Subscribes to the session's event feed.
    async fn subscribe(
        &self,
        cancel: CancellationToken,
    ) -> Result<BoxStream<'static, ProviderEvent>, ProviderError>;

    /// Submits the prompt; resolves when the provider has finished
    /// producing. Must be awaited in parallel with event consumption.
    async fn prompt(&self, request: PromptRequest) -> Result<(), ProviderError>;

    /// Best-effort cancellation of the in-flight turn.
    async fn abort(&self) -> Result<(), ProviderError>;

    async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
    ) -> Result<(), ProviderError>;

    async fn reply_question(
        &self,
        request_id: &str,
        answers: Vec<String>,
    ) -> Result<(), ProviderError>;

    async fn reject_question(&self, request_id: &str) -> Result<(), ProviderError>;
}

/// Isolated execution environment with files and shell.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ProviderError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), ProviderError>;

    async fn run_command(&self, command: &str) -> Result<CommandOutput, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_stage_names() {
        assert_eq!(
            InitStage::SandboxCheckingCache.as_str(),
            "sandbox_checking_cache"
        );
        assert_eq!(InitStage::OpencodeStarting.as_str(), "opencode_starting");
        assert_eq!(
            InitStage::SessionInitCompleted.as_str(),
            "session_init_completed"
        );
    }

    #[test]
    fn test_permission_reply_equality() {
        assert_eq!(PermissionReply::Always, PermissionReply::Always);
        assert_ne!(PermissionReply::Always, PermissionReply::Reject);
    }
}
