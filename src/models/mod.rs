// Copyright 2025 Ripple Contributors
// SPDX-License-Identifier: Apache-2.0

pub mod content_part;
pub mod conversation;
pub mod events;
pub mod generation;
pub mod message;
pub mod pending;
pub mod queued_message;
pub mod workflow_run;

pub use content_part::{ApprovalStatus, ContentPart};
pub use conversation::{
    Conversation, ConversationCreate, ConversationKind, ConversationPatch, ConversationStatus,
};
pub use events::{DonePayload, GenerationEvent};
pub use generation::{
    ExecutionPolicy, FileAttachment, Generation, GenerationCreate, GenerationPatch,
    GenerationStatus, GenerationTimings, PhaseMark,
};
pub use message::{Message, MessageCreate, MessageRole, SandboxFile};
pub use pending::{ApprovalDecision, PendingApproval, PendingAuth, ProviderRequestKind};
pub use queued_message::{QueuedMessage, QueuedMessageCreate, QueuedMessageStatus};
pub use workflow_run::{WorkflowRun, WorkflowRunStatus};
