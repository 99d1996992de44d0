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

//! Centralized constants for the generation orchestrator.

// ===== Lease =====
pub mod lease {
    /// Lease TTL for a generation's single-writer guard.
    pub const TTL_SECS: u64 = 120;

    /// Renew cadence while the runner holds the lease.
    pub const RENEW_INTERVAL_SECS: u64 = 30;

    /// Key prefix for generation leases.
    pub const GENERATION_KEY_PREFIX: &str = "locks:generation:";
}

// ===== Generation Runner =====
pub mod generation {
    /// Default budget (seconds) for sandbox/session preparation.
    pub const PREPARING_TIMEOUT_SECS: u64 = 300;

    /// Default budget (seconds) for end-to-end upstream prompt processing.
    pub const PROMPT_TIMEOUT_SECS: u64 = 1500;

    /// Interval between durable cancellation-flag polls while running.
    pub const CANCEL_POLL_INTERVAL_SECS: u64 = 1;

    /// Maximum serialized size for a tool result before truncation.
    pub const TOOL_RESULT_MAX_BYTES: usize = 50_000;

    /// Sandbox directory where user-staged uploads land.
    pub const UPLOADS_DIR: &str = "/home/user/uploads";

    /// Sandbox location of the pre-prompt setup cache record.
    pub const PRE_PROMPT_CACHE_PATH: &str = "/app/.opencode/pre-prompt-cache.json";

    /// Sandbox manifest listing the skills written during pre-prompt setup.
    pub const SKILLS_MANIFEST_PATH: &str = "/app/.opencode/skills.json";

    /// Sandbox directory the model deposits integration-skill drafts into.
    pub const SKILL_DRAFTS_DIR: &str = "/app/.opencode/integration-skill-drafts";

    /// User command that resets the provider session instead of prompting.
    pub const SESSION_RESET_COMMAND: &str = "/new";

    /// Marker stored in the system message inserted on session reset.
    pub const SESSION_BOUNDARY_MARKER: &str = "SESSION_BOUNDARY";

    /// Fixed assistant body for a session-reset turn.
    pub const SESSION_RESET_REPLY: &str =
        "Started a fresh session. Previous context has been archived.";

    /// System content-part body appended when a run is cancelled mid-stream.
    pub const INTERRUPTED_MESSAGE: &str = "Interrupted by user";

    /// Assistant body used when a run finalizes as error without any text.
    pub const ERROR_FALLBACK_MESSAGE: &str =
        "I apologize, something went wrong while generating this response.";

    /// Maximum characters for an auto-generated conversation title.
    pub const TITLE_MAX_CHARS: usize = 80;
}

// ===== Pending Approval / Auth =====
pub mod approval {
    /// Budget (seconds) for a pending approval before the run pauses.
    pub const APPROVAL_TIMEOUT_SECS: u64 = 300;

    /// Budget (seconds) for a pending auth before the run cancels.
    pub const AUTH_TIMEOUT_SECS: u64 = 600;

    /// Interval between durable-state polls while waiting for a decision.
    pub const DECISION_POLL_INTERVAL_MS: u64 = 400;
}

// ===== Event Stream Normalizer =====
pub mod normalizer {
    /// Maximum buffered parts per unknown-role message.
    pub const PART_QUEUE_MAX: usize = 100;

    /// Buffered parts expire this long after the first enqueue.
    pub const PART_QUEUE_TTL_SECS: u64 = 300;
}

// ===== Subscription Stream =====
pub mod subscription {
    /// Base polling interval against durable state.
    pub const BASE_POLL_INTERVAL_MS: u64 = 500;

    /// Minimum interval while the generation awaits approval or auth.
    pub const AWAITING_MIN_INTERVAL_MS: u64 = 2000;

    /// Backoff cap for chat conversations.
    pub const CHAT_MAX_INTERVAL_MS: u64 = 3000;

    /// Backoff cap for workflow conversations.
    pub const WORKFLOW_MAX_INTERVAL_MS: u64 = 5000;

    /// A status_change heartbeat is emitted at least this often.
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 10;

    /// Global maximum wait for chat subscriptions.
    pub const CHAT_MAX_WAIT_SECS: u64 = 180;

    /// Global maximum wait for workflow subscriptions.
    pub const WORKFLOW_MAX_WAIT_SECS: u64 = 600;

    /// Event channel capacity for one subscriber.
    pub const CHANNEL_CAPACITY: usize = 256;
}

// ===== Background Jobs =====
pub mod queue {
    /// Jobs claimed per worker poll.
    pub const CLAIM_BATCH: usize = 16;

    /// Worker poll interval when the queue is idle.
    pub const POLL_INTERVAL_MS: u64 = 500;
}

// ===== Stale Generation Reaper =====
pub mod reaper {
    /// A `running` generation older than this finalizes as error.
    pub const RUNNING_MAX_AGE_SECS: i64 = 6 * 3600;

    /// An `awaiting_approval` generation older than this finalizes as cancelled.
    pub const AWAITING_APPROVAL_MAX_AGE_SECS: i64 = 30 * 60;

    /// An `awaiting_auth` generation older than this finalizes as cancelled.
    pub const AWAITING_AUTH_MAX_AGE_SECS: i64 = 60 * 60;

    /// A `paused` generation older than this finalizes as cancelled.
    pub const PAUSED_MAX_AGE_SECS: i64 = 60 * 60;

    /// Interval between reaper scans in the worker binary.
    pub const SCAN_INTERVAL_SECS: u64 = 300;
}

// ===== Post-processing =====
pub mod postprocess {
    /// Roots scanned for files the model produced during the turn.
    pub const SCAN_ROOTS: &[&str] = &["/app", "/home/user"];

    /// Path fragments excluded from produced-file collection.
    pub const IGNORED_FRAGMENTS: &[&str] = &[
        "node_modules",
        ".git",
        ".cache",
        "__pycache__",
        ".venv",
        ".opencode",
    ];

    /// Basenames excluded from produced-file collection.
    pub const IGNORED_BASENAMES: &[&str] = &[
        ".DS_Store",
        "package-lock.json",
        "yarn.lock",
        "pnpm-lock.yaml",
        "Cargo.lock",
        "uv.lock",
        "poetry.lock",
    ];
}
