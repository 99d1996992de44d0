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

pub const SCHEMA_SQL: &str = r#"
-- Namespace and Database
DEFINE NAMESPACE ripple;
USE NS ripple;
DEFINE DATABASE orchestrator;
USE DB orchestrator;

-- Table: conversation
DEFINE TABLE OVERWRITE conversation SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON conversation TYPE string;
DEFINE FIELD OVERWRITE user_id ON conversation TYPE string;
DEFINE FIELD OVERWRITE kind ON conversation TYPE string ASSERT $value IN ['chat', 'workflow'];
DEFINE FIELD OVERWRITE model ON conversation TYPE option<string>;
DEFINE FIELD OVERWRITE auto_approve ON conversation TYPE bool DEFAULT false;
DEFINE FIELD OVERWRITE current_generation_id ON conversation TYPE option<string>;
DEFINE FIELD OVERWRITE generation_status ON conversation TYPE string DEFAULT 'idle'
    ASSERT $value IN ['idle', 'generating', 'awaiting_approval', 'awaiting_auth', 'paused', 'complete', 'error'];
DEFINE FIELD OVERWRITE sandbox_id ON conversation TYPE option<string>;
DEFINE FIELD OVERWRITE agent_session_id ON conversation TYPE option<string>;
DEFINE FIELD OVERWRITE title ON conversation TYPE option<string>;
DEFINE FIELD OVERWRITE created_at ON conversation TYPE datetime DEFAULT time::now();
DEFINE FIELD OVERWRITE updated_at ON conversation TYPE datetime DEFAULT time::now();

DEFINE INDEX OVERWRITE conversation_user_idx ON conversation FIELDS user_id;

-- Table: generation
-- One end-to-end run. Content parts and pending payloads are FLEXIBLE
-- objects: their serialized shape is owned by the Rust model layer.
DEFINE TABLE OVERWRITE generation SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON generation TYPE string;
DEFINE FIELD OVERWRITE conversation_id ON generation TYPE string;
DEFINE FIELD OVERWRITE status ON generation TYPE string
    ASSERT $value IN ['running', 'awaiting_approval', 'awaiting_auth', 'paused', 'completed', 'cancelled', 'error'];
DEFINE FIELD OVERWRITE content_parts ON generation FLEXIBLE TYPE array DEFAULT [];
DEFINE FIELD OVERWRITE pending_approval ON generation FLEXIBLE TYPE option<object>;
DEFINE FIELD OVERWRITE pending_auth ON generation FLEXIBLE TYPE option<object>;
DEFINE FIELD OVERWRITE execution_policy ON generation FLEXIBLE TYPE object;
DEFINE FIELD OVERWRITE tokens_input ON generation TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE tokens_output ON generation TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE started_at ON generation TYPE datetime DEFAULT time::now();
DEFINE FIELD OVERWRITE completed_at ON generation TYPE option<datetime>;
DEFINE FIELD OVERWRITE cancel_requested_at ON generation TYPE option<datetime>;
DEFINE FIELD OVERWRITE error_message ON generation TYPE option<string>;
DEFINE FIELD OVERWRITE sandbox_id ON generation TYPE option<string>;
DEFINE FIELD OVERWRITE message_id ON generation TYPE option<string>;
DEFINE FIELD OVERWRITE workflow_run_id ON generation TYPE option<string>;
DEFINE FIELD OVERWRITE is_paused ON generation TYPE bool DEFAULT false;

-- Admission checks "no non-terminal generation on this conversation"
DEFINE INDEX OVERWRITE generation_conversation_idx ON generation FIELDS conversation_id;
DEFINE INDEX OVERWRITE generation_status_idx ON generation FIELDS status;
DEFINE INDEX OVERWRITE generation_conversation_status_idx ON generation FIELDS conversation_id, status;

-- Table: message
DEFINE TABLE OVERWRITE message SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON message TYPE string;
DEFINE FIELD OVERWRITE conversation_id ON message TYPE string;
DEFINE FIELD OVERWRITE role ON message TYPE string ASSERT $value IN ['user', 'assistant', 'system'];
DEFINE FIELD OVERWRITE content ON message TYPE string;
DEFINE FIELD OVERWRITE content_parts ON message FLEXIBLE TYPE option<array>;
DEFINE FIELD OVERWRITE tokens_input ON message TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE tokens_output ON message TYPE int DEFAULT 0;
DEFINE FIELD OVERWRITE timing ON message FLEXIBLE TYPE option<object>;
DEFINE FIELD OVERWRITE attachments ON message FLEXIBLE TYPE array DEFAULT [];
DEFINE FIELD OVERWRITE sandbox_files ON message FLEXIBLE TYPE array DEFAULT [];
DEFINE FIELD OVERWRITE created_at ON message TYPE datetime DEFAULT time::now();

-- message is write-heavy; both indexes are read-path critical
-- (history loading and chronological display)
DEFINE INDEX OVERWRITE message_conversation_idx ON message FIELDS conversation_id;
DEFINE INDEX OVERWRITE message_created_idx ON message FIELDS created_at;

-- Table: queued_message
DEFINE TABLE OVERWRITE queued_message SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON queued_message TYPE string;
DEFINE FIELD OVERWRITE conversation_id ON queued_message TYPE string;
DEFINE FIELD OVERWRITE user_id ON queued_message TYPE string;
DEFINE FIELD OVERWRITE content ON queued_message TYPE string;
DEFINE FIELD OVERWRITE file_attachments ON queued_message FLEXIBLE TYPE array DEFAULT [];
DEFINE FIELD OVERWRITE selected_platform_skills ON queued_message TYPE array<string> DEFAULT [];
DEFINE FIELD OVERWRITE status ON queued_message TYPE string DEFAULT 'queued'
    ASSERT $value IN ['queued', 'processing', 'sent', 'failed'];
DEFINE FIELD OVERWRITE generation_id ON queued_message TYPE option<string>;
DEFINE FIELD OVERWRITE error_message ON queued_message TYPE option<string>;
DEFINE FIELD OVERWRITE created_at ON queued_message TYPE datetime DEFAULT time::now();
DEFINE FIELD OVERWRITE updated_at ON queued_message TYPE datetime DEFAULT time::now();

DEFINE INDEX OVERWRITE queued_conversation_idx ON queued_message FIELDS conversation_id;
DEFINE INDEX OVERWRITE queued_conversation_status_idx ON queued_message FIELDS conversation_id, status;

-- Table: workflow_run (status mirror only; execution is external)
DEFINE TABLE OVERWRITE workflow_run SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON workflow_run TYPE string;
DEFINE FIELD OVERWRITE user_id ON workflow_run TYPE string;
DEFINE FIELD OVERWRITE name ON workflow_run TYPE string;
DEFINE FIELD OVERWRITE status ON workflow_run TYPE string DEFAULT 'running'
    ASSERT $value IN ['running', 'awaiting_approval', 'awaiting_auth', 'completed', 'cancelled', 'error'];
DEFINE FIELD OVERWRITE conversation_id ON workflow_run TYPE option<string>;
DEFINE FIELD OVERWRITE created_at ON workflow_run TYPE datetime DEFAULT time::now();
DEFINE FIELD OVERWRITE updated_at ON workflow_run TYPE datetime DEFAULT time::now();

-- Table: job (deduplicated delayed worker jobs)
-- Record id doubles as the dedup key: CREATE on an existing id fails and
-- the enqueue becomes a no-op.
DEFINE TABLE OVERWRITE job SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON job TYPE string;
DEFINE FIELD OVERWRITE kind ON job TYPE string;
DEFINE FIELD OVERWRITE payload ON job FLEXIBLE TYPE object;
DEFINE FIELD OVERWRITE status ON job TYPE string DEFAULT 'queued'
    ASSERT $value IN ['queued', 'running', 'done'];
DEFINE FIELD OVERWRITE run_at ON job TYPE datetime DEFAULT time::now();
DEFINE FIELD OVERWRITE created_at ON job TYPE datetime DEFAULT time::now();

DEFINE INDEX OVERWRITE job_status_run_idx ON job FIELDS status, run_at;

-- Table: lease (single-writer guards, CAS on owner)
DEFINE TABLE OVERWRITE lease SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON lease TYPE string;
DEFINE FIELD OVERWRITE owner ON lease TYPE string;
DEFINE FIELD OVERWRITE expires_at ON lease TYPE datetime;
DEFINE FIELD OVERWRITE created_at ON lease TYPE datetime DEFAULT time::now();

-- Table: skill_draft (integration-skill drafts imported in post-processing)
DEFINE TABLE OVERWRITE skill_draft SCHEMAFULL;
DEFINE FIELD OVERWRITE id ON skill_draft TYPE string;
DEFINE FIELD OVERWRITE user_id ON skill_draft TYPE string;
DEFINE FIELD OVERWRITE generation_id ON skill_draft TYPE string;
DEFINE FIELD OVERWRITE draft ON skill_draft FLEXIBLE TYPE object;
DEFINE FIELD OVERWRITE created_at ON skill_draft TYPE datetime DEFAULT time::now();

DEFINE INDEX OVERWRITE skill_draft_user_idx ON skill_draft FIELDS user_id;
"#;
