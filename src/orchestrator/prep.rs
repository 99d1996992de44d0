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

//! Pre-prompt sandbox setup.
//!
//! Writes skill assets into the sandbox and stages user uploads. A cache
//! record inside the sandbox remembers the inputs of the last setup; a
//! reused sandbox with an unchanged key skips the writes entirely.

use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::constants::generation as gen_const;
use crate::models::Generation;
use crate::objectstore::ObjectStore;
use crate::provider::Sandbox;

/// Result of pre-prompt setup.
#[derive(Debug, Clone, Default)]
pub struct PrepOutcome {
    /// Sandbox paths of user files staged this turn.
    pub staged_paths: Vec<String>,
    /// Whether the skill-asset writes were skipped via the cache.
    pub cache_hit: bool,
}

/// Deterministic fingerprint of every input that affects skill-asset
/// writes. Stored verbatim at `PRE_PROMPT_CACHE_PATH`.
pub fn cache_key(user_id: &str, generation: &Generation) -> String {
    let policy = &generation.execution_policy;
    let mut integrations = policy.allowed_integrations.clone();
    integrations.sort();
    let mut custom = policy.allowed_custom_integrations.clone();
    custom.sort();
    let mut skills = policy.selected_platform_skills.clone();
    skills.sort();

    json!({
        "user_id": user_id,
        "allowed_integrations": integrations,
        "allowed_custom_integrations": custom,
        "selected_platform_skills": skills,
    })
    .to_string()
}

/// Runs pre-prompt setup against the sandbox.
#[instrument(name = "pre_prompt_setup", skip_all, fields(generation_id = %generation.id))]
pub async fn run(
    objects: &Arc<dyn ObjectStore>,
    sandbox: &Arc<dyn Sandbox>,
    user_id: &str,
    generation: &Generation,
) -> Result<PrepOutcome> {
    let mut outcome = PrepOutcome::default();

    let key = cache_key(user_id, generation);
    let cached = sandbox
        .read_file(gen_const::PRE_PROMPT_CACHE_PATH)
        .await
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok());

    if cached.as_deref() == Some(key.as_str()) {
        debug!("Pre-prompt cache hit, skipping skill writes");
        outcome.cache_hit = true;
    } else {
        let policy = &generation.execution_policy;
        let manifest = json!({
            "selected_platform_skills": policy.selected_platform_skills,
            "allowed_integrations": policy.allowed_integrations,
            "allowed_custom_integrations": policy.allowed_custom_integrations,
        });
        sandbox
            .write_file(
                gen_const::SKILLS_MANIFEST_PATH,
                manifest.to_string().as_bytes(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("skills manifest write failed: {}", e))?;
        sandbox
            .write_file(gen_const::PRE_PROMPT_CACHE_PATH, key.as_bytes())
            .await
            .map_err(|e| anyhow::anyhow!("cache record write failed: {}", e))?;
        info!("Pre-prompt skill assets written");
    }

    // Attachments are per-turn and always staged; images are passed
    // inline with the prompt instead.
    for attachment in &generation.execution_policy.file_attachments {
        if attachment.is_image() {
            continue;
        }
        let data = objects.get(&attachment.id).await?;
        let path = format!("{}/{}", gen_const::UPLOADS_DIR, attachment.name);
        sandbox
            .write_file(&path, &data)
            .await
            .map_err(|e| anyhow::anyhow!("staging {} failed: {}", attachment.name, e))?;
        outcome.staged_paths.push(path);
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionPolicy, FileAttachment, GenerationCreate, GenerationStatus};
    use chrono::Utc;

    fn generation_with_policy(policy: ExecutionPolicy) -> Generation {
        let create = GenerationCreate::new("conv_1".to_string(), policy);
        Generation {
            id: "gen_1".to_string(),
            conversation_id: create.conversation_id,
            status: GenerationStatus::Running,
            content_parts: vec![],
            pending_approval: None,
            pending_auth: None,
            execution_policy: create.execution_policy,
            tokens_input: 0,
            tokens_output: 0,
            started_at: Utc::now(),
            completed_at: None,
            cancel_requested_at: None,
            error_message: None,
            sandbox_id: None,
            message_id: None,
            workflow_run_id: None,
            is_paused: false,
        }
    }

    #[test]
    fn test_cache_key_is_order_insensitive() {
        let a = generation_with_policy(ExecutionPolicy {
            allowed_integrations: vec!["slack".to_string(), "github".to_string()],
            selected_platform_skills: vec!["research".to_string(), "drafting".to_string()],
            ..Default::default()
        });
        let b = generation_with_policy(ExecutionPolicy {
            allowed_integrations: vec!["github".to_string(), "slack".to_string()],
            selected_platform_skills: vec!["drafting".to_string(), "research".to_string()],
            ..Default::default()
        });
        assert_eq!(cache_key("user_1", &a), cache_key("user_1", &b));
    }

    #[test]
    fn test_cache_key_varies_by_inputs() {
        let a = generation_with_policy(ExecutionPolicy {
            allowed_integrations: vec!["slack".to_string()],
            ..Default::default()
        });
        let b = generation_with_policy(ExecutionPolicy {
            allowed_integrations: vec!["github".to_string()],
            ..Default::default()
        });
        assert_ne!(cache_key("user_1", &a), cache_key("user_1", &b));
        assert_ne!(cache_key("user_1", &a), cache_key("user_2", &a));
    }

    #[test]
    fn test_attachments_do_not_affect_cache_key() {
        let bare = generation_with_policy(ExecutionPolicy::default());
        let with_files = generation_with_policy(ExecutionPolicy {
            file_attachments: vec![FileAttachment {
                id: "obj".to_string(),
                name: "notes.pdf".to_string(),
                content_type: "application/pdf".to_string(),
            }],
            ..Default::default()
        });
        assert_eq!(cache_key("u", &bare), cache_key("u", &with_files));
    }
}
