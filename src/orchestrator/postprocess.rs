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

//! Post-processing after the prompt phase.
//!
//! Imports integration-skill drafts the model deposited in the sandbox and
//! collects files it produced this turn. Only files the assistant's final
//! answer actually mentions are surfaced; this is the model's escape hatch
//! for exposing artifacts deliberately.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::constants::{generation as gen_const, postprocess as pp_const};
use crate::db::GenerationStore;
use crate::models::SandboxFile;
use crate::objectstore::ObjectStore;
use crate::provider::Sandbox;

/// Imports skill drafts and uploads mentioned produced files.
#[instrument(name = "post_processing", skip_all, fields(generation_id = %generation_id))]
pub async fn run(
    store: &GenerationStore,
    objects: &Arc<dyn ObjectStore>,
    sandbox: &Arc<dyn Sandbox>,
    generation_id: &str,
    user_id: &str,
    final_text: &str,
    staged_paths: &[String],
    marker_unix: i64,
) -> Result<Vec<SandboxFile>> {
    import_skill_drafts(store, sandbox, generation_id, user_id).await;

    let candidates = collect_new_files(sandbox, staged_paths, marker_unix).await;
    let mentioned: Vec<String> = candidates
        .into_iter()
        .filter(|path| is_mentioned(final_text, path))
        .collect();

    let mut files = Vec::with_capacity(mentioned.len());
    for path in mentioned {
        let data = match sandbox.read_file(&path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(path = %path, error = %e, "Produced file unreadable, skipping");
                continue;
            }
        };
        let id = Uuid::new_v4().to_string();
        let name = basename(&path).to_string();
        objects.put(&id, &data, "application/octet-stream").await?;
        files.push(SandboxFile { id, path, name });
    }

    if !files.is_empty() {
        info!(count = files.len(), "Surfaced sandbox-produced files");
    }
    Ok(files)
}

/// Imports each draft at `SKILL_DRAFTS_DIR/*.json`, deleting on success.
/// Best-effort: a malformed draft is logged and left in place.
async fn import_skill_drafts(
    store: &GenerationStore,
    sandbox: &Arc<dyn Sandbox>,
    generation_id: &str,
    user_id: &str,
) {
    let listing = match sandbox
        .run_command(&format!(
            "ls -1 {} 2>/dev/null || true",
            gen_const::SKILL_DRAFTS_DIR
        ))
        .await
    {
        Ok(output) => output.stdout,
        Err(e) => {
            debug!(error = %e, "Skill draft listing failed");
            return;
        }
    };

    for entry in listing.lines().map(str::trim) {
        if !entry.ends_with(".json") {
            continue;
        }
        let path = format!("{}/{}", gen_const::SKILL_DRAFTS_DIR, entry);
        let draft = match sandbox.read_file(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => value,
                Err(e) => {
                    warn!(path = %path, error = %e, "Skill draft is not valid JSON");
                    continue;
                }
            },
            Err(e) => {
                warn!(path = %path, error = %e, "Skill draft unreadable");
                continue;
            }
        };

        let draft_id = Uuid::new_v4().to_string();
        match store
            .insert_skill_draft(&draft_id, user_id, generation_id, draft)
            .await
        {
            Ok(()) => {
                if let Err(e) = sandbox.run_command(&format!("rm -f {}", path)).await {
                    warn!(path = %path, error = %e, "Imported draft could not be deleted");
                } else {
                    info!(path = %path, "Imported integration-skill draft");
                }
            }
            Err(e) => {
                warn!(path = %path, error = %e, "Skill draft import failed");
            }
        }
    }
}

/// Lists files created since the marker under the scan roots, minus
/// staged uploads and known noise.
async fn collect_new_files(
    sandbox: &Arc<dyn Sandbox>,
    staged_paths: &[String],
    marker_unix: i64,
) -> Vec<String> {
    let roots = pp_const::SCAN_ROOTS.join(" ");
    let command = format!(
        "find {} -type f -newermt @{} 2>/dev/null || true",
        roots, marker_unix
    );
    let listing = match sandbox.run_command(&command).await {
        Ok(output) => output.stdout,
        Err(e) => {
            debug!(error = %e, "Produced-file scan failed");
            return Vec::new();
        }
    };

    listing
        .lines()
        .map(str::trim)
        .filter(|path| !path.is_empty())
        .filter(|path| !staged_paths.iter().any(|staged| staged == path))
        .filter(|path| !is_noise(path))
        .map(String::from)
        .collect()
}

fn is_noise(path: &str) -> bool {
    if pp_const::IGNORED_FRAGMENTS
        .iter()
        .any(|fragment| path.split('/').any(|segment| segment == *fragment))
    {
        return true;
    }
    pp_const::IGNORED_BASENAMES
        .iter()
        .any(|basename_| basename(path) == *basename_)
}

fn is_mentioned(final_text: &str, path: &str) -> bool {
    final_text.contains(path) || final_text.contains(basename(path))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noise_filtering() {
        assert!(is_noise("/app/node_modules/react/index.js"));
        assert!(is_noise("/home/user/project/.git/HEAD"));
        assert!(is_noise("/app/__pycache__/mod.pyc"));
        assert!(is_noise("/app/package-lock.json"));
        assert!(is_noise("/home/user/.cache/pip/wheel"));
        assert!(!is_noise("/app/report.md"));
        assert!(!is_noise("/home/user/summary.csv"));
    }

    #[test]
    fn test_mention_filter() {
        let answer = "I wrote the summary to report.md and the data lives in /app/data/out.csv.";
        assert!(is_mentioned(answer, "/app/report.md"));
        assert!(is_mentioned(answer, "/app/data/out.csv"));
        assert!(!is_mentioned(answer, "/app/scratch.txt"));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("/app/data/out.csv"), "out.csv");
        assert_eq!(basename("plain.txt"), "plain.txt");
    }
}
