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

//! Classification of `bash` tool commands into integration metadata.
//!
//! The sandbox exposes integrations as CLI binaries (`slack send -c C123
//! -t hi`); approval surfaces and analytics need the parsed
//! `{integration, operation, is_write}` triple.

use once_cell::sync::Lazy;
use regex::Regex;

/// Integrations whose CLI form the parser recognizes.
pub const KNOWN_INTEGRATIONS: &[&str] = &[
    "slack", "github", "gmail", "gcal", "notion", "linear", "drive", "jira",
];

/// Operations that mutate external state.
const WRITE_OPERATIONS: &[&str] = &[
    "send", "create", "update", "delete", "post", "reply", "merge", "close", "upload", "move",
    "archive", "invite",
];

static COMMAND_RE: Lazy<Regex> = Lazy::new(|| {
    // `<integration> <operation> …` with optional leading env assignments
    Regex::new(r"^(?:[A-Za-z_][A-Za-z0-9_]*=\S+\s+)*([a-z][a-z0-9-]*)(?:\s+([a-z][a-z0-9-]*))?")
        .expect("command regex must compile")
});

/// Parsed integration metadata for a bash command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub integration: String,
    pub operation: Option<String>,
    pub is_write: bool,
}

/// Parses a bash command line into integration metadata.
///
/// Returns `None` when the command does not start with a known
/// integration binary.
pub fn parse_command(command: &str) -> Option<ParsedCommand> {
    let trimmed = command.trim();
    let captures = COMMAND_RE.captures(trimmed)?;

    let integration = captures.get(1)?.as_str();
    if !KNOWN_INTEGRATIONS.contains(&integration) {
        return None;
    }

    let operation = captures.get(2).map(|m| m.as_str().to_string());
    let is_write = operation
        .as_deref()
        .map(|op| WRITE_OPERATIONS.contains(&op))
        .unwrap_or(false);

    Some(ParsedCommand {
        integration: integration.to_string(),
        operation,
        is_write,
    })
}

/// Detects a Slack send, either from explicit metadata or by parsing the
/// command when the operation is empty. Slack sends stay interactive even
/// under conversation auto-approve.
pub fn is_slack_send(
    integration: Option<&str>,
    operation: Option<&str>,
    command: Option<&str>,
) -> bool {
    match (integration, operation) {
        (Some("slack"), Some("send")) => true,
        (_, None) | (_, Some("")) => command
            .and_then(parse_command)
            .map(|parsed| parsed.integration == "slack" && parsed.operation.as_deref() == Some("send"))
            .unwrap_or(false),
        _ => false,
    }
}
