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

//! # Ripple
//!
//! Durable generation orchestrator for conversational AI agents.
//!
//! A generation is one user turn: sandbox preparation, prompting of an
//! upstream model, ingestion of its streaming event feed, interactive
//! approval/auth handling, and durable completion. The orchestrator
//! guarantees at most one live execution per generation across processes
//! (lease), resumes from any intermediate state (durable suspensions),
//! and stays deterministic under crashes (every transition is one store
//! update).
//!
//! Entry points:
//! - [`state::OrchestratorState`] wires the collaborators together
//! - [`orchestrator::Orchestrator`] exposes the operations
//! - the `ripple-worker` binary drives queue jobs and the reaper

pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod integrations;
pub mod lease;
pub mod models;
pub mod objectstore;
pub mod orchestrator;
pub mod provider;
pub mod queue;
pub mod state;

pub use config::OrchestratorConfig;
pub use error::{OrchestratorError, OrchestratorResult, TimeoutKind};
pub use orchestrator::Orchestrator;
pub use state::OrchestratorState;
