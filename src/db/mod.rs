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

//! # Database Module
//!
//! Provides SurrealDB durable-store functionality for the orchestrator.
//!
//! ## Overview
//!
//! This module contains:
//! - [`DBClient`] - Database client for CRUD operations
//! - [`schema`] - Database schema definitions
//! - [`store::GenerationStore`] - Typed adapter used by the orchestrator
//!
//! ## Database Engine
//!
//! Uses SurrealDB through the `any` engine, so the same client runs against
//! an embedded RocksDB path in tests and single-node deployments, or a
//! remote server URL in multi-process deployments. The store is the only
//! authoritative cross-process state.
//!
//! ## Tables
//!
//! - `conversation` - Threads of turns
//! - `generation` - One end-to-end run each, with content parts and
//!   pending approval/auth payloads
//! - `message` - Persisted chat turns
//! - `queued_message` - User turns buffered behind an active generation
//! - `workflow_run` - Workflow status mirror
//! - `job` - Deduplicated delayed worker jobs
//! - `lease` - Single-writer guards

pub mod client;
pub mod queries;
pub mod schema;
pub mod store;

pub use client::DBClient;
pub use store::GenerationStore;
