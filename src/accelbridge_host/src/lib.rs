/*
Copyright 2025  The Accelbridge Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

//! Host-side engine bridging a synchronous caller to an asynchronous
//! accelerator behind a narrow blocking transport.
//!
//! A caller submits tasks through [`Engine::submit_task`], which allocates a
//! slot in a fixed-depth in-flight table (blocking when the table is
//! exhausted), and later picks up completions with [`Engine::fetch_result`].
//! In between, three dedicated stages overlap the work:
//!
//! - **Dispatch** binds incoming tasks to table slots and fans completed
//!   responses out to waiting fetchers.
//! - **Submission** coalesces consecutive same-kind tasks into batched wire
//!   packets and issues the blocking transport writes.
//! - **Collection** polls the device for response packets, or delegates to
//!   the bulk-DMA engine for high-throughput streamed output.

/// Engine configuration with construction-time constants.
pub mod config;
/// Bulk-DMA side channel bypassing the per-task response queue.
pub mod dma;
/// The caller-facing engine facade.
pub mod engine;
/// The error type for engine operations.
pub mod error;
pub(crate) mod metrics;
/// The three pipeline stages and their shared state.
pub(crate) mod pipeline;
/// The in-flight task table and lifecycle tracker.
pub mod table;
pub(crate) mod time;
/// The blocking device transport boundary.
pub mod transport;

pub use config::{CollectMode, EngineConfig};
pub use engine::Engine;
pub use error::EngineError;

/// The result type for accelbridge operations.
pub type Result<T> = core::result::Result<T, EngineError>;
