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

use std::cmp::{max, min};

use accelbridge_common::{MAX_BATCH, RESULT_PAYLOAD_LEN};
use tracing::{instrument, Span};

/// How the collection stage obtains responses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
pub enum CollectMode {
    /// Poll the packet window with blocking reads whenever responses are
    /// outstanding.
    #[default]
    Poll,
    /// Delegate to the bulk-DMA engine, which drains an addressed window
    /// into the local staging buffer. The packet window is not polled in
    /// this mode, so per-task responses are never collected; submit only
    /// fire-and-forget tasks alongside bulk transfers.
    BulkDma,
}

/// The complete set of configuration needed to create an [`Engine`].
///
/// Table depth and batch limit are construction-time constants: every queue,
/// packet and staging buffer is sized from them once, so the pipeline never
/// allocates per task.
///
/// [`Engine`]: crate::Engine
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct EngineConfig {
    table_depth: usize,
    limit_batch: usize,
    collect_mode: CollectMode,
    dma_capacity: usize,
    spin_budget: u32,
}

impl EngineConfig {
    /// The default in-flight task table depth
    pub const DEFAULT_TABLE_DEPTH: usize = 16;
    /// The minimum in-flight task table depth
    pub const MIN_TABLE_DEPTH: usize = 1;
    /// The maximum in-flight task table depth (slot ids are i8 on the wire)
    pub const MAX_TABLE_DEPTH: usize = i8::MAX as usize;

    /// The default batch limit configured into the device
    pub const DEFAULT_LIMIT_BATCH: usize = 1;
    /// The minimum batch limit
    pub const MIN_LIMIT_BATCH: usize = 1;
    /// The maximum batch limit a wire packet can carry
    pub const MAX_LIMIT_BATCH: usize = MAX_BATCH;

    /// The default bulk-DMA staging buffer capacity (2 MiB)
    pub const DEFAULT_DMA_CAPACITY: usize = 0x20_0000;
    /// The minimum bulk-DMA staging buffer capacity
    pub const MIN_DMA_CAPACITY: usize = RESULT_PAYLOAD_LEN;
    /// The maximum bulk-DMA staging buffer capacity (128 MiB)
    pub const MAX_DMA_CAPACITY: usize = 0x800_0000;

    /// The default number of empty poll iterations before yielding the core
    pub const DEFAULT_SPIN_BUDGET: u32 = 64;
    /// The minimum spin budget
    pub const MIN_SPIN_BUDGET: u32 = 1;

    /// Set the in-flight task table depth; the value is clamped to
    /// [`MIN_TABLE_DEPTH`, `MAX_TABLE_DEPTH`].
    ///
    /// [`MIN_TABLE_DEPTH`]: Self::MIN_TABLE_DEPTH
    /// [`MAX_TABLE_DEPTH`]: Self::MAX_TABLE_DEPTH
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_table_depth(&mut self, table_depth: usize) {
        self.table_depth = min(
            Self::MAX_TABLE_DEPTH,
            max(table_depth, Self::MIN_TABLE_DEPTH),
        );
    }

    /// Get the in-flight task table depth.
    pub fn get_table_depth(&self) -> usize {
        self.table_depth
    }

    /// Set how many tasks the submission stage may coalesce into one wire
    /// packet; clamped to [`MIN_LIMIT_BATCH`, `MAX_LIMIT_BATCH`]. The same
    /// value is configured into the device at session begin.
    ///
    /// [`MIN_LIMIT_BATCH`]: Self::MIN_LIMIT_BATCH
    /// [`MAX_LIMIT_BATCH`]: Self::MAX_LIMIT_BATCH
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_limit_batch(&mut self, limit_batch: usize) {
        self.limit_batch = min(
            Self::MAX_LIMIT_BATCH,
            max(limit_batch, Self::MIN_LIMIT_BATCH),
        );
    }

    /// Get the batch limit.
    pub fn get_limit_batch(&self) -> usize {
        self.limit_batch
    }

    /// Select how the collection stage obtains responses.
    pub fn set_collect_mode(&mut self, collect_mode: CollectMode) {
        self.collect_mode = collect_mode;
    }

    /// Get the collection mode.
    pub fn get_collect_mode(&self) -> CollectMode {
        self.collect_mode
    }

    /// Set the bulk-DMA staging buffer capacity in bytes; clamped to
    /// [`MIN_DMA_CAPACITY`, `MAX_DMA_CAPACITY`].
    ///
    /// [`MIN_DMA_CAPACITY`]: Self::MIN_DMA_CAPACITY
    /// [`MAX_DMA_CAPACITY`]: Self::MAX_DMA_CAPACITY
    #[instrument(skip_all, parent = Span::current(), level= "Trace")]
    pub fn set_dma_capacity(&mut self, dma_capacity: usize) {
        self.dma_capacity = min(
            Self::MAX_DMA_CAPACITY,
            max(dma_capacity, Self::MIN_DMA_CAPACITY),
        );
    }

    /// Get the bulk-DMA staging buffer capacity.
    pub fn get_dma_capacity(&self) -> usize {
        self.dma_capacity
    }

    /// Set how many empty poll iterations a stage tolerates before yielding
    /// the core; clamped below by [`MIN_SPIN_BUDGET`](Self::MIN_SPIN_BUDGET).
    pub fn set_spin_budget(&mut self, spin_budget: u32) {
        self.spin_budget = max(spin_budget, Self::MIN_SPIN_BUDGET);
    }

    /// Get the spin budget.
    pub fn get_spin_budget(&self) -> u32 {
        self.spin_budget
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            table_depth: Self::DEFAULT_TABLE_DEPTH,
            limit_batch: Self::DEFAULT_LIMIT_BATCH,
            collect_mode: CollectMode::default(),
            dma_capacity: Self::DEFAULT_DMA_CAPACITY,
            spin_budget: Self::DEFAULT_SPIN_BUDGET,
        }
    }
}
