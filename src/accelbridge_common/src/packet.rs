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

//! Batched Wire Packets
//!
//! The submission stage coalesces consecutive same-kind tasks into one
//! outbound packet; the collection stage reads whole response packets. All
//! three packet types are fixed-capacity value types sized by [`MAX_BATCH`],
//! so batching never allocates. The transfer length on the wire is computed
//! from the *configured* batch limit (a construction-time constant of the
//! engine), not from the number of occupied entries; the `batch` field tells
//! the device how many entries are live.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::task::{ControlTask, Task, TaskResult};
use crate::{DATA_CHUNK_LEN, MAX_BATCH};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    /// A bulk chunk does not start where the previous chunk ended. The
    /// packet must be flushed and the chunk re-offered to a fresh one.
    #[error("bulk chunk starts at {found:#x}, packet ends at {expected:#x}")]
    Discontiguous { expected: u32, found: u32 },
    /// More entries offered than the packet can carry.
    #[error("batch index {0} exceeds capacity {MAX_BATCH}")]
    BatchOverflow(usize),
}

/// A batch of control tasks bound for the device.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct RequestPacket {
    /// 0x1 once the packet is ready to issue.
    pub valid: u8,
    /// Number of live entries in `tasks`.
    pub batch: u8,
    pub tasks: [ControlTask; MAX_BATCH],
}

const _: () = assert!(core::mem::size_of::<RequestPacket>() == 2 + 26 * MAX_BATCH);

impl RequestPacket {
    /// Bytes occupied on the wire for a configured batch limit.
    pub fn wire_size(limit_batch: usize) -> usize {
        debug_assert!(limit_batch >= 1 && limit_batch <= MAX_BATCH);
        2 + ControlTask::SIZE * limit_batch
    }

    /// Place the control projection of `task` at `index`.
    pub fn set_task(&mut self, index: usize, task: &Task) -> Result<(), PacketError> {
        let slot = self
            .tasks
            .get_mut(index)
            .ok_or(PacketError::BatchOverflow(index))?;
        *slot = ControlTask::from_task(task);
        Ok(())
    }

    /// Mark the packet ready with `batch` live entries.
    pub fn finish(&mut self, batch: usize) {
        debug_assert!(batch >= 1 && batch <= MAX_BATCH);
        self.valid = 0x1;
        self.batch = batch as u8;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

/// A contiguous run of bulk chunks bound for one device address window.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct DataPacket {
    pub start_addr: u32,
    pub total_size: u32,
    pub data: [u8; MAX_BATCH * DATA_CHUNK_LEN],
}

const _: () = assert!(core::mem::size_of::<DataPacket>() == 8 + DATA_CHUNK_LEN * MAX_BATCH);

impl DataPacket {
    /// Bytes occupied on the wire for a configured batch limit.
    pub fn wire_size(limit_batch: usize) -> usize {
        debug_assert!(limit_batch >= 1 && limit_batch <= MAX_BATCH);
        8 + DATA_CHUNK_LEN * limit_batch
    }

    /// Append the chunk carried by `task` at `index`.
    ///
    /// The first chunk establishes the window; every later chunk must start
    /// exactly where the packet currently ends, otherwise
    /// [`PacketError::Discontiguous`] is returned and the packet is left
    /// unchanged so it can be flushed as-is.
    pub fn append(&mut self, index: usize, task: &Task) -> Result<(), PacketError> {
        if index >= MAX_BATCH {
            return Err(PacketError::BatchOverflow(index));
        }
        let task_addr = task.addr;
        if index == 0 {
            self.start_addr = task_addr;
            self.total_size = task.size;
        } else {
            let expected = self.start_addr + self.total_size;
            if expected != task_addr {
                log::debug!(
                    "bulk chunk at {task_addr:#x} breaks the run ending at {expected:#x}"
                );
                return Err(PacketError::Discontiguous {
                    expected,
                    found: task_addr,
                });
            }
            self.total_size += task.size;
        }
        let off = index * DATA_CHUNK_LEN;
        self.data[off..off + DATA_CHUNK_LEN].copy_from_slice(&task.content);
        Ok(())
    }

    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }

    pub fn total_size(&self) -> u32 {
        self.total_size
    }

    /// The chunk bytes accumulated so far.
    ///
    /// Chunks are full [`DATA_CHUNK_LEN`]-byte strides on the wire; a
    /// trailing partial chunk is truncated to the recorded total, matching
    /// what the device consumes.
    pub fn payload(&self) -> &[u8] {
        let len = (self.total_size as usize).min(self.data.len());
        &self.data[..len]
    }
}

/// A batch of results coming back from the device.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct ResponsePacket {
    /// 0x1 when the device had results ready; 0x0 means "not ready, retry".
    pub valid: u8,
    /// Number of live entries in `results`.
    pub batch: u8,
    pub results: [TaskResult; MAX_BATCH],
}

const _: () = assert!(core::mem::size_of::<ResponsePacket>() == 2 + 42 * MAX_BATCH);

impl ResponsePacket {
    /// Bytes occupied on the wire for a configured batch limit.
    pub fn wire_size(limit_batch: usize) -> usize {
        debug_assert!(limit_batch >= 1 && limit_batch <= MAX_BATCH);
        2 + TaskResult::SIZE * limit_batch
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid & 0x1 != 0
    }

    /// The live result entries. A malformed batch count is clamped to the
    /// packet capacity rather than trusted.
    pub fn results(&self) -> &[TaskResult] {
        let n = (self.batch as usize).min(MAX_BATCH);
        &self.results[..n]
    }

    /// Place `result` at `index`. Device-side helper, also used by the test
    /// device.
    pub fn set_result(&mut self, index: usize, result: TaskResult) -> Result<(), PacketError> {
        let slot = self
            .results
            .get_mut(index)
            .ok_or(PacketError::BatchOverflow(index))?;
        *slot = result;
        Ok(())
    }

    /// Mark the packet ready with `batch` live entries.
    pub fn finish(&mut self, batch: usize) {
        debug_assert!(batch >= 1 && batch <= MAX_BATCH);
        self.valid = 0x1;
        self.batch = batch as u8;
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }
}
