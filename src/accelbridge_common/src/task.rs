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

//! Task and Result Wire Records
//!
//! A task is immutable once handed to the pipeline, except for the slot-id
//! which the host assigns when a table slot is allocated. The `flags` byte
//! selects the task kind and determines which pipeline path the task takes:
//!
//! ```text
//!  bit 0  valid          record carries a live task
//!  bit 1  needs-response completion observed via the response channel
//!  bit 2  write          control write
//!  bit 3  read           control read (solicited implicitly, never issued)
//!  bit 4  bulk-data      chunk of an addressed bulk stream
//! ```

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use crate::{CTRL_PAYLOAD_LEN, DATA_CHUNK_LEN, RESULT_PAYLOAD_LEN};

bitflags! {
    /// Flag bits of a task's `flags` byte.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TaskFlags: u8 {
        /// Record carries a live task.
        const VALID     = 1 << 0;
        /// Completion is observed via the response channel.
        const NEED_RESP = 1 << 1;
        /// Control write.
        const WRITE     = 1 << 2;
        /// Control read. Reads are only ever solicited through the
        /// needs-response channel; a bare read task is a protocol violation.
        const READ      = 1 << 3;
        /// Chunk of an addressed bulk-data stream.
        const BULK      = 1 << 4;
    }
}

/// Host-side staging record for one task.
///
/// This is what travels through the ingress and transmit queues. It carries
/// the full bulk payload plus the address/size pair so that the submission
/// stage can fold it into either a request packet or a data packet without
/// looking anywhere else.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
pub struct Task {
    /// Kind and lifetime bits, see [`TaskFlags`].
    pub flags: u8,
    /// Table slot this task occupies; -1 until allocated.
    pub slot_id: i8,
    /// Caller-supplied timestamp, echoed to the device.
    pub insert_time: u64,
    /// Payload. Control tasks use the first [`CTRL_PAYLOAD_LEN`] bytes.
    pub content: [u8; DATA_CHUNK_LEN],
    /// Device address of a bulk chunk; unused for control tasks.
    pub addr: u32,
    /// Byte count of a bulk chunk; unused for control tasks.
    pub size: u32,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            flags: 0,
            slot_id: -1,
            insert_time: 0,
            content: [0; DATA_CHUNK_LEN],
            addr: 0,
            size: 0,
        }
    }
}

impl Task {
    /// Build a valid fire-and-forget control write.
    pub fn control_write(payload: &[u8]) -> Self {
        let mut task = Self::default();
        task.set_valid();
        task.set_write();
        task.fill_ctrl(payload);
        task
    }

    /// Build a valid control write whose completion arrives on the response
    /// channel.
    pub fn control_write_with_response(payload: &[u8]) -> Self {
        let mut task = Self::control_write(payload);
        task.set_needs_response();
        task
    }

    /// Build a valid bulk-data chunk targeting `addr`.
    pub fn bulk_chunk(addr: u32, data: &[u8]) -> Self {
        let mut task = Self::default();
        task.set_valid();
        task.set_bulk();
        task.fill_bulk(addr, data);
        task
    }

    /// Get flags as a [`TaskFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> TaskFlags {
        TaskFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.flags().contains(TaskFlags::VALID)
    }

    #[inline]
    pub fn needs_response(&self) -> bool {
        self.flags().contains(TaskFlags::NEED_RESP)
    }

    #[inline]
    pub fn is_write(&self) -> bool {
        self.flags().contains(TaskFlags::WRITE)
    }

    #[inline]
    pub fn is_read(&self) -> bool {
        self.flags().contains(TaskFlags::READ)
    }

    /// Is this a control task (read or write, as opposed to bulk data)?
    #[inline]
    pub fn is_ctrl(&self) -> bool {
        self.is_read() || self.is_write()
    }

    #[inline]
    pub fn is_bulk(&self) -> bool {
        self.flags().contains(TaskFlags::BULK)
    }

    #[inline]
    pub fn set_valid(&mut self) {
        self.flags |= TaskFlags::VALID.bits();
    }

    #[inline]
    pub fn clear_valid(&mut self) {
        self.flags &= !TaskFlags::VALID.bits();
    }

    #[inline]
    pub fn set_needs_response(&mut self) {
        self.flags |= TaskFlags::NEED_RESP.bits();
    }

    /// Mark as a control write. Clears a previously requested response; the
    /// kind must be chosen before [`set_needs_response`](Self::set_needs_response).
    #[inline]
    pub fn set_write(&mut self) {
        self.flags &= !TaskFlags::NEED_RESP.bits();
        self.flags |= TaskFlags::WRITE.bits();
    }

    /// Mark as a control read.
    #[inline]
    pub fn set_read(&mut self) {
        self.flags &= !TaskFlags::NEED_RESP.bits();
        self.flags |= TaskFlags::READ.bits();
    }

    /// Mark as a bulk-data chunk.
    #[inline]
    pub fn set_bulk(&mut self) {
        self.flags &= !TaskFlags::NEED_RESP.bits();
        self.flags |= TaskFlags::BULK.bits();
    }

    /// Copy a control payload into the task.
    ///
    /// Panics if `data` exceeds [`CTRL_PAYLOAD_LEN`]; the kind must have been
    /// set first.
    pub fn fill_ctrl(&mut self, data: &[u8]) {
        assert!(self.is_ctrl());
        assert!(data.len() <= CTRL_PAYLOAD_LEN);
        self.content[..data.len()].copy_from_slice(data);
    }

    /// Copy a bulk chunk payload into the task and record its window.
    ///
    /// Panics if `data` exceeds [`DATA_CHUNK_LEN`]; the kind must have been
    /// set first.
    pub fn fill_bulk(&mut self, addr: u32, data: &[u8]) {
        assert!(self.is_bulk());
        assert!(data.len() <= DATA_CHUNK_LEN);
        self.addr = addr;
        self.size = data.len() as u32;
        self.content[..data.len()].copy_from_slice(data);
    }
}

/// Control task as it appears inside a request packet.
///
/// Identical to [`Task`] minus the bulk address/size pair and truncated to
/// the control payload width.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct ControlTask {
    pub flags: u8,
    pub slot_id: i8,
    pub insert_time: u64,
    pub content: [u8; CTRL_PAYLOAD_LEN],
}

const _: () = assert!(core::mem::size_of::<ControlTask>() == 26);
const _: () = assert!(core::mem::offset_of!(ControlTask, insert_time) == 2);
const _: () = assert!(core::mem::offset_of!(ControlTask, content) == 10);

impl ControlTask {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Project the control-relevant prefix of a staged task.
    pub fn from_task(task: &Task) -> Self {
        let mut content = [0u8; CTRL_PAYLOAD_LEN];
        content.copy_from_slice(&task.content[..CTRL_PAYLOAD_LEN]);
        Self {
            flags: task.flags,
            slot_id: task.slot_id,
            insert_time: task.insert_time,
            content,
        }
    }
}

/// One result record as produced by the device.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct TaskResult {
    /// Bit 0: record is live. Bit 1: device-side stream marker.
    pub valid: u8,
    /// Slot of the task this result answers.
    pub slot_id: i8,
    /// Device timestamp taken when execution finished.
    pub executed_time: u64,
    pub content: [u8; RESULT_PAYLOAD_LEN],
}

const _: () = assert!(core::mem::size_of::<TaskResult>() == 42);
const _: () = assert!(core::mem::offset_of!(TaskResult, executed_time) == 2);
const _: () = assert!(core::mem::offset_of!(TaskResult, content) == 10);

impl TaskResult {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.valid & 0x1 != 0
    }

    /// Device-side end-of-stream marker carried on bulk result records.
    #[inline]
    pub fn is_stream_marker(&self) -> bool {
        self.valid & 0x2 != 0
    }
}
