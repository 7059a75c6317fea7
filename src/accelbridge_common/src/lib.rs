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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

/// Bounded circular queue used for every inter-stage channel in the host
/// pipeline.
pub mod ring;

/// Task and result records as they travel over the transport.
///
/// The host and the device agree on these packed layouts byte-for-byte; the
/// compile-time assertions in this module are the single source of truth for
/// the wire format.
pub mod task;

/// Batched wire packets: a request packet carries up to [`MAX_BATCH`] control
/// tasks, a data packet carries a contiguous run of bulk chunks, and a
/// response packet carries up to [`MAX_BATCH`] results.
pub mod packet;

pub use packet::{DataPacket, PacketError, RequestPacket, ResponsePacket};
pub use ring::RingBuffer;
pub use task::{ControlTask, Task, TaskFlags, TaskResult};

/// Maximum number of tasks the device accepts in one batched packet.
pub const MAX_BATCH: usize = 3;

/// Payload bytes carried by a control task.
pub const CTRL_PAYLOAD_LEN: usize = 16;

/// Payload bytes carried by one bulk-data chunk.
pub const DATA_CHUNK_LEN: usize = 64;

/// Payload bytes carried by one result.
pub const RESULT_PAYLOAD_LEN: usize = 32;
