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

//! In-process software accelerator used by the integration tests.
//!
//! Implements [`Transport`] over a mutex-guarded device model: request
//! packets written to the packet window produce results for every
//! needs-response task (echoing the control payload), reads from the packet
//! window serve them back batched, and reads from the bulk window serve a
//! pre-staged chunk stream the way the streaming side channel would.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use accelbridge_common::{
    ControlTask, RequestPacket, ResponsePacket, TaskFlags, TaskResult, CTRL_PAYLOAD_LEN,
    RESULT_PAYLOAD_LEN,
};
use accelbridge_host::transport::{
    Transport, PACKET_WINDOW, REG_BATCH_THRESHOLD, REG_POLL_READ_MODE, REG_SESSION_INIT,
    REG_SESSION_STOP,
};
use bytemuck::Zeroable;

/// Device address the bulk-stream window is served from.
pub const BULK_WINDOW: u64 = 0x10_0000;

#[derive(Default)]
struct DeviceState {
    /// Results servable from the packet window.
    ready: VecDeque<TaskResult>,
    /// Results produced while responses are held back.
    held: VecDeque<TaskResult>,
    hold_responses: bool,
    batch_threshold: u32,
    request_writes: usize,
    request_batches: Vec<u8>,
    data_writes: usize,
    data_sink: Vec<(u64, Vec<u8>)>,
    window_reads: usize,
    strobes: Vec<u64>,
    /// Chunk stream served from [`BULK_WINDOW`].
    bulk_chunks: Vec<[u8; RESULT_PAYLOAD_LEN]>,
    /// Artificial latency per packet-window write.
    write_delay: Option<Duration>,
}

pub struct SoftDevice {
    state: Mutex<DeviceState>,
}

impl SoftDevice {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                batch_threshold: 1,
                ..DeviceState::default()
            }),
        }
    }

    /// Park produced results in the held queue instead of serving them.
    pub fn hold_responses(&self, hold: bool) {
        self.state.lock().unwrap().hold_responses = hold;
    }

    /// Move one held result into the servable queue.
    pub fn release_one(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(result) = state.held.pop_front() {
            state.ready.push_back(result);
        }
    }

    /// Move every held result into the servable queue.
    pub fn release_all(&self) {
        let mut state = self.state.lock().unwrap();
        while let Some(result) = state.held.pop_front() {
            state.ready.push_back(result);
        }
    }

    /// Stage the chunk stream served from the bulk window.
    pub fn set_bulk_chunks(&self, chunks: Vec<[u8; RESULT_PAYLOAD_LEN]>) {
        self.state.lock().unwrap().bulk_chunks = chunks;
    }

    /// Add artificial latency to packet-window writes so submissions pile up
    /// in the transmit queue and coalesce.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().unwrap().write_delay = Some(delay);
    }

    pub fn request_writes(&self) -> usize {
        self.state.lock().unwrap().request_writes
    }

    pub fn request_batches(&self) -> Vec<u8> {
        self.state.lock().unwrap().request_batches.clone()
    }

    pub fn data_writes(&self) -> usize {
        self.state.lock().unwrap().data_writes
    }

    pub fn data_sink(&self) -> Vec<(u64, Vec<u8>)> {
        self.state.lock().unwrap().data_sink.clone()
    }

    pub fn window_reads(&self) -> usize {
        self.state.lock().unwrap().window_reads
    }

    pub fn strobes(&self) -> Vec<u64> {
        self.state.lock().unwrap().strobes.clone()
    }

    pub fn batch_threshold(&self) -> u32 {
        self.state.lock().unwrap().batch_threshold
    }

    /// Result for one executed control task: echoes the control payload into
    /// the response content and finishes one tick after the insert time.
    fn execute_task(task: &ControlTask) -> TaskResult {
        let mut result = TaskResult::zeroed();
        result.valid = 0x1;
        result.slot_id = task.slot_id;
        result.executed_time = task.insert_time + 1;
        result.content[..CTRL_PAYLOAD_LEN].copy_from_slice(&task.content);
        result
    }
}

impl Transport for SoftDevice {
    fn write(&self, addr: u64, buf: &[u8]) -> io::Result<usize> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            match addr {
                REG_SESSION_INIT | REG_POLL_READ_MODE | REG_SESSION_STOP => {
                    state.strobes.push(addr);
                    None
                }
                REG_BATCH_THRESHOLD => {
                    state.strobes.push(addr);
                    state.batch_threshold =
                        u32::from_le_bytes(buf[..4].try_into().expect("strobe payload"));
                    None
                }
                PACKET_WINDOW => {
                    let mut pkt = RequestPacket::zeroed();
                    bytemuck::bytes_of_mut(&mut pkt)[..buf.len()].copy_from_slice(buf);
                    assert_eq!(pkt.valid, 0x1, "request packet without the valid flag");

                    state.request_writes += 1;
                    state.request_batches.push(pkt.batch);
                    for task in &pkt.tasks[..pkt.batch as usize] {
                        let flags = TaskFlags::from_bits_truncate(task.flags);
                        if flags.contains(TaskFlags::NEED_RESP) {
                            let result = Self::execute_task(task);
                            if state.hold_responses {
                                state.held.push_back(result);
                            } else {
                                state.ready.push_back(result);
                            }
                        }
                    }
                    state.write_delay
                }
                _ => {
                    state.data_writes += 1;
                    state.data_sink.push((addr, buf.to_vec()));
                    state.write_delay
                }
            }
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        Ok(buf.len())
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        let mut pkt = ResponsePacket::zeroed();

        if addr >= BULK_WINDOW {
            // Bulk stream: the engine reads at window base + write pointer,
            // one chunk per staged result.
            let next = ((addr - BULK_WINDOW) as usize) / RESULT_PAYLOAD_LEN;
            let limit = state.batch_threshold as usize;
            let available = state.bulk_chunks.len().saturating_sub(next);
            let batch = available.min(limit);
            if batch > 0 {
                for (i, chunk) in state.bulk_chunks[next..next + batch].iter().enumerate() {
                    let mut result = TaskResult::zeroed();
                    result.valid = 0x1;
                    result.content = *chunk;
                    pkt.set_result(i, result).expect("batch within capacity");
                }
                pkt.finish(batch);
            }
        } else {
            state.window_reads += 1;
            let limit = state.batch_threshold as usize;
            let batch = state.ready.len().min(limit);
            if batch > 0 {
                for i in 0..batch {
                    let result = state.ready.pop_front().expect("checked non-empty");
                    pkt.set_result(i, result).expect("batch within capacity");
                }
                pkt.finish(batch);
            }
        }

        buf.copy_from_slice(&pkt.as_bytes()[..buf.len()]);
        Ok(buf.len())
    }
}
