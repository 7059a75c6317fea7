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

//! Bulk DMA Engine
//!
//! An independent, addressable bulk-transfer channel that bypasses the
//! per-task response queue. While a window is armed, [`BulkDma::execute`]
//! polls the device and copies every valid result payload into a local
//! circular staging buffer; the consumer drains it with
//! [`fetch_data`](BulkDma::fetch_data).
//!
//! `fetch_data` never blocks and never returns a partial frame: a request
//! for more bytes than are staged zero-fills the destination and leaves both
//! pointers untouched. Downstream consumers rely on that deterministic
//! frame boundary instead of retrying short reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread;

use accelbridge_common::{ResponsePacket, RESULT_PAYLOAD_LEN};
use bytemuck::Zeroable;

use crate::metrics::{EmittableMetric, HistogramMetric};
use crate::transport::DeviceHandle;
use crate::Result;

pub struct BulkDma {
    window_addr: u64,
    window_size: u64,
    buffer: Box<[u8]>,
    write_ptr: u64,
    read_ptr: u64,
    enabled: bool,
    /// The whole window has been staged; the device side is finished but the
    /// staging buffer stays fetchable until the window is disarmed.
    drained: bool,
    resp_wire: usize,
}

impl BulkDma {
    pub(crate) fn new(capacity: usize, limit_batch: usize) -> Self {
        assert!(capacity >= RESULT_PAYLOAD_LEN);
        Self {
            window_addr: 0,
            window_size: 0,
            buffer: vec![0u8; capacity].into_boxed_slice(),
            write_ptr: 0,
            read_ptr: 0,
            enabled: false,
            drained: false,
            resp_wire: ResponsePacket::wire_size(limit_batch),
        }
    }

    /// Arm a hardware-visible window at `addr` and reset both pointers.
    ///
    /// Panics if a window is already armed.
    pub fn enable(&mut self, addr: u64, size: u64) {
        assert!(!self.enabled, "bulk window armed twice");
        self.window_addr = addr;
        self.window_size = size;
        self.write_ptr = 0;
        self.read_ptr = 0;
        self.drained = false;
        self.enabled = true;
        log::debug!("bulk window armed at {addr:#x}, size {size}");
    }

    /// Tear the window down and reset both pointers.
    ///
    /// Panics if no window is armed.
    pub fn disable(&mut self) {
        assert!(self.enabled, "bulk window disabled while not armed");
        self.window_addr = 0;
        self.window_size = 0;
        self.write_ptr = 0;
        self.read_ptr = 0;
        self.drained = false;
        self.enabled = false;
        log::debug!("bulk window disarmed");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Has the armed window been fully staged?
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    /// Record that the device side of the window is finished. Collection
    /// calls this when [`execute`](Self::execute) reports the window staged;
    /// the staging buffer stays fetchable until [`disable`](Self::disable).
    pub(crate) fn mark_drained(&mut self) {
        debug_assert!(self.enabled);
        self.drained = true;
    }

    /// Bytes staged but not yet fetched. Never negative; going negative
    /// would mean the read pointer overtook the write pointer, which has no
    /// legal cause.
    pub fn remaining(&self) -> i64 {
        let remain = self.write_ptr as i64 - self.read_ptr as i64;
        assert!(remain >= 0, "bulk read pointer overtook the write pointer");
        remain
    }

    /// Drain the armed window into the staging buffer.
    ///
    /// Polls the device with reads of one response-packet stride, staging
    /// every valid batch and silently retrying invalid ones (with a yield
    /// once the spin budget is spent). Returns `true` once the whole window
    /// has been staged; returns `false` if the window was disarmed or `stop`
    /// was raised first.
    ///
    /// Takes the engine's mutex rather than `&mut self` so the lock is held
    /// only around pointer updates: consumers keep fetching while the drain
    /// is in progress, and the blocking reads run unlocked.
    pub(crate) fn execute(
        this: &Mutex<BulkDma>,
        dev: &DeviceHandle,
        stop: &AtomicBool,
        spin_budget: u32,
    ) -> Result<bool> {
        let (addr, resp_wire) = {
            let dma = this.lock()?;
            debug_assert!(dma.enabled);
            (dma.window_addr, dma.resp_wire)
        };

        let mut spins: u32 = 0;
        loop {
            if stop.load(Ordering::Acquire) {
                return Ok(false);
            }
            let write_ptr = {
                let dma = this.lock()?;
                if !dma.enabled {
                    return Ok(false);
                }
                if dma.write_ptr >= dma.window_size {
                    return Ok(true);
                }
                dma.write_ptr
            };

            let mut pkt = ResponsePacket::zeroed();
            dev.read_all(addr + write_ptr, &mut pkt.as_bytes_mut()[..resp_wire])?;

            if pkt.is_valid() {
                spins = 0;
                let mut dma = this.lock()?;
                for result in pkt.results() {
                    if result.is_stream_marker() {
                        log::trace!("bulk stream marker at write pointer {}", dma.write_ptr);
                    }
                    dma.stage(&result.content);
                }
                HistogramMetric::BatchSize {
                    direction: "bulk",
                    tasks: pkt.results().len(),
                }
                .emit();
            } else {
                // Hardware not ready for a response yet
                spins += 1;
                if spins >= spin_budget {
                    thread::yield_now();
                    spins = 0;
                }
            }
        }
    }

    /// Copy one result payload into the staging buffer at the write pointer.
    fn stage(&mut self, chunk: &[u8; RESULT_PAYLOAD_LEN]) {
        let cap = self.buffer.len() as u64;
        assert!(
            self.remaining() as u64 + RESULT_PAYLOAD_LEN as u64 <= cap,
            "bulk staging buffer overrun"
        );
        let off = (self.write_ptr % cap) as usize;
        let tail = (self.buffer.len() - off).min(RESULT_PAYLOAD_LEN);
        self.buffer[off..off + tail].copy_from_slice(&chunk[..tail]);
        self.buffer[..RESULT_PAYLOAD_LEN - tail].copy_from_slice(&chunk[tail..]);
        self.write_ptr += RESULT_PAYLOAD_LEN as u64;
    }

    /// Copy exactly `dst.len()` staged bytes, advancing the read pointer, or
    /// zero-fill `dst` and leave both pointers untouched if fewer bytes are
    /// staged. Never partial, never blocking.
    pub fn fetch_data(&mut self, dst: &mut [u8]) {
        let len = dst.len() as u64;
        if len > self.remaining() as u64 {
            dst.fill(0);
            return;
        }
        let cap = self.buffer.len() as u64;
        let off = (self.read_ptr % cap) as usize;
        let dst_len = dst.len();
        let tail = (self.buffer.len() - off).min(dst_len);
        dst[..tail].copy_from_slice(&self.buffer[off..off + tail]);
        dst[tail..].copy_from_slice(&self.buffer[..dst_len - tail]);
        self.read_ptr += len;
    }
}
