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

//! Pipeline Stages & Shared State
//!
//! Three stages overlap submission, hardware execution and response
//! collection:
//!
//! ```text
//! caller ─submit→ [ingress] ─→ Dispatch ─→ [transmit] ─→ Submission ─→ device
//!                                 ↑                                      │
//! caller ←fetch─ [completions] ───┴───────── [responses] ← Collection ←──┘
//! ```
//!
//! Coordination is one mutex/condvar pair per queue boundary plus lock-free
//! atomics for the outstanding-response and free-slot counts; there is no
//! global lock, which is what lets the three stages run in true overlap.
//! Queue locks are held only while mutating queue state — every blocking
//! transport operation runs unlocked.
//!
//! Shutdown is three-phase and strictly ordered: once the shutdown flag is
//! raised and the ingress queue is empty, Dispatch tells Submission to drain
//! and stop; once the task table is fully reclaimed it tells Collection the
//! same; Dispatch itself exits only after both. Submission is never stopped
//! while tasks remain unsent, and Collection is never stopped while a
//! response is still owed, so no task is dropped or duplicated mid-flight.

pub(crate) mod collect;
pub(crate) mod dispatch;
pub(crate) mod submit;

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};

use accelbridge_common::{ResponsePacket, RingBuffer, Task, TaskResult};

use crate::config::CollectMode;
use crate::dma::BulkDma;
use crate::table::TaskTable;
use crate::transport::DeviceHandle;
use crate::Result;

/// The two queues drained by the dispatch stage, behind one mutex so its
/// condition-variable predicate covers both.
pub(crate) struct DispatchQueues {
    pub ingress: RingBuffer<Task>,
    pub responses: RingBuffer<ResponsePacket>,
}

pub(crate) struct PipelineState {
    pub dispatch_mx: Mutex<DispatchQueues>,
    pub dispatch_cv: Condvar,
    pub transmit_mx: Mutex<RingBuffer<Task>>,
    pub transmit_cv: Condvar,
    pub collect_mx: Mutex<()>,
    pub collect_cv: Condvar,
    /// Submitted needs-response tasks not yet collected. Signed so that a
    /// miscounted decrement is caught by assertion instead of wrapping.
    pub outstanding: AtomicI64,
    /// Caller requested shutdown (phase one).
    pub shutdown: AtomicBool,
    /// Submission told to drain and stop (phase two).
    pub submit_done: AtomicBool,
    /// Collection told to drain and stop (phase three).
    pub collect_done: AtomicBool,
}

impl PipelineState {
    /// Every inter-stage queue is sized to the table depth, so the caller
    /// can never have more outstanding tasks than slots exist.
    pub(crate) fn new(depth: usize) -> Self {
        Self {
            dispatch_mx: Mutex::new(DispatchQueues {
                ingress: RingBuffer::new(depth),
                responses: RingBuffer::new(depth),
            }),
            dispatch_cv: Condvar::new(),
            transmit_mx: Mutex::new(RingBuffer::new(depth)),
            transmit_cv: Condvar::new(),
            collect_mx: Mutex::new(()),
            collect_cv: Condvar::new(),
            outstanding: AtomicI64::new(0),
            shutdown: AtomicBool::new(false),
            submit_done: AtomicBool::new(false),
            collect_done: AtomicBool::new(false),
        }
    }
}

/// A completed task waiting to be fetched by the caller.
pub(crate) struct Completion {
    pub slot_id: i8,
    pub result: TaskResult,
    pub enqueue_time: u64,
}

/// Everything the stage loops share, behind one `Arc`.
pub(crate) struct StageContext {
    pub state: PipelineState,
    pub table: TaskTable,
    pub dev: DeviceHandle,
    pub completions: Mutex<Vec<Completion>>,
    pub fetch_cv: Condvar,
    pub dma: Mutex<BulkDma>,
    pub limit_batch: usize,
    pub collect_mode: CollectMode,
    pub spin_budget: u32,
}

impl StageContext {
    // The wake helpers take and drop the paired mutex before notifying so a
    // waiter between its predicate check and its wait cannot miss the
    // notification.

    pub(crate) fn wake_dispatch(&self) {
        drop(self.state.dispatch_mx.lock());
        self.state.dispatch_cv.notify_one();
    }

    pub(crate) fn wake_submission(&self) {
        drop(self.state.transmit_mx.lock());
        self.state.transmit_cv.notify_one();
    }

    pub(crate) fn wake_collection(&self) {
        drop(self.state.collect_mx.lock());
        self.state.collect_cv.notify_one();
    }

    pub(crate) fn wake_fetchers(&self) {
        drop(self.completions.lock());
        self.fetch_cv.notify_all();
    }

    /// Release a table slot and, during shutdown, re-wake dispatch so it can
    /// re-check whether the table is fully reclaimed.
    pub(crate) fn release_slot(&self, id: usize) -> Result<()> {
        self.table.release(id)?;
        if self.state.shutdown.load(Ordering::Acquire) {
            self.wake_dispatch();
        }
        Ok(())
    }
}
