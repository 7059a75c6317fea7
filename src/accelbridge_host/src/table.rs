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

//! Task Table & Lifecycle Tracker
//!
//! A fixed-depth pool of slots, one per in-flight task, with a free-list of
//! slot ids as the unit of backpressure. Each slot carries the originating
//! task, its eventual result, and the lifecycle record of timestamps taken
//! as the task moves through the pipeline.
//!
//! Slot ownership transfers exactly once per transition; every slot is
//! wrapped in its own mutex so only the stage currently holding a slot can
//! touch it. A lifecycle record is live exactly while its slot is allocated:
//! allocating a slot whose record is still live is a contract violation and
//! panics.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use accelbridge_common::{RingBuffer, Task, TaskResult};
use bytemuck::Zeroable;

use crate::error::EngineError;
use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::time::system_time_nanos;
use crate::Result;

/// Callback fired once per slot release while the caller-should-retry flag
/// is armed.
pub type RetryCallback = Box<dyn Fn() + Send + Sync>;

/// Per-slot timestamps, valid only while the slot is allocated.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifeCycle {
    pub valid: bool,
    pub needs_response: bool,
    pub recv_time: u64,
    pub pre_submit_time: u64,
    pub post_submit_time: u64,
    pub pre_collect_time: u64,
    pub post_collect_time: u64,
    pub resp_time: u64,
    pub pre_hw_time: u64,
    pub post_hw_time: u64,
}

impl LifeCycle {
    fn reset(&mut self) {
        *self = LifeCycle::default();
    }
}

/// One in-flight task table entry.
#[derive(Debug)]
pub(crate) struct SlotEntry {
    pub valid: bool,
    pub complete: bool,
    pub task_uid: u64,
    pub task: Task,
    pub result: TaskResult,
    pub enqueue_time: u64,
    pub lifecycle: LifeCycle,
}

impl SlotEntry {
    fn new() -> Self {
        Self {
            valid: false,
            complete: false,
            task_uid: 0,
            task: Task::default(),
            result: TaskResult::zeroed(),
            enqueue_time: 0,
            lifecycle: LifeCycle::default(),
        }
    }
}

/// Fixed-depth in-flight task table with a free-list of slot ids.
pub struct TaskTable {
    depth: usize,
    slots: Vec<Mutex<SlotEntry>>,
    free_ids: Mutex<RingBuffer<usize>>,
    free_cv: Condvar,
    free_count: AtomicUsize,
    retry_armed: AtomicBool,
    retry_callback: Mutex<Option<RetryCallback>>,
    next_uid: AtomicU64,
}

impl TaskTable {
    /// Interval at which a blocked allocation re-checks the shutdown flag.
    const ALLOCATE_RECHECK: Duration = Duration::from_millis(20);

    pub fn new(depth: usize) -> Self {
        assert!(depth >= 1 && depth <= i8::MAX as usize);
        let mut free_ids = RingBuffer::new(depth);
        for id in 0..depth {
            let queued = free_ids.enqueue(id);
            debug_assert!(queued);
        }
        Self {
            depth,
            slots: (0..depth).map(|_| Mutex::new(SlotEntry::new())).collect(),
            free_ids: Mutex::new(free_ids),
            free_cv: Condvar::new(),
            free_count: AtomicUsize::new(depth),
            retry_armed: AtomicBool::new(false),
            retry_callback: Mutex::new(None),
            next_uid: AtomicU64::new(0),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of slots currently on the free-list.
    pub fn free_slots(&self) -> usize {
        self.free_count.load(Ordering::Acquire)
    }

    /// Every slot has been released; nothing is in flight.
    pub fn is_fully_reclaimed(&self) -> bool {
        self.free_slots() == self.depth
    }

    /// Pop a slot id, blocking while the free-list is empty.
    ///
    /// Marks the slot's lifecycle record live and stamps the receive time.
    /// Panics if the record is already live: a slot id handed out twice is a
    /// programming error with no recovery path.
    pub fn allocate(&self, shutdown: &AtomicBool) -> Result<usize> {
        let mut free = self.free_ids.lock()?;
        loop {
            if shutdown.load(Ordering::Acquire) {
                return Err(EngineError::SessionNotActive());
            }
            if !free.is_empty() {
                let id = free.dequeue();
                self.free_count.fetch_sub(1, Ordering::AcqRel);
                drop(free);

                let mut slot = self.slots[id].lock()?;
                assert!(
                    !slot.lifecycle.valid,
                    "slot {id} allocated while its lifecycle record is live"
                );
                slot.lifecycle.valid = true;
                slot.lifecycle.recv_time = system_time_nanos();
                return Ok(id);
            }
            // Timed wait so a missed notification cannot outlive shutdown
            let (guard, _timeout) = self.free_cv.wait_timeout(free, Self::ALLOCATE_RECHECK)?;
            free = guard;
        }
    }

    /// Record caller-side facts about a freshly allocated task: whether a
    /// response is owed, the caller's insert timestamp, and the enqueue time
    /// returned later from fetch.
    pub fn note_received(&self, id: usize, task: &Task) -> Result<()> {
        let mut slot = self.slots[id].lock()?;
        slot.lifecycle.needs_response = task.needs_response();
        slot.lifecycle.pre_hw_time = task.insert_time;
        slot.enqueue_time = system_time_nanos();
        Ok(())
    }

    /// Bind the task to its slot. Dispatch-side: marks the entry valid and
    /// assigns the monotonic task-unique-id.
    pub fn bind(&self, id: usize, task: &Task) -> Result<()> {
        let mut slot = self.slots[id].lock()?;
        slot.valid = true;
        slot.complete = false;
        slot.task_uid = self.next_uid.fetch_add(1, Ordering::AcqRel);
        slot.task = *task;
        log::debug!("bound task uid {} to table slot {id}", slot.task_uid);
        Ok(())
    }

    pub fn stamp_pre_submit(&self, id: usize) -> Result<()> {
        let mut slot = self.slots[id].lock()?;
        slot.lifecycle.pre_submit_time = system_time_nanos();
        Ok(())
    }

    pub fn stamp_post_submit(&self, id: usize) -> Result<()> {
        let mut slot = self.slots[id].lock()?;
        slot.lifecycle.post_submit_time = system_time_nanos();
        Ok(())
    }

    pub fn stamp_collect(&self, id: usize, pre: u64, post: u64) -> Result<()> {
        let mut slot = self.slots[id].lock()?;
        slot.lifecycle.pre_collect_time = pre;
        slot.lifecycle.post_collect_time = post;
        Ok(())
    }

    /// Store the device's result in the slot and stamp the response
    /// timestamps. Returns the slot's enqueue time for the completion
    /// record.
    pub fn complete(&self, id: usize, result: &TaskResult) -> Result<u64> {
        let mut slot = self.slots[id].lock()?;
        slot.result = *result;
        slot.complete = true;
        slot.lifecycle.resp_time = system_time_nanos();
        slot.lifecycle.post_hw_time = result.executed_time;
        Ok(slot.enqueue_time)
    }

    /// Fold the slot's lifecycle into the aggregate flow metrics, clear it,
    /// and return the id to the free-list. Must be called exactly once per
    /// task; wakes one blocked allocation and fires the retry callback if
    /// the caller-should-retry flag was armed.
    pub fn release(&self, id: usize) -> Result<()> {
        {
            let mut slot = self.slots[id].lock()?;
            let lc = slot.lifecycle;
            assert!(lc.valid, "released slot {id} has no live lifecycle record");

            CounterMetric::TasksHandled.emit();
            HistogramMetric::FlowPhase {
                phase: "pre_submit",
                duration: Duration::from_nanos(lc.pre_submit_time.saturating_sub(lc.recv_time)),
            }
            .emit();
            HistogramMetric::FlowPhase {
                phase: "submit",
                duration: Duration::from_nanos(
                    lc.post_submit_time.saturating_sub(lc.pre_submit_time),
                ),
            }
            .emit();
            if lc.needs_response {
                HistogramMetric::FlowPhase {
                    phase: "collect",
                    duration: Duration::from_nanos(
                        lc.post_collect_time.saturating_sub(lc.pre_collect_time),
                    ),
                }
                .emit();
                HistogramMetric::FlowPhase {
                    phase: "response",
                    duration: Duration::from_nanos(
                        lc.resp_time.saturating_sub(lc.post_collect_time),
                    ),
                }
                .emit();
                HistogramMetric::FlowPhase {
                    phase: "hardware",
                    duration: Duration::from_nanos(lc.post_hw_time.saturating_sub(lc.pre_hw_time)),
                }
                .emit();
            }

            slot.lifecycle.reset();
            slot.valid = false;
            slot.complete = false;
        }

        {
            let mut free = self.free_ids.lock()?;
            let queued = free.enqueue(id);
            assert!(queued, "free-list sized to table depth");
            self.free_count.fetch_add(1, Ordering::AcqRel);
        }
        self.free_cv.notify_one();

        if self.retry_armed.swap(false, Ordering::AcqRel) {
            if let Some(cb) = &*self.retry_callback.lock()? {
                cb();
            }
        }
        log::debug!("released table slot {id}");
        Ok(())
    }

    /// Report free-list exhaustion and, as a side effect, arm the
    /// caller-should-retry flag consumed by the next release.
    pub fn is_exhausted(&self) -> bool {
        let exhausted = self.free_slots() == 0;
        if exhausted {
            self.retry_armed.store(true, Ordering::Release);
        }
        exhausted
    }

    /// Register (or clear) the backpressure-relief callback.
    pub fn set_retry_callback(&self, cb: Option<RetryCallback>) -> Result<()> {
        *self.retry_callback.lock()? = cb;
        Ok(())
    }

    /// Wake every thread blocked in [`allocate`](Self::allocate), e.g. on
    /// shutdown.
    pub fn wake_waiters(&self) {
        self.free_cv.notify_all();
    }

    /// Copy of the slot's lifecycle record.
    pub fn lifecycle(&self, id: usize) -> Result<LifeCycle> {
        Ok(self.slots[id].lock()?.lifecycle)
    }

    pub(crate) fn slot(&self, id: usize) -> &Mutex<SlotEntry> {
        &self.slots[id]
    }
}
