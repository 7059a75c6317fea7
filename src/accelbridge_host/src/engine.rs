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

//! Caller-Facing Engine
//!
//! Owns the transport handle, the task table and the three stage threads.
//! One engine instance runs one session: [`begin_session`] strobes the
//! device and starts the stages, [`end_session`] drains them in the strict
//! three-phase order and joins the threads. Results remain fetchable after
//! the session ends.
//!
//! [`begin_session`]: Engine::begin_session
//! [`end_session`]: Engine::end_session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use accelbridge_common::{Task, TaskResult};
use tracing::{instrument, Span};

use crate::config::{CollectMode, EngineConfig};
use crate::dma::BulkDma;
use crate::error::EngineError;
use crate::new_error;
use crate::pipeline::{collect, dispatch, submit, PipelineState, StageContext};
use crate::table::{RetryCallback, TaskTable};
use crate::transport::{DeviceHandle, Transport};
use crate::Result;

pub struct Engine {
    ctx: Arc<StageContext>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    session_active: AtomicBool,
}

impl Engine {
    /// Build an engine over `transport`. Nothing touches the device until
    /// [`begin_session`](Self::begin_session).
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        let depth = config.get_table_depth();
        let ctx = StageContext {
            state: PipelineState::new(depth),
            table: TaskTable::new(depth),
            dev: DeviceHandle::new(transport),
            completions: Mutex::new(Vec::with_capacity(depth)),
            fetch_cv: Condvar::new(),
            dma: Mutex::new(BulkDma::new(
                config.get_dma_capacity(),
                config.get_limit_batch(),
            )),
            limit_batch: config.get_limit_batch(),
            collect_mode: config.get_collect_mode(),
            spin_budget: config.get_spin_budget(),
        };
        Self {
            ctx: Arc::new(ctx),
            threads: Mutex::new(Vec::new()),
            session_active: AtomicBool::new(false),
        }
    }

    /// Initialize the device and start the three pipeline stages.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn begin_session(&self) -> Result<()> {
        if self.ctx.state.shutdown.load(Ordering::Acquire) {
            return Err(new_error!("engine sessions cannot be restarted"));
        }
        if self.session_active.swap(true, Ordering::AcqRel) {
            return Err(EngineError::SessionAlreadyActive());
        }

        self.ctx.dev.init_session()?;
        self.ctx.dev.set_poll_read_mode()?;
        self.ctx.dev.set_batch_threshold(self.ctx.limit_batch as u32)?;

        let mut threads = self.threads.lock()?;
        threads.push(spawn_stage("accelbridge-dispatch", &self.ctx, dispatch::run)?);
        threads.push(spawn_stage("accelbridge-submit", &self.ctx, submit::run)?);
        threads.push(spawn_stage("accelbridge-collect", &self.ctx, collect::run)?);
        log::debug!("session started with {} table slots", self.ctx.table.depth());
        Ok(())
    }

    /// Drain the pipeline in the three-phase order and join all stage
    /// threads, then strobe the device stop register.
    ///
    /// Every task in flight at the moment of the call is carried to
    /// completion first; its result stays fetchable afterwards.
    #[instrument(err(Debug), skip_all, parent = Span::current(), level = "Trace")]
    pub fn end_session(&self) -> Result<()> {
        if !self.session_active.swap(false, Ordering::AcqRel) {
            return Err(EngineError::SessionNotActive());
        }
        log::debug!("session end requested");
        self.ctx.state.shutdown.store(true, Ordering::Release);
        self.ctx.wake_dispatch();
        self.ctx.table.wake_waiters();

        let mut stage_failed = false;
        for handle in self.threads.lock()?.drain(..) {
            if handle.join().is_err() {
                stage_failed = true;
            }
        }
        self.ctx.wake_fetchers();

        self.ctx.dev.stop_session()?;
        if stage_failed {
            return Err(new_error!("a pipeline stage panicked during the session"));
        }
        log::debug!("session ended");
        Ok(())
    }

    /// Hand a task to the pipeline, blocking while the task table is
    /// exhausted. Returns the slot id to fetch the result with.
    #[instrument(err(Debug), skip(self, task), parent = Span::current(), level = "Trace")]
    pub fn submit_task(&self, mut task: Task) -> Result<i8> {
        if !self.session_active.load(Ordering::Acquire) {
            return Err(EngineError::SessionNotActive());
        }
        if !task.is_valid() {
            return Err(EngineError::InvalidTask());
        }
        // Reads are solicited implicitly through the needs-response channel
        // and never issued directly
        if !task.is_write() && !task.is_bulk() {
            return Err(EngineError::InvalidTask());
        }

        let id = self.ctx.table.allocate(&self.ctx.state.shutdown)?;
        task.slot_id = id as i8;
        self.ctx.table.note_received(id, &task)?;

        {
            let mut queues = self.ctx.state.dispatch_mx.lock()?;
            let queued = queues.ingress.enqueue(task);
            assert!(queued, "ingress queue sized to table depth");
        }
        self.ctx.state.dispatch_cv.notify_one();
        log::debug!("submitted task into slot {id}");
        Ok(id as i8)
    }

    /// Block until the task in `slot_id` completes, then return its result
    /// and the enqueue timestamp recorded at submission.
    ///
    /// Completions arrive in batch order, not submission order; callers look
    /// up by slot id.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn fetch_result(&self, slot_id: i8) -> Result<(TaskResult, u64)> {
        let mut completions = self.ctx.completions.lock()?;
        loop {
            if let Some(pos) = completions.iter().position(|c| c.slot_id == slot_id) {
                let done = completions.swap_remove(pos);
                log::debug!("fetched result for slot {slot_id}");
                return Ok((done.result, done.enqueue_time));
            }
            let stopped = self.ctx.state.shutdown.load(Ordering::Acquire)
                && self.ctx.state.submit_done.load(Ordering::Acquire)
                && self.ctx.state.collect_done.load(Ordering::Acquire);
            if stopped {
                return Err(EngineError::SessionNotActive());
            }
            completions = self.ctx.fetch_cv.wait(completions)?;
        }
    }

    /// Report whether the slot pool is exhausted; as a side effect, arms the
    /// caller-should-retry flag consumed by the next slot release.
    pub fn is_backpressured(&self) -> bool {
        self.ctx.table.is_exhausted()
    }

    /// Register (or clear) the callback fired exactly once per slot release
    /// while the retry flag is armed.
    pub fn set_retry_callback(&self, cb: Option<RetryCallback>) -> Result<()> {
        self.ctx.table.set_retry_callback(cb)
    }

    /// Arm the bulk-transfer window at `addr` and wake Collection to drain
    /// it. Only meaningful in [`CollectMode::BulkDma`].
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn enable_bulk_transfer(&self, addr: u64, size: u64) -> Result<()> {
        if self.ctx.collect_mode != CollectMode::BulkDma {
            return Err(new_error!(
                "bulk transfer requires the bulk-DMA collection mode"
            ));
        }
        self.ctx.dma.lock()?.enable(addr, size);
        let previous = self.ctx.state.outstanding.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous >= 0);
        self.ctx.wake_collection();
        Ok(())
    }

    /// Disarm the bulk-transfer window. Collection disarms it by itself once
    /// the window drains; this is for tearing down an unfinished transfer.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn disable_bulk_transfer(&self) -> Result<()> {
        let mut dma = self.ctx.dma.lock()?;
        if !dma.is_enabled() {
            return Err(new_error!("bulk transfer window is not armed"));
        }
        // A drained window already settled its charge on the outstanding
        // counter when Collection retired it.
        let undrained = !dma.is_drained();
        dma.disable();
        if undrained {
            let outstanding = self.ctx.state.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
            assert!(outstanding >= 0, "outstanding-response counter went negative");
            self.ctx.wake_collection();
        }
        Ok(())
    }

    /// Copy exactly `buf.len()` staged bulk bytes, or zero-fill `buf` if
    /// fewer are staged. Never partial, never blocking.
    pub fn fetch_bulk_data(&self, buf: &mut [u8]) -> Result<()> {
        self.ctx.dma.lock()?.fetch_data(buf);
        Ok(())
    }

    /// Staged bulk bytes not yet fetched.
    pub fn bulk_remaining(&self) -> Result<i64> {
        Ok(self.ctx.dma.lock()?.remaining())
    }

    /// Is a bulk-transfer window currently armed?
    pub fn bulk_enabled(&self) -> Result<bool> {
        Ok(self.ctx.dma.lock()?.is_enabled())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.session_active.load(Ordering::Acquire) {
            if let Err(e) = self.end_session() {
                log::error!("engine dropped with a live session, teardown failed: {e}");
            }
        }
    }
}

fn spawn_stage(
    name: &str,
    ctx: &Arc<StageContext>,
    stage: fn(&StageContext) -> Result<()>,
) -> Result<JoinHandle<()>> {
    let ctx = ctx.clone();
    let stage_name = name.to_string();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Err(e) = stage(&ctx) {
                log::error!("{stage_name} stage failed: {e}");
                panic!("{stage_name} stage failed: {e}");
            }
        })?;
    Ok(handle)
}
