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

//! Collection Stage
//!
//! While responses are outstanding, either polls the packet window with
//! blocking reads (an invalid packet means "hardware not ready" and is
//! retried, yielding once the spin budget is spent), or delegates to the
//! bulk-DMA engine and disarms its window once the drain finishes.
//!
//! Hard invariant: the outstanding-response counter is exactly zero at the
//! moment shutdown is acknowledged. Anything else at exit is an invariant
//! breach and aborts.

use std::sync::atomic::Ordering;
use std::thread;

use accelbridge_common::ResponsePacket;
use bytemuck::Zeroable;

use crate::config::CollectMode;
use crate::dma::BulkDma;
use crate::metrics::{EmittableMetric, HistogramMetric};
use crate::pipeline::StageContext;
use crate::time::system_time_nanos;
use crate::transport::PACKET_WINDOW;
use crate::Result;

pub(crate) fn run(ctx: &StageContext) -> Result<()> {
    let resp_wire = ResponsePacket::wire_size(ctx.limit_batch);
    let mut spins: u32 = 0;
    loop {
        {
            let mut guard = ctx.state.collect_mx.lock()?;
            while ctx.state.outstanding.load(Ordering::Acquire) <= 0
                && !ctx.state.collect_done.load(Ordering::Acquire)
            {
                guard = ctx.state.collect_cv.wait(guard)?;
            }
        }
        if ctx.state.collect_done.load(Ordering::Acquire) {
            break;
        }

        match ctx.collect_mode {
            CollectMode::Poll => {
                let pre = system_time_nanos();
                let mut pkt = ResponsePacket::zeroed();
                ctx.dev
                    .read_all(PACKET_WINDOW, &mut pkt.as_bytes_mut()[..resp_wire])?;

                if pkt.is_valid() {
                    spins = 0;
                    let tasks = pkt.results().len();
                    let outstanding = ctx
                        .state
                        .outstanding
                        .fetch_sub(tasks as i64, Ordering::AcqRel)
                        - tasks as i64;
                    assert!(outstanding >= 0, "outstanding-response counter went negative");

                    let post = system_time_nanos();
                    for result in pkt.results() {
                        let slot_id = result.slot_id;
                        assert!(slot_id >= 0, "device response for an unallocated slot");
                        ctx.table.stamp_collect(slot_id as usize, pre, post)?;
                    }
                    {
                        let mut queues = ctx.state.dispatch_mx.lock()?;
                        let queued = queues.responses.enqueue(pkt);
                        assert!(queued, "response queue sized to table depth");
                    }
                    ctx.state.dispatch_cv.notify_one();
                    HistogramMetric::BatchSize {
                        direction: "response",
                        tasks,
                    }
                    .emit();
                    log::debug!("collection: staged a valid response batch of {tasks}");
                } else {
                    log::trace!("collection: device not ready, retrying");
                    spins += 1;
                    if spins >= ctx.spin_budget {
                        thread::yield_now();
                        spins = 0;
                    }
                }
            }
            CollectMode::BulkDma => {
                let armed = {
                    let dma = ctx.dma.lock()?;
                    dma.is_enabled() && !dma.is_drained()
                };
                if armed {
                    let finished = BulkDma::execute(
                        &ctx.dma,
                        &ctx.dev,
                        &ctx.state.collect_done,
                        ctx.spin_budget,
                    )?;
                    log::debug!("collection: bulk drain finished: {finished}");
                    if finished {
                        // Window staged in full: retire its charge on the
                        // outstanding counter. The staging buffer remains
                        // fetchable until the caller disarms the window. A
                        // caller disarming in the meantime settled the
                        // counter itself.
                        let mut dma = ctx.dma.lock()?;
                        if dma.is_enabled() {
                            dma.mark_drained();
                            let outstanding =
                                ctx.state.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
                            assert!(
                                outstanding >= 0,
                                "outstanding-response counter went negative"
                            );
                        }
                    } else {
                        // Stopped early. A manual disarm already settled the
                        // counter; a shutdown stop has not.
                        let mut dma = ctx.dma.lock()?;
                        if dma.is_enabled() {
                            dma.disable();
                            let outstanding =
                                ctx.state.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
                            assert!(
                                outstanding >= 0,
                                "outstanding-response counter went negative"
                            );
                        }
                    }
                } else {
                    // Woken with nothing armed; don't saturate a core
                    thread::yield_now();
                }
            }
        }
    }

    // A window still armed at shutdown is disarmed cooperatively; only an
    // undrained window still has a charge on the outstanding counter.
    {
        let mut dma = ctx.dma.lock()?;
        if dma.is_enabled() {
            log::debug!("collection: disarming bulk window at shutdown");
            let undrained = !dma.is_drained();
            dma.disable();
            if undrained {
                let outstanding = ctx.state.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
                assert!(
                    outstanding >= 0,
                    "outstanding-response counter went negative"
                );
            }
        }
    }

    let leftover = ctx.state.outstanding.load(Ordering::Acquire);
    assert!(
        leftover == 0,
        "collection stage exited with {leftover} outstanding responses"
    );
    log::debug!("collection stage exit");
    Ok(())
}
