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

//! Submission Stage
//!
//! Consumes the transmit queue, greedily coalescing consecutive tasks with
//! an identical flags byte into one outbound packet, bounded by the
//! configured batch limit. Bulk chunks additionally require address
//! contiguity: a discontiguous chunk flushes the batch and starts a fresh
//! packet on the next cycle.
//!
//! Fire-and-forget batches release their slots immediately after the write;
//! needs-response batches charge the outstanding-response counter and wake
//! Collection. A bare control-read reaching this stage aborts: reads are
//! only ever solicited implicitly through the needs-response channel.

use std::sync::atomic::Ordering;

use accelbridge_common::{DataPacket, RequestPacket, RingBuffer, Task, TaskFlags};
use bytemuck::Zeroable;

use crate::metrics::{CounterMetric, EmittableMetric, HistogramMetric};
use crate::pipeline::StageContext;
use crate::transport::PACKET_WINDOW;
use crate::Result;

/// One coalesced batch, ready to issue.
pub(crate) struct Batch {
    pub request: RequestPacket,
    pub data: DataPacket,
    pub flags: TaskFlags,
    pub slot_ids: Vec<usize>,
}

/// Pop a maximal run of same-kind tasks off the transmit queue.
///
/// The queue must be non-empty. Stops at the batch limit, at the first task
/// whose flags byte differs from the head's, or at a discontiguous bulk
/// chunk (which stays queued for the next batch).
pub(crate) fn build_batch(queue: &mut RingBuffer<Task>, limit_batch: usize) -> Batch {
    debug_assert!(!queue.is_empty());
    let mut request = RequestPacket::zeroed();
    let mut data = DataPacket::zeroed();
    let kind = queue.peek().flags;
    let mut slot_ids = Vec::with_capacity(limit_batch);

    while slot_ids.len() < limit_batch && !queue.is_empty() && queue.peek().flags == kind {
        let task = *queue.peek();
        let index = slot_ids.len();
        if task.is_bulk() && data.append(index, &task).is_err() {
            break;
        }
        request
            .set_task(index, &task)
            .expect("batch index bounded by the configured limit");
        queue.dequeue();
        assert!(task.slot_id >= 0, "transmit task without an allocated slot");
        slot_ids.push(task.slot_id as usize);
    }

    request.finish(slot_ids.len());
    Batch {
        request,
        data,
        flags: TaskFlags::from_bits_truncate(kind),
        slot_ids,
    }
}

pub(crate) fn run(ctx: &StageContext) -> Result<()> {
    let request_wire = RequestPacket::wire_size(ctx.limit_batch);
    loop {
        let batch = {
            let mut queue = ctx.state.transmit_mx.lock()?;
            while queue.is_empty() && !ctx.state.submit_done.load(Ordering::Acquire) {
                queue = ctx.state.transmit_cv.wait(queue)?;
            }
            if queue.is_empty() {
                break;
            }

            let head = *queue.peek();
            if !head.is_write() && !head.is_bulk() {
                if head.is_read() {
                    panic!("bare control-read task reached the submission stage");
                }
                panic!("task with no kind reached the submission stage");
            }
            build_batch(&mut queue, ctx.limit_batch)
        };

        let tasks = batch.slot_ids.len();
        debug_assert!(tasks >= 1);
        for &id in &batch.slot_ids {
            ctx.table.stamp_pre_submit(id)?;
        }

        // The blocking write runs with no queue lock held, so Dispatch and
        // Collection stay unblocked for its duration.
        if batch.flags.contains(TaskFlags::BULK) {
            log::debug!(
                "submission: issuing bulk data packet, {tasks} chunks at {:#x}",
                batch.data.start_addr()
            );
            ctx.dev
                .write_all(batch.data.start_addr() as u64, batch.data.payload())?;
            CounterMetric::BulkPacketsIssued.emit();
        } else {
            log::debug!("submission: issuing request packet, batch {tasks}");
            ctx.dev
                .write_all(PACKET_WINDOW, &batch.request.as_bytes()[..request_wire])?;
        }

        for &id in &batch.slot_ids {
            ctx.table.stamp_post_submit(id)?;
        }
        HistogramMetric::BatchSize {
            direction: "request",
            tasks,
        }
        .emit();

        if batch.flags.contains(TaskFlags::NEED_RESP) {
            let previous = ctx.state.outstanding.fetch_add(tasks as i64, Ordering::AcqRel);
            debug_assert!(previous >= 0);
            log::debug!("submission: batch owes {tasks} responses, waking collection");
            ctx.wake_collection();
        } else {
            for &id in &batch.slot_ids {
                ctx.release_slot(id)?;
            }
        }
    }
    log::debug!("submission stage exit");
    Ok(())
}
