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

//! Dispatch Stage
//!
//! Single consumer of the ingress and response queues. Per wake-up it binds
//! at most one incoming task to its table slot and hands it to Submission,
//! and fans one response batch out to waiting fetchers. It also drives the
//! three-phase shutdown described in [`super`].

use std::sync::atomic::Ordering;

use crate::pipeline::{Completion, StageContext};
use crate::Result;

pub(crate) fn run(ctx: &StageContext) -> Result<()> {
    loop {
        let (task, response) = {
            let mut queues = ctx.state.dispatch_mx.lock()?;
            loop {
                if !queues.ingress.is_empty() || !queues.responses.is_empty() {
                    break;
                }
                if ctx.state.shutdown.load(Ordering::Acquire) {
                    let submit_done = ctx.state.submit_done.load(Ordering::Acquire);
                    let collect_done = ctx.state.collect_done.load(Ordering::Acquire);
                    // The ingress queue is known empty here, so phase two
                    // can fire; phase three needs the table reclaimed.
                    let stop_submission = !submit_done;
                    let stop_collection = !collect_done && ctx.table.is_fully_reclaimed();
                    if stop_submission || stop_collection || (submit_done && collect_done) {
                        break;
                    }
                }
                queues = ctx.state.dispatch_cv.wait(queues)?;
            }
            let task = (!queues.ingress.is_empty()).then(|| queues.ingress.dequeue());
            let response = (!queues.responses.is_empty()).then(|| queues.responses.dequeue());
            (task, response)
        };

        if let Some(task) = task {
            let slot_id = task.slot_id;
            assert!(slot_id >= 0, "ingress task without an allocated slot");
            let id = slot_id as usize;
            log::debug!("dispatch: binding ingress task to slot {id}");
            ctx.table.bind(id, &task)?;
            {
                let mut transmit = ctx.state.transmit_mx.lock()?;
                let queued = transmit.enqueue(task);
                assert!(queued, "transmit queue sized to table depth");
            }
            ctx.state.transmit_cv.notify_one();
        }

        if let Some(pkt) = response {
            let results = pkt.results();
            log::debug!(
                "dispatch: fanning out a response batch of {}",
                results.len()
            );
            let mut ready = Vec::with_capacity(results.len());
            for result in results {
                let slot_id = result.slot_id;
                assert!(slot_id >= 0, "device response for an unallocated slot");
                let id = slot_id as usize;
                let enqueue_time = ctx.table.complete(id, result)?;
                ready.push(Completion {
                    slot_id,
                    result: *result,
                    enqueue_time,
                });
                ctx.release_slot(id)?;
            }
            {
                let mut completions = ctx.completions.lock()?;
                completions.extend(ready);
            }
            ctx.fetch_cv.notify_all();
        }

        if ctx.state.shutdown.load(Ordering::Acquire) {
            let ingress_empty = ctx.state.dispatch_mx.lock()?.ingress.is_empty();
            if ingress_empty && !ctx.state.submit_done.load(Ordering::Acquire) {
                log::debug!("dispatch: signalling submission to drain and stop");
                ctx.state.submit_done.store(true, Ordering::Release);
                ctx.wake_submission();
            }
            if !ctx.state.collect_done.load(Ordering::Acquire) && ctx.table.is_fully_reclaimed() {
                log::debug!("dispatch: signalling collection to drain and stop");
                ctx.state.collect_done.store(true, Ordering::Release);
                ctx.wake_collection();
            }
            if ctx.state.submit_done.load(Ordering::Acquire)
                && ctx.state.collect_done.load(Ordering::Acquire)
            {
                break;
            }
        }
    }
    log::debug!("dispatch stage exit");
    Ok(())
}
