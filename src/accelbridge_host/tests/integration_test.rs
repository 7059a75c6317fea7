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

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use accelbridge_common::{Task, CTRL_PAYLOAD_LEN, DATA_CHUNK_LEN, RESULT_PAYLOAD_LEN};
use accelbridge_host::transport::{
    REG_BATCH_THRESHOLD, REG_POLL_READ_MODE, REG_SESSION_INIT, REG_SESSION_STOP,
};
use accelbridge_host::{CollectMode, Engine, EngineConfig, EngineError};
use common::{SoftDevice, BULK_WINDOW};
use crossbeam_channel::{bounded, RecvTimeoutError};

fn engine_over(device: &Arc<SoftDevice>, config: EngineConfig) -> Engine {
    Engine::new(device.clone(), config)
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn payload(tag: u8) -> [u8; CTRL_PAYLOAD_LEN] {
    let mut p = [0u8; CTRL_PAYLOAD_LEN];
    for (i, byte) in p.iter_mut().enumerate() {
        *byte = tag.wrapping_add(i as u8);
    }
    p
}

#[test]
fn session_strobes_and_round_trip() {
    let device = Arc::new(SoftDevice::new());
    let mut config = EngineConfig::default();
    config.set_limit_batch(2);
    let engine = engine_over(&device, config);

    engine.begin_session().unwrap();
    assert_eq!(
        device.strobes(),
        vec![REG_SESSION_INIT, REG_POLL_READ_MODE, REG_BATCH_THRESHOLD]
    );
    assert_eq!(device.batch_threshold(), 2);

    let mut task = Task::control_write_with_response(&payload(7));
    task.insert_time = 41;
    let slot = engine.submit_task(task).unwrap();

    let (result, enqueue_time) = engine.fetch_result(slot).unwrap();
    assert_eq!(result.slot_id, slot);
    assert!(result.is_valid());
    assert_eq!({ result.executed_time }, 42);
    assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(7));
    assert!(enqueue_time > 0);

    engine.end_session().unwrap();
    assert_eq!(device.strobes().last(), Some(&REG_SESSION_STOP));
    assert_eq!(device.request_writes(), 1);
    assert!(device.window_reads() >= 1);
}

#[test]
fn completions_fetchable_by_slot_in_any_order() {
    let device = Arc::new(SoftDevice::new());
    let engine = engine_over(&device, EngineConfig::default());
    engine.begin_session().unwrap();

    let slots: Vec<i8> = (0..3)
        .map(|i| {
            engine
                .submit_task(Task::control_write_with_response(&payload(10 * (i + 1))))
                .unwrap()
        })
        .collect();

    // Fetch in reverse submission order; lookup is by slot id, not arrival
    for (i, &slot) in slots.iter().enumerate().rev() {
        let (result, _) = engine.fetch_result(slot).unwrap();
        assert_eq!(result.slot_id, slot);
        assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(10 * (i as u8 + 1)));
    }

    engine.end_session().unwrap();
}

#[test]
fn backpressure_blocks_then_single_release_unblocks() {
    let device = Arc::new(SoftDevice::new());
    device.hold_responses(true);

    let mut config = EngineConfig::default();
    config.set_table_depth(2);
    let engine = Arc::new(engine_over(&device, config));

    let fired = Arc::new(AtomicUsize::new(0));
    let counter = fired.clone();
    engine
        .set_retry_callback(Some(Box::new(move || {
            counter.fetch_add(1, Ordering::AcqRel);
        })))
        .unwrap();

    engine.begin_session().unwrap();

    let first = engine
        .submit_task(Task::control_write_with_response(&payload(1)))
        .unwrap();
    let second = engine
        .submit_task(Task::control_write_with_response(&payload(2)))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || device.request_writes() == 2));
    assert!(engine.is_backpressured());

    // The (depth + 1)-th submission blocks in slot allocation
    let (sender, receiver) = bounded(1);
    let blocked_engine = engine.clone();
    let submitter = thread::spawn(move || {
        let slot = blocked_engine
            .submit_task(Task::control_write_with_response(&payload(3)))
            .unwrap();
        sender.send(slot).unwrap();
    });
    assert_eq!(
        receiver.recv_timeout(Duration::from_millis(300)),
        Err(RecvTimeoutError::Timeout)
    );

    // One release unblocks exactly one pending submission
    device.release_one();
    let third = receiver
        .recv_timeout(Duration::from_secs(5))
        .expect("blocked submission should unblock after one release");
    submitter.join().unwrap();
    assert_eq!(fired.load(Ordering::Acquire), 1);

    // Fetch the completed first task before its slot id is reused further
    let (result, _) = engine.fetch_result(first).unwrap();
    assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(1));

    device.release_all();
    let (result, _) = engine.fetch_result(second).unwrap();
    assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(2));
    let (result, _) = engine.fetch_result(third).unwrap();
    assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(3));

    engine.end_session().unwrap();
}

#[test]
fn fire_and_forget_releases_slots_without_responses() {
    let device = Arc::new(SoftDevice::new());
    let mut config = EngineConfig::default();
    config.set_table_depth(4);
    let engine = engine_over(&device, config);
    engine.begin_session().unwrap();

    for i in 0..4 {
        engine.submit_task(Task::control_write(&payload(i))).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || device.request_writes() == 4));

    // All slots come back without any response traffic
    assert!(wait_until(Duration::from_secs(5), || !engine.is_backpressured()));
    engine.submit_task(Task::control_write(&payload(9))).unwrap();

    engine.end_session().unwrap();
    assert_eq!(device.request_writes(), 5);
}

#[test]
fn consecutive_writes_coalesce_into_batches() {
    let device = Arc::new(SoftDevice::new());
    device.set_write_delay(Duration::from_millis(100));

    let mut config = EngineConfig::default();
    config.set_limit_batch(3);
    let engine = engine_over(&device, config);
    engine.begin_session().unwrap();

    // First write goes out alone and stalls in the device...
    engine.submit_task(Task::control_write(&payload(1))).unwrap();
    assert!(wait_until(Duration::from_secs(5), || device.request_writes() == 1));

    // ...while three more writes pile up and coalesce into one batch
    for i in 2..=4 {
        engine.submit_task(Task::control_write(&payload(i))).unwrap();
    }
    assert!(wait_until(Duration::from_secs(5), || device.request_writes() == 2));
    assert_eq!(device.request_batches(), vec![1, 3]);

    engine.end_session().unwrap();
    assert_eq!(device.request_writes(), 2);
}

#[test]
fn bulk_data_tasks_write_contiguous_payloads() {
    let device = Arc::new(SoftDevice::new());
    device.set_write_delay(Duration::from_millis(100));

    let mut config = EngineConfig::default();
    config.set_limit_batch(3);
    let engine = engine_over(&device, config);
    engine.begin_session().unwrap();

    let chunk = DATA_CHUNK_LEN as u32;
    engine
        .submit_task(Task::bulk_chunk(0x4000, &[0x11; DATA_CHUNK_LEN]))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || device.data_writes() == 1));

    engine
        .submit_task(Task::bulk_chunk(0x4000 + chunk, &[0x22; DATA_CHUNK_LEN]))
        .unwrap();
    engine
        .submit_task(Task::bulk_chunk(0x4000 + 2 * chunk, &[0x33; DATA_CHUNK_LEN]))
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || device.data_writes() == 2));

    let sink = device.data_sink();
    assert_eq!(sink[0].0, 0x4000);
    assert_eq!(sink[0].1, vec![0x11; DATA_CHUNK_LEN]);
    // The two queued chunks were contiguous and went out as one packet
    assert_eq!(sink[1].0, 0x4000 + chunk as u64);
    assert_eq!(sink[1].1.len(), 2 * DATA_CHUNK_LEN);
    assert_eq!(sink[1].1[..DATA_CHUNK_LEN], [0x22; DATA_CHUNK_LEN]);
    assert_eq!(sink[1].1[DATA_CHUNK_LEN..], [0x33; DATA_CHUNK_LEN]);

    engine.end_session().unwrap();
}

#[test]
fn shutdown_with_tasks_in_flight_delivers_all_completions() {
    let device = Arc::new(SoftDevice::new());
    device.hold_responses(true);

    let mut config = EngineConfig::default();
    config.set_table_depth(8);
    let engine = engine_over(&device, config);
    engine.begin_session().unwrap();

    let slots: Vec<i8> = (0..5)
        .map(|i| {
            engine
                .submit_task(Task::control_write_with_response(&payload(i + 1)))
                .unwrap()
        })
        .collect();
    assert!(wait_until(Duration::from_secs(5), || device.request_writes() == 5));

    // Shutdown must deliver exactly the five in-flight completions
    device.release_all();
    engine.end_session().unwrap();

    for (i, &slot) in slots.iter().enumerate() {
        let (result, _) = engine.fetch_result(slot).unwrap();
        assert_eq!(result.slot_id, slot);
        assert_eq!(result.content[..CTRL_PAYLOAD_LEN], payload(i as u8 + 1));
    }

    // Nothing else was delivered
    assert!(matches!(
        engine.fetch_result(100),
        Err(EngineError::SessionNotActive())
    ));
}

#[test]
fn bulk_dma_stream_round_trip_and_underrun() {
    let device = Arc::new(SoftDevice::new());
    let chunks: Vec<[u8; RESULT_PAYLOAD_LEN]> = (0..6)
        .map(|i| [i as u8 + 1; RESULT_PAYLOAD_LEN])
        .collect();
    device.set_bulk_chunks(chunks.clone());

    let mut config = EngineConfig::default();
    config.set_collect_mode(CollectMode::BulkDma);
    let engine = engine_over(&device, config);
    engine.begin_session().unwrap();

    let total = (chunks.len() * RESULT_PAYLOAD_LEN) as u64;
    engine.enable_bulk_transfer(BULK_WINDOW, total).unwrap();

    // Frames arrive with deterministic boundaries: a zero-filled frame just
    // means "not staged yet", so poll until each expected frame shows up
    for expected in &chunks {
        let mut frame = [0u8; RESULT_PAYLOAD_LEN];
        let got = wait_until(Duration::from_secs(5), || {
            engine.fetch_bulk_data(&mut frame).unwrap();
            frame == *expected
        });
        assert!(got, "bulk frame never arrived");
    }

    // Window fully staged and drained
    assert!(wait_until(Duration::from_secs(5), || engine
        .bulk_remaining()
        .unwrap()
        == 0));

    // Underrun: more than is staged zero-fills and moves nothing
    let mut frame = [0xFFu8; RESULT_PAYLOAD_LEN];
    engine.fetch_bulk_data(&mut frame).unwrap();
    assert_eq!(frame, [0u8; RESULT_PAYLOAD_LEN]);
    assert_eq!(engine.bulk_remaining().unwrap(), 0);

    engine.disable_bulk_transfer().unwrap();
    assert!(matches!(
        engine.disable_bulk_transfer(),
        Err(EngineError::Error(_))
    ));

    engine.end_session().unwrap();
}

#[test]
fn session_misuse_is_an_error() {
    let device = Arc::new(SoftDevice::new());
    let engine = engine_over(&device, EngineConfig::default());

    assert!(matches!(
        engine.submit_task(Task::control_write(&payload(1))),
        Err(EngineError::SessionNotActive())
    ));

    engine.begin_session().unwrap();
    assert!(matches!(
        engine.begin_session(),
        Err(EngineError::SessionAlreadyActive())
    ));

    // A task without the valid flag never enters the pipeline
    assert!(matches!(
        engine.submit_task(Task::default()),
        Err(EngineError::InvalidTask())
    ));

    // Neither does a bare control read; reads are only ever solicited
    // through the needs-response channel
    let mut read_task = Task::default();
    read_task.set_valid();
    read_task.set_read();
    assert!(matches!(
        engine.submit_task(read_task),
        Err(EngineError::InvalidTask())
    ));

    engine.end_session().unwrap();
    assert!(matches!(
        engine.end_session(),
        Err(EngineError::SessionNotActive())
    ));
    assert!(matches!(engine.begin_session(), Err(EngineError::Error(_))));
    assert!(matches!(
        engine.submit_task(Task::control_write(&payload(1))),
        Err(EngineError::SessionNotActive())
    ));
}
