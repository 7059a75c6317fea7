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

//! Blocking Device Transport Boundary
//!
//! Everything accelerator-bound goes through [`Transport`]: a pair of
//! blocking, addressed, fixed-size read/write operations. The engine never
//! retries a short transfer; a device that moves fewer bytes than requested
//! is assumed wedged.
//!
//! The control-register offsets below live in the device's address space and
//! are a contract with the transport collaborator, not with the pipeline:
//! the engine only strobes them around session begin/end.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use crate::error::EngineError;
use crate::metrics::{EmittableMetric, HistogramMetric};
use crate::Result;

/// Session-begin strobe.
pub const REG_SESSION_INIT: u64 = 0x1000;
/// Selects polled response reads.
pub const REG_POLL_READ_MODE: u64 = 0x1008;
/// Configures the device-side batch threshold (little-endian u32 payload).
pub const REG_BATCH_THRESHOLD: u64 = 0x1010;
/// Session-end strobe.
pub const REG_SESSION_STOP: u64 = 0x2000;

/// Address of the request/response packet window.
pub const PACKET_WINDOW: u64 = 0x0;

/// Register strobes carry a fixed 32-byte payload.
pub const STROBE_LEN: usize = 32;

/// Blocking transport to the accelerator.
///
/// Both operations return the number of bytes actually moved; the engine
/// treats a short transfer as an unrecoverable fault.
pub trait Transport: Send + Sync {
    fn write(&self, addr: u64, buf: &[u8]) -> io::Result<usize>;
    fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// Engine-side handle over a [`Transport`] that enforces the short-transfer
/// contract, times transfers, and knows the control-register protocol.
pub(crate) struct DeviceHandle {
    transport: Arc<dyn Transport>,
}

impl DeviceHandle {
    pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Issue one blocking write; a short transfer is a fault.
    pub(crate) fn write_all(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let start = Instant::now();
        let actual = self.transport.write(addr, buf)?;
        HistogramMetric::TransportTransfer {
            direction: "write",
            duration: start.elapsed(),
        }
        .emit();
        if actual != buf.len() {
            return Err(EngineError::TransportFault {
                addr,
                requested: buf.len(),
                actual,
            });
        }
        log::trace!("device write finished, address: {addr:#x}, size: {}", buf.len());
        Ok(())
    }

    /// Issue one blocking read; a short transfer is a fault.
    pub(crate) fn read_all(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let start = Instant::now();
        let actual = self.transport.read(addr, buf)?;
        HistogramMetric::TransportTransfer {
            direction: "read",
            duration: start.elapsed(),
        }
        .emit();
        if actual != buf.len() {
            return Err(EngineError::TransportFault {
                addr,
                requested: buf.len(),
                actual,
            });
        }
        log::trace!("device read finished, address: {addr:#x}, size: {}", buf.len());
        Ok(())
    }

    fn strobe(&self, reg: u64, payload: [u8; STROBE_LEN]) -> Result<()> {
        self.write_all(reg, &payload)
    }

    pub(crate) fn init_session(&self) -> Result<()> {
        self.strobe(REG_SESSION_INIT, [0; STROBE_LEN])
    }

    pub(crate) fn set_poll_read_mode(&self) -> Result<()> {
        self.strobe(REG_POLL_READ_MODE, [0; STROBE_LEN])
    }

    pub(crate) fn set_batch_threshold(&self, limit_batch: u32) -> Result<()> {
        let mut payload = [0u8; STROBE_LEN];
        payload[..4].copy_from_slice(&limit_batch.to_le_bytes());
        self.strobe(REG_BATCH_THRESHOLD, payload)
    }

    pub(crate) fn stop_session(&self) -> Result<()> {
        self.strobe(REG_SESSION_STOP, [0; STROBE_LEN])
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Transport that records operations and can be told to short-transfer.
    struct RecordingTransport {
        log: Mutex<Vec<(u64, usize)>>,
        short_writes: bool,
    }

    impl RecordingTransport {
        fn new(short_writes: bool) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                short_writes,
            }
        }
    }

    impl Transport for RecordingTransport {
        fn write(&self, addr: u64, buf: &[u8]) -> io::Result<usize> {
            self.log.lock().unwrap().push((addr, buf.len()));
            if self.short_writes {
                Ok(buf.len() / 2)
            } else {
                Ok(buf.len())
            }
        }

        fn read(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
            self.log.lock().unwrap().push((addr, buf.len()));
            Ok(buf.len())
        }
    }

    #[test]
    fn short_write_is_a_fault() {
        let transport = Arc::new(RecordingTransport::new(true));
        let dev = DeviceHandle::new(transport);
        let err = dev.write_all(0x0, &[0u8; 8]).unwrap_err();
        assert!(matches!(
            err,
            EngineError::TransportFault {
                addr: 0,
                requested: 8,
                actual: 4,
            }
        ));
    }

    #[test]
    fn strobes_hit_the_documented_registers() {
        let transport = Arc::new(RecordingTransport::new(false));
        let dev = DeviceHandle::new(transport.clone());

        dev.init_session().unwrap();
        dev.set_poll_read_mode().unwrap();
        dev.set_batch_threshold(3).unwrap();
        dev.stop_session().unwrap();

        let log = transport.log.lock().unwrap();
        let addrs: Vec<u64> = log.iter().map(|&(a, _)| a).collect();
        assert_eq!(
            addrs,
            vec![
                REG_SESSION_INIT,
                REG_POLL_READ_MODE,
                REG_BATCH_THRESHOLD,
                REG_SESSION_STOP
            ]
        );
        assert!(log.iter().all(|&(_, len)| len == STROBE_LEN));
    }
}
