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

use std::error::Error;
use std::sync::PoisonError;

use thiserror::Error;

/// The error type for Accelbridge operations.
///
/// Contract breaches with no recovery path (double-allocating a live slot, a
/// bare control-read reaching the submission stage, a negative bulk-DMA
/// remainder) are not represented here; those panic, because no caller can
/// meaningfully handle them.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Anyhow error
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// Reading or writing data failed
    #[error("Reading or writing data failed {0:?}")]
    IOError(#[from] std::io::Error),

    /// A task without the valid bit was offered to the pipeline
    #[error("Task submitted without the valid flag set")]
    InvalidTask(),

    /// An attempt to get a lock from a Mutex failed
    #[error("Unable to lock resource")]
    LockAttemptFailed(String),

    /// A session is already running on this engine
    #[error("Session is already active")]
    SessionAlreadyActive(),

    /// The engine has no running session
    #[error("Session is not active")]
    SessionNotActive(),

    /// The transport moved fewer bytes than requested. The device is assumed
    /// wedged; the transfer is not retried.
    #[error("Transport moved {actual} of {requested} bytes at {addr:#x}")]
    TransportFault {
        addr: u64,
        requested: usize,
        actual: usize,
    },
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Error(s.to_string())
    }
}

// Implemented this way rather than passing the error as a source to
// LockAttemptFailed as that would require Box<dyn Error + Send + Sync> which
// is not easy to implement for PoisonError. This is a good enough solution
// and allows us to use the ? operator on lock() and wait() calls.
impl<T> From<PoisonError<T>> for EngineError {
    fn from(e: PoisonError<T>) -> Self {
        let source = match e.source() {
            Some(s) => s.to_string(),
            None => String::new(),
        };
        EngineError::LockAttemptFailed(source)
    }
}

/// Creates an `EngineError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::error::EngineError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
        let __err_msg = std::format!($fmtstr, $($arg)*);
        $crate::error::EngineError::Error(__err_msg)
    }};
}
