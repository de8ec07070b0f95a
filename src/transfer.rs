// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! USB transfer engine (C3).
//!
//! The source protocol keeps `NUM_TRANSFERS` incoming bulk transfers
//! continuously armed via the USB library's raw async callback/resubmit
//! primitive, so the device always has a buffer to fill. rusb's safe API
//! exposes only synchronous, blocking bulk transfers — it does not expose
//! libusb's raw transfer submission. A single dedicated reader thread
//! performing back-to-back blocking reads is the synchronous equivalent:
//! it keeps exactly one read outstanding at all times (rather than
//! `NUM_TRANSFERS` concurrently), which preserves the strict byte-FIFO
//! ordering invariant (§5) and is simpler than fanning reads across a pool
//! of threads that would need to reorder completions before enqueuing.
//! `NUM_TRANSFERS` survives as the sizing constant for the byte queue's
//! bounded capacity, so the queue can still absorb a full pipeline's worth
//! of buffered chunks if the consumer falls behind.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use rusb::{Context, DeviceHandle};

use crate::device::{ENDPOINT_IN, ENDPOINT_OUT};
use crate::error::TransferError;
use crate::queue::ByteQueue;

/// Size of each incoming bulk-read buffer.
pub const TRANSFER_BUFFER_LEN: usize = 16_384;
/// B = ⌈221 688 / 16 384⌉, the source's in-flight transfer count; repurposed
/// here to size the byte queue (§4.3).
pub const NUM_TRANSFERS: usize = 14;

/// No response is expected on the configuration write and the device does
/// not impose a deadline; a long fixed bound stands in for "no timeout" so
/// a wedged write cannot hang the caller forever.
const BULK_OUT_TIMEOUT: Duration = Duration::from_secs(5);
/// Incoming reads block indefinitely in the source; rusb requires a
/// concrete timeout, so the reader retries transparently on a timeout
/// rather than treating it as a transfer failure.
const BULK_IN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Inactive = 0,
    Running = 1,
    Canceling = 2,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => SessionState::Running,
            2 => SessionState::Canceling,
            _ => SessionState::Inactive,
        }
    }
}

/// Owns the reader thread and the shared session-state flag.
pub struct TransferEngine {
    state: Arc<AtomicU8>,
    reader: Option<JoinHandle<()>>,
}

impl TransferEngine {
    /// Submit the outgoing configuration record, then spawn the dedicated
    /// incoming-transfer reader thread (W1). Returns once the
    /// configuration write has completed and the reader is running.
    pub fn start(
        handle: Arc<DeviceHandle<Context>>,
        config_record: [u8; crate::config::CONFIG_RECORD_LEN],
        queue: Arc<ByteQueue>,
    ) -> Result<Self, TransferError> {
        handle.write_bulk(ENDPOINT_OUT, &config_record, BULK_OUT_TIMEOUT)?;

        let state = Arc::new(AtomicU8::new(SessionState::Running as u8));
        let reader_state = Arc::clone(&state);
        let reader = std::thread::spawn(move || run_reader(handle, queue, reader_state));

        Ok(Self { state, reader: Some(reader) })
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transition Running→Canceling, join the reader thread once its
    /// current blocking read settles, then transition to Inactive.
    /// Idempotent (§4.3): calling this more than once, or on an engine
    /// that never started, is a no-op.
    pub fn stop(&mut self) {
        if self.state.swap(SessionState::Canceling as u8, Ordering::AcqRel)
            == SessionState::Inactive as u8
        {
            self.state.store(SessionState::Inactive as u8, Ordering::Release);
            return;
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.state.store(SessionState::Inactive as u8, Ordering::Release);
    }
}

impl Drop for TransferEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_reader(handle: Arc<DeviceHandle<Context>>, queue: Arc<ByteQueue>, state: Arc<AtomicU8>) {
    let mut buf = vec![0u8; TRANSFER_BUFFER_LEN];
    while SessionState::from_u8(state.load(Ordering::Acquire)) == SessionState::Running {
        match handle.read_bulk(ENDPOINT_IN, &mut buf, BULK_IN_TIMEOUT) {
            Ok(actual_length) => {
                queue.enqueue(buf[..actual_length].to_vec());
            }
            Err(rusb::Error::Timeout) => continue,
            Err(err) => {
                warn!("incoming bulk transfer failed, not resubmitting: {err}");
                break;
            }
        }
    }
    queue.close();
    debug!("transfer engine reader thread exiting");
}
