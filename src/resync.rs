// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Byte-stream-to-frame resynchronizer (C4).
//!
//! Scans a continuous, unframed byte stream for the frame start sentinel,
//! then checks the corresponding end sentinel 221 696 bytes later. A
//! corrupted frame that begins with a start sentinel but lacks the matching
//! end sentinel is silently discarded and resynchronization resumes
//! automatically from the next byte.

use crate::queue::ByteQueue;
use crate::{END_SENTINEL, FRAME_LEN, START_SENTINEL};

/// Stateful framer over one [`ByteQueue`]. Not `Sync`; owned by the single
/// consumer thread (W2).
pub struct FrameResync<'q> {
    queue: &'q ByteQueue,
    carry: Vec<u8>,
}

impl<'q> FrameResync<'q> {
    pub fn new(queue: &'q ByteQueue) -> Self {
        Self { queue, carry: Vec::new() }
    }

    /// Top up `buf` to `target` bytes by pulling exactly the shortfall from
    /// the queue. Returns early, with `buf` shorter than `target`, only if
    /// the queue is closed and starved.
    fn refill(&self, buf: &mut Vec<u8>, target: usize) {
        while buf.len() < target {
            let more = self.queue.read(target - buf.len());
            if more.is_empty() {
                break;
            }
            buf.extend_from_slice(&more);
        }
    }

    /// Attempt to produce one complete, sentinel-delimited frame.
    ///
    /// Returns `Some(frame)` with `frame.len() == FRAME_LEN` on success, or
    /// `None` if no complete frame could be assembled this call (a
    /// `ResyncMiss`, per §7) — the caller should simply call again.
    pub fn read_frame(&mut self) -> Option<Vec<u8>> {
        let mut working = std::mem::take(&mut self.carry);

        self.refill(&mut working, FRAME_LEN);

        let start = working.windows(START_SENTINEL.len()).position(|w| w == START_SENTINEL);
        let Some(start) = start else {
            let tail_start = working.len().saturating_sub(START_SENTINEL.len() - 1);
            self.carry = working[tail_start..].to_vec();
            return None;
        };
        working.drain(..start);

        self.refill(&mut working, FRAME_LEN);
        if working.len() < FRAME_LEN {
            // Stream ended (session stopping) before a full frame arrived.
            self.carry = working;
            return None;
        }

        if working[FRAME_LEN - END_SENTINEL.len()..FRAME_LEN] == END_SENTINEL {
            self.carry.clear();
            Some(working)
        } else {
            working.drain(..START_SENTINEL.len());
            self.carry = working;
            None
        }
    }
}
