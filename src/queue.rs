// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Bounded multi-producer/single-consumer byte queue (C2).
//!
//! Producers are the transfer engine's completion callbacks; the sole
//! consumer is the frame resynchronizer. `enqueue` never blocks: once the
//! queue is at capacity the newest chunk is dropped and a warning is
//! logged (§7, `QueueOverflow`). `read` blocks the consumer until `n` bytes
//! are available or the queue is closed, in which case it returns whatever
//! it has.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use log::warn;

/// Default bound on the number of in-flight chunks the queue will hold,
/// matching the transfer engine's pipeline depth (`transfer::NUM_TRANSFERS`).
pub const DEFAULT_CAPACITY: usize = 14;

pub struct ByteQueue {
    chunks: Mutex<VecDeque<Vec<u8>>>,
    not_empty: Condvar,
    capacity: usize,
    closed: AtomicBool,
}

impl ByteQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueue a chunk produced by a completed incoming transfer. Drops the
    /// chunk and logs a warning if the queue is already at capacity.
    pub fn enqueue(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }
        let mut guard = self.chunks.lock().unwrap();
        if guard.len() >= self.capacity {
            warn!(
                "byte queue at capacity ({} chunks); dropping {} bytes",
                self.capacity,
                chunk.len()
            );
            return;
        }
        guard.push_back(chunk);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Read exactly `n` bytes, concatenating and slicing chunks as needed,
    /// holding back any tail for the next call. Blocks until `n` bytes are
    /// available, unless the queue is closed, in which case it returns
    /// whatever is currently buffered (which may be fewer than `n` bytes,
    /// including zero).
    pub fn read(&self, n: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(n);
        let mut guard = self.chunks.lock().unwrap();
        loop {
            while out.len() < n {
                let Some(front) = guard.front_mut() else { break };
                let need = n - out.len();
                if front.len() <= need {
                    out.extend_from_slice(front);
                    guard.pop_front();
                } else {
                    out.extend_from_slice(&front[..need]);
                    front.drain(..need);
                }
            }
            if out.len() >= n || self.closed.load(Ordering::Acquire) {
                return out;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Transition the queue to closed: outstanding and future `read` calls
    /// return immediately with whatever is buffered instead of blocking.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn read_concatenates_and_holds_back_tail() {
        let q = ByteQueue::new(4);
        q.enqueue(vec![1, 2, 3]);
        q.enqueue(vec![4, 5]);
        assert_eq!(q.read(4), vec![1, 2, 3, 4]);
        assert_eq!(q.read(1), vec![5]);
    }

    #[test]
    fn overflow_drops_newest_chunk() {
        let q = ByteQueue::new(2);
        q.enqueue(vec![1]);
        q.enqueue(vec![2]);
        q.enqueue(vec![3]); // dropped
        assert_eq!(q.read(2), vec![1, 2]);
    }

    #[test]
    fn overflow_never_exceeds_declared_capacity() {
        let q = ByteQueue::new(4);
        for i in 0..40u8 {
            q.enqueue(vec![i]);
        }
        let guard = q.chunks.lock().unwrap();
        assert!(guard.len() <= 4);
    }

    #[test]
    fn close_unblocks_reader_with_partial_data() {
        let q = Arc::new(ByteQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.read(100));
        thread::sleep(Duration::from_millis(20));
        q.enqueue(vec![1, 2, 3]);
        q.close();
        let got = handle.join().unwrap();
        assert_eq!(got, vec![1, 2, 3]);
    }

    #[test]
    fn blocking_reader_wakes_on_enqueue() {
        let q = Arc::new(ByteQueue::new(4));
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.read(3));
        thread::sleep(Duration::from_millis(20));
        q.enqueue(vec![9, 9, 9]);
        assert_eq!(handle.join().unwrap(), vec![9, 9, 9]);
    }
}
