// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Application loop (C9): ties the device session, transfer engine, frame
//! resynchronizer, parser, and calibration engine together and dispatches
//! processed frames to external collaborators (W4, the display; and an
//! optional annotator), per §4.8.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{info, warn};

use crate::calibration::CalibrationEngine;
use crate::config::ConfigRecord;
use crate::device::DeviceSession;
use crate::error::ThermError;
use crate::frame::Frame;
use crate::queue::ByteQueue;
use crate::resync::FrameResync;
use crate::run_config::RunConfig;
use crate::transfer::{SessionState, TransferEngine, NUM_TRANSFERS};

/// Receives each processed 8-bit, 384×288 displayable frame (W4).
pub trait FrameSink {
    fn accept(&mut self, processed: &[u8], frame_number: u16);
}

/// Receives a processed frame every Nth frame, per [`RunConfig::annotate_every_n`].
pub trait AnnotationSink {
    fn annotate(&mut self, processed: &[u8], frame_number: u16);
}

/// A running acquisition session: owns the device, the transfer engine,
/// and the calibration state. Not `Sync` — the frame pipeline (W2) is
/// single-threaded by design (§5).
pub struct Session {
    device: DeviceSession,
    engine: TransferEngine,
    queue: Arc<ByteQueue>,
    calibration: CalibrationEngine,
    run_config: RunConfig,
    stop_requested: Arc<AtomicBool>,
    started_at: Instant,
}

impl Session {
    /// Open the device, submit the configuration record, start the
    /// transfer engine, and run initial calibration. Fatal per §7 if any
    /// of the device-open sequence, the transfer submission, or the
    /// calibration warm-up fails.
    pub fn open(run_config: RunConfig) -> Result<Self, ThermError> {
        let device = DeviceSession::open_with_ids(run_config.device_vid, run_config.device_pid)?;

        let queue = Arc::new(ByteQueue::new(NUM_TRANSFERS));
        let config_record = ConfigRecord::default().to_bytes();
        let engine = TransferEngine::start(device.handle(), config_record, Arc::clone(&queue))?;

        info!("transfer engine started, running initial calibration");
        let calibration = run_initial_calibration(&queue, run_config.calibration_options())?;

        Ok(Self {
            device,
            engine,
            queue,
            calibration,
            run_config,
            stop_requested: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        })
    }

    /// A cloneable handle W3 can use to request shutdown from another
    /// thread without borrowing the session itself.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { stop_requested: Arc::clone(&self.stop_requested), queue: Arc::clone(&self.queue) }
    }

    /// Main acquisition loop (§4.8 step 4). Runs until a stop is
    /// requested via [`Session::stop_handle`] or the transfer engine's
    /// queue closes (device disconnected or engine stopped externally).
    pub fn run(&mut self, sink: &mut dyn FrameSink, mut annotate: Option<&mut dyn AnnotationSink>) {
        let queue = Arc::clone(&self.queue);
        let mut resync = FrameResync::new(&queue);
        let mut last_recalibration = Instant::now();

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                break;
            }

            let Some(buf) = resync.read_frame() else {
                if self.queue.is_closed() {
                    break;
                }
                continue;
            };

            let frame = match Frame::parse(&buf) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("dropping frame: {err}");
                    continue;
                }
            };

            let ann: Option<&mut dyn AnnotationSink> = match annotate {
                Some(ref mut a) => Some(&mut **a),
                None => None,
            };
            self.process_frame(&frame, sink, ann);

            if self.run_config.recalibration_enabled {
                let elapsed_since_last = last_recalibration.elapsed();
                if elapsed_since_last >= self.run_config.recalibration_interval(self.started_at.elapsed())
                {
                    self.calibration.recalibrate();
                    last_recalibration = Instant::now();
                }
            }
        }
    }

    fn process_frame(
        &mut self,
        frame: &Frame,
        sink: &mut dyn FrameSink,
        annotate: Option<&mut dyn AnnotationSink>,
    ) {
        self.calibration.push_raw(frame.pixels.clone());
        let processed = self.calibration.process(&frame.pixels);

        sink.accept(&processed, frame.frame_number);

        if let Some(every_n) = self.run_config.annotate_every_n {
            if every_n > 0 && u32::from(frame.frame_number) % every_n == 0 {
                if let Some(annotator) = annotate {
                    annotator.annotate(&processed, frame.frame_number);
                }
            }
        }
    }

    /// Stop the transfer engine, join its worker, and close the device
    /// (§4.8 step 5). Idempotent.
    pub fn stop(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        self.engine.stop();
        self.queue.close();
        self.device.close();
    }

    pub fn state(&self) -> SessionState {
        self.engine.state()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Shareable stop signal for W3 (control/CLI) to request shutdown from a
/// thread other than the one running [`Session::run`]. Closing the queue
/// alongside the flag (§4.2) is what actually unblocks a run loop parked
/// in `resync.read_frame` → `queue.read`; the flag alone is only checked
/// between frames and would leave a stalled stream stuck forever.
#[derive(Clone)]
pub struct StopHandle {
    stop_requested: Arc<AtomicBool>,
    queue: Arc<ByteQueue>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.queue.close();
    }
}

fn run_initial_calibration(
    queue: &ByteQueue,
    options: crate::calibration::CalibrationOptions,
) -> Result<CalibrationEngine, ThermError> {
    let mut resync = FrameResync::new(queue);
    let mut frames = Vec::new();
    while frames.len() < options.initial_calibration_frames {
        match resync.read_frame() {
            Some(buf) => match Frame::parse(&buf) {
                Ok(frame) => frames.push(Some(frame.pixels)),
                Err(_) => frames.push(None),
            },
            None => {
                if queue.is_closed() {
                    break;
                }
            }
        }
    }
    Ok(CalibrationEngine::from_frames_with_options(frames, options)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingSink {
        count: usize,
    }

    impl FrameSink for CountingSink {
        fn accept(&mut self, _processed: &[u8], _frame_number: u16) {
            self.count += 1;
        }
    }

    #[test]
    fn stop_handle_is_observed_by_run_loop_flag() {
        let stop = Arc::new(AtomicBool::new(false));
        let queue = Arc::new(ByteQueue::new(4));
        let handle = StopHandle { stop_requested: Arc::clone(&stop), queue: Arc::clone(&queue) };
        assert!(!stop.load(Ordering::Acquire));
        assert!(!queue.is_closed());
        handle.request_stop();
        assert!(stop.load(Ordering::Acquire));
        assert!(queue.is_closed());
    }

    #[test]
    fn counting_sink_counts_accepted_frames() {
        let mut sink = CountingSink { count: 0 };
        sink.accept(&[0u8; 4], 1);
        sink.accept(&[0u8; 4], 2);
        assert_eq!(sink.count, 2);
    }
}
