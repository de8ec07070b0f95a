// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Rolling flat-field calibration and displayable-frame production (C6).
//!
//! Owned exclusively by the frame-pipeline worker (W2); never touched by
//! the USB event pump. Maintains a per-pixel float32 reference image, a
//! scalar brightness offset, and a bounded rolling buffer of recent raw
//! pixel planes used for periodic recalibration.

use std::collections::VecDeque;

use crate::error::CalibrationError;
use crate::PIXEL_COUNT;

/// Number of frames consumed during initial calibration (§4.6).
pub const INITIAL_CALIBRATION_FRAMES: usize = 50;
/// Default depth of the rolling buffer of recent raw pixel planes (§3).
pub const DEFAULT_ROLLING_DEPTH: usize = 300;
/// Minimum frames in the rolling buffer before a recalibration blend runs.
pub const RECALIBRATION_SAMPLE: usize = 50;

const OFFSET_MIN: f32 = 50.0;
const OFFSET_MAX: f32 = 150.0;
const OFFSET_DEFAULT: f32 = 70.0;
const BLEND_REFERENCE_WEIGHT: f32 = 0.9;
const BLEND_NEW_MEAN_WEIGHT: f32 = 0.1;
const BRIGHTNESS_DAMPING: f32 = 0.5;
const BRIGHTNESS_TARGET: f32 = 128.0;

/// Run-time knobs for [`CalibrationEngine::from_frames_with_options`],
/// distinct from the compile-time defaults above — lets `RunConfig`
/// override the initial-calibration sample size and the brightness
/// offset's clip bounds without touching the fixed sensor protocol.
#[derive(Debug, Clone, Copy)]
pub struct CalibrationOptions {
    pub initial_calibration_frames: usize,
    pub rolling_depth: usize,
    pub offset_min: f32,
    pub offset_max: f32,
}

impl Default for CalibrationOptions {
    fn default() -> Self {
        Self {
            initial_calibration_frames: INITIAL_CALIBRATION_FRAMES,
            rolling_depth: DEFAULT_ROLLING_DEPTH,
            offset_min: OFFSET_MIN,
            offset_max: OFFSET_MAX,
        }
    }
}

#[derive(Debug)]
pub struct CalibrationEngine {
    reference: Vec<f32>,
    offset: f32,
    offset_min: f32,
    offset_max: f32,
    rolling_buffer: VecDeque<Vec<u16>>,
    rolling_depth: usize,
}

impl CalibrationEngine {
    /// Run initial calibration over raw pixel planes pulled from `frames`
    /// using the default [`CalibrationOptions`] except for `rolling_depth`,
    /// which the original call sites pass explicitly.
    pub fn from_frames<I>(frames: I, rolling_depth: usize) -> Result<Self, CalibrationError>
    where
        I: IntoIterator<Item = Option<Vec<u16>>>,
    {
        Self::from_frames_with_options(frames, CalibrationOptions { rolling_depth, ..Default::default() })
    }

    /// As [`CalibrationEngine::from_frames`], with every knob overridable
    /// via `options` (§4.10's `RunConfig`). Fatal per §7 if fewer than
    /// `options.initial_calibration_frames` valid frames are produced
    /// before `frames` is exhausted.
    pub fn from_frames_with_options<I>(
        frames: I,
        options: CalibrationOptions,
    ) -> Result<Self, CalibrationError>
    where
        I: IntoIterator<Item = Option<Vec<u16>>>,
    {
        let mut sum = vec![0.0f64; PIXEL_COUNT];
        let mut count = 0usize;

        for frame in frames {
            let Some(pixels) = frame else { continue };
            debug_assert_eq!(pixels.len(), PIXEL_COUNT);
            for (acc, &p) in sum.iter_mut().zip(pixels.iter()) {
                *acc += f64::from(p);
            }
            count += 1;
            if count == options.initial_calibration_frames {
                break;
            }
        }

        if count < options.initial_calibration_frames {
            return Err(CalibrationError::Underflow {
                got: count,
                required: options.initial_calibration_frames,
            });
        }

        let reference = sum.iter().map(|&s| (s / count as f64) as f32).collect();

        Ok(Self {
            reference,
            offset: OFFSET_DEFAULT.clamp(options.offset_min, options.offset_max),
            offset_min: options.offset_min,
            offset_max: options.offset_max,
            rolling_buffer: VecDeque::with_capacity(options.rolling_depth),
            rolling_depth: options.rolling_depth,
        })
    }

    pub fn offset(&self) -> f32 {
        self.offset
    }

    pub fn reference(&self) -> &[f32] {
        &self.reference
    }

    /// Push a raw pixel plane into the rolling buffer, evicting the oldest
    /// entry once `rolling_depth` is exceeded.
    pub fn push_raw(&mut self, pixels: Vec<u16>) {
        debug_assert_eq!(pixels.len(), PIXEL_COUNT);
        if self.rolling_buffer.len() == self.rolling_depth {
            self.rolling_buffer.pop_front();
        }
        self.rolling_buffer.push_back(pixels);
    }

    /// Per-frame processing (§4.6 step 1–3): flat-field correct, clip, and
    /// cast to an 8-bit displayable frame.
    pub fn process(&self, pixels: &[u16]) -> Vec<u8> {
        debug_assert_eq!(pixels.len(), PIXEL_COUNT);
        pixels
            .iter()
            .zip(self.reference.iter())
            .map(|(&p, &r)| {
                let f = (f32::from(p) - r) + self.offset;
                f.clamp(0.0, 255.0) as u8
            })
            .collect()
    }

    /// Blend the reference toward the mean of the most recent
    /// [`RECALIBRATION_SAMPLE`] rolling-buffer entries, then run the
    /// brightness auto-adjust. No-op if the rolling buffer is too shallow.
    pub fn recalibrate(&mut self) {
        if self.rolling_buffer.len() < RECALIBRATION_SAMPLE {
            return;
        }

        let recent: Vec<&Vec<u16>> =
            self.rolling_buffer.iter().rev().take(RECALIBRATION_SAMPLE).collect();
        let mut new_mean = vec![0.0f32; PIXEL_COUNT];
        for pixels in &recent {
            for (acc, &p) in new_mean.iter_mut().zip(pixels.iter()) {
                *acc += f32::from(p);
            }
        }
        let n = recent.len() as f32;
        for m in new_mean.iter_mut() {
            *m /= n;
        }

        for (r, m) in self.reference.iter_mut().zip(new_mean.iter()) {
            *r = BLEND_REFERENCE_WEIGHT * *r + BLEND_NEW_MEAN_WEIGHT * *m;
        }

        // Brightness auto-adjust (§4.6): damp `offset` toward keeping
        // `mean(last_raw − reference)` near `BRIGHTNESS_TARGET`, clipped to
        // `[offset_min, offset_max]`. Inlined rather than a `&mut self`
        // helper: `recent` still borrows `self.rolling_buffer` here, and a
        // `&mut self` call would conflict with that borrow.
        let Some(last_raw) = recent.first() else { return };
        let mean_value: f32 = last_raw
            .iter()
            .zip(self.reference.iter())
            .map(|(&p, &r)| f32::from(p) - r)
            .sum::<f32>()
            / PIXEL_COUNT as f32;

        self.offset = (self.offset + BRIGHTNESS_DAMPING * (BRIGHTNESS_TARGET - mean_value))
            .clamp(self.offset_min, self.offset_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constant_frame(v: u16) -> Vec<u16> {
        vec![v; PIXEL_COUNT]
    }

    #[test]
    fn underflow_is_fatal_below_fifty_valid_frames() {
        let frames = (0..49).map(|_| Some(constant_frame(100)));
        let err = CalibrationEngine::from_frames(frames, DEFAULT_ROLLING_DEPTH).unwrap_err();
        assert_eq!(err, CalibrationError::Underflow { got: 49, required: 50 });
    }

    #[test]
    fn skipped_frames_do_not_count_toward_calibration() {
        let frames = (0..200).map(|i| if i % 2 == 0 { Some(constant_frame(100)) } else { None });
        let engine = CalibrationEngine::from_frames(frames, DEFAULT_ROLLING_DEPTH).unwrap();
        assert_eq!(engine.reference()[0], 100.0);
    }

    #[test]
    fn calibration_idempotence() {
        let frames = (0..INITIAL_CALIBRATION_FRAMES).map(|_| Some(constant_frame(100)));
        let engine = CalibrationEngine::from_frames(frames, DEFAULT_ROLLING_DEPTH).unwrap();

        let processed = engine.process(&constant_frame(100));
        let expected = engine.offset().clamp(0.0, 255.0) as u8;
        assert!(processed.iter().all(|&p| p == expected));
    }

    #[test]
    fn blend_convergence_after_100_blends() {
        let frames = (0..INITIAL_CALIBRATION_FRAMES).map(|_| Some(constant_frame(0)));
        let mut engine = CalibrationEngine::from_frames(frames, DEFAULT_ROLLING_DEPTH).unwrap();
        let reference0 = engine.reference()[0];
        let target = 200.0f32;

        for _ in 0..100 {
            for _ in 0..RECALIBRATION_SAMPLE {
                engine.push_raw(constant_frame(target as u16));
            }
            engine.recalibrate();
        }

        let drift = (engine.reference()[0] - target).abs();
        let initial_drift = (reference0 - target).abs();
        assert!(drift <= 1e-3 * initial_drift, "drift={drift} initial={initial_drift}");
    }

    #[test]
    fn brightness_offset_stays_within_bounds() {
        let frames = (0..INITIAL_CALIBRATION_FRAMES).map(|_| Some(constant_frame(100)));
        let mut engine = CalibrationEngine::from_frames(frames, DEFAULT_ROLLING_DEPTH).unwrap();

        for v in [0u16, 4095, 2000, 100, 3000] {
            for _ in 0..RECALIBRATION_SAMPLE {
                engine.push_raw(constant_frame(v));
            }
            for _ in 0..20 {
                engine.recalibrate();
                assert!(engine.offset() >= 50.0 && engine.offset() <= 150.0);
            }
        }
    }

    #[test]
    fn rolling_buffer_evicts_oldest_first() {
        let frames = (0..INITIAL_CALIBRATION_FRAMES).map(|_| Some(constant_frame(0)));
        let mut engine = CalibrationEngine::from_frames(frames, 3).unwrap();
        engine.push_raw(constant_frame(1));
        engine.push_raw(constant_frame(2));
        engine.push_raw(constant_frame(3));
        engine.push_raw(constant_frame(4));
        assert_eq!(engine.rolling_buffer.len(), 3);
        assert_eq!(engine.rolling_buffer.front().unwrap()[0], 2);
    }
}
