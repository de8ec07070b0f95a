// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error kinds for every component, per the propagation policy of §7: an
//! initialization error aborts startup, a steady-state error is logged and
//! the session continues.

use thiserror::Error;

/// Errors opening and configuring the USB device session (C1).
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no USB device matching vid=0x{vid:04x} pid=0x{pid:04x} found")]
    NotFound { vid: u16, pid: u16 },

    #[error("failed to claim interface {interface}: {source}")]
    ClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("control transfer step {step} failed: {source}")]
    ControlTransferFailed {
        step: u8,
        #[source]
        source: rusb::Error,
    },

    #[error(transparent)]
    Usb(#[from] rusb::Error),
}

/// Errors from the transfer engine (C3). Only allocation/submission
/// failures at startup are fatal; per-callback errors are logged in place
/// (see `TransferEngine::run_reader`) and never surface as this type.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("failed to allocate {requested} incoming transfer buffers")]
    AllocFailed { requested: usize },

    #[error("failed to submit outgoing configuration transfer: {0}")]
    SubmitFailed(#[from] rusb::Error),
}

/// Errors from the frame parser (C5). Always logged and the frame skipped;
/// never fatal (§7).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("bad frame length: expected {expected} bytes, got {actual}")]
    BadFrameLength { expected: usize, actual: usize },
}

/// Errors from the calibration engine (C6).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CalibrationError {
    #[error("initial calibration underflow: got {got} valid frames, needed {required}")]
    Underflow { got: usize, required: usize },
}

/// Crate-wide error for `Session::run`. Only the fatal, initialization-time
/// variants of the per-component errors above are reachable here.
#[derive(Debug, Error)]
pub enum ThermError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),
}
