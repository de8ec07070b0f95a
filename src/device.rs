// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! USB device session (C1): find the sensor, claim its interface, and run
//! the fixed descriptor-read control-transfer sequence.

use std::sync::Arc;
use std::time::Duration;

use rusb::{Context, Device, DeviceHandle, UsbContext};

use crate::error::DeviceError;
use crate::{PRODUCT_ID, VENDOR_ID};

/// Interface claimed on the sensor.
pub const INTERFACE: u8 = 0;
/// Bulk-IN endpoint carrying the pixel stream.
pub const ENDPOINT_IN: u8 = 0x81;
/// Bulk-OUT endpoint carrying the configuration record.
pub const ENDPOINT_OUT: u8 = 0x02;

/// Control transfers have no timeout in the source protocol; rusb requires
/// a concrete `Duration` so a generous but finite one is used instead of
/// blocking forever on a wedged device.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// One step of the fixed open-time descriptor-read sequence (§6).
struct ControlStep {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: usize,
}

const IN_DEVICE: u8 = 0x80;
const SET_CONFIGURATION: u8 = 0x09;
const GET_DESCRIPTOR: u8 = 0x06;

const CONTROL_SEQUENCE: [ControlStep; 10] = [
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0100, index: 0x0000, length: 0x12 },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0200, index: 0x0000, length: 0x09 },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0200, index: 0x0000, length: 0x20 },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0300, index: 0x0000, length: 0xff },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0302, index: 0x0409, length: 0xff },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0301, index: 0x0409, length: 0xff },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0303, index: 0x0409, length: 0xff },
    ControlStep { request_type: 0x00, request: SET_CONFIGURATION, value: 0x0001, index: 0x0000, length: 0x00 },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0304, index: 0x0409, length: 0xff },
    ControlStep { request_type: IN_DEVICE, request: GET_DESCRIPTOR, value: 0x0305, index: 0x0409, length: 0xff },
];

/// An opened, interface-claimed USB session for the sensor. Consumed by
/// [`crate::transfer::TransferEngine`], which needs its own owned
/// reference to the handle to run the reader thread — hence `Arc` rather
/// than a plain value.
pub struct DeviceSession {
    handle: Arc<DeviceHandle<Context>>,
    _device: Device<Context>,
}

impl DeviceSession {
    /// Open the first device matching [`VENDOR_ID`]/[`PRODUCT_ID`], claim
    /// [`INTERFACE`], and run the fixed control-transfer sequence. All ten
    /// steps must succeed; any failure is fatal and aborts startup (§4.1).
    pub fn open() -> Result<Self, DeviceError> {
        Self::open_with_ids(VENDOR_ID, PRODUCT_ID)
    }

    /// As [`DeviceSession::open`], but matching an overridden VID/PID
    /// instead of the sensor's factory identity (`RunConfig::device_vid`
    /// / `device_pid`).
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, DeviceError> {
        let context = Context::new()?;
        let (device, handle) = find_device(&context, vid, pid)?;

        handle.claim_interface(INTERFACE).map_err(|source| DeviceError::ClaimFailed {
            interface: INTERFACE,
            source,
        })?;

        let mut session = Self { handle: Arc::new(handle), _device: device };
        session.run_control_sequence()?;
        Ok(session)
    }

    fn run_control_sequence(&mut self) -> Result<(), DeviceError> {
        for (i, step) in CONTROL_SEQUENCE.iter().enumerate() {
            let mut buf = vec![0u8; step.length];
            let result = if step.request_type & IN_DEVICE != 0 {
                self.handle.read_control(
                    step.request_type,
                    step.request,
                    step.value,
                    step.index,
                    &mut buf,
                    CONTROL_TIMEOUT,
                )
            } else {
                self.handle.write_control(
                    step.request_type,
                    step.request,
                    step.value,
                    step.index,
                    &buf,
                    CONTROL_TIMEOUT,
                )
            };
            result.map_err(|source| DeviceError::ControlTransferFailed {
                step: (i + 1) as u8,
                source,
            })?;
        }
        Ok(())
    }

    /// An owned, shareable reference to the handle for the transfer
    /// engine's reader thread (C3).
    pub fn handle(&self) -> Arc<DeviceHandle<Context>> {
        Arc::clone(&self.handle)
    }

    /// Release the claimed interface. Idempotent: rusb tolerates a
    /// redundant release, and drop releases the handle regardless.
    pub fn close(&mut self) {
        let _ = self.handle.release_interface(INTERFACE);
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn find_device(
    context: &Context,
    vid: u16,
    pid: u16,
) -> Result<(Device<Context>, DeviceHandle<Context>), DeviceError> {
    for device in context.devices()?.iter() {
        let Ok(desc) = device.device_descriptor() else { continue };
        if desc.vendor_id() == vid && desc.product_id() == pid {
            let handle = device.open()?;
            return Ok((device, handle));
        }
    }
    Err(DeviceError::NotFound { vid, pid })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_sequence_has_ten_steps_matching_the_spec_table() {
        assert_eq!(CONTROL_SEQUENCE.len(), 10);
        assert_eq!(CONTROL_SEQUENCE[0].length, 0x12);
        assert_eq!(CONTROL_SEQUENCE[7].request, SET_CONFIGURATION);
        assert_eq!(CONTROL_SEQUENCE[7].value, 0x0001);
        assert_eq!(CONTROL_SEQUENCE[9].value, 0x0305);
        assert_eq!(CONTROL_SEQUENCE[9].index, 0x0409);
    }
}
