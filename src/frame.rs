// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Fixed-layout frame decoder (C5).
//!
//! Pure function from a 221 696-byte buffer (already sentinel-aligned by
//! [`crate::resync`]) to a structured [`Frame`]. Does not re-validate the
//! sentinels and does not reshape the pixel plane — callers reshape on use.

use crate::error::ParseError;
use crate::{FRAME_LEN, PIXEL_COUNT};

/// One decoded sensor frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub sensor_temperature: u16,
    pub frame_number: u16,
    /// Row-major, 384×288, raw sensor counts in wire order.
    pub pixels: Vec<u16>,
}

const PIXEL_PLANE_OFFSET: usize = 60;
const PIXEL_PLANE_LEN: usize = 221_184;

impl Frame {
    /// Decode a frame from its 221 696-byte wire representation.
    ///
    /// Rejects any input whose length is not exactly [`FRAME_LEN`]; does not
    /// check the start/end sentinels, which [`crate::resync::FrameResync`]
    /// has already verified.
    pub fn parse(buf: &[u8]) -> Result<Frame, ParseError> {
        if buf.len() != FRAME_LEN {
            return Err(ParseError::BadFrameLength { expected: FRAME_LEN, actual: buf.len() });
        }

        let id = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        let sensor_temperature = u16::from_le_bytes(buf[26..28].try_into().unwrap());
        let frame_number = u16::from_le_bytes(buf[48..50].try_into().unwrap());

        let plane = &buf[PIXEL_PLANE_OFFSET..PIXEL_PLANE_OFFSET + PIXEL_PLANE_LEN];
        let mut pixels = Vec::with_capacity(PIXEL_COUNT);
        for chunk in plane.chunks_exact(2) {
            pixels.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }
        debug_assert_eq!(pixels.len(), PIXEL_COUNT);

        Ok(Frame { id, sensor_temperature, frame_number, pixels })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{END_SENTINEL, START_SENTINEL};

    fn encode(id: u32, sensor_temperature: u16, frame_number: u16, pixels: &[u16]) -> Vec<u8> {
        let mut buf = vec![0u8; FRAME_LEN];
        buf[0..4].copy_from_slice(&START_SENTINEL);
        buf[6..10].copy_from_slice(&id.to_le_bytes());
        buf[26..28].copy_from_slice(&sensor_temperature.to_le_bytes());
        buf[48..50].copy_from_slice(&frame_number.to_le_bytes());
        for (i, p) in pixels.iter().enumerate() {
            let off = PIXEL_PLANE_OFFSET + i * 2;
            buf[off..off + 2].copy_from_slice(&p.to_le_bytes());
        }
        buf[FRAME_LEN - 4..].copy_from_slice(&END_SENTINEL);
        buf
    }

    #[test]
    fn round_trip_parse_preserves_scalars_and_pixels() {
        let pixels: Vec<u16> = (0..PIXEL_COUNT).map(|i| (i * 7 % 4096) as u16).collect();
        let buf = encode(0xdead_beef, 0x1234, 42, &pixels);

        let frame = Frame::parse(&buf).expect("valid frame parses");
        assert_eq!(frame.id, 0xdead_beef);
        assert_eq!(frame.sensor_temperature, 0x1234);
        assert_eq!(frame.frame_number, 42);
        assert_eq!(frame.pixels, pixels);
    }

    #[test]
    fn rejects_wrong_length() {
        let buf = vec![0u8; FRAME_LEN - 1];
        assert_eq!(
            Frame::parse(&buf),
            Err(ParseError::BadFrameLength { expected: FRAME_LEN, actual: FRAME_LEN - 1 })
        );
    }

    #[test]
    fn does_not_validate_sentinels() {
        let pixels = vec![0u16; PIXEL_COUNT];
        let mut buf = encode(1, 2, 3, &pixels);
        buf[0] = 0x00; // corrupt start sentinel
        buf[FRAME_LEN - 1] = 0x00; // corrupt end sentinel
        assert!(Frame::parse(&buf).is_ok());
    }

    #[test]
    fn pixel_plane_preserves_wire_byte_order() {
        let mut buf = vec![0u8; FRAME_LEN];
        buf[PIXEL_PLANE_OFFSET] = 0x01;
        buf[PIXEL_PLANE_OFFSET + 1] = 0x02;
        let frame = Frame::parse(&buf).unwrap();
        assert_eq!(frame.pixels[0], 0x0201);
    }
}
