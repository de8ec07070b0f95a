// Licensed under the Apache License, Version 2.0 or the MIT License.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Minimal runnable frontend for the acquisition core. Opens the sensor,
//! runs the application loop, and writes each processed frame's mean
//! pixel value to stdout. The display, annotation, dataset-writer, and
//! encoder collaborators named in §1 are out of scope; this binary exists
//! to exercise the core end to end, not to replace them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use thermacq::run_config::RunConfig;
use thermacq::session::{FrameSink, Session};
use thermacq::{ThermError, FRAME_HEIGHT, FRAME_WIDTH};

#[derive(Parser, Debug)]
#[command(name = "thermacq", about = "Thermal sensor acquisition core")]
struct Cli {
    /// Override the sensor's USB vendor ID (hex, e.g. 0x1772).
    #[arg(long, value_parser = parse_hex_u16)]
    vid: Option<u16>,

    /// Override the sensor's USB product ID (hex, e.g. 0x0002).
    #[arg(long, value_parser = parse_hex_u16)]
    pid: Option<u16>,

    /// Number of frames consumed during initial calibration.
    #[arg(long, default_value_t = thermacq::calibration::INITIAL_CALIBRATION_FRAMES)]
    initial_calibration_frames: usize,

    /// Depth of the rolling buffer of recent raw pixel planes.
    #[arg(long, default_value_t = thermacq::calibration::DEFAULT_ROLLING_DEPTH)]
    rolling_depth: usize,

    /// Enable periodic rolling recalibration (disabled by default).
    #[arg(long)]
    recalibrate: bool,

    /// Invoke the annotation collaborator every Nth frame. Unset disables
    /// annotation.
    #[arg(long)]
    annotate_every: Option<u32>,
}

fn parse_hex_u16(s: &str) -> Result<u16, std::num::ParseIntError> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16)
}

struct StdoutSink;

impl FrameSink for StdoutSink {
    fn accept(&mut self, processed: &[u8], frame_number: u16) {
        let sum: u64 = processed.iter().map(|&p| u64::from(p)).sum();
        let mean = sum as f64 / processed.len() as f64;
        println!("frame {frame_number}: {FRAME_WIDTH}x{FRAME_HEIGHT} mean={mean:.2}");
    }
}

fn main() -> Result<(), ThermError> {
    env_logger::init();
    let cli = Cli::parse();

    let defaults = RunConfig::default();
    let run_config = RunConfig {
        device_vid: cli.vid.unwrap_or(defaults.device_vid),
        device_pid: cli.pid.unwrap_or(defaults.device_pid),
        initial_calibration_frames: cli.initial_calibration_frames,
        rolling_depth: cli.rolling_depth,
        recalibration_enabled: cli.recalibrate,
        annotate_every_n: cli.annotate_every,
        ..defaults
    };

    info!("opening sensor session");
    let mut session = Session::open(run_config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let stop_handle = session.stop_handle();
    let shutdown_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        shutdown_flag.store(true, Ordering::Release);
        stop_handle.request_stop();
    })
    .expect("failed to install Ctrl-C handler");

    let mut sink = StdoutSink;
    session.run(&mut sink, None);

    if shutdown.load(Ordering::Acquire) {
        info!("shutdown requested, session stopped");
    } else {
        error!("session loop exited unexpectedly (device disconnected?)");
    }

    session.stop();
    Ok(())
}
