//! Library surface for `guide-daemon`, split out from the binary the way
//! `strand-cam` splits `src/strand-cam.rs` (the library) from its
//! `src/bin/*.rs` wrappers: the binary is a thin `fn main` over `run()`,
//! and the modules are reachable from integration tests under `tests/`.

pub mod camera;
pub mod camera_codec;
pub mod centroid;
pub mod command_server;
pub mod config;
pub mod counters;
pub mod dispatch;
pub mod error;
pub mod frame_loop;
pub mod geometry;
pub mod isu;
pub mod logging;
pub mod output;
pub mod state;

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use camera::SimulatedFrameGrabber;
use camera_codec::{read_manufacturing_block, SerialTransport};
use command_server::CommandServer;
use config::{Cli, IsuCapabilityArg};
use frame_loop::FrameLoop;
use isu::{IsuDriver, NoIsu};

/// Entry point shared by every `[[bin]]` target.
pub fn run() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    logging::init();

    let cli = Cli::parse();
    tracing::info!(?cli, "starting guide-daemon");

    let guide_config = config::load_guide_config(&cli.config)
        .with_context(|| format!("loading guide configuration from {}", cli.config.display()))?;

    let mut camera_serial = open_camera_serial(&cli.serial_device)?;
    let cal = read_manufacturing_block(camera_serial.as_mut())
        .context("reading camera manufacturing calibration block")?;

    // The vendor frame-grabber C API is an external collaborator
    // (spec.md section 1); this build always links the software star
    // simulator described in spec.md section 9 as a deployment variant.
    let grabber = Box::new(SimulatedFrameGrabber::new());

    let isu: Box<dyn IsuDriver> = match cli.isu {
        IsuCapabilityArg::None => Box::new(NoIsu),
        IsuCapabilityArg::Real => {
            tracing::warn!(
                "ISU capability `real` requested but no vendor ISU driver is linked into this \
                 build; falling back to the no-op driver. Link a vendor implementation of \
                 isu::IsuDriver to enable hardware motion."
            );
            Box::new(NoIsu)
        }
    };

    let server = CommandServer::bind(cli.port)
        .with_context(|| format!("binding command socket on port {}", cli.port))?;

    let output = open_output(&cli.output)
        .with_context(|| format!("opening image output destination {}", cli.output))?;

    let mut loop_ = FrameLoop::new(guide_config, camera_serial, cal, grabber, isu, server, output);

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::Relaxed);
    })
    .context("installing Ctrl-C handler")?;

    loop_.run(&shutdown).context("frame loop terminated")?;

    let counters = loop_.counters();
    tracing::info!(
        frames_acquired = counters.frames_acquired,
        camera_timeouts = counters.camera_timeouts,
        commands_accepted = counters.commands_accepted,
        commands_rejected = counters.commands_rejected,
        "guide-daemon shutting down"
    );

    Ok(())
}

fn open_camera_serial(device: &str) -> anyhow::Result<Box<dyn SerialTransport>> {
    let port = serialport::new(device, 115_200)
        .timeout(Duration::from_secs(6))
        .open()
        .with_context(|| format!("opening camera serial device {device}"))?;
    Ok(Box::new(port))
}

/// The image output stream (spec.md section 6): stdout by default, or a
/// file if the operator names one. Opened once and held open for the
/// life of the process, since every acquired frame is one more record
/// appended to the same continuous byte stream.
fn open_output(dest: &str) -> anyhow::Result<Box<dyn Write + Send>> {
    if dest == "-" {
        Ok(Box::new(std::io::stdout()))
    } else {
        let file = std::fs::File::create(dest)
            .with_context(|| format!("creating output file {dest}"))?;
        Ok(Box::new(file))
    }
}
