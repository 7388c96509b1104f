//! The real-time state machine (spec.md section 4.5): IDLE -> VIDEO_ON ->
//! GUIDE_ON, with exactly two suspension points per tick -- the bounded
//! command-socket poll and the blocking `wait_image` call. Everything
//! else is synchronous on this one thread; grounded on spec.md section 9's
//! explicit instruction to model this as a state machine rather than
//! cooperative continuations, which is why this module reaches for plain
//! `std::thread`/`std::sync` rather than the teacher's usual `tokio`.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use guide_types::{ClientRecord, GuideConfig, USER_TIMEOUT_MS};
use parking_lot::Mutex;

use crate::camera::{FrameGrabber, WaitImageOutcome, MULTIBUF_COUNT};
use crate::camera_codec::{self, GainMode, ManufacturingCal, SerialTransport};
use crate::centroid::{self, CentroidResult, FitMode, Subraster32};
use crate::command_server::{CommandServer, PollOutcome};
use crate::counters::Counters;
use crate::dispatch::apply_command;
use crate::error::DeviceError;
use crate::geometry::{self, GeometryInput};
use crate::isu::IsuDriver;
use crate::state::ServerState;

/// Command server poll budget per tick (spec.md section 5).
const SOCKSERV_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Slope rate used for the detached ISU dispatch when no live frame rate
/// has been established yet.
const FALLBACK_SLOPE_RATE_HZ: f64 = 10.0;

pub struct FrameLoop {
    state: ServerState,
    camera_serial: Box<dyn SerialTransport>,
    cal: ManufacturingCal,
    grabber: Box<dyn FrameGrabber>,
    isu: Arc<Mutex<Box<dyn IsuDriver>>>,
    server: CommandServer,
    counters: Counters,
    fixed_fwhm: Option<(f64, f64)>,
    prev_video_on: bool,
    prev_guide_on: bool,
    output: Box<dyn Write + Send>,
}

impl FrameLoop {
    pub fn new(
        config: GuideConfig,
        camera_serial: Box<dyn SerialTransport>,
        cal: ManufacturingCal,
        grabber: Box<dyn FrameGrabber>,
        isu: Box<dyn IsuDriver>,
        server: CommandServer,
        output: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            state: ServerState::new(config),
            camera_serial,
            cal,
            grabber,
            isu: Arc::new(Mutex::new(isu)),
            server,
            counters: Counters::default(),
            fixed_fwhm: None,
            prev_video_on: false,
            prev_guide_on: false,
            output,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    /// Runs until `shutdown` is set or an `ISU` fault makes continuing
    /// unsafe (spec.md section 7: "Fatal device fault" exits non-zero
    /// rather than retrying).
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), DeviceError> {
        while !shutdown.load(Ordering::Relaxed) && !self.state.done {
            self.tick()?;
        }
        Ok(())
    }

    fn tick(&mut self) -> Result<(), DeviceError> {
        self.poll_commands();
        self.handle_rising_edges()?;

        if self.state.video_on {
            self.acquire_one_frame()?;
        }

        self.handle_falling_edges()?;

        self.prev_video_on = self.state.video_on;
        self.prev_guide_on = self.state.guide_on;
        Ok(())
    }

    fn poll_commands(&mut self) {
        let client_records: Vec<ClientRecord> = self.server.client_records();
        let Self { server, state, camera_serial, cal, isu, counters, grabber, .. } = self;
        let outcome = server.poll(SOCKSERV_POLL_INTERVAL, |cmd| {
            let reply =
                apply_command(cmd, state, camera_serial.as_mut(), cal, isu, &client_records, grabber.as_mut());
            match reply {
                guide_types::CommandReply::Ok { .. } => counters.commands_accepted += 1,
                guide_types::CommandReply::Err { .. } => counters.commands_rejected += 1,
            }
            reply
        });
        if let PollOutcome::Shutdown = outcome {
            self.state.done = true;
        }
    }

    fn handle_rising_edges(&mut self) -> Result<(), DeviceError> {
        if self.state.video_on && !self.prev_video_on {
            self.grabber.open()?;

            let width = self.grabber.sensor_width()?;
            let height = self.grabber.sensor_height()?;
            if width <= 1 || height <= 1 {
                return Err(DeviceError::CameraOpen(format!(
                    "sensor reports degenerate size {width}x{height}"
                )));
            }

            self.grabber.allocate_multibuf(MULTIBUF_COUNT)?;
            self.grabber.set_blocking_timeout(Duration::from_millis(USER_TIMEOUT_MS as u64))?;

            self.bring_up_camera_registers();
        }

        if self.state.guide_on && !self.prev_guide_on {
            self.state.sync_crop_to_guide_mode();
            self.grabber.set_roi(
                self.state.win_x0,
                self.state.win_y0,
                self.state.image_width,
                self.state.image_height,
            )?;
            self.grabber.enable_roi(true)?;
            self.fixed_fwhm = None;
            self.state.first_done_flag = false;
        }
        Ok(())
    }

    /// Sensor conditioning run once per `video_on` rising edge: status
    /// check, NUC off, auto-level off, TEC enable, gain mode (spec.md
    /// section 1's in-scope camera-parameter list). Unlike multibuf/
    /// timeout above, these are conditioning rather than correctness-
    /// critical for the acquisition path, so a failure is logged and does
    /// not hold `video_on` back.
    fn bring_up_camera_registers(&mut self) {
        let dev = self.camera_serial.as_mut();

        match camera_codec::check_status(dev) {
            Ok(true) => {}
            Ok(false) => tracing::warn!("camera status check returned an unexpected reply"),
            Err(e) => tracing::warn!(error = %e, "camera status check failed"),
        }
        if let Err(e) = camera_codec::set_nuc_off(dev) {
            tracing::warn!(error = %e, "failed to disable NUC");
        }
        if let Err(e) = camera_codec::set_auto_level_off(dev) {
            tracing::warn!(error = %e, "failed to disable auto-level");
        }
        if let Err(e) = camera_codec::enable_tec(dev) {
            tracing::warn!(error = %e, "failed to enable TEC");
        }
        match camera_codec::set_gain_mode(dev, GainMode::High) {
            Ok(()) => match camera_codec::get_gain_mode(dev) {
                Ok(GainMode::High) => {}
                Ok(other) => tracing::warn!(?other, "gain mode readback did not confirm requested mode"),
                Err(e) => tracing::warn!(error = %e, "gain mode readback failed"),
            },
            Err(e) => tracing::warn!(error = %e, "failed to set gain mode"),
        }
        match camera_codec::set_digital_gain(dev, 1.0) {
            Ok(()) => {
                if let Err(e) = camera_codec::get_digital_gain(dev) {
                    tracing::warn!(error = %e, "digital gain readback failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to set digital gain"),
        }
    }

    fn handle_falling_edges(&mut self) -> Result<(), DeviceError> {
        if !self.state.guide_on && self.prev_guide_on {
            self.grabber.enable_roi(false)?;
            self.state.sync_crop_to_guide_mode();
            self.state.first_done_flag = false;
            self.fixed_fwhm = None;
        }
        Ok(())
    }

    fn acquire_one_frame(&mut self) -> Result<(), DeviceError> {
        self.grabber.start_image()?;
        match self.grabber.wait_image()? {
            WaitImageOutcome::TimedOut => {
                self.counters.camera_timeouts += 1;
                Ok(())
            }
            WaitImageOutcome::Ready(frame) => {
                self.counters.frames_acquired += 1;
                let centroid = if self.state.guide_on {
                    Some(self.process_guide_frame(&frame.data)?)
                } else {
                    None
                };
                self.emit_frame(&frame, centroid)
            }
        }
    }

    /// Runs the centroid + geometry + ISU-dispatch pipeline for one
    /// guide-mode frame. The first frame of a guide session runs the full
    /// FWHM fit and checks for an ISU fault before anything else is
    /// allowed to proceed (spec.md section 4.5).
    fn process_guide_frame(&mut self, data: &[u16]) -> Result<CentroidResult, DeviceError> {
        let sub = Subraster32::from_rows(data.to_vec());

        let mode = if !self.state.first_done_flag {
            FitMode::Fwhm
        } else {
            let (wx, wy) = self.fixed_fwhm.unwrap_or((2.5, 2.5));
            FitMode::CentroidOnly { width_x: wx, width_y: wy }
        };

        let result = centroid::refine(&sub, mode);

        if !self.state.first_done_flag {
            self.fixed_fwhm = Some((result.fwhm_x, result.fwhm_y));
            self.state.fwhm_x = result.fwhm_x;
            self.state.fwhm_y = result.fwhm_y;

            let fault = self.isu.lock().check_fault();
            if fault.any() {
                return Err(DeviceError::IsuFault { axis: if fault.x_fault { "x" } else { "y" } });
            }
            self.state.first_done_flag = true;
        }

        let geom_input = GeometryInput {
            guide_x0: self.state.guide_x0,
            guide_y0: self.state.guide_y0,
            null_x: self.state.null_x,
            null_y: self.state.null_y,
        };

        let out = {
            let guard = self.isu.lock();
            geometry::transform(geom_input, result.x, result.y, &**guard)
        };

        self.state.guide_xoff = out.guide_xoff_arcsec;
        self.state.guide_yoff = out.guide_yoff_arcsec;
        self.state.isu_mrad_x_delta_setup = out.delta_mrad_x;
        self.state.isu_mrad_y_delta_setup = out.delta_mrad_y;
        self.state.isu_mrad_x_status = out.last_mrad_x;
        self.state.isu_mrad_y_status = out.last_mrad_y;

        if self.state.isu_on {
            let worker = Arc::clone(&self.isu);
            let rate_hz = if self.state.frame_rate_hz > 0.0 {
                self.state.frame_rate_hz
            } else {
                FALLBACK_SLOPE_RATE_HZ
            };
            let (target_x, target_y) = (out.target_mrad_x, out.target_mrad_y);
            let spawned = std::thread::Builder::new().name("isu-dispatch".into()).spawn(move || {
                if let Err(e) = worker.lock().set_analog_slope(rate_hz, target_x, target_y) {
                    tracing::warn!(error = %e, "ISU dispatch failed");
                }
            });
            if let Err(e) = spawned {
                tracing::warn!(error = %e, "failed to spawn ISU dispatch worker");
            }
        }

        Ok(result)
    }

    /// Streams every acquired frame to the configured output destination
    /// (spec.md section 6: "Standard output receives a sequence of
    /// self-contained records"), independent of `exp_on`/`filename` --
    /// those only control which header cards this record carries, not
    /// whether it gets written at all.
    fn emit_frame(&mut self, frame: &crate::camera::Frame, centroid: Option<CentroidResult>) -> Result<(), DeviceError> {
        let seqnum = self.state.advance_save_sequence();
        let bytes = crate::output::encode_frame(&self.state, frame, centroid.as_ref(), seqnum);
        self.output.write_all(&bytes).map_err(|e| DeviceError::OutputWrite(e.to_string()))?;
        self.output.flush().map_err(|e| DeviceError::OutputWrite(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SimulatedFrameGrabber;
    use crate::camera_codec::ManufacturingCal;
    use crate::isu::NoIsu;

    struct NullTransport;
    impl SerialTransport for NullTransport {
        fn write_all(&mut self, _buf: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        fn read_until_wait(&mut self, _wait_char: u8, _out: &mut Vec<u8>) -> std::io::Result<usize> {
            Ok(0)
        }
    }

    /// An in-memory sink that records every byte written to the image
    /// output stream, so tests can assert on it without touching the
    /// filesystem.
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> Vec<u8> {
            self.0.lock().clone()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn test_loop(grabber: SimulatedFrameGrabber) -> (FrameLoop, SharedBuf) {
        let buf = SharedBuf::default();
        let fl = FrameLoop::new(
            GuideConfig { guide_x0: 16, guide_y0: 16, null_x: 16.0, null_y: 16.0 },
            Box::new(NullTransport),
            ManufacturingCal { adc_at_0c: 0, adc_at_40c: 1, dac_at_0c: 0, dac_at_40c: 1 },
            Box::new(grabber),
            Box::new(NoIsu),
            CommandServer::bind(0).unwrap(),
            Box::new(buf.clone()),
        );
        (fl, buf)
    }

    #[test]
    fn idle_tick_acquires_nothing() {
        let (mut fl, buf) = test_loop(SimulatedFrameGrabber::new());
        fl.tick().unwrap();
        assert_eq!(fl.counters().frames_acquired, 0);
        assert!(buf.contents().is_empty());
    }

    #[test]
    fn video_on_acquires_a_frame_per_tick() {
        let (mut fl, buf) = test_loop(SimulatedFrameGrabber::new().with_star(16.0, 16.0, 2.5, 12_000.0));
        fl.state.video_on = true;
        fl.tick().unwrap();
        assert_eq!(fl.counters().frames_acquired, 1);
        assert!(!buf.contents().is_empty());
    }

    #[test]
    fn guide_session_streams_a_frame_to_the_output_sink() {
        let (mut fl, buf) = test_loop(SimulatedFrameGrabber::new().with_star(16.0, 16.0, 2.5, 12_000.0));
        fl.state.video_on = true;
        fl.state.guide_on = true;

        fl.tick().unwrap();

        assert!(!buf.contents().is_empty());
        assert!(fl.state.first_done_flag);
    }

    #[test]
    fn sensor_size_is_read_and_cached_on_video_on() {
        let (mut fl, _buf) = test_loop(SimulatedFrameGrabber::new());
        fl.state.video_on = true;
        fl.tick().unwrap();
        assert_eq!(fl.grabber.sensor_width().unwrap(), guide_types::FULL_WIDTH);
        assert_eq!(fl.grabber.sensor_height().unwrap(), guide_types::FULL_HEIGHT);
    }

    #[test]
    fn guide_off_disables_roi_and_clears_first_done_flag() {
        let (mut fl, _buf) = test_loop(SimulatedFrameGrabber::new().with_star(16.0, 16.0, 2.5, 12_000.0));
        fl.state.video_on = true;
        fl.state.guide_on = true;
        fl.tick().unwrap();
        assert!(fl.state.first_done_flag);

        fl.state.guide_on = false;
        fl.tick().unwrap();
        assert!(!fl.state.first_done_flag);
    }

    #[test]
    fn save_sequence_stamps_successive_frames_then_resets() {
        let (mut fl, buf) = test_loop(SimulatedFrameGrabber::new());
        fl.state.video_on = true;
        fl.state.frame_save_count = 2;

        fl.tick().unwrap();
        fl.tick().unwrap();

        let written = buf.contents();
        let text = String::from_utf8_lossy(&written);
        assert_eq!(text.matches("SEQNUM").count(), 2);
        assert_eq!(fl.state.frame_save_count, 0);
    }
}
