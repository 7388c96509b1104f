//! Applies a parsed [`Command`] to the [`ServerState`], the camera codec,
//! and the ISU. Runs on the main thread between frames (spec.md section 9:
//! "the command dispatcher runs only inside the single-threaded poll");
//! the only command that reaches off-thread is `ISU ON` while unhomed,
//! which hands the homing call to a detached worker holding its own lock
//! on the shared ISU handle.

use std::sync::Arc;

use parking_lot::Mutex;

use guide_types::{ClientRecord, Command, CommandReply, StartExpArgs, FULL_HEIGHT, FULL_WIDTH, GUIDE_SIZE, MAX_FRAME_RATE_HZ, MAX_SAVE_COUNT};

use crate::camera::FrameGrabber;
use crate::camera_codec::{self, ManufacturingCal, SerialTransport};
use crate::isu::IsuDriver;
use crate::state::ServerState;

pub fn apply_command(
    cmd: Command,
    state: &mut ServerState,
    camera_serial: &mut dyn SerialTransport,
    cal: &ManufacturingCal,
    isu: &Arc<Mutex<Box<dyn IsuDriver>>>,
    client_records: &[ClientRecord],
    grabber: &mut dyn FrameGrabber,
) -> CommandReply {
    match cmd {
        Command::Disconnect | Command::Shutdown => {
            unreachable!("command_server handles these before dispatch")
        }
        Command::EndExp => {
            state.exp_on = false;
            CommandReply::ok("ENDEXP")
        }
        Command::StartExp(args) => start_exp(state, args),
        Command::FrameRate(value) => frame_rate(state, camera_serial, value),
        Command::ExpTime(value) => exp_time(state, camera_serial, value),
        Command::Tec(value) => tec(state, camera_serial, cal, value),
        Command::Temp => temp(state, camera_serial, cal),
        Command::Roi(value) => roi(state, grabber, value),
        Command::Null(value) => null(state, value),
        Command::Video(on) => video(state, on),
        Command::Guide(on) => guide(state, on),
        Command::Isu(on) => isu_cmd(state, isu, on),
        Command::Save(n, comment) => save(state, n, comment),
        Command::Clients => clients(client_records),
    }
}

fn start_exp(state: &mut ServerState, args: StartExpArgs) -> CommandReply {
    state.exp_on = true;
    state.filename = args.filename;
    state.ra = args.ra.unwrap_or_default();
    state.dec = args.dec.unwrap_or_default();
    state.equinox = args.equinox.unwrap_or(0.0);
    state.objmag = args.objmag.unwrap_or(0.0);
    CommandReply::ok("STARTEXP")
}

fn frame_rate(state: &mut ServerState, dev: &mut dyn SerialTransport, value: Option<f64>) -> CommandReply {
    match value {
        None => match camera_codec::get_frame_rate_hz(dev) {
            Ok(v) => {
                state.frame_rate_hz = v;
                CommandReply::ok_with("FRAMERATE", format!("{v}"))
            }
            Err(e) => CommandReply::err("FRAMERATE", e.to_string()),
        },
        Some(v) => {
            if v <= 0.0 || v > MAX_FRAME_RATE_HZ {
                return CommandReply::err("FRAMERATE", "Frame Rate Specified is Invalid");
            }
            match camera_codec::set_frame_rate_hz(dev, v) {
                Ok(()) => {
                    state.frame_rate_hz = v;
                    CommandReply::ok("FRAMERATE")
                }
                Err(e) => CommandReply::err("FRAMERATE", e.to_string()),
            }
        }
    }
}

fn exp_time(state: &mut ServerState, dev: &mut dyn SerialTransport, value: Option<f64>) -> CommandReply {
    match value {
        None => match camera_codec::get_exposure_time_ms(dev) {
            Ok(v) => {
                state.exposure_time_ms = v;
                CommandReply::ok_with("EXPTIME", format!("{v}"))
            }
            Err(e) => CommandReply::err("EXPTIME", e.to_string()),
        },
        Some(v) => {
            if v <= 0.0 {
                return CommandReply::err("EXPTIME", "Exposure Time Specified is Invalid");
            }
            match camera_codec::set_exposure_time_ms(dev, v) {
                Ok(()) => {
                    state.exposure_time_ms = v;
                    CommandReply::ok("EXPTIME")
                }
                Err(e) => CommandReply::err("EXPTIME", e.to_string()),
            }
        }
    }
}

fn tec(
    state: &mut ServerState,
    dev: &mut dyn SerialTransport,
    cal: &ManufacturingCal,
    value: Option<f64>,
) -> CommandReply {
    match value {
        None => match camera_codec::get_tec_setpoint_c(dev, cal) {
            Ok(v) => {
                state.tec_setpoint_c = v;
                CommandReply::ok_with("TEC", format!("{v}"))
            }
            Err(e) => CommandReply::err("TEC", e.to_string()),
        },
        Some(v) => match camera_codec::set_tec_setpoint_c(dev, cal, v) {
            Ok(()) => {
                state.tec_setpoint_c = v;
                CommandReply::ok("TEC")
            }
            Err(e) => CommandReply::err("TEC", e.to_string()),
        },
    }
}

fn temp(state: &mut ServerState, dev: &mut dyn SerialTransport, cal: &ManufacturingCal) -> CommandReply {
    match camera_codec::read_temperature_c(dev, cal) {
        Ok(v) => {
            state.temp_c = v;
            CommandReply::ok_with("TEMP", format!("{v}"))
        }
        Err(e) => CommandReply::err("TEMP", e.to_string()),
    }
}

/// A live `ROI x y` while guiding must reach the camera immediately
/// (spec.md section 3: "If guide_on then ... the camera ROI equals
/// (guide_x0, guide_y0, 32, 32)"), not just update the recorded state
/// and wait for the next guide_on rising edge.
fn roi(state: &mut ServerState, grabber: &mut dyn FrameGrabber, value: Option<(u32, u32)>) -> CommandReply {
    match value {
        None => CommandReply::ok_with("ROI", format!("{} {}", state.guide_x0, state.guide_y0)),
        Some((x, y)) => {
            if x > FULL_WIDTH - GUIDE_SIZE || y > FULL_HEIGHT - GUIDE_SIZE {
                return CommandReply::err("ROI", "ROI origin out of range");
            }
            state.guide_x0 = x;
            state.guide_y0 = y;
            if state.guide_on {
                state.sync_crop_to_guide_mode();
                if let Err(e) =
                    grabber.set_roi(state.win_x0, state.win_y0, state.image_width, state.image_height)
                {
                    return CommandReply::err("ROI", e.to_string());
                }
            }
            CommandReply::ok("ROI")
        }
    }
}

fn null(state: &mut ServerState, value: Option<(f64, f64)>) -> CommandReply {
    match value {
        None => CommandReply::ok_with("NULL", format!("{} {}", state.null_x, state.null_y)),
        Some((x, y)) => {
            if !(0.0..=FULL_WIDTH as f64).contains(&x) || !(0.0..=FULL_HEIGHT as f64).contains(&y) {
                return CommandReply::err("NULL", "null pixel out of range");
            }
            state.null_x = x;
            state.null_y = y;
            CommandReply::ok("NULL")
        }
    }
}

fn video(state: &mut ServerState, on: bool) -> CommandReply {
    if !on {
        state.guide_on = false;
    }
    state.video_on = on;
    CommandReply::ok(if on { "VIDEO ON" } else { "VIDEO OFF" })
}

fn guide(state: &mut ServerState, on: bool) -> CommandReply {
    if on && !state.video_on {
        return CommandReply::err("GUIDE", "VIDEO must be ON before GUIDE");
    }
    state.guide_on = on;
    CommandReply::ok(if on { "GUIDE ON" } else { "GUIDE OFF" })
}

/// `ISU ON` while unhomed dispatches `home()` to a detached worker holding
/// its own lock on the shared driver and replies immediately; the operator
/// is expected to send `ISU ON` again once homing completes to actually
/// enable the mechanism.
fn isu_cmd(state: &mut ServerState, isu: &Arc<Mutex<Box<dyn IsuDriver>>>, on: bool) -> CommandReply {
    if !on {
        return match isu.lock().stop() {
            Ok(()) => {
                state.isu_on = false;
                CommandReply::ok("ISU OFF")
            }
            Err(e) => CommandReply::err("ISU", e.to_string()),
        };
    }

    let homed = isu.lock().is_homed();
    if !homed {
        let worker = Arc::clone(isu);
        let spawned = std::thread::Builder::new().name("isu-home".into()).spawn(move || {
            if let Err(e) = worker.lock().home() {
                tracing::warn!(error = %e, "ISU homing failed");
            }
        });
        return match spawned {
            Ok(_) => CommandReply::ok_with("ISU", "HOMING"),
            Err(e) => CommandReply::err("ISU", format!("failed to spawn homing worker: {e}")),
        };
    }

    match isu.lock().enable() {
        Ok(()) => {
            state.isu_on = true;
            CommandReply::ok("ISU ON")
        }
        Err(e) => CommandReply::err("ISU", e.to_string()),
    }
}

/// `SAVE 0` cancels any active save sequence rather than being rejected
/// (spec.md section 4.4: "n=0 cancels").
fn save(state: &mut ServerState, n: u32, comment: String) -> CommandReply {
    if n > MAX_SAVE_COUNT {
        return CommandReply::err("SAVE", format!("count {n} out of range"));
    }
    state.frame_save_count = n;
    state.frame_sequence = 0;
    state.fits_comment = comment;
    CommandReply::ok("SAVE")
}

fn clients(records: &[ClientRecord]) -> CommandReply {
    let value = records
        .iter()
        .map(|r| format!("{}@{}", r.hostname, r.connected_at.to_rfc3339()))
        .collect::<Vec<_>>()
        .join(",");
    CommandReply::ok_with("CLIENTS", value)
}
