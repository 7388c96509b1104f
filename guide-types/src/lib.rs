//! Wire types shared between the command dispatcher and the frame loop.
//!
//! Nothing here performs I/O; it is the pure-data half of the protocol,
//! mirrored after how the teacher splits `ci2-remote-control` /
//! `image-tracker-types` away from the crates that actually drive hardware.

use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Camera sensor crop when not guiding.
pub const FULL_WIDTH: u32 = 640;
pub const FULL_HEIGHT: u32 = 512;
/// Guide subraster is always square.
pub const GUIDE_SIZE: u32 = 32;

pub const PIXSCALE_ARCSEC_PER_PIX: f64 = 0.128;
pub const USER_TIMEOUT_MS: f64 = 20_000.0;
pub const MAX_FRAME_RATE_HZ: f64 = 120.0;
pub const MAX_SAVE_COUNT: u32 = 1_000_000;

/// The guide-raster and null-pixel configuration loaded at startup.
///
/// Grounded on the `key=value` config described in spec.md section 6; the
/// four keys are all required, with the same range checks as the live
/// `NULL`/`ROI` commands.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GuideConfig {
    pub guide_x0: u32,
    pub guide_y0: u32,
    pub null_x: f64,
    pub null_y: f64,
}

impl GuideConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.guide_x0 > FULL_WIDTH - GUIDE_SIZE {
            return Err(format!(
                "guideRasterX0 {} out of range [0, {}]",
                self.guide_x0,
                FULL_WIDTH - GUIDE_SIZE
            ));
        }
        if self.guide_y0 > FULL_HEIGHT - GUIDE_SIZE {
            return Err(format!(
                "guideRasterY0 {} out of range [0, {}]",
                self.guide_y0,
                FULL_HEIGHT - GUIDE_SIZE
            ));
        }
        if !(0.0..=FULL_WIDTH as f64).contains(&self.null_x) {
            return Err(format!("holeNullX {} out of range [0, {}]", self.null_x, FULL_WIDTH));
        }
        if !(0.0..=FULL_HEIGHT as f64).contains(&self.null_y) {
            return Err(format!("holeNullY {} out of range [0, {}]", self.null_y, FULL_HEIGHT));
        }
        Ok(())
    }
}

/// Which ISU capability set to bind at startup (spec.md section 9:
/// "deployment variants, not dynamic modes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsuCapabilityKind {
    #[default]
    Real,
    None,
}

/// One parsed client connection, kept in insertion order by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRecord {
    pub remote_ip: Ipv4Addr,
    pub hostname: String,
    pub connected_at: DateTime<Utc>,
}

/// A parsed operator command. `command_server` owns parsing text into this;
/// `frame_loop` owns applying it to `ServerState`.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Disconnect,
    Shutdown,
    EndExp,
    StartExp(StartExpArgs),
    FrameRate(Option<f64>),
    ExpTime(Option<f64>),
    Tec(Option<f64>),
    Temp,
    Roi(Option<(u32, u32)>),
    Null(Option<(f64, f64)>),
    Video(bool),
    Guide(bool),
    Isu(bool),
    Save(u32, String),
    Clients,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartExpArgs {
    pub filename: String,
    pub ra: Option<String>,
    pub dec: Option<String>,
    pub equinox: Option<f64>,
    pub objmag: Option<f64>,
}

/// A single reply line: `.` for pass, `!` for fail, per spec.md section 4.4.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReply {
    Ok { echo: String, value: Option<String> },
    Err { echo: String, message: String },
}

impl CommandReply {
    pub fn ok(echo: impl Into<String>) -> Self {
        CommandReply::Ok { echo: echo.into(), value: None }
    }

    pub fn ok_with(echo: impl Into<String>, value: impl Into<String>) -> Self {
        CommandReply::Ok { echo: echo.into(), value: Some(value.into()) }
    }

    pub fn err(echo: impl Into<String>, message: impl Into<String>) -> Self {
        CommandReply::Err { echo: echo.into(), message: message.into() }
    }

    /// Render as the single line written back to the operator's socket.
    pub fn to_line(&self) -> String {
        match self {
            CommandReply::Ok { echo, value: None } => format!(". {echo}"),
            CommandReply::Ok { echo, value: Some(v) } => format!(". {echo} {v}"),
            CommandReply::Err { echo, message } => format!("! {echo} \"{message}\""),
        }
    }
}

/// Read-only snapshot of the server state, for the diagnostic `CLIENTS`
/// command and for tests. Not the state itself (that stays owned by the
/// frame loop per spec.md section 9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub frame_rate_hz: f64,
    pub exposure_time_ms: f64,
    pub tec_setpoint_c: f64,
    pub temp_c: f64,
    pub image_width: u32,
    pub image_height: u32,
    pub win_x0: u32,
    pub win_y0: u32,
    pub guide_x0: u32,
    pub guide_y0: u32,
    pub null_x: f64,
    pub null_y: f64,
    pub video_on: bool,
    pub guide_on: bool,
    pub isu_on: bool,
    pub exp_on: bool,
    pub guide_xoff_arcsec: f64,
    pub guide_yoff_arcsec: f64,
    pub fwhm_x: f64,
    pub fwhm_y: f64,
    pub frame_sequence: u64,
    pub frame_save_count: u32,
}
