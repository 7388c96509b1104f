//! CLI flags and the guide-raster/null-pixel configuration file.
//!
//! The CLI layer follows `strand-cam`'s `cli_app.rs` (clap derive, a
//! `dotenv().ok()` before parsing). The config-file layer has no direct
//! analogue in the pack (nothing else in the teacher reads a bare
//! `key=value` file) so its parser is hand-rolled, grounded on the same
//! "trim, tokenize, validate" texture as `camera_codec`'s own line parsing.

use std::path::{Path, PathBuf};

use guide_types::{GuideConfig, IsuCapabilityKind};

use crate::error::DeviceError;

#[derive(clap::Parser, Debug)]
#[command(name = "guide-daemon", about = "Tip-tilt fast-guiding control core")]
pub struct Cli {
    /// Path to the guide-raster/null configuration file.
    #[arg(long, default_value = "guide.cfg")]
    pub config: PathBuf,

    /// TCP port the command server listens on.
    #[arg(long, default_value_t = 915)]
    pub port: u16,

    /// Which ISU capability set to bind: `real` talks to hardware, `none`
    /// is the no-op variant used on benches without a mirror attached.
    #[arg(long, value_enum, default_value = "real")]
    pub isu: IsuCapabilityArg,

    /// Serial device path for the camera's frame-grabber serial channel.
    #[arg(long, default_value = "/dev/ttyUSB0")]
    pub serial_device: String,

    /// Destination for the image output stream (spec.md section 6):
    /// `-` (the default) means stdout, anything else is a file path.
    #[arg(long, default_value = "-")]
    pub output: String,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsuCapabilityArg {
    Real,
    None,
}

impl From<IsuCapabilityArg> for IsuCapabilityKind {
    fn from(v: IsuCapabilityArg) -> Self {
        match v {
            IsuCapabilityArg::Real => IsuCapabilityKind::Real,
            IsuCapabilityArg::None => IsuCapabilityKind::None,
        }
    }
}

/// Parses the `key=value` guide configuration file. All four keys are
/// required (spec.md section 6); unknown keys warn but do not abort.
pub fn load_guide_config(path: &Path) -> Result<GuideConfig, DeviceError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| DeviceError::ConfigLoad(format!("reading {}: {e}", path.display())))?;
    parse_guide_config(&text)
}

fn parse_guide_config(text: &str) -> Result<GuideConfig, DeviceError> {
    let mut guide_x0: Option<u32> = None;
    let mut guide_y0: Option<u32> = None;
    let mut null_x: Option<f64> = None;
    let mut null_y: Option<f64> = None;

    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            tracing::warn!(line = lineno + 1, %raw, "config line missing '=', ignored");
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "guideRasterX0" => {
                guide_x0 = Some(value.parse().map_err(|_| {
                    DeviceError::ConfigLoad(format!("guideRasterX0: invalid integer {value:?}"))
                })?)
            }
            "guideRasterY0" => {
                guide_y0 = Some(value.parse().map_err(|_| {
                    DeviceError::ConfigLoad(format!("guideRasterY0: invalid integer {value:?}"))
                })?)
            }
            "holeNullX" => {
                null_x = Some(value.parse().map_err(|_| {
                    DeviceError::ConfigLoad(format!("holeNullX: invalid float {value:?}"))
                })?)
            }
            "holeNullY" => {
                null_y = Some(value.parse().map_err(|_| {
                    DeviceError::ConfigLoad(format!("holeNullY: invalid float {value:?}"))
                })?)
            }
            other => tracing::warn!(key = other, "unknown config key, ignored"),
        }
    }

    let cfg = GuideConfig {
        guide_x0: guide_x0
            .ok_or_else(|| DeviceError::ConfigLoad("missing guideRasterX0".into()))?,
        guide_y0: guide_y0
            .ok_or_else(|| DeviceError::ConfigLoad("missing guideRasterY0".into()))?,
        null_x: null_x.ok_or_else(|| DeviceError::ConfigLoad("missing holeNullX".into()))?,
        null_y: null_y.ok_or_else(|| DeviceError::ConfigLoad("missing holeNullY".into()))?,
    };
    cfg.validate().map_err(DeviceError::ConfigLoad)?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_complete_config() {
        let text = "guideRasterX0=100\nguideRasterY0=200\nholeNullX=115.5\nholeNullY=215.5\n";
        let cfg = parse_guide_config(text).unwrap();
        assert_eq!(cfg.guide_x0, 100);
        assert_eq!(cfg.guide_y0, 200);
        assert_eq!(cfg.null_x, 115.5);
        assert_eq!(cfg.null_y, 215.5);
    }

    #[test]
    fn missing_key_is_a_startup_failure() {
        let text = "guideRasterX0=100\nguideRasterY0=200\nholeNullX=115.5\n";
        assert!(parse_guide_config(text).is_err());
    }

    #[test]
    fn unknown_key_warns_but_does_not_abort() {
        let text =
            "guideRasterX0=100\nguideRasterY0=200\nholeNullX=115.5\nholeNullY=215.5\nfoo=bar\n";
        assert!(parse_guide_config(text).is_ok());
    }

    #[test]
    fn out_of_range_value_is_rejected() {
        let text = "guideRasterX0=999\nguideRasterY0=200\nholeNullX=115.5\nholeNullY=215.5\n";
        assert!(parse_guide_config(text).is_err());
    }
}
