//! The Image Stabilization Unit capability set, modeled as a deployment
//! capability trait per spec.md section 9's "conditional compilation ...
//! is a deployment variant, not a dynamic mode": one trait, a real
//! implementation and a no-op implementation selected at startup from
//! `config::IsuCapabilityArg`.
//!
//! Grounded on `ci2::Camera`'s shape (a narrow trait of plain methods
//! returning `Result`, no async, no generics) applied to the ISU
//! collaborator instead of the camera collaborator.

use crate::error::DeviceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultFlags {
    pub x_fault: bool,
    pub y_fault: bool,
}

impl FaultFlags {
    pub fn any(&self) -> bool {
        self.x_fault || self.y_fault
    }
}

/// Narrow contract for the ISU driver (spec.md section 1): home, check
/// homed, enable, stop, read angles, set up a slope or direct setpoint,
/// read fault flags, and the two calibration conversions used by the
/// geometry transform.
pub trait IsuDriver: Send {
    fn home(&mut self) -> Result<(), DeviceError>;
    fn is_homed(&self) -> bool;
    fn enable(&mut self) -> Result<(), DeviceError>;
    fn stop(&mut self) -> Result<(), DeviceError>;
    /// Last read-back `(x, y)` angles in milliradians.
    fn read_angles_mrad(&self) -> (f64, f64);
    /// Dispatches a rate-based slope move toward `(target_x, target_y)`
    /// mrad at `rate_hz`. Runs on the caller's thread; the frame loop is
    /// responsible for calling this from a detached worker (spec.md
    /// section 4.5, step 3).
    fn set_analog_slope(&mut self, rate_hz: f64, target_x: f64, target_y: f64) -> Result<(), DeviceError>;
    /// Synchronous alternative to `set_analog_slope` (spec.md section 4.5:
    /// "a synchronous `setup_isu` path exists as a build-time
    /// alternative").
    fn setup_direct(&mut self, target_x: f64, target_y: f64) -> Result<(), DeviceError>;
    fn check_fault(&self) -> FaultFlags;
    fn arcsec_to_mrad(&self, arcsec: f64) -> f64;
    /// Non-identity calibration mapping a requested setpoint to the angle
    /// the mechanism actually moves to.
    fn setup_to_true(&self, setpoint_mrad: f64) -> f64;
}

/// The no-op variant for benches without a mirror attached
/// (`IsuCapabilityKind::None`).
pub struct NoIsu;

impl IsuDriver for NoIsu {
    fn home(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn is_homed(&self) -> bool {
        true
    }
    fn enable(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn stop(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
    fn read_angles_mrad(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
    fn set_analog_slope(&mut self, _rate_hz: f64, _target_x: f64, _target_y: f64) -> Result<(), DeviceError> {
        Ok(())
    }
    fn setup_direct(&mut self, _target_x: f64, _target_y: f64) -> Result<(), DeviceError> {
        Ok(())
    }
    fn check_fault(&self) -> FaultFlags {
        FaultFlags::default()
    }
    fn arcsec_to_mrad(&self, arcsec: f64) -> f64 {
        // 1 arcsec = pi / (180 * 3600) rad = 1000 * that in mrad.
        arcsec * std::f64::consts::PI / (180.0 * 3600.0) * 1000.0
    }
    fn setup_to_true(&self, setpoint_mrad: f64) -> f64 {
        setpoint_mrad
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_isu_is_always_homed_and_fault_free() {
        let isu = NoIsu;
        assert!(isu.is_homed());
        assert!(!isu.check_fault().any());
    }

    #[test]
    fn no_isu_arcsec_to_mrad_matches_standard_conversion() {
        let isu = NoIsu;
        let one_arcsec_in_mrad = std::f64::consts::PI / (180.0 * 3600.0) * 1000.0;
        assert!((isu.arcsec_to_mrad(1.0) - one_arcsec_in_mrad).abs() < 1e-12);
    }
}
