//! Pixel offset to ISU mechanism angle, spec.md section 4.3.

use guide_types::PIXSCALE_ARCSEC_PER_PIX;

use crate::isu::IsuDriver;

/// Everything the geometry transform needs from the server state for one
/// frame; kept as plain data so it can be passed by value to a detached
/// worker thread (spec.md section 5: "Worker threads receive a copy of
/// the arguments they need").
#[derive(Debug, Clone, Copy)]
pub struct GeometryInput {
    pub guide_x0: u32,
    pub guide_y0: u32,
    pub null_x: f64,
    pub null_y: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct GeometryOutput {
    pub guide_xoff_arcsec: f64,
    pub guide_yoff_arcsec: f64,
    pub delta_mrad_x: f64,
    pub delta_mrad_y: f64,
    pub last_mrad_x: f64,
    pub last_mrad_y: f64,
    /// Absolute target angles to command the mechanism to.
    pub target_mrad_x: f64,
    pub target_mrad_y: f64,
}

/// Converts a refined subraster centroid into an ISU command, per
/// spec.md section 4.3: pixel offset from null -> arcsec -> mrad ->
/// `setup_to_true` calibration -> absolute target relative to the
/// mechanism's last read-back position.
pub fn transform(input: GeometryInput, xc: f64, yc: f64, isu: &dyn IsuDriver) -> GeometryOutput {
    let guide_xoff_arcsec = (input.guide_x0 as f64 + xc - input.null_x) * PIXSCALE_ARCSEC_PER_PIX;
    let guide_yoff_arcsec = (input.guide_y0 as f64 + yc - input.null_y) * PIXSCALE_ARCSEC_PER_PIX;

    let delta_setup_x = isu.arcsec_to_mrad(guide_xoff_arcsec);
    let delta_setup_y = isu.arcsec_to_mrad(guide_yoff_arcsec);

    let delta_mrad_x = isu.setup_to_true(delta_setup_x);
    let delta_mrad_y = isu.setup_to_true(delta_setup_y);

    let (last_mrad_x, last_mrad_y) = isu.read_angles_mrad();

    GeometryOutput {
        guide_xoff_arcsec,
        guide_yoff_arcsec,
        delta_mrad_x,
        delta_mrad_y,
        last_mrad_x,
        last_mrad_y,
        target_mrad_x: last_mrad_x - delta_mrad_x,
        target_mrad_y: last_mrad_y - delta_mrad_y,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isu::NoIsu;

    #[test]
    fn zero_offset_at_null_pixel() {
        let input = GeometryInput { guide_x0: 100, guide_y0: 200, null_x: 115.5, null_y: 215.5 };
        // xc, yc in subraster-local coordinates such that absolute pixel
        // equals the null pixel exactly.
        let out = transform(input, 15.5, 15.5, &NoIsu);
        assert!(out.guide_xoff_arcsec.abs() < 1e-9);
        assert!(out.guide_yoff_arcsec.abs() < 1e-9);
    }

    #[test]
    fn one_pixel_offset_scales_by_pixscale() {
        let input = GeometryInput { guide_x0: 100, guide_y0: 200, null_x: 115.5, null_y: 215.5 };
        let out = transform(input, 16.5, 15.5, &NoIsu);
        assert!((out.guide_xoff_arcsec - PIXSCALE_ARCSEC_PER_PIX).abs() < 1e-9);
    }

    #[test]
    fn target_is_last_minus_delta() {
        let input = GeometryInput { guide_x0: 100, guide_y0: 200, null_x: 115.5, null_y: 215.5 };
        let out = transform(input, 16.5, 15.5, &NoIsu);
        assert_eq!(out.target_mrad_x, out.last_mrad_x - out.delta_mrad_x);
        assert_eq!(out.target_mrad_y, out.last_mrad_y - out.delta_mrad_y);
    }
}
