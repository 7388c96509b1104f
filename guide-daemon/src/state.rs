//! The process-wide server state record (spec.md section 3), owned
//! exclusively by the frame loop and lent by `&mut` to the command
//! dispatcher between frames (spec.md section 9: "model it as one value
//! owned by the Frame Loop ... never share across threads").

use guide_types::{ClientRecord, GuideConfig, ServerSnapshot, FULL_HEIGHT, FULL_WIDTH, GUIDE_SIZE};

#[derive(Debug, Clone)]
pub struct ServerState {
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

    pub isu_mrad_x_delta_setup: f64,
    pub isu_mrad_y_delta_setup: f64,
    pub isu_mrad_x_status: f64,
    pub isu_mrad_y_status: f64,

    pub guide_xoff: f64,
    pub guide_yoff: f64,
    pub fwhm_x: f64,
    pub fwhm_y: f64,

    pub frame_sequence: u64,
    pub frame_save_count: u32,
    pub fits_comment: String,
    pub filename: String,
    pub ra: String,
    pub dec: String,
    pub equinox: f64,
    pub objmag: f64,

    pub first_done_flag: bool,

    pub clients: Vec<ClientRecord>,
    pub done: bool,
}

impl ServerState {
    pub fn new(config: GuideConfig) -> Self {
        Self {
            frame_rate_hz: 0.0,
            exposure_time_ms: 0.0,
            tec_setpoint_c: 0.0,
            temp_c: 0.0,
            image_width: FULL_WIDTH,
            image_height: FULL_HEIGHT,
            win_x0: 0,
            win_y0: 0,
            guide_x0: config.guide_x0,
            guide_y0: config.guide_y0,
            null_x: config.null_x,
            null_y: config.null_y,
            video_on: false,
            guide_on: false,
            isu_on: false,
            exp_on: false,
            isu_mrad_x_delta_setup: 0.0,
            isu_mrad_y_delta_setup: 0.0,
            isu_mrad_x_status: 0.0,
            isu_mrad_y_status: 0.0,
            guide_xoff: 0.0,
            guide_yoff: 0.0,
            fwhm_x: 0.0,
            fwhm_y: 0.0,
            frame_sequence: 0,
            frame_save_count: 0,
            fits_comment: String::new(),
            filename: String::new(),
            ra: String::new(),
            dec: String::new(),
            equinox: 0.0,
            objmag: 0.0,
            first_done_flag: false,
            clients: Vec::new(),
            done: false,
        }
    }

    /// Enforces the invariant in spec.md section 3: guiding pins the crop
    /// to the 32x32 subraster at the configured guide origin; otherwise the
    /// crop is the full 640x512 sensor.
    pub fn sync_crop_to_guide_mode(&mut self) {
        if self.guide_on {
            self.image_width = GUIDE_SIZE;
            self.image_height = GUIDE_SIZE;
            self.win_x0 = self.guide_x0;
            self.win_y0 = self.guide_y0;
        } else {
            self.image_width = FULL_WIDTH;
            self.image_height = FULL_HEIGHT;
            self.win_x0 = 0;
            self.win_y0 = 0;
        }
    }

    /// ETYPE per spec.md section 3: `GUIDE` while a save sequence is
    /// armed, `ACQUIRE` otherwise.
    pub fn etype(&self) -> &'static str {
        if self.frame_save_count > 0 {
            "GUIDE"
        } else {
            "ACQUIRE"
        }
    }

    /// Advances the save-sequence bookkeeping for one emitted frame,
    /// returning the `SEQNUM` to stamp on this frame's header, or `None`
    /// if no save sequence is armed. Resets the save state once
    /// `frame_sequence >= frame_save_count`, per spec.md section 3.
    pub fn advance_save_sequence(&mut self) -> Option<u64> {
        if self.frame_save_count == 0 {
            return None;
        }
        self.frame_sequence += 1;
        let seqnum = self.frame_sequence;
        if self.frame_sequence >= self.frame_save_count as u64 {
            self.fits_comment.clear();
            self.frame_save_count = 0;
            self.frame_sequence = 0;
        }
        Some(seqnum)
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            frame_rate_hz: self.frame_rate_hz,
            exposure_time_ms: self.exposure_time_ms,
            tec_setpoint_c: self.tec_setpoint_c,
            temp_c: self.temp_c,
            image_width: self.image_width,
            image_height: self.image_height,
            win_x0: self.win_x0,
            win_y0: self.win_y0,
            guide_x0: self.guide_x0,
            guide_y0: self.guide_y0,
            null_x: self.null_x,
            null_y: self.null_y,
            video_on: self.video_on,
            guide_on: self.guide_on,
            isu_on: self.isu_on,
            exp_on: self.exp_on,
            guide_xoff_arcsec: self.guide_xoff,
            guide_yoff_arcsec: self.guide_yoff,
            fwhm_x: self.fwhm_x,
            fwhm_y: self.fwhm_y,
            frame_sequence: self.frame_sequence,
            frame_save_count: self.frame_save_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> GuideConfig {
        GuideConfig { guide_x0: 100, guide_y0: 200, null_x: 115.5, null_y: 215.5 }
    }

    #[test]
    fn crop_follows_guide_mode() {
        let mut s = ServerState::new(cfg());
        s.guide_on = true;
        s.sync_crop_to_guide_mode();
        assert_eq!((s.image_width, s.image_height), (GUIDE_SIZE, GUIDE_SIZE));
        assert_eq!((s.win_x0, s.win_y0), (100, 200));

        s.guide_on = false;
        s.sync_crop_to_guide_mode();
        assert_eq!((s.image_width, s.image_height), (FULL_WIDTH, FULL_HEIGHT));
    }

    #[test]
    fn save_sequence_resets_after_n_frames() {
        let mut s = ServerState::new(cfg());
        s.frame_save_count = 3;
        s.fits_comment = "seq42".into();
        assert_eq!(s.advance_save_sequence(), Some(1));
        assert_eq!(s.etype(), "GUIDE");
        assert_eq!(s.advance_save_sequence(), Some(2));
        assert_eq!(s.advance_save_sequence(), Some(3));
        // save_count is now 0: the state has reset.
        assert_eq!(s.frame_save_count, 0);
        assert_eq!(s.fits_comment, "");
        assert_eq!(s.etype(), "ACQUIRE");
        assert_eq!(s.advance_save_sequence(), None);
    }
}
