//! Image header and payload serialization (spec.md section 6): an
//! 80-column card-image header padded to a 2880-byte block, followed by
//! the pixel payload (signed 16-bit, `BZERO`-shifted) padded to the same
//! block size. No analogue in the teacher pack -- this is a from-scratch
//! FITS-shaped writer, built the way `camera_codec`'s framing is built:
//! small pure functions, explicit byte layout, no external FITS crate
//! (none appears anywhere in the corpus).

use chrono::{DateTime, Utc};

use crate::camera::Frame;
use crate::centroid::CentroidResult;
use crate::state::ServerState;

const CARD_LEN: usize = 80;
const BLOCK_LEN: usize = 2880;

struct HeaderBuilder {
    cards: Vec<String>,
}

impl HeaderBuilder {
    fn new() -> Self {
        Self { cards: Vec::new() }
    }

    fn num(&mut self, keyword: &str, value: impl std::fmt::Display) -> &mut Self {
        self.cards.push(format!("{keyword:<8}= {value:>20}"));
        self
    }

    fn text(&mut self, keyword: &str, value: &str) -> &mut Self {
        self.cards.push(format!("{keyword:<8}= '{value}'"));
        self
    }

    fn finish(self) -> Vec<u8> {
        let mut out = String::new();
        for mut card in self.cards {
            card.truncate(CARD_LEN);
            out.push_str(&format!("{card:<CARD_LEN$}"));
        }
        out.push_str(&format!("{:<CARD_LEN$}", "END"));
        let mut bytes = out.into_bytes();
        pad_to_block(&mut bytes);
        bytes
    }
}

fn pad_to_block(bytes: &mut Vec<u8>) {
    let rem = bytes.len() % BLOCK_LEN;
    if rem != 0 {
        bytes.resize(bytes.len() + (BLOCK_LEN - rem), b' ');
    }
}

/// Builds the complete header+payload byte stream for one acquired frame.
///
/// Fields that only apply in certain modes (guide offsets while not
/// guiding, ISU angles while the ISU is off, exposure metadata while no
/// exposure is open) are omitted entirely rather than written with a
/// fabricated sentinel value, since no concrete null convention survived
/// the distillation down to this module (see DESIGN.md).
pub fn encode_frame(
    state: &ServerState,
    frame: &Frame,
    centroid: Option<&CentroidResult>,
    seqnum: Option<u64>,
) -> Vec<u8> {
    let now = Utc::now();
    let mut h = HeaderBuilder::new();
    h.text("SIMPLE", "T")
        .num("BITPIX", 16)
        .num("NAXIS", 2)
        .num("NAXIS1", frame.width)
        .num("NAXIS2", frame.height)
        .num("PCOUNT", 0)
        .num("GCOUNT", 1)
        .text("DATE", &now.format("%Y-%m-%d").to_string())
        .text("HSTTIME", &now.format("%H:%M:%S%.3f").to_string())
        .num("UNIXTIME", now.timestamp())
        .text("ORIGIN", "CFHT")
        .num("BZERO", 32768)
        .num("BSCALE", 1)
        .num("ETIME", state.exposure_time_ms)
        .text("ETYPE", state.etype())
        .text("IMGINFO", &state.fits_comment)
        .num("FRMRATE", state.frame_rate_hz)
        .num("TEMP", state.temp_c)
        .num("PIXSCALE", guide_types::PIXSCALE_ARCSEC_PER_PIX)
        .num("WIN_X0", state.win_x0)
        .num("WIN_Y0", state.win_y0)
        .num("WIN_X1", state.win_x0 + state.image_width)
        .num("WIN_Y1", state.win_y0 + state.image_height)
        .num("GUIDE_X0", state.guide_x0)
        .num("GUIDE_Y0", state.guide_y0)
        .num("GUIDE_X1", state.guide_x0 + guide_types::GUIDE_SIZE)
        .num("GUIDE_Y1", state.guide_y0 + guide_types::GUIDE_SIZE)
        .num("NULLX", state.null_x)
        .num("NULLY", state.null_y);

    if let Some(seq) = seqnum {
        h.num("SEQNUM", seq);
    }

    if state.guide_on {
        h.num("GD_XOFF", state.guide_xoff).num("GD_YOFF", state.guide_yoff);
        if let Some(c) = centroid {
            h.num("FWHM_X", c.fwhm_x).num("FWHM_Y", c.fwhm_y);
        }
    }

    if state.isu_on {
        h.num("SMRAD_X", state.isu_mrad_x_delta_setup)
            .num("SMRAD_Y", state.isu_mrad_y_delta_setup)
            .num("RMRAD_X", state.isu_mrad_x_status)
            .num("RMRAD_Y", state.isu_mrad_y_status);
    }

    if state.exp_on {
        h.text("FILENAME", &state.filename)
            .text("RA", &state.ra)
            .text("DEC", &state.dec)
            .num("EQUINOX", state.equinox)
            .num("OBJMAG", state.objmag);
    }

    let mut bytes = h.finish();
    bytes.extend_from_slice(&encode_payload(frame));
    bytes
}

/// Pixel payload as big-endian signed 16-bit samples, `BZERO`-shifted per
/// the unsigned-via-signed FITS convention, padded to a 2880-byte block.
fn encode_payload(frame: &Frame) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.data.len() * 2);
    for &pixel in &frame.data {
        let shifted = pixel as i32 - 32768;
        bytes.extend_from_slice(&(shifted as i16).to_be_bytes());
    }
    pad_to_block(&mut bytes);
    bytes
}

/// Formats a UTC timestamp the way `HSTTIME`/`DATE` want it; exposed for
/// tests that need to assert on header content without re-deriving the
/// format string.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
}
