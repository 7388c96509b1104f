//! Narrow frame-grabber contract (spec.md section 1: "assumed to expose:
//! open channel, set ROI, enable ROI, read width/height, start image, wait
//! image, multibuf, timeouts"). The real backend is an external
//! collaborator; this module only defines the seam and a software
//! simulator used by tests and by the "star simulation" deployment variant
//! named in spec.md section 9.

use std::time::Duration;

use crate::error::DeviceError;

#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

pub enum WaitImageOutcome {
    Ready(Frame),
    TimedOut,
}

/// The frame-grabber seam. The real implementation wraps the vendor's
/// open-channel / ROI / multibuf C API; grounded on `ci2::Camera`'s shape
/// (plain `Result`-returning methods, no generics, exclusive ownership by
/// one caller).
pub trait FrameGrabber: Send {
    fn open(&mut self) -> Result<(), DeviceError>;
    fn sensor_width(&self) -> Result<u32, DeviceError>;
    fn sensor_height(&self) -> Result<u32, DeviceError>;
    fn set_roi(&mut self, x0: u32, y0: u32, width: u32, height: u32) -> Result<(), DeviceError>;
    fn enable_roi(&mut self, enabled: bool) -> Result<(), DeviceError>;
    fn allocate_multibuf(&mut self, count: u32) -> Result<(), DeviceError>;
    fn set_blocking_timeout(&mut self, timeout: Duration) -> Result<(), DeviceError>;
    fn start_image(&mut self) -> Result<(), DeviceError>;
    fn wait_image(&mut self) -> Result<WaitImageOutcome, DeviceError>;
}

/// Number of DMA buffers allocated on the rising edge of `video_on`
/// (spec.md section 4.5, step 2).
pub const MULTIBUF_COUNT: u32 = 4;

/// A software frame-grabber used for tests and the star-simulation
/// deployment variant. Produces a flat field with an optional injected
/// Gaussian star so the frame loop and centroid engine can be exercised
/// end to end without real hardware.
pub struct SimulatedFrameGrabber {
    opened: bool,
    width: u32,
    height: u32,
    roi_enabled: bool,
    star: Option<(f64, f64, f64, f64)>, // (x, y, width, amplitude)
    background: u16,
    frame_ready: bool,
}

impl SimulatedFrameGrabber {
    pub fn new() -> Self {
        Self {
            opened: false,
            width: guide_types::FULL_WIDTH,
            height: guide_types::FULL_HEIGHT,
            roi_enabled: false,
            star: None,
            background: 300,
            frame_ready: false,
        }
    }

    pub fn with_star(mut self, x: f64, y: f64, width: f64, amplitude: f64) -> Self {
        self.star = Some((x, y, width, amplitude));
        self
    }

    fn render(&self) -> Vec<u16> {
        let mut data = vec![self.background; (self.width * self.height) as usize];
        if let Some((sx, sy, width, amp)) = self.star {
            for y in 0..self.height {
                for x in 0..self.width {
                    let dx = x as f64 - sx;
                    let dy = y as f64 - sy;
                    let v = amp * (-0.5 * (dx * dx + dy * dy) / (width * width)).exp();
                    let idx = (y * self.width + x) as usize;
                    data[idx] = (data[idx] as f64 + v).round().clamp(0.0, 65535.0) as u16;
                }
            }
        }
        data
    }
}

impl Default for SimulatedFrameGrabber {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameGrabber for SimulatedFrameGrabber {
    fn open(&mut self) -> Result<(), DeviceError> {
        self.opened = true;
        Ok(())
    }

    fn sensor_width(&self) -> Result<u32, DeviceError> {
        Ok(guide_types::FULL_WIDTH)
    }

    fn sensor_height(&self) -> Result<u32, DeviceError> {
        Ok(guide_types::FULL_HEIGHT)
    }

    fn set_roi(&mut self, _x0: u32, _y0: u32, width: u32, height: u32) -> Result<(), DeviceError> {
        self.width = width;
        self.height = height;
        Ok(())
    }

    fn enable_roi(&mut self, enabled: bool) -> Result<(), DeviceError> {
        self.roi_enabled = enabled;
        if !enabled {
            self.width = guide_types::FULL_WIDTH;
            self.height = guide_types::FULL_HEIGHT;
        }
        Ok(())
    }

    fn allocate_multibuf(&mut self, _count: u32) -> Result<(), DeviceError> {
        Ok(())
    }

    fn set_blocking_timeout(&mut self, _timeout: Duration) -> Result<(), DeviceError> {
        Ok(())
    }

    fn start_image(&mut self) -> Result<(), DeviceError> {
        if !self.opened {
            return Err(DeviceError::CameraEnable("channel not open".into()));
        }
        self.frame_ready = true;
        Ok(())
    }

    fn wait_image(&mut self) -> Result<WaitImageOutcome, DeviceError> {
        if !self.frame_ready {
            return Ok(WaitImageOutcome::TimedOut);
        }
        self.frame_ready = false;
        Ok(WaitImageOutcome::Ready(Frame { width: self.width, height: self.height, data: self.render() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_without_open_fails() {
        let mut cam = SimulatedFrameGrabber::new();
        assert!(cam.start_image().is_err());
    }

    #[test]
    fn wait_without_start_times_out() {
        let mut cam = SimulatedFrameGrabber::new();
        cam.open().unwrap();
        match cam.wait_image().unwrap() {
            WaitImageOutcome::TimedOut => {}
            _ => panic!("expected timeout"),
        }
    }

    #[test]
    fn roi_resizes_frame() {
        let mut cam = SimulatedFrameGrabber::new();
        cam.open().unwrap();
        cam.set_roi(100, 200, 32, 32).unwrap();
        cam.enable_roi(true).unwrap();
        cam.start_image().unwrap();
        match cam.wait_image().unwrap() {
            WaitImageOutcome::Ready(frame) => {
                assert_eq!(frame.width, 32);
                assert_eq!(frame.height, 32);
            }
            _ => panic!("expected a frame"),
        }
    }
}
