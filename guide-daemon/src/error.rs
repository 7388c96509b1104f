//! Leaf error types, shaped after `ci2::Error`: a `thiserror` enum per
//! concern, `#[from]` only where the conversion is unambiguous, no
//! backtraces (the teacher gates those behind an optional feature we have
//! no need to reintroduce here).

pub type CodecResult<T> = std::result::Result<T, CodecError>;
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Errors raised by the vendor serial framing and its getters/setters.
/// Spec.md section 7: "Transient I/O" and "Protocol mismatch" both surface
/// through this type; the command dispatcher turns any of these into a
/// `!`-prefixed reply without altering loop state.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("serial timeout waiting for {0} bytes")]
    Timeout(usize),

    #[error("checksum mismatch: computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("echo mismatch: expected {expected}, got {got}")]
    EchoMismatch { expected: String, got: String },

    #[error("manufacturing block: expected 18 tokens, got {0}")]
    ManufacturingBlockShort(usize),

    #[error("malformed hex token {0:?}")]
    BadToken(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that are fatal per spec.md section 7 ("Fatal device fault"): the
/// frame loop logs and exits non-zero rather than retrying.
#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    #[error("camera open failed: {0}")]
    CameraOpen(String),

    #[error("camera enable failed: {0}")]
    CameraEnable(String),

    #[error("ISU fault flag set on axis {axis}")]
    IsuFault { axis: &'static str },

    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    #[error("config load failed: {0}")]
    ConfigLoad(String),

    #[error("writing output frame failed: {0}")]
    OutputWrite(String),
}
