use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("GPU device lost")]
    DeviceLost,

    #[error("invalid capture size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("unknown texture {0}")]
    UnknownTexture(u64),

    #[error("no back buffer bound to the copier")]
    NoSource,

    #[error("GPU backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The handle no longer refers to a live window.
    #[error("target window is gone")]
    WindowGone,

    /// Capturing the tracked game window or a window of this process.
    #[error("refusing to capture window {0:#x}: it belongs to the host")]
    SelfCapture(isize),

    #[error("window client area is empty")]
    EmptyClient,

    #[error("crop removes the whole {width}x{height} client area")]
    CropTooLarge { width: u32, height: u32 },

    #[error("platform capture failed: {0}")]
    Platform(String),
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("failed to spawn {name} thread")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

pub type GpuResult<T> = Result<T, GpuError>;
pub type CaptureResult<T> = Result<T, CaptureError>;
