pub mod capture_queue;
pub mod config;
pub mod derived;
pub mod double_buffer;
pub mod error;
pub mod frame_exchange;
pub mod gpu;
pub mod host;
pub mod logger;
pub mod logic;
pub mod mirror_capture;
pub mod persistence;
pub mod platform;
pub mod render;
pub mod snapshot;
pub mod transition;
pub mod triple_buffer;
pub mod window_capture;
pub mod window_overlay;
pub mod workers;

#[cfg(windows)]
pub mod gpu_d3d11;
#[cfg(windows)]
pub mod platform_win32;

pub use config::{Configuration, ScreenMetrics};
pub use error::{CaptureError, GpuError, HostError};
pub use host::{HostBackends, HostOptions, OverlayHost};
pub use logger::*;
pub use persistence::ConfigStore;
pub use render::{FramePlan, RenderSide};
pub use snapshot::{ConfigDraft, ConfigSnapshot, SnapshotStore};
