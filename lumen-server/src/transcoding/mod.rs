//! On-demand video transcoding: probe-driven encoder selection, GPU
//! detection with CPU fallback, and a single-writer cache of MP4 artifacts.

pub mod cache;
pub mod hardware;
pub mod service;

pub use cache::{TranscodeCache, TranscodeCacheStatus};
pub use hardware::{is_gpu_error, GpuBackend, HardwareAccel};
pub use service::{
    select_plan, EncodePlan, StreamSource, TranscodeError, TranscodeOptions, TranscodeService,
    TranscodeStatus,
};
