//! GPU encoder detection and fallback.
//!
//! Hardware families are probed once, in priority order, with a one-frame
//! `testsrc` encode; the selection is then sticky for the process. A GPU
//! error during a production transcode permanently disables acceleration and
//! the job is retried on the CPU path.

use std::path::Path;

use lumen_config::GpuAccel;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Case-insensitive substrings that mark an encoder failure as a hardware
/// problem rather than a bad input file.
pub const GPU_ERROR_PATTERNS: &[&str] = &[
    "libcuda",
    "nvenc",
    "cuda",
    "libva",
    "vaapi",
    "/dev/dri",
    "videotoolbox",
    "cannot load",
    "not supported",
    "no device available",
    "hardware",
    "device creation failed",
    "hwupload",
];

/// Classify an encoder failure message.
pub fn is_gpu_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    GPU_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Hardware encoder families, in detection priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuBackend {
    Nvenc,
    Vaapi,
    VideoToolbox,
}

impl GpuBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nvenc => "nvenc",
            Self::Vaapi => "vaapi",
            Self::VideoToolbox => "videotoolbox",
        }
    }

    /// The ffmpeg H.264 encoder for this family.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            Self::Nvenc => "h264_nvenc",
            Self::Vaapi => "h264_vaapi",
            Self::VideoToolbox => "h264_videotoolbox",
        }
    }

    /// Whether the host can possibly support this family, judged from cheap
    /// device-node visibility before any encode attempt.
    fn device_visible(&self) -> bool {
        match self {
            Self::Nvenc => Path::new("/dev/nvidia0").exists(),
            Self::Vaapi => render_node().is_some(),
            Self::VideoToolbox => cfg!(target_os = "macos"),
        }
    }
}

/// First DRM render node, for VA-API device selection.
pub(crate) fn render_node() -> Option<String> {
    let entries = std::fs::read_dir("/dev/dri").ok()?;
    let mut nodes: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with("renderD"))
        .map(|name| format!("/dev/dri/{name}"))
        .collect();
    nodes.sort();
    nodes.into_iter().next()
}

#[derive(Debug, Default)]
struct DetectState {
    probed: bool,
    backend: Option<GpuBackend>,
}

/// Process-wide hardware acceleration state.
#[derive(Debug)]
pub struct HardwareAccel {
    ffmpeg_path: String,
    mode: GpuAccel,
    state: tokio::sync::Mutex<DetectState>,
}

impl HardwareAccel {
    pub fn new(ffmpeg_path: impl Into<String>, mode: GpuAccel) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            mode,
            state: tokio::sync::Mutex::new(DetectState::default()),
        }
    }

    /// Families to try for the configured mode, in priority order.
    fn candidates(&self) -> Vec<GpuBackend> {
        match self.mode {
            GpuAccel::None => Vec::new(),
            GpuAccel::Auto => vec![GpuBackend::Nvenc, GpuBackend::Vaapi, GpuBackend::VideoToolbox],
            GpuAccel::Nvidia => vec![GpuBackend::Nvenc],
            GpuAccel::Vaapi => vec![GpuBackend::Vaapi],
            GpuAccel::Videotoolbox => vec![GpuBackend::VideoToolbox],
        }
    }

    /// The selected backend, probing hardware on first use. Sticky until
    /// [`Self::disable`].
    pub async fn backend(&self) -> Option<GpuBackend> {
        let mut state = self.state.lock().await;
        if state.probed {
            return state.backend;
        }

        state.backend = self.detect().await;
        state.probed = true;
        match state.backend {
            Some(backend) => info!("hardware encoder selected: {}", backend.as_str()),
            None => info!("no hardware encoder available, using software encoding"),
        }
        state.backend
    }

    /// Permanently drop hardware acceleration for this process; subsequent
    /// transcodes take the CPU path.
    pub async fn disable(&self) {
        let mut state = self.state.lock().await;
        if state.backend.take().is_some() {
            warn!("hardware encoder disabled after GPU failure");
        }
        state.probed = true;
    }

    pub async fn is_available(&self) -> bool {
        self.backend().await.is_some()
    }

    async fn detect(&self) -> Option<GpuBackend> {
        for candidate in self.candidates() {
            if !candidate.device_visible() {
                debug!("{}: no device visible, skipping", candidate.as_str());
                continue;
            }
            match self.test_encode(candidate).await {
                Ok(()) => {
                    info!("{}: test encode succeeded", candidate.as_str());
                    return Some(candidate);
                }
                Err(message) if is_gpu_error(&message) => {
                    info!("{}: unusable ({})", candidate.as_str(), last_line(&message));
                }
                Err(message) => {
                    warn!(
                        "{}: test encode failed ({})",
                        candidate.as_str(),
                        last_line(&message)
                    );
                }
            }
        }
        None
    }

    /// One-frame encode of a synthetic source through the real driver stack.
    async fn test_encode(&self, backend: GpuBackend) -> Result<(), String> {
        let mut cmd = Command::new(&self.ffmpeg_path);
        cmd.arg("-hide_banner")
            .args(["-f", "lavfi", "-i", "testsrc=duration=0.1:size=320x240:rate=30"]);

        match backend {
            GpuBackend::Vaapi => {
                let device = render_node().unwrap_or_else(|| "/dev/dri/renderD128".to_string());
                cmd.arg("-vaapi_device").arg(device);
                cmd.args(["-vf", "format=nv12,hwupload"]);
            }
            GpuBackend::Nvenc | GpuBackend::VideoToolbox => {}
        }

        cmd.args(["-frames:v", "1", "-c:v", backend.encoder_name(), "-f", "null", "-"]);

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {e}", self.ffmpeg_path))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).into_owned())
        }
    }
}

fn last_line(message: &str) -> &str {
    message.lines().last().unwrap_or(message).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gpu_failures() {
        assert!(is_gpu_error("Cannot load libcuda.so.1"));
        assert!(is_gpu_error("Failed to initialise VAAPI connection"));
        assert!(is_gpu_error("No device available for decoder"));
        assert!(is_gpu_error("b_frames not supported"));
        assert!(is_gpu_error("could not open /dev/dri/renderD128"));
    }

    #[test]
    fn ordinary_failures_are_not_gpu_errors() {
        assert!(!is_gpu_error("Invalid data found when processing input"));
        assert!(!is_gpu_error("No such file or directory"));
        assert!(!is_gpu_error("moov atom not found"));
    }

    #[test]
    fn candidates_respect_mode() {
        let auto = HardwareAccel::new("ffmpeg", GpuAccel::Auto);
        assert_eq!(
            auto.candidates(),
            vec![GpuBackend::Nvenc, GpuBackend::Vaapi, GpuBackend::VideoToolbox]
        );

        let none = HardwareAccel::new("ffmpeg", GpuAccel::None);
        assert!(none.candidates().is_empty());

        let nvidia = HardwareAccel::new("ffmpeg", GpuAccel::Nvidia);
        assert_eq!(nvidia.candidates(), vec![GpuBackend::Nvenc]);
    }

    #[test]
    fn encoder_names() {
        assert_eq!(GpuBackend::Nvenc.encoder_name(), "h264_nvenc");
        assert_eq!(GpuBackend::Vaapi.encoder_name(), "h264_vaapi");
        assert_eq!(GpuBackend::VideoToolbox.encoder_name(), "h264_videotoolbox");
    }

    #[tokio::test]
    async fn disable_is_sticky() {
        let accel = HardwareAccel::new("ffmpeg", GpuAccel::None);
        assert_eq!(accel.backend().await, None);
        accel.disable().await;
        assert!(!accel.is_available().await);
    }
}
