//! Video probing via the external `ffprobe` tool.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::error::{MediaError, Result};

/// Codecs browsers decode natively; anything else forces a re-encode.
pub const COMPATIBLE_CODECS: &[&str] = &["h264", "vp8", "vp9", "av1"];

/// Containers browsers play natively; anything else forces a remux at least.
pub const COMPATIBLE_CONTAINERS: &[&str] = &["mp4", "webm", "ogg"];

/// Probe result for one video source. Dimensions are already rounded up to
/// even values (hardware encoders refuse odd sizes).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub codec: String,
    #[serde(rename = "needsTranscode")]
    pub needs_transcode: bool,
}

/// Round an odd dimension up to the next even integer.
pub fn round_even(dim: u32) -> u32 {
    dim + (dim & 1)
}

/// Thin wrapper around the `ffprobe` executable.
#[derive(Debug, Clone)]
pub struct Prober {
    ffprobe_path: String,
}

impl Prober {
    pub fn new(ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
        }
    }

    /// Probe `path` and derive the transcode decision from its codec and
    /// container extension.
    pub async fn probe(&self, path: &Path) -> Result<VideoInfo> {
        let output = tokio::process::Command::new(&self.ffprobe_path)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_streams",
                "-select_streams",
                "v:0",
                "-show_format",
            ])
            .arg(path)
            .output()
            .await
            .map_err(|e| MediaError::Probe(format!("failed to run {}: {e}", self.ffprobe_path)))?;

        if !output.status.success() {
            return Err(MediaError::Probe(format!(
                "ffprobe exited with {} for {}",
                output.status,
                path.display()
            )));
        }

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        let info = parse_probe_output(&output.stdout, &extension)?;
        debug!(path = %path.display(), ?info, "probed video");
        Ok(info)
    }
}

/// Parse ffprobe's JSON output. Split out of [`Prober::probe`] so the format
/// handling is testable without the executable.
pub fn parse_probe_output(raw: &[u8], container_ext: &str) -> Result<VideoInfo> {
    let json: serde_json::Value = serde_json::from_slice(raw)
        .map_err(|e| MediaError::Probe(format!("unparseable ffprobe output: {e}")))?;

    let stream = json["streams"]
        .as_array()
        .and_then(|s| s.first())
        .ok_or_else(|| MediaError::Probe("no video stream found".into()))?;

    let codec = stream["codec_name"]
        .as_str()
        .unwrap_or("unknown")
        .to_ascii_lowercase();
    let width = stream["width"].as_u64().unwrap_or(0) as u32;
    let height = stream["height"].as_u64().unwrap_or(0) as u32;

    // Duration lives on the stream for most containers and on the format
    // section for the rest; both arrive as strings.
    let duration = stream["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .or_else(|| {
            json["format"]["duration"]
                .as_str()
                .and_then(|d| d.parse::<f64>().ok())
        })
        .unwrap_or(0.0);

    let codec_ok = COMPATIBLE_CODECS.contains(&codec.as_str());
    let container_ok = COMPATIBLE_CONTAINERS.contains(&container_ext);

    Ok(VideoInfo {
        duration,
        width: round_even(width),
        height: round_even(height),
        codec,
        needs_transcode: !(codec_ok && container_ok),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_json(codec: &str, width: u32, height: u32) -> Vec<u8> {
        format!(
            r#"{{
                "streams": [{{
                    "codec_name": "{codec}",
                    "width": {width},
                    "height": {height},
                    "duration": "93.480000"
                }}],
                "format": {{ "duration": "93.513000" }}
            }}"#
        )
        .into_bytes()
    }

    #[test]
    fn parses_stream_fields() {
        let info = parse_probe_output(&probe_json("h264", 1920, 1080), "mp4").unwrap();
        assert_eq!(info.codec, "h264");
        assert_eq!(info.width, 1920);
        assert_eq!(info.height, 1080);
        assert!((info.duration - 93.48).abs() < 1e-6);
        assert!(!info.needs_transcode);
    }

    #[test]
    fn odd_dimensions_round_up() {
        let info = parse_probe_output(&probe_json("h264", 1279, 719), "mp4").unwrap();
        assert_eq!(info.width, 1280);
        assert_eq!(info.height, 720);
    }

    #[test]
    fn incompatible_codec_triggers_transcode() {
        let info = parse_probe_output(&probe_json("hevc", 1920, 1080), "mp4").unwrap();
        assert!(info.needs_transcode);
    }

    #[test]
    fn incompatible_container_triggers_transcode() {
        let info = parse_probe_output(&probe_json("h264", 1920, 1080), "mkv").unwrap();
        assert!(info.needs_transcode);
    }

    #[test]
    fn compatible_webm_passes_through() {
        let info = parse_probe_output(&probe_json("vp9", 640, 480), "webm").unwrap();
        assert!(!info.needs_transcode);
    }

    #[test]
    fn format_duration_is_fallback() {
        let raw = br#"{
            "streams": [{"codec_name": "h264", "width": 320, "height": 240}],
            "format": {"duration": "12.000000"}
        }"#;
        let info = parse_probe_output(raw, "mp4").unwrap();
        assert!((info.duration - 12.0).abs() < 1e-6);
    }

    #[test]
    fn missing_stream_is_an_error() {
        let raw = br#"{"streams": [], "format": {}}"#;
        assert!(matches!(
            parse_probe_output(raw, "mp4"),
            Err(MediaError::Probe(_))
        ));
    }

    #[test]
    fn garbage_output_is_an_error() {
        assert!(parse_probe_output(b"not json", "mp4").is_err());
    }

    #[test]
    fn round_even_is_identity_on_even() {
        assert_eq!(round_even(1920), 1920);
        assert_eq!(round_even(1921), 1922);
        assert_eq!(round_even(0), 0);
        assert_eq!(round_even(1), 2);
    }
}
