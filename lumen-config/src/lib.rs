//! Shared configuration loading for the Lumen media server.
//!
//! All runtime settings come from environment variables (optionally seeded
//! from a `.env` file). The loader is deliberately lookup-driven so tests can
//! feed it a plain map instead of mutating the process environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Default number of scanner workers. Conservative so NFS-backed libraries
/// don't get hammered; raise with `INDEX_WORKERS` on local disks.
pub const DEFAULT_INDEX_WORKERS: usize = 3;

const DEFAULT_INDEX_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_THUMBNAIL_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Hardware acceleration policy, from `GPU_ACCEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuAccel {
    /// Never use a hardware encoder.
    None,
    /// Probe NVENC, then VA-API, then VideoToolbox.
    #[default]
    Auto,
    /// Only consider NVENC.
    Nvidia,
    /// Only consider VA-API.
    Vaapi,
    /// Only consider VideoToolbox.
    Videotoolbox,
}

impl FromStr for GpuAccel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "off" => Ok(Self::None),
            "auto" => Ok(Self::Auto),
            "nvidia" | "nvenc" => Ok(Self::Nvidia),
            "vaapi" => Ok(Self::Vaapi),
            "videotoolbox" => Ok(Self::Videotoolbox),
            other => Err(format!(
                "unknown GPU mode {other:?} (expected none, auto, nvidia, vaapi, or videotoolbox)"
            )),
        }
    }
}

/// Non-fatal findings from [`Config::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    MediaDirMissing(PathBuf),
    ManyIndexWorkers(usize),
    ShortPollInterval(Duration),
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MediaDirMissing(p) => {
                write!(f, "media directory {} does not exist yet", p.display())
            }
            Self::ManyIndexWorkers(n) => {
                write!(f, "{n} index workers is a lot; NFS mounts may struggle")
            }
            Self::ShortPollInterval(d) => {
                write!(f, "poll interval {d:?} is under 5s and will stat the library hard")
            }
        }
    }
}

/// Runtime configuration for the server and its core services.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source media tree (read-only).
    pub media_dir: PathBuf,
    /// Derived artifacts: `<cache_dir>/thumbnails`, `<cache_dir>/transcodes`.
    pub cache_dir: PathBuf,
    /// Directory holding the metadata database file.
    pub database_dir: PathBuf,

    /// Periodic full-reindex cadence.
    pub index_interval: Duration,
    /// Change-detector polling cadence.
    pub poll_interval: Duration,
    /// Periodic thumbnail sweep cadence.
    pub thumbnail_interval: Duration,
    /// Scanner worker count.
    pub index_workers: usize,

    pub gpu_accel: GpuAccel,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    pub host: String,
    pub port: u16,
}

impl Config {
    /// Load configuration from the process environment, after seeding it from
    /// a `.env` file when one is present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary lookup function.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let media_dir = lookup("MEDIA_DIR")
            .map(PathBuf::from)
            .ok_or(ConfigError::MissingVar("MEDIA_DIR"))?;
        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("cache"));
        let database_dir = lookup("DATABASE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data"));

        let index_interval =
            parse_duration_var(&lookup, "INDEX_INTERVAL", DEFAULT_INDEX_INTERVAL)?;
        let poll_interval = parse_duration_var(&lookup, "POLL_INTERVAL", DEFAULT_POLL_INTERVAL)?;
        let thumbnail_interval =
            parse_duration_var(&lookup, "THUMBNAIL_INTERVAL", DEFAULT_THUMBNAIL_INTERVAL)?;

        let index_workers = match lookup("INDEX_WORKERS") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ConfigError::InvalidVar {
                    var: "INDEX_WORKERS",
                    value: raw,
                    reason: "expected a positive integer".into(),
                })?,
            None => DEFAULT_INDEX_WORKERS,
        };

        let gpu_accel = match lookup("GPU_ACCEL") {
            Some(raw) => raw
                .parse::<GpuAccel>()
                .map_err(|reason| ConfigError::InvalidVar {
                    var: "GPU_ACCEL",
                    value: raw,
                    reason,
                })?,
            None => GpuAccel::default(),
        };

        let port = match lookup("SERVER_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|e| ConfigError::InvalidVar {
                    var: "SERVER_PORT",
                    value: raw,
                    reason: e.to_string(),
                })?,
            None => 8080,
        };

        Ok(Self {
            media_dir,
            cache_dir,
            database_dir,
            index_interval,
            poll_interval,
            thumbnail_interval,
            index_workers,
            gpu_accel,
            ffmpeg_path: lookup("FFMPEG_PATH").unwrap_or_else(|| "ffmpeg".into()),
            ffprobe_path: lookup("FFPROBE_PATH").unwrap_or_else(|| "ffprobe".into()),
            host: lookup("SERVER_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
        })
    }

    /// Load from a plain map; test helper.
    pub fn from_map(vars: &HashMap<&str, &str>) -> Result<Self, ConfigError> {
        Self::from_lookup(|var| vars.get(var).map(|v| v.to_string()))
    }

    /// Sanity-check the loaded configuration. Warnings are reported, not
    /// fatal: a missing media dir may simply be an unmounted share.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        if !self.media_dir.is_dir() {
            warnings.push(ConfigWarning::MediaDirMissing(self.media_dir.clone()));
        }
        if self.index_workers > 16 {
            warnings.push(ConfigWarning::ManyIndexWorkers(self.index_workers));
        }
        if self.poll_interval < Duration::from_secs(5) {
            warnings.push(ConfigWarning::ShortPollInterval(self.poll_interval));
        }
        warnings
    }

    /// `<cache_dir>/thumbnails`
    pub fn thumbnail_dir(&self) -> PathBuf {
        self.cache_dir.join("thumbnails")
    }

    /// `<cache_dir>/transcodes`
    pub fn transcode_dir(&self) -> PathBuf {
        self.cache_dir.join("transcodes")
    }

    /// Path of the metadata database file.
    pub fn database_file(&self) -> PathBuf {
        self.database_dir.join("lumen.db")
    }
}

fn parse_duration_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(var) {
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidVar {
            var,
            value: raw,
            reason: e.to_string(),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("MEDIA_DIR", "/srv/media")])
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_map(&base_vars()).unwrap();
        assert_eq!(config.media_dir, PathBuf::from("/srv/media"));
        assert_eq!(config.index_workers, DEFAULT_INDEX_WORKERS);
        assert_eq!(config.index_interval, Duration::from_secs(1800));
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.gpu_accel, GpuAccel::Auto);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.port, 8080);
    }

    #[test]
    fn media_dir_is_required() {
        let err = Config::from_map(&HashMap::new()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar("MEDIA_DIR")));
    }

    #[test]
    fn durations_parse_humantime() {
        let mut vars = base_vars();
        vars.insert("INDEX_INTERVAL", "15m");
        vars.insert("POLL_INTERVAL", "10s");
        vars.insert("THUMBNAIL_INTERVAL", "1h");
        let config = Config::from_map(&vars).unwrap();
        assert_eq!(config.index_interval, Duration::from_secs(900));
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.thumbnail_interval, Duration::from_secs(3600));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let mut vars = base_vars();
        vars.insert("INDEX_INTERVAL", "soon");
        assert!(Config::from_map(&vars).is_err());
    }

    #[test]
    fn gpu_accel_modes_parse() {
        for (raw, expected) in [
            ("none", GpuAccel::None),
            ("auto", GpuAccel::Auto),
            ("nvidia", GpuAccel::Nvidia),
            ("vaapi", GpuAccel::Vaapi),
            ("videotoolbox", GpuAccel::Videotoolbox),
            ("NVENC", GpuAccel::Nvidia),
        ] {
            let mut vars = base_vars();
            vars.insert("GPU_ACCEL", raw);
            assert_eq!(Config::from_map(&vars).unwrap().gpu_accel, expected, "{raw}");
        }

        let mut vars = base_vars();
        vars.insert("GPU_ACCEL", "quantum");
        assert!(Config::from_map(&vars).is_err());
    }

    #[test]
    fn worker_override() {
        let mut vars = base_vars();
        vars.insert("INDEX_WORKERS", "8");
        assert_eq!(Config::from_map(&vars).unwrap().index_workers, 8);

        vars.insert("INDEX_WORKERS", "0");
        assert!(Config::from_map(&vars).is_err());
    }

    #[test]
    fn derived_paths() {
        let mut vars = base_vars();
        vars.insert("CACHE_DIR", "/var/cache/lumen");
        vars.insert("DATABASE_DIR", "/var/lib/lumen");
        let config = Config::from_map(&vars).unwrap();
        assert_eq!(config.thumbnail_dir(), PathBuf::from("/var/cache/lumen/thumbnails"));
        assert_eq!(config.transcode_dir(), PathBuf::from("/var/cache/lumen/transcodes"));
        assert_eq!(config.database_file(), PathBuf::from("/var/lib/lumen/lumen.db"));
    }

    #[test]
    fn validate_warns_on_missing_media_dir() {
        let mut vars = base_vars();
        vars.insert("MEDIA_DIR", "/definitely/not/here");
        let config = Config::from_map(&vars).unwrap();
        let warnings = config.validate();
        assert!(warnings
            .iter()
            .any(|w| matches!(w, ConfigWarning::MediaDirMissing(_))));
    }
}
