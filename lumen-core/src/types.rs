use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Image file extensions recognized by the indexer (lowercase).
pub const IMAGE_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "bmp", "webp", "svg", "ico", "tiff", "tif", "heic", "heif",
    "avif", "jxl", "raw", "cr2", "nef", "arw", "dng",
];

/// Video file extensions recognized by the indexer (lowercase).
pub const VIDEO_EXTENSIONS: &[&str] = &[
    "mp4", "mkv", "avi", "mov", "wmv", "flv", "webm", "m4v", "mpeg", "mpg", "3gp", "ts",
];

/// Playlist file extensions recognized by the indexer (lowercase).
pub const PLAYLIST_EXTENSIONS: &[&str] = &["wpl"];

/// Classification of an indexed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Folder,
    Image,
    Video,
    Playlist,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Folder => "folder",
            Self::Image => "image",
            Self::Video => "video",
            Self::Playlist => "playlist",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "folder" => Some(Self::Folder),
            "image" => Some(Self::Image),
            "video" => Some(Self::Video),
            "playlist" => Some(Self::Playlist),
            _ => None,
        }
    }

    /// Kind for a file extension, or `None` for extensions the library does
    /// not catalogue.
    pub fn for_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Image)
        } else if VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Video)
        } else if PLAYLIST_EXTENSIONS.contains(&ext.as_str()) {
            Some(Self::Playlist)
        } else {
            None
        }
    }

    /// Kind for a file path, based on its extension.
    pub fn for_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::for_extension)
    }
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One catalogued entry of the media tree.
///
/// `path` is repository-relative, `/`-separated, with no leading slash, and
/// is the primary key in the metadata store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub parent_path: String,
    pub kind: MediaKind,
    pub size: u64,
    pub modified: DateTime<Utc>,
    pub mime: String,
    pub fingerprint: String,
    #[serde(default)]
    pub favorite: bool,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Build a record for a scanned entry. Folders carry size 0 and a
    /// directory MIME label; files get a MIME and fingerprint derived from
    /// the relative path, size, and mtime.
    pub fn new(
        rel_path: String,
        kind: MediaKind,
        size: u64,
        modified: DateTime<Utc>,
    ) -> Self {
        let (name, parent_path) = split_rel_path(&rel_path);
        let size = if kind == MediaKind::Folder { 0 } else { size };
        let mime = match kind {
            MediaKind::Folder => "inode/directory".to_string(),
            _ => mime_for_path(&rel_path).to_string(),
        };
        let fingerprint = fingerprint(&rel_path, size, modified);
        Self {
            name,
            parent_path,
            path: rel_path,
            kind,
            size,
            modified,
            mime,
            fingerprint,
            favorite: false,
            updated_at: modified,
        }
    }
}

/// 128-bit content fingerprint over `path|size|modtime`. A change signal and
/// cache key, not a cryptographic identity.
pub fn fingerprint(rel_path: &str, size: u64, modified: DateTime<Utc>) -> String {
    let digest = md5::compute(format!("{rel_path}|{size}|{}", modified.timestamp()));
    format!("{digest:x}")
}

/// Split a relative path into `(name, parent_path)`. Root children get an
/// empty parent.
pub fn split_rel_path(rel_path: &str) -> (String, String) {
    match rel_path.rsplit_once('/') {
        Some((parent, name)) => (name.to_string(), parent.to_string()),
        None => (rel_path.to_string(), String::new()),
    }
}

/// Repository-relative form of `path` under `root`: forward slashes on every
/// host OS, no leading separator.
pub fn rel_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for comp in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(comp.as_os_str().to_str()?);
    }
    Some(out)
}

/// MIME label for a path, from its lowercase extension.
pub fn mime_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "tiff" | "tif" => "image/tiff",
        "heic" | "heif" => "image/heif",
        "avif" => "image/avif",
        "jxl" => "image/jxl",
        "raw" | "cr2" | "nef" | "arw" | "dng" => "image/x-raw",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "wmv" => "video/x-ms-wmv",
        "flv" => "video/x-flv",
        "webm" => "video/webm",
        "mpg" | "mpeg" => "video/mpeg",
        "3gp" => "video/3gpp",
        "ts" => "video/mp2t",
        "wpl" => "application/vnd.ms-wpl",
        _ => "application/octet-stream",
    }
}

/// Convert unix seconds from the store into a UTC timestamp.
pub fn datetime_from_unix(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

/// Convert a `SystemTime` (file mtime) into a UTC timestamp, truncated to
/// whole seconds so fingerprints are stable across filesystems.
pub fn datetime_from_system(time: std::time::SystemTime) -> DateTime<Utc> {
    let secs = time
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    datetime_from_unix(secs)
}
