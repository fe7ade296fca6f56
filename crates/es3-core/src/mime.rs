//! Content-Type table and compressibility hints, keyed by file extension.
//!
//! Process-wide and read-only; uploads use it for the `Content-Type` header
//! and the compressor uses it to skip formats that are already entropy-coded.

use std::path::Path;

/// Content-Type for an upload, by extension. Unknown extensions get the
/// S3 default.
pub fn content_type_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("txt") | Some("log") | Some("cfg") | Some("conf") => "text/plain",
        Some("htm") | Some("html") => "text/html",
        Some("css") => "text/css",
        Some("csv") => "text/csv",
        Some("xml") => "text/xml",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("pdf") => "application/pdf",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/x-gzip",
        Some("bz2") => "application/x-bzip2",
        Some("xz") => "application/x-xz",
        Some("tar") => "application/x-tar",
        Some("7z") => "application/x-7z-compressed",
        Some("rar") => "application/x-rar-compressed",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("bmp") => "image/bmp",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("flac") => "audio/flac",
        Some("mp4") => "video/mp4",
        Some("mkv") => "video/x-matroska",
        Some("avi") => "video/x-msvideo",
        Some("webm") => "video/webm",
        Some("bam") => "application/octet-stream",
        _ => "application/octet-stream",
    }
}

/// True when the format is already compressed and gzip would only waste CPU.
pub fn is_precompressed(path: &Path) -> bool {
    matches!(
        extension_of(path).as_deref(),
        Some("gz")
            | Some("tgz")
            | Some("bz2")
            | Some("xz")
            | Some("zip")
            | Some("7z")
            | Some("rar")
            | Some("jpg")
            | Some("jpeg")
            | Some("png")
            | Some("gif")
            | Some("mp3")
            | Some("ogg")
            | Some("flac")
            | Some("mp4")
            | Some("mkv")
            | Some("avi")
            | Some("webm")
            | Some("bam")
    )
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
}
