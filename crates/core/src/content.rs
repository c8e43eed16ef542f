use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::debug;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Files above this size are not line-counted.
const LINE_COUNT_LIMIT: u64 = 8 * 1024 * 1024;

/// Content type from the file extension alone.
pub fn detect_content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        Some("webp") => "image/webp",
        Some("heic") => "image/heic",
        Some("svg") => "image/svg+xml",
        Some("pdf") => "application/pdf",
        Some("doc") => "application/msword",
        Some("docx") => {
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        }
        Some("xls") => "application/vnd.ms-excel",
        Some("xlsx") => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        Some("ppt") => "application/vnd.ms-powerpoint",
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        Some("odt") => "application/vnd.oasis.opendocument.text",
        Some("rtf") => "application/rtf",
        Some("txt") | Some("text") | Some("log") | Some("ini") | Some("cfg") | Some("conf") => {
            "text/plain"
        }
        Some("md") | Some("markdown") => "text/markdown",
        Some("csv") => "text/csv",
        Some("tsv") => "text/tab-separated-values",
        Some("html") | Some("htm") => "text/html",
        Some("xml") => "application/xml",
        Some("json") => "application/json",
        Some("yaml") | Some("yml") => "application/yaml",
        Some("toml") => "application/toml",
        Some("rs") | Some("py") | Some("js") | Some("ts") | Some("go") | Some("java")
        | Some("c") | Some("h") | Some("cpp") | Some("sh") => "text/x-source",
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("flac") => "audio/flac",
        Some("mp4") | Some("m4v") => "video/mp4",
        Some("mov") => "video/quicktime",
        Some("mkv") => "video/x-matroska",
        Some("zip") => "application/zip",
        Some("gz") | Some("tgz") => "application/gzip",
        Some("tar") => "application/x-tar",
        Some("7z") => "application/x-7z-compressed",
        _ => OCTET_STREAM,
    }
}

/// `image/png` -> `image`.
pub fn primary_type(content_type: &str) -> &str {
    content_type.split('/').next().unwrap_or(content_type)
}

pub fn is_textual(content_type: &str) -> bool {
    primary_type(content_type) == "text"
        || matches!(
            content_type,
            "application/json" | "application/xml" | "application/yaml" | "application/toml"
        )
}

/// Type-specific sidecar metadata. Extraction failures are reported inside
/// the returned object rather than failing the file.
pub fn extract_metadata(path: &Path, content_type: &str, size_bytes: u64) -> Value {
    let mut meta = Map::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        meta.insert("extension".into(), json!(ext.to_lowercase()));
    }
    if primary_type(content_type) == "image" {
        match image::image_dimensions(path) {
            Ok((width, height)) => {
                meta.insert("width".into(), json!(width));
                meta.insert("height".into(), json!(height));
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "image dimensions unavailable");
                meta.insert("metadata_error".into(), json!(err.to_string()));
            }
        }
    } else if content_type == "application/pdf" {
        match lopdf::Document::load(path) {
            Ok(doc) => {
                meta.insert("page_count".into(), json!(doc.get_pages().len()));
            }
            Err(err) => {
                debug!(path = %path.display(), error = %err, "pdf page count unavailable");
                meta.insert("metadata_error".into(), json!(err.to_string()));
            }
        }
    } else if is_textual(content_type) && size_bytes <= LINE_COUNT_LIMIT {
        match count_lines(path) {
            Ok(lines) => {
                meta.insert("line_count".into(), json!(lines));
            }
            Err(err) => {
                meta.insert("metadata_error".into(), json!(err.to_string()));
            }
        }
    }
    Value::Object(meta)
}

fn count_lines(path: &Path) -> std::io::Result<usize> {
    let reader = BufReader::new(File::open(path)?);
    let mut count = 0usize;
    for line in reader.split(b'\n') {
        line?;
        count += 1;
    }
    Ok(count)
}

/// Up to `max_bytes` of leading text, cut back to a char boundary. `None` for
/// binary content.
pub fn read_excerpt(path: &Path, max_bytes: usize) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut buf = Vec::with_capacity(max_bytes.min(64 * 1024));
    file.take(max_bytes as u64).read_to_end(&mut buf).ok()?;
    if buf.contains(&0) {
        return None;
    }
    let text = match std::str::from_utf8(&buf) {
        Ok(text) => text,
        Err(err) if err.error_len().is_none() => {
            // truncated mid-character
            std::str::from_utf8(&buf[..err.valid_up_to()]).ok()?
        }
        Err(_) => return None,
    };
    Some(text.to_string())
}
