//! Content-type detection by file extension.

use std::path::Path;

/// Maps a path's extension onto a Content-Type value. Unknown extensions
/// are served as opaque bytes.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext,
        None => return "application/octet-stream",
    };

    if ext.eq_ignore_ascii_case("html") {
        "text/html"
    } else if ext.eq_ignore_ascii_case("css") {
        "text/css"
    } else if ext.eq_ignore_ascii_case("js") {
        "application/javascript"
    } else if ext.eq_ignore_ascii_case("png") {
        "image/png"
    } else if ext.eq_ignore_ascii_case("jpg") {
        "image/jpeg"
    } else if ext.eq_ignore_ascii_case("gif") {
        "image/gif"
    } else {
        "application/octet-stream"
    }
}
