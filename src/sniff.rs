use std::path::Path;

/// Bytes of the body inspected before it is written.
pub const SNIFF_LEN: usize = 512;

pub const FALLBACK_MIME: &str = "application/octet-stream";
const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

const PREVIEWABLE: &[&str] = &[
    "image/",
    "video/",
    "audio/",
    "text/",
    "application/pdf",
    "application/json",
    "application/xml",
];

/// Picks a content type from the leading bytes, then the client's file
/// extension, then the generic binary type. The client's declared type is
/// never consulted.
pub fn detect(prefix: &[u8], filename: &str) -> String {
    if let Some(kind) = infer::get(prefix) {
        // markup is shown as source, never rendered
        if is_markup(kind.mime_type()) {
            return TEXT_PLAIN.to_string();
        }
        return kind.mime_type().to_string();
    }
    if let Some(mime) = utf16_text(prefix) {
        return mime.to_string();
    }
    if looks_like_text(prefix) {
        return TEXT_PLAIN.to_string();
    }
    if let Some(ext) = Path::new(filename).extension().and_then(|e| e.to_str()) {
        let guessed = actix_files::file_extension_to_mime(ext);
        if guessed.essence_str() != FALLBACK_MIME && !is_markup(guessed.essence_str()) {
            return guessed.to_string();
        }
    }
    FALLBACK_MIME.to_string()
}

/// Types a browser would parse as a document able to run script.
fn is_markup(mime: &str) -> bool {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    matches!(essence, "text/html" | "text/xml" | "application/xml")
        || essence.ends_with("+xml")
}

fn utf16_text(prefix: &[u8]) -> Option<&'static str> {
    match prefix {
        [0xFF, 0xFE, ..] => Some("text/plain; charset=utf-16le"),
        [0xFE, 0xFF, ..] => Some("text/plain; charset=utf-16be"),
        _ => None,
    }
}

/// Whether a browser may render this type in place instead of downloading it.
pub fn is_previewable(mime: &str) -> bool {
    PREVIEWABLE.iter().any(|p| mime.starts_with(p))
}

fn looks_like_text(prefix: &[u8]) -> bool {
    let valid = match std::str::from_utf8(prefix) {
        Ok(_) => true,
        // a multi-byte character cut off by the prefix window
        Err(e) => e.error_len().is_none(),
    };
    valid && !prefix.iter().any(|b| is_binary_byte(*b))
}

fn is_binary_byte(b: u8) -> bool {
    matches!(b, 0x00..=0x08 | 0x0B | 0x0E..=0x1A | 0x1C..=0x1F)
}
