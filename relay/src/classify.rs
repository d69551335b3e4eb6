//! Content classification.

use url::Url;

/// Coarse content category driving the choice between rewrite, inline and
/// relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentCategory {
    Markup,
    Stylesheet,
    Script,
    Image,
    Font,
    Media,
    Opaque,
}

impl ContentCategory {
    /// Categories whose bodies are text the rewriter understands
    pub fn is_textual(self) -> bool {
        matches!(
            self,
            ContentCategory::Markup | ContentCategory::Stylesheet | ContentCategory::Script
        )
    }

    /// Category implied by a path's file extension
    pub fn from_extension(path: &str) -> ContentCategory {
        match extension(path).as_deref() {
            Some("html" | "htm" | "xhtml") => ContentCategory::Markup,
            Some("css") => ContentCategory::Stylesheet,
            Some("js" | "mjs" | "json") => ContentCategory::Script,
            Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "avif" | "svg" | "ico" | "bmp") => {
                ContentCategory::Image
            }
            Some("woff" | "woff2" | "ttf" | "otf" | "eot") => ContentCategory::Font,
            Some("mp4" | "webm" | "m3u8" | "ts" | "m4s" | "mpd" | "mp3" | "ogg" | "m4a" | "aac") => {
                ContentCategory::Media
            }
            _ => ContentCategory::Opaque,
        }
    }
}

/// Map a `Content-Type` header value to a category.
///
/// Total over all inputs; parameters are ignored and matching is
/// case-insensitive. Anything unrecognised (including an empty value) is
/// [`ContentCategory::Opaque`].
pub fn classify(content_type: &str) -> ContentCategory {
    let essence = essence(content_type);
    if essence.starts_with("text/html") || essence == "application/xhtml+xml" {
        ContentCategory::Markup
    } else if essence.starts_with("text/css") {
        ContentCategory::Stylesheet
    } else if essence.contains("javascript")
        || essence.contains("ecmascript")
        || essence.starts_with("application/json")
        || essence.ends_with("+json")
    {
        ContentCategory::Script
    } else if essence.starts_with("image/") {
        ContentCategory::Image
    } else if essence.starts_with("font/")
        || essence.starts_with("application/font-")
        || essence.starts_with("application/x-font-")
        || essence == "application/vnd.ms-fontobject"
    {
        ContentCategory::Font
    } else if essence.starts_with("video/")
        || essence.starts_with("audio/")
        || essence == "application/vnd.apple.mpegurl"
        || essence == "application/x-mpegurl"
        || essence == "application/dash+xml"
    {
        ContentCategory::Media
    } else {
        ContentCategory::Opaque
    }
}

/// Classify by header, falling back to the URL's extension when the header
/// is missing or too generic to tell.
pub fn sniff(content_type: Option<&str>, url: &Url) -> ContentCategory {
    match content_type.map(classify) {
        Some(category) if category != ContentCategory::Opaque => category,
        _ => ContentCategory::from_extension(url.path()),
    }
}

/// MIME type (essence only, lowercased) of a `Content-Type` value
pub fn essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// The `charset` parameter of a `Content-Type` value, lowercased
pub fn charset(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (name, value) = param.split_once('=')?;
        if name.trim().eq_ignore_ascii_case("charset") {
            Some(value.trim().trim_matches('"').to_ascii_lowercase())
        } else {
            None
        }
    })
}

/// Best guess at a MIME type for a URL that came back without one
pub fn guess_mime(url: &Url) -> &'static str {
    match extension(url.path()).as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("woff2") => "font/woff2",
        Some("woff") => "font/woff",
        Some("ttf") => "font/ttf",
        Some("otf") => "font/otf",
        Some("eot") => "application/vnd.ms-fontobject",
        Some("js" | "mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json") => "application/json",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("m3u8") => "application/vnd.apple.mpegurl",
        _ => "application/octet-stream",
    }
}

fn extension(path: &str) -> Option<String> {
    let file = path.rsplit('/').next()?;
    let (_, ext) = file.rsplit_once('.')?;
    Some(ext.to_ascii_lowercase())
}
