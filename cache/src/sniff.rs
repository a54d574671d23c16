//! Content-type detection from raw bytes, and the checks between the
//! detected type and whatever the server claimed.

/// How many bytes the sniffer wants before committing to a text type.
pub const SNIFF_LEN: usize = 256;

const HTML_MARKERS: &[&str] = &[
    "<!doctype html", "<html", "<head", "<title", "<body", "<frameset", "<!--",
];

/// Detects a content type from the first bytes of a body.
///
/// Returns the type and whether the verdict is final. Magic numbers and
/// HTML markers are final immediately; the text/binary distinction is
/// final only once [`SNIFF_LEN`] bytes (or end of data) have been seen.
pub fn from_data(data: &[u8]) -> (&'static str, bool) {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return ("image/png", true);
    }
    if data.starts_with(b"GIF8") {
        return ("image/gif", true);
    }
    if data.starts_with(b"\xff\xd8") {
        return ("image/jpeg", true);
    }

    let head = &data[..data.len().min(SNIFF_LEN)];
    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start().to_ascii_lowercase();
    if HTML_MARKERS.iter().any(|marker| trimmed.starts_with(marker)) {
        return ("text/html", true);
    }

    let binary = head
        .iter()
        .any(|&b| b < 0x20 && !matches!(b, b'\t' | b'\n' | b'\r' | 0x0c));
    let verdict = if binary {
        "application/octet-stream"
    } else {
        "text/plain"
    };
    (verdict, data.len() >= SNIFF_LEN)
}

/// Splits a `Content-Type` value into essence, major type and charset.
pub fn parse_type(ctype: &str) -> (String, String, Option<String>) {
    match ctype.trim().parse::<mime::Mime>() {
        Ok(parsed) => {
            let charset = parsed
                .get_param(mime::CHARSET)
                .map(|cs| cs.as_str().to_string());
            (
                parsed.essence_str().to_ascii_lowercase(),
                parsed.type_().as_str().to_ascii_lowercase(),
                charset,
            )
        }
        Err(_) => {
            // A bare "; charset=x" still deserves its charset extracted.
            let charset = ctype
                .split(';')
                .filter_map(|p| p.trim().strip_prefix("charset="))
                .map(|cs| cs.trim_matches('"').to_string())
                .next();
            let first = ctype.split(';').next().unwrap_or("").trim();
            // A leading "charset=x" is a parameter, not a media type.
            let essence = if first.contains('=') {
                String::new()
            } else {
                first.to_ascii_lowercase()
            };
            let major = essence.split('/').next().unwrap_or("").to_string();
            (essence, major, charset)
        }
    }
}

/// Whether the server-declared type is plausible for the detected one.
///
/// Generous on purpose: only combinations that would make the browser
/// render garbage (say, an image declared as HTML) count as mismatches.
pub fn declared_type_matches(declared: Option<&str>, detected: &str) -> bool {
    let Some(declared) = declared else { return true };
    let (decl_essence, decl_major, _) = parse_type(declared);
    let (det_essence, det_major, _) = parse_type(detected);
    if decl_essence == det_essence || decl_major == det_major {
        return true;
    }
    // Text sniffed in a body declared as something structured is fine:
    // JSON, XML and friends all read as text/plain to the sniffer.
    if det_essence == "text/plain" && decl_major == "application" {
        return true;
    }
    if decl_essence == "application/xhtml+xml" && det_essence == "text/html" {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_magic_is_final() {
        assert_eq!(from_data(b"\x89PNG\r\n\x1a\nrest"), ("image/png", true));
        assert_eq!(from_data(b"GIF89a..."), ("image/gif", true));
        assert_eq!(from_data(b"\xff\xd8\xff\xe0"), ("image/jpeg", true));
    }

    #[test]
    fn html_markers_are_final() {
        assert_eq!(from_data(b"  <!DOCTYPE HTML><html>"), ("text/html", true));
        assert_eq!(from_data(b"<html lang=\"en\">"), ("text/html", true));
    }

    #[test]
    fn short_text_is_tentative() {
        let (ctype, certain) = from_data(b"hello");
        assert_eq!(ctype, "text/plain");
        assert!(!certain);
        let long = b"x".repeat(SNIFF_LEN);
        assert_eq!(from_data(&long), ("text/plain", true));
    }

    #[test]
    fn control_bytes_mean_binary() {
        let mut data = b"ok so far".to_vec();
        data.push(0);
        data.resize(SNIFF_LEN, b'a');
        assert_eq!(from_data(&data), ("application/octet-stream", true));
    }

    #[test]
    fn type_parsing_extracts_charset() {
        let (essence, major, charset) = parse_type("Text/HTML; charset=ISO-8859-1");
        assert_eq!(essence, "text/html");
        assert_eq!(major, "text");
        assert_eq!(charset.as_deref(), Some("ISO-8859-1"));
        let (_, _, none) = parse_type("text/html");
        assert_eq!(none, None);
    }

    #[test]
    fn charset_only_declaration_has_no_essence() {
        let (essence, major, charset) = parse_type("charset=utf-8");
        assert_eq!(essence, "");
        assert_eq!(major, "");
        assert_eq!(charset.as_deref(), Some("utf-8"));
    }

    #[test]
    fn mismatch_rules() {
        assert!(declared_type_matches(None, "text/html"));
        assert!(declared_type_matches(Some("text/html"), "text/html"));
        assert!(declared_type_matches(Some("text/html"), "text/plain"));
        assert!(declared_type_matches(Some("application/json"), "text/plain"));
        assert!(declared_type_matches(
            Some("application/xhtml+xml"),
            "text/html"
        ));
        assert!(!declared_type_matches(Some("image/png"), "text/html"));
        assert!(!declared_type_matches(
            Some("text/html"),
            "application/octet-stream"
        ));
    }
}
