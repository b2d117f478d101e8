//! Binary-safe `multipart/form-data` parsing.
//!
//! Browsers upload files as raw bytes, so the parser never decodes the part
//! bodies; only the small header block preceding each body is decoded as
//! text, and leniently at that (malformed header bytes must not abort
//! parsing). Parsing works on a complete request body:
//!
//! 1. Locate successive `--boundary` byte sequences by exact match.
//! 2. The bytes between one boundary line and the next (minus the trailing
//!    CRLF) are one raw part.
//! 3. Within a part, the first CRLF CRLF separates headers from body.
//! 4. `filename="..."` is pattern-matched out of the headers and
//!    percent-decoded, keeping the raw value if decoding fails.
//!
//! Parts without a filename and parts with empty bodies are dropped. The
//! terminal `--boundary--` marker ends parsing. A body without any boundary
//! yields an empty list rather than an error: malformed uploads simply
//! produce zero files.

use percent_encoding::percent_decode_str;

/// One file part extracted from a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    /// Decoded filename from the part headers
    pub filename: String,
    /// Raw part body
    pub data: Vec<u8>,
}

/// Parse a complete multipart body into its file parts.
#[must_use]
pub fn parse(body: &[u8], boundary: &str) -> Vec<UploadedPart> {
    let delimiter = format!("--{boundary}").into_bytes();
    let mut parts = Vec::new();

    let Some(first) = find_bytes(body, &delimiter, 0) else {
        return parts;
    };

    let mut pos = first;
    loop {
        pos += delimiter.len();

        // `--boundary--` terminates the body.
        if body[pos..].starts_with(b"--") {
            break;
        }

        if body[pos..].starts_with(b"\r\n") {
            pos += 2;
        } else if body[pos..].starts_with(b"\n") {
            pos += 1;
        }

        let Some(next) = find_bytes(body, &delimiter, pos) else {
            break;
        };

        let mut segment = &body[pos..next];
        if segment.ends_with(b"\r\n") {
            segment = &segment[..segment.len() - 2];
        }

        if let Some(part) = parse_part(segment) {
            parts.push(part);
        }

        pos = next;
    }

    parts
}

/// Extract the boundary token from a `Content-Type` header value.
///
/// Accepts both quoted and bare parameter forms. Returns `None` when the
/// value is not multipart or carries no boundary.
#[must_use]
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    if !value.trim_start().starts_with("multipart/") {
        return None;
    }

    let param = value
        .split(';')
        .map(str::trim)
        .find_map(|p| p.strip_prefix("boundary="))?;

    let boundary = param.trim_matches('"');
    if boundary.is_empty() {
        None
    } else {
        Some(boundary.to_string())
    }
}

fn parse_part(segment: &[u8]) -> Option<UploadedPart> {
    let split = find_bytes(segment, b"\r\n\r\n", 0)?;
    let data = segment[split + 4..].to_vec();
    if data.is_empty() {
        return None;
    }

    // Headers are the only text in the part; decode leniently.
    let headers = String::from_utf8_lossy(&segment[..split]);
    let filename = extract_filename(&headers)?;

    Some(UploadedPart { filename, data })
}

/// Pull `filename="..."` out of a part's header block.
fn extract_filename(headers: &str) -> Option<String> {
    let start = headers.find("filename=\"")? + "filename=\"".len();
    let end = headers[start..].find('"')? + start;
    let raw = &headers[start..end];
    if raw.is_empty() {
        return None;
    }

    // Tolerate undecodable names by keeping the raw value.
    match percent_decode_str(raw).decode_utf8() {
        Ok(decoded) => Some(decoded.into_owned()),
        Err(_) => Some(raw.to_string()),
    }
}

/// Find `needle` in `haystack` at or after `from` by exact byte match.
fn find_bytes(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() || from > haystack.len() - needle.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "----DroplinkBoundary7MA4YWxk";

    fn encode(parts: &[(Option<&str>, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (filename, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match filename {
                Some(name) => body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"files\"; filename=\"{name}\"\r\n"
                    )
                    .as_bytes(),
                ),
                None => body.extend_from_slice(
                    b"Content-Disposition: form-data; name=\"field\"\r\n",
                ),
            }
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    #[test]
    fn test_roundtrip_binary_payloads() {
        let all_bytes: Vec<u8> = (0u16..=255).map(|b| b as u8).collect();
        let body = encode(&[
            (Some("a.bin"), all_bytes.as_slice()),
            (Some("b.bin"), b"\r\n--not-a-boundary\r\n"),
        ]);

        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].filename, "a.bin");
        assert_eq!(parts[0].data, all_bytes);
        assert_eq!(parts[1].filename, "b.bin");
        assert_eq!(parts[1].data, b"\r\n--not-a-boundary\r\n");
    }

    #[test]
    fn test_percent_encoded_filename() {
        let body = encode(&[(Some("r%C3%A9sum%C3%A9%20final.pdf"), b"pdf bytes")]);
        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "r\u{e9}sum\u{e9} final.pdf");
    }

    #[test]
    fn test_undecodable_filename_kept_raw() {
        let body = encode(&[(Some("bad%FFname.bin"), b"x")]);
        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "bad%FFname.bin");
    }

    #[test]
    fn test_parts_without_filename_dropped() {
        let body = encode(&[(None, b"field value"), (Some("keep.txt"), b"kept")]);
        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "keep.txt");
    }

    #[test]
    fn test_empty_bodies_dropped() {
        let body = encode(&[(Some("empty.txt"), b""), (Some("full.txt"), b"data")]);
        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].filename, "full.txt");
    }

    #[test]
    fn test_no_boundary_yields_empty() {
        let parts = parse(b"this is not multipart at all", BOUNDARY);
        assert!(parts.is_empty());
    }

    #[test]
    fn test_missing_terminator_stops_cleanly() {
        let mut body = encode(&[(Some("a.txt"), b"aaa")]);
        // Chop off the terminal boundary line entirely.
        let len = body.len() - format!("--{BOUNDARY}--\r\n").len();
        body.truncate(len);
        body.extend_from_slice(format!("--{BOUNDARY}\r\nheaders-without-end").as_bytes());

        let parts = parse(&body, BOUNDARY);
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].data, b"aaa");
    }

    #[test]
    fn test_boundary_from_content_type() {
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=abc123"),
            Some("abc123".to_string())
        );
        assert_eq!(
            boundary_from_content_type("multipart/form-data; boundary=\"quoted-x\""),
            Some("quoted-x".to_string())
        );
        assert_eq!(boundary_from_content_type("application/json"), None);
        assert_eq!(boundary_from_content_type("multipart/form-data"), None);
    }
}
