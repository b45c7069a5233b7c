// Parser for the remote transcoder's multipart/mixed responses.
//
// One part per rendition. A part whose Content-Type is the livepeer URI type
// carries a reference URL as its body; anything else is the rendition bytes
// inline. Every part must name its rendition.

use bytes::Bytes;
use url::Url;

use vod_types::RenditionSegment;

use crate::error::PipelineError;

pub const URI_CONTENT_TYPE: &str = "application/vnd+livepeer.uri";
pub const RENDITION_NAME_HEADER: &str = "rendition-name";

#[derive(Debug)]
pub struct MultipartPart {
    headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl MultipartPart {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Extract the boundary parameter from a `multipart/mixed` content type.
pub fn mixed_boundary(content_type: &str) -> Result<String, PipelineError> {
    let mut parts = content_type.split(';');
    let media_type = parts.next().unwrap_or_default().trim();
    if !media_type.eq_ignore_ascii_case("multipart/mixed") {
        return Err(PipelineError::multipart(format!(
            "expected multipart/mixed, got `{media_type}`"
        )));
    }
    for param in parts {
        let param = param.trim();
        if let Some(value) = param.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            if value.is_empty() {
                break;
            }
            return Ok(value.to_string());
        }
    }
    Err(PipelineError::multipart("missing boundary parameter"))
}

/// Split a multipart body into its parts.
pub fn parse_parts(boundary: &str, body: &[u8]) -> Result<Vec<MultipartPart>, PipelineError> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut parts = Vec::new();
    let mut cursor = find(body, delimiter, 0)
        .ok_or_else(|| PipelineError::multipart("no opening boundary"))?
        + delimiter.len();

    loop {
        // Closing delimiter is "--boundary--".
        if body[cursor..].starts_with(b"--") {
            break;
        }
        cursor = skip_line_break(body, cursor);

        let headers_end = find(body, b"\r\n\r\n", cursor)
            .ok_or_else(|| PipelineError::multipart("part headers not terminated"))?;
        let headers = parse_headers(&body[cursor..headers_end])?;
        let body_start = headers_end + 4;

        let next = find(body, delimiter, body_start)
            .ok_or_else(|| PipelineError::multipart("part not terminated by boundary"))?;
        // The boundary owns its preceding CRLF.
        let body_end = next.saturating_sub(2).max(body_start);
        parts.push(MultipartPart {
            headers,
            body: Bytes::copy_from_slice(&body[body_start..body_end]),
        });
        cursor = next + delimiter.len();
    }

    Ok(parts)
}

/// Map one parsed part onto a rendition segment.
pub fn part_to_rendition(part: &MultipartPart) -> Result<RenditionSegment, PipelineError> {
    let name = part
        .header(RENDITION_NAME_HEADER)
        .ok_or_else(|| PipelineError::multipart("part is missing Rendition-Name"))?
        .to_string();

    let is_uri = part
        .header("content-type")
        .map(|ct| ct.split(';').next().unwrap_or_default().trim() == URI_CONTENT_TYPE)
        .unwrap_or(false);

    if is_uri {
        let text = std::str::from_utf8(&part.body)
            .map_err(|_| PipelineError::multipart("URI part body is not UTF-8"))?
            .trim();
        let url = Url::parse(text)
            .map_err(|e| PipelineError::multipart(format!("invalid rendition URL `{text}`: {e}")))?;
        Ok(RenditionSegment::reference(name, url))
    } else {
        Ok(RenditionSegment::inline(name, part.body.clone()))
    }
}

fn parse_headers(raw: &[u8]) -> Result<Vec<(String, String)>, PipelineError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| PipelineError::multipart("part headers are not UTF-8"))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| PipelineError::multipart(format!("malformed header `{line}`")))?;
            Ok((name.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

fn skip_line_break(body: &[u8], mut cursor: usize) -> usize {
    if body[cursor..].starts_with(b"\r\n") {
        cursor += 2;
    } else if body[cursor..].starts_with(b"\n") {
        cursor += 1;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use vod_types::RenditionPayload;

    fn build_body(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, content_type, body) in parts {
            out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
            out.extend_from_slice(format!("Rendition-Name: {name}\r\n").as_bytes());
            if let Some(ct) = content_type {
                out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
            }
            out.extend_from_slice(b"\r\n");
            out.extend_from_slice(body);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
        out
    }

    #[test]
    fn boundary_extraction() {
        assert_eq!(
            mixed_boundary("multipart/mixed; boundary=abc123").unwrap(),
            "abc123"
        );
        assert_eq!(
            mixed_boundary("multipart/mixed; boundary=\"quoted\"").unwrap(),
            "quoted"
        );
        assert!(mixed_boundary("application/json").is_err());
        assert!(mixed_boundary("multipart/mixed").is_err());
    }

    #[test]
    fn parses_inline_and_uri_parts() {
        let body = build_body(
            "bnd",
            &[
                ("360p0", Some("video/mp2t"), b"\x47segment-bytes"),
                (
                    "720p0",
                    Some(URI_CONTENT_TYPE),
                    b"https://t.example/out/720p0/0.ts",
                ),
            ],
        );
        let parts = parse_parts("bnd", &body).unwrap();
        assert_eq!(parts.len(), 2);

        let first = part_to_rendition(&parts[0]).unwrap();
        assert_eq!(first.rendition_name, "360p0");
        assert!(matches!(
            &first.payload,
            RenditionPayload::Inline(b) if b.as_ref() == b"\x47segment-bytes"
        ));

        let second = part_to_rendition(&parts[1]).unwrap();
        assert_eq!(second.rendition_name, "720p0");
        assert!(matches!(
            &second.payload,
            RenditionPayload::Reference(u) if u.as_str() == "https://t.example/out/720p0/0.ts"
        ));
    }

    #[test]
    fn missing_rendition_name_is_an_error() {
        let mut body = Vec::new();
        body.extend_from_slice(b"--bnd\r\nContent-Type: video/mp2t\r\n\r\ndata\r\n--bnd--\r\n");
        let parts = parse_parts("bnd", &body).unwrap();
        assert!(part_to_rendition(&parts[0]).is_err());
    }

    #[test]
    fn binary_bodies_survive_intact() {
        let payload: Vec<u8> = (0u8..=255).collect();
        let body = build_body("xyz", &[("src", Some("video/mp2t"), &payload)]);
        let parts = parse_parts("xyz", &body).unwrap();
        assert_eq!(parts[0].body.as_ref(), payload.as_slice());
    }

    #[test]
    fn unterminated_body_is_rejected() {
        let body = b"--bnd\r\nRendition-Name: x\r\n\r\ndata-without-closing".to_vec();
        assert!(parse_parts("bnd", &body).is_err());
    }
}
