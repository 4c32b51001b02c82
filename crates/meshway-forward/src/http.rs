//! HTTP/1.1 byte serialization for relayed requests and responses.
//!
//! Requests enter the overlay as opaque serialized bytes and are only
//! reconstructed at the terminal relay; responses make the reverse trip.
//! Parsing uses httparse (the parser under hyper); bodies are delimited by
//! Content-Length, which the serializers always emit.

use bytes::Bytes;

use crate::error::{ForwardError, ForwardResult};

/// Upper bound on header count accepted from relayed bytes.
const MAX_HEADERS: usize = 64;

/// A reconstructed HTTP request.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// A reconstructed HTTP response.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

/// Serialize a request into HTTP/1.1 wire bytes.
///
/// A Content-Length header is always emitted so the terminal relay can
/// delimit the body without connection semantics.
pub fn serialize_request(
    method: &str,
    path: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Bytes {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("{method} {path} HTTP/1.1\r\n").as_bytes());
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// Serialize a response into HTTP/1.1 wire bytes.
pub fn serialize_response(status: u16, headers: &[(String, String)], body: &[u8]) -> Bytes {
    let reason = reason_phrase(status);
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length")
            || name.eq_ignore_ascii_case("transfer-encoding")
        {
            continue;
        }
        out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    out.extend_from_slice(format!("content-length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(body);
    Bytes::from(out)
}

/// Parse serialized request bytes back into structured form.
pub fn parse_request(data: &[u8]) -> ForwardResult<ParsedRequest> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let body_start = match req
        .parse(data)
        .map_err(|e| ForwardError::HttpParse(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(ForwardError::HttpParse("incomplete request head".to_string()))
        }
    };

    let method = req
        .method
        .ok_or_else(|| ForwardError::HttpParse("missing method".to_string()))?
        .to_string();
    let path = req
        .path
        .ok_or_else(|| ForwardError::HttpParse("missing path".to_string()))?
        .to_string();
    let headers = collect_headers(req.headers)?;
    let body = body_slice(data, body_start, &headers)?;

    Ok(ParsedRequest {
        method,
        path,
        headers,
        body,
    })
}

/// Parse serialized response bytes back into structured form.
pub fn parse_response(data: &[u8]) -> ForwardResult<ParsedResponse> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    let body_start = match resp
        .parse(data)
        .map_err(|e| ForwardError::HttpParse(e.to_string()))?
    {
        httparse::Status::Complete(n) => n,
        httparse::Status::Partial => {
            return Err(ForwardError::HttpParse("incomplete response head".to_string()))
        }
    };

    let status = resp
        .code
        .ok_or_else(|| ForwardError::HttpParse("missing status".to_string()))?;
    let headers = collect_headers(resp.headers)?;
    let body = body_slice(data, body_start, &headers)?;

    Ok(ParsedResponse {
        status,
        headers,
        body,
    })
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> ForwardResult<Vec<(String, String)>> {
    parsed
        .iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value)
                .map_err(|_| ForwardError::HttpParse("non-UTF-8 header value".to_string()))?;
            Ok((h.name.to_string(), value.to_string()))
        })
        .collect()
}

fn body_slice(
    data: &[u8],
    body_start: usize,
    headers: &[(String, String)],
) -> ForwardResult<Bytes> {
    let content_length = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(data.len() - body_start);
    let end = body_start + content_length;
    if end > data.len() {
        return Err(ForwardError::HttpParse("body shorter than declared".to_string()));
    }
    Ok(Bytes::copy_from_slice(&data[body_start..end]))
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let headers = vec![
            ("host".to_string(), "example.com".to_string()),
            ("x-trace".to_string(), "abc".to_string()),
        ];
        let bytes = serialize_request("POST", "/api/v1/items", &headers, b"{\"a\":1}");
        let parsed = parse_request(&bytes).unwrap();

        assert_eq!(parsed.method, "POST");
        assert_eq!(parsed.path, "/api/v1/items");
        assert_eq!(parsed.body.as_ref(), b"{\"a\":1}");
        assert!(parsed
            .headers
            .iter()
            .any(|(n, v)| n == "host" && v == "example.com"));
    }

    #[test]
    fn response_roundtrip() {
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        let bytes = serialize_response(200, &headers, b"hello");
        let parsed = parse_response(&bytes).unwrap();

        assert_eq!(parsed.status, 200);
        assert_eq!(parsed.body.as_ref(), b"hello");
    }

    #[test]
    fn content_length_is_rewritten_not_duplicated() {
        let headers = vec![("Content-Length".to_string(), "999".to_string())];
        let bytes = serialize_request("GET", "/", &headers, b"xy");
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert_eq!(text.matches("content-length").count(), 1);

        let parsed = parse_request(&bytes).unwrap();
        assert_eq!(parsed.body.as_ref(), b"xy");
    }

    #[test]
    fn empty_body_request() {
        let bytes = serialize_request("GET", "/health", &[], b"");
        let parsed = parse_request(&bytes).unwrap();
        assert!(parsed.body.is_empty());
    }

    #[test]
    fn truncated_body_is_rejected() {
        let headers = vec![("host".to_string(), "x".to_string())];
        let bytes = serialize_request("POST", "/", &headers, b"full body here");
        // Drop the last 4 bytes: the declared length no longer fits.
        let truncated = &bytes[..bytes.len() - 4];
        assert!(parse_request(truncated).is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_request(b"\x00\x01\x02 not http").is_err());
        assert!(parse_response(b"totally not a response").is_err());
    }

    #[test]
    fn error_statuses_serialize_with_reasons() {
        let bytes = serialize_response(504, &[], b"");
        assert!(bytes.starts_with(b"HTTP/1.1 504 Gateway Timeout\r\n"));
    }
}
