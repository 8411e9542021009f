//! First-line and header parsing for the NTRIP front-end (§4.6).
//!
//! The first 1 KB of a connection is read and split on CRLF, tolerating
//! arbitrary encoding via a lossy UTF-8 decode since the bytes that follow
//! a request line are raw RTCM, not text. Verb dispatch happens on the
//! parsed [`RequestLine`]; headers are only parsed for the two forms that
//! carry them (`ModernSource`, `Get`): the legacy `SOURCE <password>
//! <mount>` line has none, and whatever immediately follows it on the wire
//! is already the first chunk of RTCM payload.

use std::collections::HashMap;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestLine {
    /// `SOURCE <password> <mount>` — NTRIP 1.0 style upload.
    LegacySource { password: String, mount: String },
    /// `SOURCE /<mount> HTTP/1.x` — NTRIP 2.0 style upload, auth in headers.
    ModernSource { mount: String, http_version: String },
    /// `GET /<mount|/> HTTP/1.x` — subscribe, or sourcetable if `/`.
    Get { target: String, http_version: String },
    Malformed(String),
}

fn parse_request_line(line: &str) -> RequestLine {
    let line = line.trim_end_matches('\r');
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["SOURCE", a, b] if b.starts_with("HTTP/") => RequestLine::ModernSource {
            mount: a.trim_start_matches('/').to_string(),
            http_version: b.to_string(),
        },
        ["SOURCE", password, mount] => RequestLine::LegacySource {
            password: password.to_string(),
            mount: mount.trim_start_matches('/').to_string(),
        },
        ["GET", path, version] if version.starts_with("HTTP/") => {
            RequestLine::Get { target: path.to_string(), http_version: version.to_string() }
        }
        _ => RequestLine::Malformed(line.to_string()),
    }
}

fn parse_headers(block: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(block);
    text.split("\r\n")
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Reads and parses one request, returning the parsed request line, any
/// headers (empty for the legacy upload form), and whatever bytes were
/// read past the request but not yet consumed by it (the start of the
/// uploader's payload, almost always empty for a GET/subscribe).
pub async fn read_request(
    stream: &mut TcpStream,
    cap: usize,
) -> std::io::Result<(RequestLine, HashMap<String, String>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(cap);
    let mut chunk = vec![0u8; cap];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(line_end) = find(&buf, b"\r\n") {
            let line = String::from_utf8_lossy(&buf[..line_end]).to_string();
            let request_line = parse_request_line(&line);
            match &request_line {
                RequestLine::LegacySource { .. } | RequestLine::Malformed(_) => {
                    let leftover = buf[line_end + 2..].to_vec();
                    return Ok((request_line, HashMap::new(), leftover));
                }
                RequestLine::ModernSource { .. } | RequestLine::Get { .. } => {
                    let rest = &buf[line_end + 2..];
                    if let Some(headers_end) = find(rest, b"\r\n\r\n") {
                        let headers = parse_headers(&rest[..headers_end]);
                        let leftover = rest[headers_end + 4..].to_vec();
                        return Ok((request_line, headers, leftover));
                    }
                }
            }
        }

        if buf.len() >= cap {
            return Ok((RequestLine::Malformed("request exceeded header size cap".to_string()), HashMap::new(), Vec::new()));
        }
    }
    Ok((RequestLine::Malformed("connection closed before request completed".to_string()), HashMap::new(), Vec::new()))
}
