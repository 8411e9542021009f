//! Response line/header builders for the NTRIP front-end (§4.6, §6).

use crate::config::AppInfo;
use crate::types::ProtocolVersion;

pub fn upload_ok(version: ProtocolVersion) -> &'static str {
    match version {
        ProtocolVersion::Ntrip1_0 => "ICY 200 OK\r\n",
        ProtocolVersion::Ntrip2_0 => "HTTP/1.1 200 OK\r\nNtrip-Version: Ntrip/2.0\r\n\r\n",
    }
}

pub fn upload_bad_password(version: ProtocolVersion) -> &'static str {
    match version {
        ProtocolVersion::Ntrip1_0 => "ERROR - Bad Password\r\n",
        ProtocolVersion::Ntrip2_0 => "HTTP/1.1 401\r\n\r\n",
    }
}

pub fn subscribe_ok(version: ProtocolVersion, app: &AppInfo) -> String {
    match version {
        ProtocolVersion::Ntrip1_0 => "ICY 200 OK\r\n".to_string(),
        ProtocolVersion::Ntrip2_0 => format!(
            "HTTP/1.1 200 OK\r\nNtrip-Version: Ntrip/2.0\r\nServer: {name}/{ver}\r\nDate: {date}\r\n\
             Cache-Control: no-store,max-age=0\r\nPragma: no-cache\r\nConnection: close\r\n\
             Content-Type: gnss/data\r\nTransfer-Encoding: chunked\r\n\r\n",
            name = app.name,
            ver = app.version,
            date = super::rfc1123_now(),
        ),
    }
}

/// Subscribe-path error responses are HTTP status lines regardless of
/// negotiated version (§6 "Errors: 401 ... 404, 400" is listed once, not
/// per-version) — a `WWW-Authenticate` challenge is only added when the
/// peer sent no `Authorization` header at all.
pub fn subscribe_unauthorized(had_auth_header: bool) -> String {
    if had_auth_header {
        "HTTP/1.1 401 Unauthorized\r\nConnection: close\r\n\r\n".to_string()
    } else {
        "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Basic realm=\"NTRIP\"\r\nConnection: close\r\n\r\n".to_string()
    }
}

pub fn not_found() -> &'static str {
    "HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n"
}

pub fn bad_request() -> &'static str {
    "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n"
}
