//! Protocol front-end (C6): one accept loop multiplexing NTRIP 1.0
//! (`SOURCE`/`GET` with ICY-style responses) and NTRIP 2.0 (HTTP/1.1 with
//! `Ntrip-Version: Ntrip/2.0`) on a single TCP port (§4.6).

pub mod auth;
mod request;
mod response;
mod subscribe;
mod upload;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive as Socket2Keepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{Config, TcpKeepalive};
use crate::error::{CasterError, CasterResult, ProtocolError};
use crate::fanout::FanoutEngine;
use crate::geocode::ReverseGeocoder;
use crate::registry::Registry;
use crate::sourcetable::SourcetableCache;
use crate::types::ProtocolVersion;
use request::RequestLine;

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);
const HEADER_SIZE_CAP: usize = 4096;

/// The caster's shared state, handed to every connection task as an `Arc`.
pub struct Caster {
    pub config: Arc<Config>,
    pub catalog: Arc<Catalog>,
    pub registry: Arc<Registry>,
    pub fanout: Arc<FanoutEngine>,
    pub sourcetable: Arc<SourcetableCache>,
    pub geocoder: Arc<dyn ReverseGeocoder>,
}

/// Binds `config.host:config.ntrip_port` and serves connections until
/// `shutdown` fires, spawning one task per accepted connection.
pub async fn run(caster: Arc<Caster>, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = (caster.config.host.as_str(), caster.config.ntrip_port);
    let listener = TcpListener::bind(addr).await?;
    info!(target: "caster::protocol", host = %caster.config.host, port = caster.config.ntrip_port, "listening");
    serve(caster, listener, shutdown).await
}

/// Serves connections on an already-bound listener until `shutdown` fires.
/// Split out from [`run`] so tests can bind an ephemeral port (`:0`) and
/// learn the real address before connecting.
pub async fn serve(caster: Arc<Caster>, listener: TcpListener, shutdown: CancellationToken) -> std::io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(target: "caster::protocol", "shutdown signal received, no longer accepting connections");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(target: "caster::protocol", error = %e, "accept failed");
                        continue;
                    }
                };
                apply_keepalive(&stream, &caster.config.tcp_keepalive);
                let caster = caster.clone();
                tokio::spawn(async move {
                    handle_connection(caster, stream, peer_addr).await;
                });
            }
        }
    }
}

async fn handle_connection(caster: Arc<Caster>, mut stream: TcpStream, peer_addr: SocketAddr) {
    let read = tokio::time::timeout(HEADER_READ_TIMEOUT, request::read_request(&mut stream, HEADER_SIZE_CAP)).await;
    let (request_line, headers, leftover) = match read {
        Ok(Ok(parts)) => parts,
        Ok(Err(e)) => {
            debug!(target: "caster::protocol", %peer_addr, error = %e, "read error before request completed");
            return;
        }
        Err(_) => {
            debug!(target: "caster::protocol", %peer_addr, "timed out waiting for request headers");
            return;
        }
    };

    let outcome: CasterResult<()> = match request_line {
        RequestLine::LegacySource { password, mount } => {
            let agent = default_agent(&headers);
            upload::handle(caster, stream, peer_addr, mount, password, agent, ProtocolVersion::Ntrip1_0, leftover).await
        }
        RequestLine::ModernSource { mount, http_version } => {
            let version = detect_version(&http_version, &headers);
            let agent = default_agent(&headers);
            let password = headers
                .get("authorization")
                .and_then(|v| auth::decode_basic_auth(v))
                .map(|(_, pass)| pass)
                .unwrap_or_default();
            upload::handle(caster, stream, peer_addr, mount, password, agent, version, leftover).await
        }
        RequestLine::Get { target, http_version } => {
            if target == "/" {
                subscribe::serve_sourcetable(caster, stream).await;
                return;
            }
            let version = detect_version(&http_version, &headers);
            let agent = default_agent(&headers);
            let mount = target.trim_start_matches('/').to_string();
            let had_auth_header = headers.contains_key("authorization");
            let (username, password) = headers
                .get("authorization")
                .and_then(|v| auth::decode_basic_auth(v))
                .unwrap_or_default();
            subscribe::handle(caster, stream, peer_addr, mount, username, password, agent, version, had_auth_header).await
        }
        RequestLine::Malformed(reason) => {
            debug!(target: "caster::protocol", %peer_addr, reason, "malformed request");
            let _ = tokio::io::AsyncWriteExt::write_all(&mut stream, response::bad_request().as_bytes()).await;
            Err(ProtocolError::BadRequestLine(reason).into())
        }
    };

    log_outcome(peer_addr, outcome);
}

/// The top-level handler every connection task funnels through: matches on
/// the resulting `CasterError` to decide how loudly a failure is logged, so
/// a routine hangup or bad password doesn't drown the logs at `warn` while a
/// catalog/storage failure still stands out.
fn log_outcome(peer_addr: SocketAddr, outcome: CasterResult<()>) {
    match outcome {
        Ok(()) => {}
        Err(CasterError::Protocol(ProtocolError::Unauthorized)) => {
            debug!(target: "caster::protocol", %peer_addr, "connection closed: unauthorized");
        }
        Err(CasterError::Protocol(ProtocolError::Io(e))) => {
            debug!(target: "caster::protocol", %peer_addr, error = %e, "connection closed: I/O error");
        }
        Err(CasterError::Protocol(e)) => {
            debug!(target: "caster::protocol", %peer_addr, error = %e, "connection closed");
        }
        Err(e) => {
            warn!(target: "caster::protocol", %peer_addr, error = %e, "connection task failed");
        }
    }
}

/// `HTTP/1.1` plus a `Ntrip-Version: Ntrip/2.0` header selects NTRIP 2.0;
/// everything else (bare `SOURCE`, HTTP/1.0, or a 1.1 request without that
/// header) is treated as NTRIP 1.0.
fn detect_version(http_version: &str, headers: &std::collections::HashMap<String, String>) -> ProtocolVersion {
    let is_http11 = http_version.eq_ignore_ascii_case("HTTP/1.1");
    let has_ntrip2_header = headers
        .get("ntrip-version")
        .map(|v| v.eq_ignore_ascii_case("ntrip/2.0"))
        .unwrap_or(false);
    if is_http11 && has_ntrip2_header {
        ProtocolVersion::Ntrip2_0
    } else {
        ProtocolVersion::Ntrip1_0
    }
}

fn default_agent(headers: &std::collections::HashMap<String, String>) -> String {
    headers
        .get("user-agent")
        .or_else(|| headers.get("source-agent"))
        .cloned()
        .unwrap_or_else(|| "unknown".to_string())
}

fn apply_keepalive(stream: &TcpStream, cfg: &TcpKeepalive) {
    if !cfg.enabled {
        return;
    }
    let sock = SockRef::from(stream);
    let keepalive = Socket2Keepalive::new()
        .with_time(Duration::from_secs(cfg.idle_secs))
        .with_interval(Duration::from_secs(cfg.interval_secs));
    #[cfg(not(any(target_os = "windows", target_os = "openbsd")))]
    let keepalive = keepalive.with_retries(cfg.count);
    if let Err(e) = sock.set_tcp_keepalive(&keepalive) {
        debug!(target: "caster::protocol", error = %e, "failed to set tcp keepalive");
    }
}

/// An RFC 1123 `Date:` header value, e.g. `Mon, 27 Jul 2026 10:00:00 GMT`.
pub fn rfc1123_now() -> String {
    chrono::Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
