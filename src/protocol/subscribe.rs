//! `handleSubscribe` (§4.6): admits a rover, hands its write half
//! permanently to the fan-out engine, and otherwise only waits for its own
//! socket to go away.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{response, Caster};
use crate::error::{CasterResult, CatalogError, ProtocolError};
use crate::registry::UserConnection;
use crate::types::ProtocolVersion;

/// The tail of the ring buffer replayed to a freshly joined subscriber, so
/// it doesn't have to wait for the next uploaded chunk to see data (§5
/// Ordering).
const INITIAL_TAIL: Duration = Duration::from_secs(5);

pub async fn handle(
    caster: Arc<Caster>,
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    mount: String,
    username: String,
    password: String,
    agent: String,
    protocol_version: ProtocolVersion,
    had_auth_header: bool,
) -> CasterResult<()> {
    let mount_password_hint = Some(password.as_str());
    if let Err(e) =
        caster.catalog.verify_download(&mount, &username, &password, mount_password_hint, protocol_version)
    {
        debug!(target: "caster::protocol", mount, username, error = %e, "subscribe rejected");
        let body = match &e {
            CatalogError::MountNotFound(_) => response::not_found().to_string(),
            _ => response::subscribe_unauthorized(had_auth_header),
        };
        let _ = stream.write_all(body.as_bytes()).await;
        return Err(e.into());
    }

    let id = caster.registry.next_connection_id();
    let cancel = CancellationToken::new();
    let connect_time = Instant::now();
    let watermark = connect_time.checked_sub(INITIAL_TAIL).unwrap_or(connect_time);

    let conn = UserConnection {
        id,
        username: username.clone(),
        mount: mount.clone(),
        peer_addr,
        agent,
        protocol_version,
        connect_time,
        last_activity: connect_time,
        bytes_sent: 0,
        last_sent_timestamp: watermark,
        cancel: cancel.clone(),
    };
    if let Some(evicted) = caster.registry.add_user(conn) {
        info!(target: "caster::protocol", mount, username, "admission cap reached, evicting oldest connection");
        evicted.cancel();
    }

    let (mut read_half, mut write_half) = stream.into_split();
    if let Err(e) = write_half.write_all(response::subscribe_ok(protocol_version, &caster.config.app).as_bytes()).await {
        caster.registry.remove_user(id);
        return Err(ProtocolError::Io(e).into());
    }

    caster.fanout.subscribe_data(&mount, id, write_half, protocol_version, watermark, cancel.clone());

    let mut outcome = Ok(());
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) => {
                    outcome = Err(ProtocolError::Io(e));
                    break;
                }
            },
        }
    }

    caster.fanout.unsubscribe_data(&mount, id).await;
    caster.registry.remove_user(id);
    debug!(target: "caster::protocol", mount, username, id, "subscriber disconnected");
    outcome.map_err(Into::into)
}

pub async fn serve_sourcetable(caster: Arc<Caster>, mut stream: TcpStream) {
    let body = caster.sourcetable.current();
    let response = crate::sourcetable::sourcetable_response(&body, &caster.config.app);
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
