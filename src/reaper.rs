//! Reapers & housekeeping (C7): a periodic safety net for disconnects the
//! per-socket read/write paths should normally already have caught (§4.7).

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::registry::Registry;

const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Runs forever, scanning every [`SCAN_INTERVAL`] for mounts idle past
/// `mount_timeout` and subscribers idle past `client_timeout`, closing
/// both by firing their cancellation token. Exits when `shutdown` fires.
pub async fn run(
    registry: Arc<Registry>,
    mount_timeout: Duration,
    client_timeout: Duration,
    shutdown: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(SCAN_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => scan_once(&registry, mount_timeout, client_timeout),
            _ = shutdown.cancelled() => break,
        }
    }
}

fn scan_once(registry: &Registry, mount_timeout: Duration, client_timeout: Duration) {
    for mount in registry.stale_mounts(mount_timeout) {
        info!(target: "caster::reaper", mount = %mount.name, "reaping stale uploader");
        mount.cancel.cancel();
    }
    for user in registry.stale_users(client_timeout) {
        info!(target: "caster::reaper", id = user.id, username = %user.username, "reaping idle subscriber");
        user.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{MountInfo, StationInfo, UserConnection};
    use crate::types::ProtocolVersion;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1)
    }

    #[test]
    fn scan_cancels_stale_mount_and_user() {
        let registry = Registry::new(3);
        let mount_cancel = CancellationToken::new();
        registry.add_mount(MountInfo {
            name: "MT01".into(),
            peer_addr: addr(),
            agent: "test".into(),
            protocol_version: ProtocolVersion::Ntrip1_0,
            connect_time: Instant::now() - Duration::from_secs(300),
            last_data_time: Instant::now() - Duration::from_secs(300),
            total_bytes: 0,
            data_rate_bps: 0.0,
            station: StationInfo::defaults("UNK", 0.0, 0.0),
            cancel: mount_cancel.clone(),
        });

        let user_cancel = CancellationToken::new();
        registry.add_user(UserConnection {
            id: 1,
            username: "alice".into(),
            mount: "MT01".into(),
            peer_addr: addr(),
            agent: "test".into(),
            protocol_version: ProtocolVersion::Ntrip2_0,
            connect_time: Instant::now() - Duration::from_secs(300),
            last_activity: Instant::now() - Duration::from_secs(300),
            bytes_sent: 0,
            last_sent_timestamp: Instant::now() - Duration::from_secs(300),
            cancel: user_cancel.clone(),
        });

        scan_once(&registry, Duration::from_secs(180), Duration::from_secs(180));
        assert!(mount_cancel.is_cancelled());
        assert!(user_cancel.is_cancelled());
    }
}
