//! In-memory connection and mount registry (C3).
//!
//! Two independent `parking_lot::RwLock`-guarded tables, one for mounts and
//! one for user connections, are never locked nested — this is the
//! deadlock-avoidance invariant the whole concurrency model leans on (the
//! parser updates STR fields through `mounts` while a subscriber join only
//! ever touches `users`, and vice versa). `DashMap` would give the same
//! throughput with sharded internal locks, but `RwLock<HashMap<_>>` keeps
//! the never-nested rule an explicit, auditable property of this module
//! rather than something buried in a library's internals.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::{ConnectionId, ProtocolVersion};

/// Station metadata the RTCM parser fills in; defaults come from config
/// until (or unless) the parser produces a fix within its window.
#[derive(Debug, Clone)]
pub struct StationInfo {
    pub station_id: Option<u32>,
    pub identifier: String,
    pub country_iso3: String,
    pub latitude: f64,
    pub longitude: f64,
    pub height: f64,
    pub message_types: String,
    pub gnss_combined: String,
    pub carrier_combined: String,
    pub bitrate_bps: f64,
    pub fix_obtained: bool,
}

impl StationInfo {
    pub fn defaults(country_iso3: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            station_id: None,
            identifier: "none".to_string(),
            country_iso3: country_iso3.to_string(),
            latitude,
            longitude,
            height: 0.0,
            message_types: String::new(),
            gnss_combined: "N/A".to_string(),
            carrier_combined: "N/A".to_string(),
            bitrate_bps: 0.0,
            fix_obtained: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MountInfo {
    pub name: String,
    pub peer_addr: SocketAddr,
    pub agent: String,
    pub protocol_version: ProtocolVersion,
    pub connect_time: Instant,
    pub last_data_time: Instant,
    pub total_bytes: u64,
    pub data_rate_bps: f64,
    pub station: StationInfo,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct UserConnection {
    pub id: ConnectionId,
    pub username: String,
    pub mount: String,
    pub peer_addr: SocketAddr,
    pub agent: String,
    pub protocol_version: ProtocolVersion,
    pub connect_time: Instant,
    pub last_activity: Instant,
    pub bytes_sent: u64,
    pub last_sent_timestamp: Instant,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct UserTable {
    connections: HashMap<ConnectionId, UserConnection>,
    by_user_mount: HashMap<(String, String), VecDeque<ConnectionId>>,
}

pub struct Registry {
    max_user_connections_per_mount: usize,
    next_connection_id: AtomicU64,
    mounts: RwLock<HashMap<String, MountInfo>>,
    users: RwLock<UserTable>,
}

#[derive(Debug, Clone, Default)]
pub struct Statistics {
    pub mounts_online: usize,
    pub subscribers_online: usize,
    pub total_bytes_relayed: u64,
}

impl Registry {
    pub fn new(max_user_connections_per_mount: usize) -> Self {
        Self {
            max_user_connections_per_mount,
            next_connection_id: AtomicU64::new(1),
            mounts: RwLock::new(HashMap::new()),
            users: RwLock::new(UserTable::default()),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers `mount` as online. If a mount of the same name is already
    /// present, it is evicted first (last-writer-wins, §4.6 step 4) and its
    /// cancellation token is returned so the caller can stop the old
    /// uploader task.
    pub fn add_mount(&self, info: MountInfo) -> Option<CancellationToken> {
        let mut mounts = self.mounts.write();
        let evicted = mounts.insert(info.name.clone(), info.clone());
        if let Some(old) = &evicted {
            info!(target: "caster::registry", mount = %info.name, "evicting previous uploader (last-writer-wins)");
            return Some(old.cancel.clone());
        }
        debug!(target: "caster::registry", mount = %info.name, "mount online");
        None
    }

    pub fn remove_mount(&self, name: &str) -> Option<MountInfo> {
        let removed = self.mounts.write().remove(name);
        if removed.is_some() {
            debug!(target: "caster::registry", mount = %name, "mount offline");
        }
        removed
    }

    pub fn is_mount_online(&self, name: &str) -> bool {
        self.mounts.read().contains_key(name)
    }

    pub fn get_mount(&self, name: &str) -> Option<MountInfo> {
        self.mounts.read().get(name).cloned()
    }

    pub fn update_mount_activity(&self, name: &str, bytes_appended: u64) {
        if let Some(m) = self.mounts.write().get_mut(name) {
            m.last_data_time = Instant::now();
            m.total_bytes += bytes_appended;
        }
    }

    pub fn update_station_info(&self, name: &str, station: StationInfo) {
        if let Some(m) = self.mounts.write().get_mut(name) {
            m.station = station;
        }
    }

    pub fn snapshot_mounts(&self) -> Vec<MountInfo> {
        self.mounts.read().values().cloned().collect()
    }

    pub fn stale_mounts(&self, idle_timeout: std::time::Duration) -> Vec<MountInfo> {
        let now = Instant::now();
        self.mounts
            .read()
            .values()
            .filter(|m| now.duration_since(m.last_data_time) > idle_timeout)
            .cloned()
            .collect()
    }

    /// Registers a subscriber, enforcing I5: if `(user, mount)` already has
    /// `max_user_connections_per_mount` entries, the oldest is evicted
    /// first and its cancellation token returned for the caller to close.
    pub fn add_user(&self, conn: UserConnection) -> Option<CancellationToken> {
        let mut users = self.users.write();
        let key = (conn.username.clone(), conn.mount.clone());
        let mut evicted = None;
        {
            let queue = users.by_user_mount.entry(key.clone()).or_default();
            if queue.len() >= self.max_user_connections_per_mount {
                if let Some(oldest_id) = queue.pop_front() {
                    evicted = users.connections.remove(&oldest_id).map(|c| c.cancel);
                }
            }
        }
        let id = conn.id;
        users.by_user_mount.entry(key).or_default().push_back(id);
        users.connections.insert(id, conn);
        evicted
    }

    pub fn remove_user(&self, id: ConnectionId) -> Option<UserConnection> {
        let mut users = self.users.write();
        let removed = users.connections.remove(&id)?;
        let key = (removed.username.clone(), removed.mount.clone());
        if let Some(queue) = users.by_user_mount.get_mut(&key) {
            queue.retain(|&x| x != id);
        }
        Some(removed)
    }

    pub fn update_user_activity(&self, id: ConnectionId, watermark: Instant, bytes_sent_delta: u64) {
        if let Some(c) = self.users.write().connections.get_mut(&id) {
            c.last_activity = Instant::now();
            c.last_sent_timestamp = watermark;
            c.bytes_sent += bytes_sent_delta;
        }
    }

    pub fn snapshot_users_for_mount(&self, mount: &str) -> Vec<UserConnection> {
        self.users
            .read()
            .connections
            .values()
            .filter(|c| c.mount == mount)
            .cloned()
            .collect()
    }

    pub fn snapshot_all_users(&self) -> Vec<UserConnection> {
        self.users.read().connections.values().cloned().collect()
    }

    pub fn stale_users(&self, idle_timeout: std::time::Duration) -> Vec<UserConnection> {
        let now = Instant::now();
        self.users
            .read()
            .connections
            .values()
            .filter(|c| now.duration_since(c.last_activity) > idle_timeout)
            .cloned()
            .collect()
    }

    pub fn user_connection_count(&self, username: &str, mount: &str) -> usize {
        self.users
            .read()
            .by_user_mount
            .get(&(username.to_string(), mount.to_string()))
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub fn statistics(&self) -> Statistics {
        let mounts = self.mounts.read();
        let total_bytes_relayed = mounts.values().map(|m| m.total_bytes).sum();
        Statistics {
            mounts_online: mounts.len(),
            subscribers_online: self.users.read().connections.len(),
            total_bytes_relayed,
        }
    }
}
