//! Admin surface (C13): the three narrow, idempotent calls an external
//! admin HTTP process uses to act on the running caster (§6). The admin
//! web UI itself — HTML forms, JSON APIs, its own HTTP port — is out of
//! scope for this core; this module is the seam it would call through.

use std::sync::Arc;

use tracing::info;

use crate::registry::{Registry, Statistics};

pub struct AdminSurface {
    registry: Arc<Registry>,
}

impl AdminSurface {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Disconnects every currently connected session for `username`,
    /// across every mount. Idempotent: a username with no open
    /// connections is a no-op, not an error.
    pub fn force_disconnect_user(&self, username: &str) {
        let victims: Vec<_> = self
            .registry
            .snapshot_all_users()
            .into_iter()
            .filter(|c| c.username == username)
            .collect();
        for conn in &victims {
            conn.cancel.cancel();
        }
        info!(target: "caster::admin", username, count = victims.len(), "force-disconnected user");
    }

    /// Disconnects the uploader currently feeding `mount`, if any.
    /// Idempotent: an offline mount is a no-op.
    pub fn force_disconnect_mount(&self, mount: &str) {
        if let Some(info) = self.registry.get_mount(mount) {
            info.cancel.cancel();
            info!(target: "caster::admin", mount, "force-disconnected mount uploader");
        }
    }

    pub fn get_statistics(&self) -> Statistics {
        self.registry.statistics()
    }
}
