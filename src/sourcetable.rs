//! Sourcetable formatter (C8): builds the `STR`/`NET`/`ENDSOURCETABLE` text
//! body served at `GET /`, and keeps both a file copy (`mount_list.txt`) and
//! an in-memory cached copy in sync on every mount add/remove.
//!
//! The in-memory cache is a `parking_lot::RwLock<Arc<str>>` rather than
//! `arc-swap`: regeneration already runs serialized behind the registry
//! lock, so the lock-free swap `arc-swap` offers would be spent work with no
//! reader ever racing a writer here.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::config::{AppInfo, CasterLocation};
use crate::registry::MountInfo;

pub struct SourcetableCache {
    cached: RwLock<Arc<str>>,
    mount_list_path: PathBuf,
    app: AppInfo,
    default_location: CasterLocation,
    host: String,
    ntrip_port: u16,
}

impl SourcetableCache {
    pub fn new(
        mount_list_path: PathBuf,
        app: AppInfo,
        default_location: CasterLocation,
        host: String,
        ntrip_port: u16,
    ) -> Self {
        Self {
            cached: RwLock::new(Arc::from(render(&[], &app, &default_location, &host, ntrip_port))),
            mount_list_path,
            app,
            default_location,
            host,
            ntrip_port,
        }
    }

    pub fn current(&self) -> Arc<str> {
        self.cached.read().clone()
    }

    /// Rebuilds the table from a fresh snapshot of live mounts. Persists to
    /// the configured `mount_list.txt` path; a write failure is logged but
    /// not fatal (the in-memory cache is what `GET /` actually serves).
    pub fn regenerate(&self, mounts: &[MountInfo]) {
        let body = render(mounts, &self.app, &self.default_location, &self.host, self.ntrip_port);
        *self.cached.write() = Arc::from(body.as_str());
        if let Err(e) = std::fs::File::create(&self.mount_list_path).and_then(|mut f| f.write_all(body.as_bytes())) {
            warn!(target: "caster::sourcetable", error = %e, path = ?self.mount_list_path, "failed to persist mount_list.txt");
        }
    }
}

fn str_line(m: &MountInfo, default_location: &CasterLocation) -> String {
    let s = &m.station;
    let identifier = if s.identifier.is_empty() { "none" } else { &s.identifier };
    let country = if s.country_iso3.is_empty() {
        &default_location.country
    } else {
        &s.country_iso3
    };
    let lat = if s.fix_obtained { s.latitude } else { default_location.latitude };
    let lon = if s.fix_obtained { s.longitude } else { default_location.longitude };
    let format_details = if s.message_types.is_empty() { "none" } else { &s.message_types };
    let carrier = &s.carrier_combined;
    let nav_system = &s.gnss_combined;
    let bitrate = s.bitrate_bps.round() as i64;
    let misc = if s.fix_obtained { "YES" } else { "NO" };

    format!(
        "STR;{mount};{identifier};RTCM 3.3;{format_details};{carrier};{nav_system};NONE;{country};{lat:.4};{lon:.4};0;0;{generator};none;B;N;{bitrate};{misc}",
        mount = m.name,
        identifier = identifier,
        format_details = format_details,
        carrier = carrier,
        nav_system = nav_system,
        country = country,
        lat = lat,
        lon = lon,
        generator = m.agent,
        bitrate = bitrate,
        misc = misc,
    )
}

fn render(mounts: &[MountInfo], app: &AppInfo, default_location: &CasterLocation, host: &str, ntrip_port: u16) -> String {
    let mut out = String::new();
    let mut sorted: Vec<&MountInfo> = mounts.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    for m in sorted {
        out.push_str(&str_line(m, default_location));
        out.push('\n');
    }
    out.push_str(&format!(
        "NET;{name};{name};N;N;{website};{host}:{port};{contact};;\n",
        name = app.name,
        website = app.website,
        host = host,
        port = ntrip_port,
        contact = app.contact,
    ));
    out.push_str("ENDSOURCETABLE;\n");
    out
}

/// Builds the full `SOURCETABLE 200 OK` HTTP-ish response.
pub fn sourcetable_response(body: &str, app: &AppInfo) -> String {
    let date = crate::protocol::rfc1123_now();
    format!(
        "SOURCETABLE 200 OK\r\nServer: {name}/{version}\r\nDate: {date}\r\nContent-Type: text/plain\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        name = app.name,
        version = app.version,
        date = date,
        len = body.len(),
        body = body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::StationInfo;
    use crate::types::ProtocolVersion;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn mount(name: &str, station: StationInfo) -> MountInfo {
        MountInfo {
            name: name.to_string(),
            peer_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1),
            agent: "test-agent".into(),
            protocol_version: ProtocolVersion::Ntrip2_0,
            connect_time: Instant::now(),
            last_data_time: Instant::now(),
            total_bytes: 0,
            data_rate_bps: 0.0,
            station,
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn two_regenerations_are_byte_identical() {
        let app = AppInfo::default();
        let loc = CasterLocation::default();
        let mounts = vec![mount("MT01", StationInfo::defaults("UNK", 0.0, 0.0))];
        let a = render(&mounts, &app, &loc, "caster.example.com", 2101);
        let b = render(&mounts, &app, &loc, "caster.example.com", 2101);
        assert_eq!(a, b);
    }

    #[test]
    fn ends_with_endsourcetable() {
        let app = AppInfo::default();
        let loc = CasterLocation::default();
        let body = render(&[], &app, &loc, "caster.example.com", 2101);
        assert!(body.ends_with("ENDSOURCETABLE;\n"));
    }

    #[test]
    fn net_line_uses_configured_host_not_localhost() {
        let app = AppInfo::default();
        let loc = CasterLocation::default();
        let body = render(&[], &app, &loc, "caster.example.com", 2101);
        assert!(body.contains("caster.example.com:2101"));
        assert!(!body.contains("localhost"));
    }

    #[test]
    fn fix_obtained_sets_misc_yes_and_geocoded_fields() {
        let mut s = StationInfo::defaults("UNK", 0.0, 0.0);
        s.fix_obtained = true;
        s.country_iso3 = "CHN".into();
        s.latitude = 39.9042;
        s.longitude = 116.4074;
        s.identifier = "Beijing".into();
        let line = str_line(&mount("MT01", s), &CasterLocation::default());
        assert!(line.contains("Beijing"));
        assert!(line.contains("CHN"));
        assert!(line.ends_with("YES"));
    }
}
