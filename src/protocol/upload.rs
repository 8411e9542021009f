//! `handleUpload` (§4.6): admits a base-station uploader, wires its stream
//! into the ring buffer and the bounded metadata parser, and tears
//! everything down again when the read loop ends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{response, Caster};
use crate::error::{CasterResult, ProtocolError};
use crate::registry::{MountInfo, StationInfo};
use crate::types::ProtocolVersion;

const PARSER_WINDOW: Duration = Duration::from_secs(30);

pub async fn handle(
    caster: Arc<Caster>,
    mut stream: TcpStream,
    peer_addr: std::net::SocketAddr,
    mount: String,
    supplied_password: String,
    agent: String,
    protocol_version: ProtocolVersion,
    leftover: Vec<u8>,
) -> CasterResult<()> {
    let record = match caster.catalog.get_mount(&mount) {
        Ok(Some(r)) => r,
        Ok(None) => {
            debug!(target: "caster::protocol", mount, "upload rejected: no such mount");
            let _ = stream.write_all(response::upload_bad_password(protocol_version).as_bytes()).await;
            return Err(ProtocolError::Unauthorized.into());
        }
        Err(e) => {
            warn!(target: "caster::protocol", mount, error = %e, "catalog error during upload auth");
            let _ = stream.write_all(response::upload_bad_password(protocol_version).as_bytes()).await;
            return Err(e.into());
        }
    };
    if record.mount_password != supplied_password {
        debug!(target: "caster::protocol", mount, "upload rejected: bad password");
        let _ = stream.write_all(response::upload_bad_password(protocol_version).as_bytes()).await;
        return Err(ProtocolError::Unauthorized.into());
    }

    let (mut read_half, mut write_half) = stream.into_split();
    if let Err(e) = write_half.write_all(response::upload_ok(protocol_version).as_bytes()).await {
        return Err(ProtocolError::Io(e).into());
    }

    let cancel = CancellationToken::new();
    let location = &caster.config.caster;
    let info = MountInfo {
        name: mount.clone(),
        peer_addr,
        agent: agent.clone(),
        protocol_version,
        connect_time: Instant::now(),
        last_data_time: Instant::now(),
        total_bytes: 0,
        data_rate_bps: 0.0,
        station: StationInfo::defaults(&location.country, location.latitude, location.longitude),
        cancel: cancel.clone(),
    };

    if let Some(evicted) = caster.registry.add_mount(info) {
        info!(target: "caster::protocol", mount, "evicting previous uploader (last-writer-wins)");
        evicted.cancel();
    }
    caster.fanout.register_mount(&mount, caster.config.ring_buffer_size);
    caster.sourcetable.regenerate(&caster.registry.snapshot_mounts());

    spawn_metadata_parser(caster.clone(), mount.clone());

    if !leftover.is_empty() {
        ingest(&caster, &mount, Bytes::from(leftover));
    }

    let mut buf = vec![0u8; caster.config.buffer_size];
    let mut outcome = Ok(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => ingest(&caster, &mount, Bytes::copy_from_slice(&buf[..n])),
                Err(e) => {
                    debug!(target: "caster::protocol", mount, error = %e, "uploader read error");
                    outcome = Err(ProtocolError::Io(e));
                    break;
                }
            },
        }
    }

    caster.registry.remove_mount(&mount);
    caster.fanout.unregister_mount(&mount);
    caster.sourcetable.regenerate(&caster.registry.snapshot_mounts());
    info!(target: "caster::protocol", mount, "uploader disconnected");
    outcome.map_err(Into::into)
}

fn ingest(caster: &Caster, mount: &str, data: Bytes) {
    let len = data.len() as u64;
    caster.fanout.append(mount, data);
    caster.registry.update_mount_activity(mount, len);
}

/// Registers the bounded RTCM metadata parser as a subscriber and spawns
/// its bounded-duration task alongside a sink task that folds its periodic
/// `ParseResult`s into the registry's STR fields (§4.5).
fn spawn_metadata_parser(caster: Arc<Caster>, mount: String) {
    let watermark = Instant::now();
    let rx = caster.fanout.subscribe_meta(&mount, watermark);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel();
    let geocoder = caster.geocoder.clone();
    let parser_mount = mount.clone();
    tokio::spawn(crate::parser::run(parser_mount, rx, PARSER_WINDOW, geocoder, result_tx));

    tokio::spawn(async move {
        while let Some(result) = result_rx.recv().await {
            apply_parse_result(&caster, &mount, result);
        }
    });
}

fn apply_parse_result(caster: &Caster, mount: &str, result: crate::parser::ParseResult) {
    if caster.registry.get_mount(mount).is_none() {
        return;
    }
    let location = &caster.config.caster;
    let mut station = StationInfo::defaults(&location.country, location.latitude, location.longitude);
    if let Some(id) = result.station_id {
        station.station_id = Some(id as u32);
    }
    if result.fix_obtained {
        station.identifier = result.identifier.unwrap_or_else(|| "none".to_string());
        station.country_iso3 = result.country_iso3.unwrap_or_else(|| location.country.clone());
        station.latitude = result.lat.unwrap_or(location.latitude);
        station.longitude = result.lon.unwrap_or(location.longitude);
        station.height = result.height.unwrap_or(0.0);
    }
    station.message_types = result.message_types_string;
    station.gnss_combined = result.gnss_combined;
    station.carrier_combined = result.carrier_combined;
    station.bitrate_bps = result.bitrate_bps;
    station.fix_obtained = result.fix_obtained;

    caster.registry.update_station_info(mount, station);
    caster.sourcetable.regenerate(&caster.registry.snapshot_mounts());
}
