//! Bounded RTCM metadata parser (C4).
//!
//! Spawned once per newly admitted mount; consumes the mount's data stream
//! through the same kind of registered pipe subscription the fan-out engine
//! hands every subscriber, for a fixed window (default 30 s), and extracts
//! just the subset of RTCM content the sourcetable needs: station identity,
//! ECEF position, device descriptors, message-type histogram, GNSS/carrier
//! coverage, and bitrate.
//!
//! Frame synchronization (preamble + CRC24Q + length) reuses `rtcm-rs`, the
//! teacher's own RTCM dependency, the same way `client.rs`'s read loop does:
//! `MessageFrame::new` validates a candidate frame and reports its length.
//! Field-level extraction for the handful of message types this parser
//! cares about is done directly against the payload bits with
//! [`crate::bitreader::BitReader`] — RTCM 10403's bit layout for 1005/1006/
//! 1033 is public, fixed, and small enough that hand-rolling it here is
//! simpler and more auditable than depending on a general-purpose decoder's
//! full field surface for three message types.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use crate::bitreader::BitReader;
use crate::error::ParserError;
use crate::geocode::{alpha2_to_alpha3, ecef_to_lla, ReverseGeocoder};

const WARMUP: Duration = Duration::from_secs(5);
const STATS_PERIOD: Duration = Duration::from_secs(10);

/// Message id -> (constellation, carrier bands), ported verbatim from the
/// original catalog's `CARRIER_INFO` table (including the SBAS 1040-1047
/// range it also carries, beyond the core MSM 1070-1127 range).
fn carrier_info(msg_id: u16) -> Option<(&'static str, &'static [&'static str])> {
    Some(match msg_id {
        1070 => ("GPS", &["L1"]),
        1071 => ("GPS", &["L1", "L2"]),
        1072 => ("GPS", &["L2"]),
        1073 => ("GPS", &["L1", "C1"]),
        1074 => ("GPS", &["L5"]),
        1075 => ("GPS", &["L1", "L5"]),
        1076 => ("GPS", &["L2", "L5"]),
        1077 => ("GPS", &["L1", "L2", "L5"]),

        1080 => ("GLO", &["G1"]),
        1081 => ("GLO", &["G1", "G2"]),
        1082 => ("GLO", &["G2"]),
        1083 => ("GLO", &["G1", "C1"]),
        1084 => ("GLO", &["G3"]),
        1085 => ("GLO", &["G1", "G3"]),
        1086 => ("GLO", &["G2", "G3"]),
        1087 => ("GLO", &["G1", "G2", "G3"]),

        1090 => ("GAL", &["E1"]),
        1091 => ("GAL", &["E1", "E5b"]),
        1092 => ("GAL", &["E5b"]),
        1093 => ("GAL", &["E1", "C1"]),
        1094 => ("GAL", &["E5a"]),
        1095 => ("GAL", &["E1", "E5a"]),
        1096 => ("GAL", &["E5b", "E5a"]),
        1097 => ("GAL", &["E1", "E5a", "E5b"]),

        1100 => ("QZSS", &["L1"]),
        1101 => ("QZSS", &["L1", "L2"]),
        1102 => ("QZSS", &["L2"]),
        1103 => ("QZSS", &["L1", "C1"]),
        1104 => ("QZSS", &["L5"]),
        1105 => ("QZSS", &["L1", "L5"]),
        1106 => ("QZSS", &["L2", "L5"]),
        1107 => ("QZSS", &["L1", "L2", "L5", "LEX"]),

        1110 => ("IRNSS", &["L5"]),
        1111 => ("IRNSS", &["L5", "S"]),
        1112 => ("IRNSS", &["S"]),
        1113 => ("IRNSS", &["L5", "C1"]),
        1114 => ("IRNSS", &["L1"]),
        1115 => ("IRNSS", &["L1", "L5"]),
        1116 => ("IRNSS", &["L1", "S"]),
        1117 => ("IRNSS", &["L1", "L5", "S"]),

        1120 => ("BDS", &["B1I"]),
        1121 => ("BDS", &["B1I", "B3I"]),
        1122 => ("BDS", &["B3I"]),
        1123 => ("BDS", &["B1I", "B2I"]),
        1124 => ("BDS", &["B2I"]),
        1125 => ("BDS", &["B1I", "B2I"]),
        1126 => ("BDS", &["B2I", "B3I"]),
        1127 => ("BDS", &["B1I", "B2I", "B3I"]),

        1040 => ("SBAS", &["L1"]),
        1041 => ("SBAS", &["L1", "L5"]),
        1042 => ("SBAS", &["L5"]),
        1043 => ("SBAS", &["L1", "C1"]),
        1044 => ("SBAS", &["L1", "L2"]),
        1045 => ("SBAS", &["L2", "L5"]),
        1046 => ("SBAS", &["L2"]),
        1047 => ("SBAS", &["L1", "L2", "L5"]),

        _ => return None,
    })
}

/// A fix extracted from a 1005/1006 message.
struct LocationFix {
    station_id: u16,
    lat: f64,
    lon: f64,
    height: f64,
}

fn parse_location_message(payload: &[u8]) -> Result<LocationFix, ParserError> {
    let mut r = BitReader::new(payload);
    let _msg_number = r.read_u64(12).ok_or(ParserError::Truncated)?;
    let station_id = r.read_u64(12).ok_or(ParserError::Truncated)? as u16;
    let _itrf_year = r.read_u64(6).ok_or(ParserError::Truncated)?;
    let _gps_ind = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let _glo_ind = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let _galileo_ind = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let _ref_station_ind = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let x_raw = r.read_i64(38).ok_or(ParserError::Truncated)?;
    let _osc_ind = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let _reserved = r.read_u64(1).ok_or(ParserError::Truncated)?;
    let y_raw = r.read_i64(38).ok_or(ParserError::Truncated)?;
    let _quarter_cycle = r.read_u64(2).ok_or(ParserError::Truncated)?;
    let z_raw = r.read_i64(38).ok_or(ParserError::Truncated)?;

    let scale = 0.0001;
    let x = x_raw as f64 * scale;
    let y = y_raw as f64 * scale;
    let z = z_raw as f64 * scale;
    let (lat, lon, height) = ecef_to_lla(x, y, z);
    Ok(LocationFix {
        station_id,
        lat,
        lon,
        height,
    })
}

struct DeviceInfo {
    antenna_descriptor: String,
    receiver_type: String,
    firmware_version: String,
    antenna_serial: String,
}

fn read_length_prefixed_ascii(r: &mut BitReader<'_>) -> Result<String, ParserError> {
    let len = r.read_u64(8).ok_or(ParserError::Truncated)? as usize;
    let bytes = r.read_bytes(len).ok_or(ParserError::Truncated)?;
    Ok(String::from_utf8_lossy(bytes).trim().to_string())
}

fn parse_device_message(payload: &[u8]) -> Result<DeviceInfo, ParserError> {
    let mut r = BitReader::new(payload);
    let _msg_number = r.read_u64(12).ok_or(ParserError::Truncated)?;
    let _station_id = r.read_u64(12).ok_or(ParserError::Truncated)?;
    // payload is byte-aligned from here on (24 bits consumed).
    let antenna_descriptor = read_length_prefixed_ascii(&mut r)?;
    let _setup_id = r.read_u64(8).ok_or(ParserError::Truncated)?;
    let antenna_serial = read_length_prefixed_ascii(&mut r)?;
    let receiver_type = read_length_prefixed_ascii(&mut r)?;
    let firmware_version = read_length_prefixed_ascii(&mut r)?;
    Ok(DeviceInfo {
        antenna_descriptor,
        receiver_type,
        firmware_version,
        antenna_serial,
    })
}

/// The result produced every 10 s and once at shutdown; C3 overwrites STR
/// fields from it.
#[derive(Debug, Clone)]
pub struct ParseResult {
    pub mount: String,
    pub station_id: Option<u16>,
    pub identifier: Option<String>,
    pub country_iso3: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub height: Option<f64>,
    pub antenna_descriptor: Option<String>,
    pub receiver_type: Option<String>,
    pub firmware_version: Option<String>,
    pub antenna_serial: Option<String>,
    pub message_types_string: String,
    pub gnss_combined: String,
    pub carrier_combined: String,
    pub bitrate_bps: f64,
    pub fix_obtained: bool,
}

struct ParserState {
    mount: String,
    type_counts: HashMap<u16, u64>,
    gnss: HashSet<&'static str>,
    carriers: HashSet<&'static str>,
    fix: Option<LocationFix>,
    device: Option<DeviceInfo>,
    geocoded: Option<(String, String)>,
    bytes_since_warmup: u64,
    warmup_deadline: Instant,
    stats_started: bool,
    window_start: Instant,
}

impl ParserState {
    fn new(mount: String, now: Instant) -> Self {
        Self {
            mount,
            type_counts: HashMap::new(),
            gnss: HashSet::new(),
            carriers: HashSet::new(),
            fix: None,
            device: None,
            geocoded: None,
            bytes_since_warmup: 0,
            warmup_deadline: now + WARMUP,
            stats_started: false,
            window_start: now,
        }
    }

    fn ingest(&mut self, payload: &[u8], geocoder: &dyn ReverseGeocoder) {
        if payload.len() < 2 {
            return;
        }
        let mut header = BitReader::new(payload);
        let Some(msg_id) = header.read_u64(12) else {
            return;
        };
        let msg_id = msg_id as u16;
        *self.type_counts.entry(msg_id).or_insert(0) += 1;

        match msg_id {
            1005 | 1006 => match parse_location_message(payload) {
                Ok(fix) => {
                    if self.geocoded.is_none() {
                        self.geocoded = geocoder.reverse_geocode(fix.lat, fix.lon);
                    }
                    self.fix = Some(fix);
                }
                Err(e) => debug!(target: "caster::parser", mount = %self.mount, msg_id, error = %e, "failed to decode location message"),
            },
            1033 => match parse_device_message(payload) {
                Ok(device) => self.device = Some(device),
                Err(e) => debug!(target: "caster::parser", mount = %self.mount, msg_id, error = %e, "failed to decode device message"),
            },
            _ => {
                if let Some((gnss, carriers)) = carrier_info(msg_id) {
                    self.gnss.insert(gnss);
                    for c in carriers {
                        self.carriers.insert(c);
                    }
                }
            }
        }

        let now = Instant::now();
        if now >= self.warmup_deadline {
            if !self.stats_started {
                self.stats_started = true;
                self.window_start = now;
            }
            self.bytes_since_warmup += payload.len() as u64;
        }
    }

    fn bitrate_bps(&self) -> f64 {
        if !self.stats_started {
            return 0.0;
        }
        let elapsed = Instant::now().duration_since(self.window_start).as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            (self.bytes_since_warmup as f64 * 8.0) / elapsed
        }
    }

    fn snapshot(&self, stats_period_secs: f64) -> ParseResult {
        let message_types_string = {
            let mut entries: Vec<_> = self.type_counts.iter().collect();
            entries.sort_by_key(|(id, _)| **id);
            entries
                .iter()
                .map(|(id, count)| {
                    let freq = ((**count as f64) / stats_period_secs).round().max(1.0) as u64;
                    format!("{id}({freq})")
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        let gnss_combined = if self.gnss.is_empty() {
            "N/A".to_string()
        } else {
            let mut v: Vec<_> = self.gnss.iter().copied().collect();
            v.sort_unstable();
            v.join("+")
        };
        let carrier_combined = if self.carriers.is_empty() {
            "N/A".to_string()
        } else {
            let mut v: Vec<_> = self.carriers.iter().copied().collect();
            v.sort_unstable();
            v.join("+")
        };

        let (country_iso3, identifier) = match &self.geocoded {
            Some((alpha2, city)) => (Some(alpha2_to_alpha3(alpha2)), Some(city.clone())),
            None => (None, None),
        };

        ParseResult {
            mount: self.mount.clone(),
            station_id: self.fix.as_ref().map(|f| f.station_id),
            identifier,
            country_iso3,
            lat: self.fix.as_ref().map(|f| f.lat),
            lon: self.fix.as_ref().map(|f| f.lon),
            height: self.fix.as_ref().map(|f| f.height),
            antenna_descriptor: self.device.as_ref().map(|d| d.antenna_descriptor.clone()),
            receiver_type: self.device.as_ref().map(|d| d.receiver_type.clone()),
            firmware_version: self.device.as_ref().map(|d| d.firmware_version.clone()),
            antenna_serial: self.device.as_ref().map(|d| d.antenna_serial.clone()),
            message_types_string,
            gnss_combined,
            carrier_combined,
            bitrate_bps: self.bitrate_bps(),
            fix_obtained: self.fix.is_some(),
        }
    }
}

/// Runs the bounded metadata parser for one mount. `rx` is the in-process
/// pipe the fan-out engine feeds raw uploaded chunks into, the same way it
/// feeds any other subscriber. Emits a [`ParseResult`] on `results` every
/// [`STATS_PERIOD`] and once more when the window ends.
pub async fn run(
    mount: String,
    mut rx: mpsc::UnboundedReceiver<bytes::Bytes>,
    window: Duration,
    geocoder: std::sync::Arc<dyn ReverseGeocoder>,
    results: mpsc::UnboundedSender<ParseResult>,
) {
    let start = Instant::now();
    let mut state = ParserState::new(mount.clone(), start);
    let mut ticker = interval(STATS_PERIOD);
    ticker.tick().await; // consume the immediate first tick

    loop {
        let remaining = window.saturating_sub(start.elapsed());
        if remaining.is_zero() {
            break;
        }
        tokio::select! {
            biased;
            chunk = rx.recv() => {
                match chunk {
                    Some(bytes) => scan_frames(&bytes, &mut state, geocoder.as_ref()),
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let result = state.snapshot(STATS_PERIOD.as_secs_f64());
                debug!(target: "caster::parser", mount = %mount, "periodic parse result");
                if results.send(result).is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(remaining) => break,
        }
    }

    let final_result = state.snapshot(STATS_PERIOD.as_secs_f64());
    if final_result.fix_obtained {
        debug!(target: "caster::parser", mount = %mount, "parser window closed with a fix");
    } else {
        warn!(target: "caster::parser", mount = %mount, "parser window closed without a fix");
    }
    let _ = results.send(final_result);
}

/// Scans a raw chunk for RTCM3 frames (preamble `0xD3`, CRC24Q-checked via
/// `rtcm_rs`) and hands each validated payload to `state`.
fn scan_frames(chunk: &[u8], state: &mut ParserState, geocoder: &dyn ReverseGeocoder) {
    let mut offset = 0;
    while offset < chunk.len() {
        match rtcm_rs::MessageFrame::new(&chunk[offset..]) {
            Ok(frame) => {
                let len = frame.frame_len();
                if len == 0 {
                    break;
                }
                // Payload is the frame sans the 3-byte header and 3-byte CRC.
                if len > 6 && offset + len <= chunk.len() {
                    let payload = &chunk[offset + 3..offset + len - 3];
                    state.ingest(payload, geocoder);
                }
                offset += len;
            }
            Err(_) => {
                let err = if chunk[offset] == 0xD3 { ParserError::BadCrc } else { ParserError::NoPreamble };
                debug!(target: "caster::parser", offset, error = %err, "dropping one byte and resyncing");
                offset += 1;
            }
        }
    }
}
