//! NTRIP Caster
//!
//! A TCP relay that receives live GNSS correction streams (RTCM) from base
//! stations and fans them out in real time to many authenticated rover
//! clients, multiplexing NTRIP 1.0 (ICY-style) and NTRIP 2.0 (HTTP/1.1
//! chunked) on a single listening port.
//!
//! `catalog` tracks mounts and users in SQLite; `buffer` holds each mount's
//! recent data in a ring for late joiners; `registry` is the in-memory
//! online-connection state; `parser` recovers station metadata from RTCM;
//! `fanout` owns every subscriber socket and is the only writer to them;
//! `protocol` is the accept loop and wire framing; `reaper` closes idle
//! connections the normal read/write paths missed; `sourcetable` renders
//! the `GET /` listing.

pub mod admin;
pub mod bitreader;
pub mod buffer;
pub mod catalog;
pub mod config;
pub mod error;
pub mod fanout;
pub mod geocode;
pub mod parser;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod sourcetable;
pub mod types;

pub use admin::AdminSurface;
pub use catalog::Catalog;
pub use config::Config;
pub use error::{CasterError, CasterResult};
pub use fanout::FanoutEngine;
pub use protocol::Caster;
pub use registry::Registry;
pub use sourcetable::SourcetableCache;
