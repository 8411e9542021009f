//! Small value types shared across components.

use std::fmt;

/// Which NTRIP revision a peer negotiated, per the version-detection rule in
/// the protocol front-end: `HTTP/1.1` + `Ntrip-Version: Ntrip/2.0` selects
/// 2.0; anything else (bare `SOURCE`, HTTP/1.0, or HTTP/1.1 without that
/// header) selects 1.0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolVersion {
    Ntrip1_0,
    Ntrip2_0,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Ntrip1_0 => write!(f, "ntrip1.0"),
            ProtocolVersion::Ntrip2_0 => write!(f, "ntrip2.0"),
        }
    }
}

/// Monotonically increasing identifier handed to each accepted subscriber
/// connection, unique for the lifetime of the process.
pub type ConnectionId = u64;
