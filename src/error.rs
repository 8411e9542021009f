//! Error taxonomy for the caster.
//!
//! Each component (catalog, protocol front-end, RTCM parser, configuration
//! loader) owns a narrow error enum. [`CasterError`] folds them into one type
//! via `#[from]` so callers at the top of the call stack can propagate with a
//! single `?` regardless of which layer failed.

use std::net::SocketAddr;

use thiserror::Error;

/// Failures raised by the SQLite-backed catalog store.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("mount '{0}' not found")]
    MountNotFound(String),

    #[error("mount '{0}' already exists")]
    MountExists(String),

    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("user '{0}' already exists")]
    UserExists(String),

    #[error("admin account not found")]
    AdminNotFound,

    #[error("bad password")]
    BadPassword,

    #[error("user is not the owner of this mount")]
    Forbidden,
}

/// Failures raised while decoding NTRIP requests or RTCM frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer {0} closed the connection before completing the handshake")]
    Hangup(SocketAddr),

    #[error("malformed request line: {0}")]
    BadRequestLine(String),

    #[error("unsupported NTRIP version")]
    UnsupportedVersion,

    #[error("missing mount point in request")]
    MissingMount,

    #[error("unauthorized")]
    Unauthorized,

    #[error("mount '{0}' is already occupied by a source")]
    MountOccupied(String),

    #[error("server is at its subscriber cap")]
    AtCapacity,

    #[error("request timed out waiting for headers")]
    HeaderTimeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures raised by the bounded RTCM metadata parser.
#[derive(Debug, Error)]
pub enum ParserError {
    #[error("frame too short to contain a header")]
    Truncated,

    #[error("CRC24Q mismatch")]
    BadCrc,

    #[error("preamble byte not found")]
    NoPreamble,
}

/// Failures raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

/// Crate-wide error type. Every component error converts into this via
/// `#[from]`, so `?` works uniformly from `main` down to a single connection
/// handler.
#[derive(Debug, Error)]
pub enum CasterError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Parser(#[from] ParserError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CasterResult<T> = Result<T, CasterError>;
