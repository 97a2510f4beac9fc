//! Error types for misuse, protocol, codec, transport and config failures.

use crate::model::{DownlinkKind, LinkKey};
use crate::uri::Uri;
use std::path::PathBuf;
use thiserror::Error;

/// Failures surfaced by downlink handles and models.
///
/// Misuse variants are returned synchronously from the offending call.
/// `ProtocolViolation` only ever reaches consumers through `did_fail`.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DownlinkError {
    #[error("invalid downlink address: {0}")]
    InvalidAddress(String),

    #[error("node {node} is not served by host {host}")]
    HostMismatch { host: Uri, node: Uri },

    #[error("downlink is not open")]
    NotOpen,

    #[error("{key} is already linked as a {existing} downlink")]
    KindMismatch { key: LinkKey, existing: DownlinkKind },

    #[error("protocol violation on {key}: {reason}")]
    ProtocolViolation { key: LinkKey, reason: String },
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,

    #[error("unable to connect to {host}: {reason}")]
    ConnectFailed { host: Uri, reason: String },

    #[error("transport i/o failure: {0}")]
    Io(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unable to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}
