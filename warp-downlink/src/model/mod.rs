/********************************************************************************
 * Copyright (c) 2024 Contributors to the Eclipse Foundation
 *
 * See the NOTICE file(s) distributed with this work for additional
 * information regarding copyright ownership.
 *
 * This program and the accompanying materials are made available under the
 * terms of the Apache License Version 2.0 which is available at
 * https://www.apache.org/licenses/LICENSE-2.0
 *
 * SPDX-License-Identifier: Apache-2.0
 ********************************************************************************/

//! Shared per-lane replicas and their link state machine.
//!
//! Exactly one [`DownlinkModel`] exists per [`LinkKey`] on a host connection.
//! Handles attach to it as views; the model owns the replica, talks to the
//! host through an [`EnvelopeSink`] and fans changes out to its views.

mod downlink_model;
mod map_replica;
mod replica;
mod view;

pub use downlink_model::DownlinkModel;
pub use map_replica::{MapChange, MapReplica};
pub use replica::{Replica, ValueChange, ValueReplica};
pub use view::{DownlinkId, ModelView};

use crate::envelope::Envelope;
use crate::error::DownlinkError;
use crate::host::EnvelopeSink;
use crate::scheduler::Scheduler;
use crate::uri::Uri;
use std::any::Any;
use std::fmt::{self, Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

pub type ValueDownlinkModel = DownlinkModel<ValueReplica>;
pub type MapDownlinkModel = DownlinkModel<MapReplica>;

/// Identity of a model: `(host, node, lane)`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkKey {
    host: Uri,
    node: Uri,
    lane: Uri,
}

impl LinkKey {
    /// Validates and normalizes a lane address.
    ///
    /// An absolute `node` carries its own host, which must agree with `host`
    /// when one is given. The stored node is the host-relative path used on
    /// the wire.
    pub fn new(
        host: impl Into<Uri>,
        node: impl Into<Uri>,
        lane: impl Into<Uri>,
    ) -> Result<Self, DownlinkError> {
        let host: Uri = host.into();
        let node: Uri = node.into();
        let lane: Uri = lane.into();

        if node.is_empty() {
            return Err(DownlinkError::InvalidAddress("empty node uri".to_string()));
        }
        if lane.is_empty() {
            return Err(DownlinkError::InvalidAddress("empty lane uri".to_string()));
        }

        let host = host.origin().unwrap_or(host);
        let (host, node) = match node.origin() {
            Some(origin) => {
                if !host.is_empty() && host != origin {
                    return Err(DownlinkError::HostMismatch { host, node });
                }
                let path = node.path();
                if path.is_empty() || path == "/" {
                    return Err(DownlinkError::InvalidAddress(format!(
                        "node uri {node} has no path"
                    )));
                }
                (origin, Uri::new(path))
            }
            None if host.is_empty() => {
                return Err(DownlinkError::InvalidAddress(format!(
                    "relative node uri {node} requires a host"
                )));
            }
            None => (host, node),
        };

        Ok(Self { host, node, lane })
    }

    pub fn host(&self) -> &Uri {
        &self.host
    }

    pub fn node(&self) -> &Uri {
        &self.node
    }

    pub fn lane(&self) -> &Uri {
        &self.lane
    }

    /// The node resolved against its host.
    pub fn node_uri(&self) -> Uri {
        self.host.resolve(&self.node)
    }
}

impl Display for LinkKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.node_uri(), self.lane)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DownlinkKind {
    Value,
    Map,
}

impl Display for DownlinkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DownlinkKind::Value => f.write_str("value"),
            DownlinkKind::Map => f.write_str("map"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LinkState {
    Unlinked,
    Linking,
    Linked,
    Syncing,
    Synced,
    Unlinking,
}

impl LinkState {
    /// True while a link is requested or established.
    pub fn is_active(&self) -> bool {
        !matches!(self, LinkState::Unlinked | LinkState::Unlinking)
    }
}

/// What a model needs from its surroundings, handed over at construction.
#[derive(Clone)]
pub struct LinkEnv {
    pub sink: Weak<dyn EnvelopeSink>,
    pub scheduler: Arc<Scheduler>,
    pub linked_timeout: Duration,
    pub unlink_timeout: Duration,
}

/// Kind-erased model interface used by host routing and the registry.
pub trait LinkModel: Send + Sync {
    fn key(&self) -> &LinkKey;

    fn kind(&self) -> DownlinkKind;

    fn state(&self) -> LinkState;

    /// Requests the link once the model is registered.
    fn start(&self);

    fn on_envelope(&self, envelope: Envelope);

    /// Tears the link down after a protocol violation.
    fn fail(&self, reason: String);

    /// Explicit unlink, regardless of attached views.
    fn unlink(&self);

    fn did_connect(&self);

    fn did_disconnect(&self);

    fn poll_timeouts(&self, now: Instant);

    fn view_count(&self) -> usize;

    /// Retired with no views left; the registry may drop it.
    fn is_discardable(&self) -> bool;

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Recovers the concrete model behind a registry entry.
pub fn downcast_model<R: Replica>(
    model: Arc<dyn LinkModel>,
) -> Result<Arc<DownlinkModel<R>>, DownlinkError> {
    let key = model.key().clone();
    let existing = model.kind();
    model
        .as_any()
        .downcast::<DownlinkModel<R>>()
        .map_err(|_| DownlinkError::KindMismatch { key, existing })
}

#[cfg(test)]
mod tests {
    use super::{DownlinkKind, LinkKey, LinkState};
    use crate::error::DownlinkError;

    #[test]
    fn absolute_node_supplies_the_host() {
        let key = LinkKey::new("", "warp://example.com:9001/unit/a", "info").expect("valid");

        assert_eq!(key.host().as_str(), "warp://example.com:9001");
        assert_eq!(key.node().as_str(), "/unit/a");
        assert_eq!(key.node_uri().as_str(), "warp://example.com:9001/unit/a");
        assert_eq!(key.to_string(), "warp://example.com:9001/unit/a#info");
    }

    #[test]
    fn relative_node_keeps_its_path() {
        let key = LinkKey::new("warp://example.com/", "/unit/a", "info").expect("valid");

        assert_eq!(key.host().as_str(), "warp://example.com");
        assert_eq!(key.node().as_str(), "/unit/a");
    }

    #[test]
    fn rejects_empty_parts_and_mismatched_hosts() {
        assert!(matches!(
            LinkKey::new("warp://a", "", "info"),
            Err(DownlinkError::InvalidAddress(_))
        ));
        assert!(matches!(
            LinkKey::new("warp://a", "/unit", ""),
            Err(DownlinkError::InvalidAddress(_))
        ));
        assert!(matches!(
            LinkKey::new("warp://a", "warp://b/unit", "info"),
            Err(DownlinkError::HostMismatch { .. })
        ));
        assert!(matches!(
            LinkKey::new("", "/unit", "info"),
            Err(DownlinkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn kind_and_state_render() {
        assert_eq!(DownlinkKind::Map.to_string(), "map");
        assert!(LinkState::Synced.is_active());
        assert!(!LinkState::Unlinking.is_active());
    }
}
