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

//! One multiplexed connection per host.
//!
//! [`HostConnection`] is transport-agnostic: it consumes inbound frames,
//! routes envelopes to models and queues outbound envelopes. The async
//! driver in [`driver`] pumps it through a [`Transport`]; embeddings without
//! a [`Connector`] call the same methods by hand.

mod backoff;
mod connection;
pub(crate) mod driver;
mod transport;

pub use backoff::Backoff;
pub use connection::HostConnection;
pub use transport::{Connector, Transport};

use crate::envelope::Envelope;
use crate::model::LinkKey;
use crate::uri::Uri;
use crate::value::Value;

/// Outbound side of a host connection, as seen by the models it routes to.
pub trait EnvelopeSink: Send + Sync {
    /// Queues an envelope for the transport. Dropped while disconnected.
    fn push_envelope(&self, envelope: Envelope);

    fn is_connected(&self) -> bool;

    /// Drops the model registered under `key` if it is retired with no views.
    fn release(&self, key: &LinkKey);
}

/// Connection-level notifications.
pub trait HostObserver: Send + Sync {
    fn did_connect(&self, _host: &Uri) {}

    fn did_disconnect(&self, _host: &Uri) {}

    fn did_authenticate(&self, _host: &Uri, _body: &Value) {}

    fn did_deauthenticate(&self, _host: &Uri, _body: &Value) {}
}
