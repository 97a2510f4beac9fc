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

//! # warp-downlink
//!
//! `warp-downlink` keeps local replicas of remote value and map lanes in sync
//! over one multiplexed connection per host.
//!
//! Any number of typed handles ([`ValueDownlink`], [`MapDownlink`]) may be
//! opened on the same `(host, node, lane)`; they all share a single
//! [`DownlinkModel`](model::DownlinkModel) and a single link on the wire.
//! Internal modules are organized by layer: [`envelope`] is the wire codec,
//! [`host`] multiplexes links over a transport, [`model`] runs the per-link
//! state machine and [`downlink`] exposes the typed handles.
//!
//! ## Manually Driven Client
//!
//! Without a [`Connector`] the embedding feeds envelopes in and drains them
//! out itself, which is also how the tests drive the client.
//!
//! ```
//! use warp_downlink::{Client, ClientConfig, Envelope, IntForm};
//!
//! let client = Client::new(ClientConfig::default());
//! let host = client.host("warp://localhost:9001");
//! host.did_connect();
//!
//! let counter = client
//!     .downlink_value()
//!     .host("warp://localhost:9001")
//!     .node("/unit/a")
//!     .lane("count")
//!     .value_form(IntForm)
//!     .open()
//!     .unwrap();
//! assert_eq!(host.drain_outbound()[0].tag(), "sync");
//!
//! host.on_envelope(Envelope::linked("/unit/a", "count"));
//! host.on_envelope(Envelope::event("/unit/a", "count", 5));
//! host.on_envelope(Envelope::synced("/unit/a", "count"));
//! client.flush();
//!
//! assert_eq!(counter.get(), 5);
//! ```
//!
//! ## Self-Driving Client
//!
//! With a [`Connector`], every host gets a tokio task that connects, pumps
//! frames and reconnects with exponential backoff.
//!
//! ```no_run
//! use std::sync::Arc;
//! use warp_downlink::{Client, ClientConfig, Connector};
//!
//! # async fn run(connector: Arc<dyn Connector>) {
//! let client = Client::with_connector(ClientConfig::default(), connector);
//! let map = client
//!     .downlink_map()
//!     .node("warp://localhost:9001/unit/a")
//!     .lane("members")
//!     .open()
//!     .unwrap();
//! # drop(map);
//! client.shutdown().await;
//! # }
//! ```

pub mod client;
pub mod coherence;
pub mod config;
pub mod context;
pub mod downlink;
pub mod envelope;
pub mod error;
pub mod host;
pub mod model;
pub mod observability;
pub mod scheduler;
pub mod uri;
pub mod value;

pub use client::Client;
pub use config::{ClientConfig, DownlinkConfig, ReconnectConfig};
pub use context::DownlinkContext;
pub use downlink::{
    BoolForm, FloatForm, Form, IntForm, JsonForm, MapDownlink, MapDownlinkBuilder, MapEvent,
    MapObserver, TextForm, ValueDownlink, ValueDownlinkBuilder, ValueEvent, ValueForm,
    ValueObserver,
};
pub use envelope::Envelope;
pub use error::{ConfigError, DownlinkError, EnvelopeError, TransportError};
pub use host::{Connector, HostConnection, HostObserver, Transport};
pub use model::{DownlinkId, LinkKey, LinkState};
pub use uri::Uri;
pub use value::Value;
