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

use crate::config::ClientConfig;
use crate::context::DownlinkContext;
use crate::downlink::{MapDownlinkBuilder, ValueDownlinkBuilder};
use crate::host::{driver, Connector, HostConnection, HostObserver};
use crate::model::{LinkEnv, LinkModel};
use crate::observability::events;
use crate::scheduler::Scheduler;
use crate::uri::Uri;
use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const COMPONENT: &str = "client";

/// Registry of host connections and the models they route to.
///
/// A client built with [`Client::with_connector`] inside a tokio runtime
/// spawns one driver task per host that connects, pumps and reconnects on its
/// own. A client built with [`Client::new`] is driven by hand through
/// [`Client::host`] and [`Client::flush`].
pub struct Client {
    config: ClientConfig,
    scheduler: Arc<Scheduler>,
    hosts: Mutex<HashMap<Uri, Arc<HostConnection>>>,
    connector: Option<Arc<dyn Connector>>,
    runtime: Option<Handle>,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    host_observers: ArcSwap<Vec<Arc<dyn HostObserver>>>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self::build(config, None, None))
    }

    /// Builds a self-driving client. Must be called from within a tokio
    /// runtime for drivers to be spawned.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let runtime = Handle::try_current().ok();
        if runtime.is_none() {
            warn!(
                component = COMPONENT,
                "no tokio runtime, host connections will not be driven"
            );
        }
        Arc::new(Self::build(config, Some(connector), runtime))
    }

    fn build(
        config: ClientConfig,
        connector: Option<Arc<dyn Connector>>,
        runtime: Option<Handle>,
    ) -> Self {
        Self {
            config,
            scheduler: Arc::new(Scheduler::new()),
            hosts: Mutex::new(HashMap::new()),
            connector,
            runtime,
            drivers: Mutex::new(Vec::new()),
            host_observers: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// The connection for `host`, opened on first use.
    pub fn host(&self, host: impl Into<Uri>) -> Arc<HostConnection> {
        let host: Uri = host.into();
        let host = host.origin().unwrap_or(host);

        let (connection, created) = {
            let mut hosts = self.hosts.lock();
            match hosts.get(&host) {
                Some(connection) => (connection.clone(), false),
                None => {
                    let connection = HostConnection::new(
                        host.clone(),
                        self.config.clone(),
                        self.scheduler.clone(),
                    );
                    hosts.insert(host.clone(), connection.clone());
                    (connection, true)
                }
            }
        };

        if created {
            for observer in self.host_observers.load().iter() {
                connection.observe(observer.clone());
            }
            info!(
                event = events::HOST_OPENED,
                component = COMPONENT,
                host = %host,
                "opened host connection"
            );
            self.spawn_driver(&connection);
        }
        connection
    }

    pub fn hosts(&self) -> Vec<Arc<HostConnection>> {
        self.hosts.lock().values().cloned().collect()
    }

    pub fn downlink_value(self: &Arc<Self>) -> ValueDownlinkBuilder {
        ValueDownlinkBuilder::new(self.clone())
    }

    pub fn downlink_map(self: &Arc<Self>) -> MapDownlinkBuilder {
        MapDownlinkBuilder::new(self.clone())
    }

    /// Runs one scheduling step: deferred tasks, then removal of retired
    /// models. Returns how many tasks ran.
    pub fn flush(&self) -> usize {
        let ran = self.scheduler.run_pending();
        for host in self.hosts() {
            host.sweep();
        }
        ran
    }

    pub fn authenticate(&self, host: impl Into<Uri>, body: impl Into<Value>) {
        self.host(host).authenticate(body.into());
    }

    pub fn deauthenticate(&self, host: impl Into<Uri>, body: impl Into<Value>) {
        self.host(host).deauthenticate(body.into());
    }

    /// Observes every current and future host connection.
    pub fn observe_host(&self, observer: Arc<dyn HostObserver>) {
        self.host_observers.rcu(|observers| {
            let mut next = Vec::clone(observers);
            next.push(observer.clone());
            next
        });
        for host in self.hosts() {
            host.observe(observer.clone());
        }
    }

    /// Unlinks every model, closes every handle and stops the drivers.
    pub fn close(&self) {
        let hosts: Vec<_> = self.hosts.lock().drain().map(|(_, host)| host).collect();
        for host in &hosts {
            for model in host.models() {
                model.unlink();
            }
            host.close();
        }
        self.scheduler.run_pending();
        info!(
            event = events::CLIENT_CLOSED,
            component = COMPONENT,
            hosts = hosts.len(),
            "client closed"
        );
    }

    /// [`Client::close`], then waits for the driver tasks to finish.
    pub async fn shutdown(&self) {
        self.close();
        let drivers = std::mem::take(&mut *self.drivers.lock());
        for driver in drivers {
            if let Err(err) = driver.await {
                warn!(component = COMPONENT, err = %err, "host driver ended abnormally");
            }
        }
    }

    fn spawn_driver(&self, connection: &Arc<HostConnection>) {
        let (Some(connector), Some(runtime)) = (&self.connector, &self.runtime) else {
            return;
        };
        debug!(
            component = COMPONENT,
            host = %connection.host_uri(),
            "spawning host driver"
        );
        let task = runtime.spawn(driver::run(
            connection.clone(),
            connector.clone(),
            self.config.clone(),
        ));
        self.drivers.lock().push(task);
    }
}

impl DownlinkContext for Client {
    fn get_downlink(&self, host: &Uri, node: &Uri, lane: &Uri) -> Option<Arc<dyn LinkModel>> {
        let host = node
            .origin()
            .or_else(|| host.origin())
            .unwrap_or_else(|| host.clone());
        let connection = self.hosts.lock().get(&host).cloned()?;
        connection.get(node, lane)
    }

    fn link_env(&self, host: &Uri) -> LinkEnv {
        self.host(host).env()
    }

    fn open_downlink(&self, model: Arc<dyn LinkModel>) -> Arc<dyn LinkModel> {
        self.host(model.key().host()).register(model)
    }

    fn unlink_downlink(&self, model: &Arc<dyn LinkModel>) {
        model.unlink();
    }

    fn close_downlink(&self, model: &Arc<dyn LinkModel>) {
        model.unlink();
        let connection = self.hosts.lock().get(model.key().host()).cloned();
        if let Some(connection) = connection {
            let registered = connection.get(model.key().node(), model.key().lane());
            let same = registered.is_some_and(|registered| {
                Arc::as_ptr(&registered) as *const () == Arc::as_ptr(model) as *const ()
            });
            if same {
                connection.remove(model.key());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Client;
    use crate::config::ClientConfig;
    use crate::context::DownlinkContext;
    use crate::uri::Uri;
    use std::sync::Arc;

    #[test]
    fn hosts_are_keyed_by_origin() {
        let client = Client::new(ClientConfig::default());

        let first = client.host("warp://localhost:9001/unit/a");
        let second = client.host("warp://localhost:9001");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(client.hosts().len(), 1);
        assert!(client.drivers.lock().is_empty());
    }

    #[test]
    fn lookup_never_opens_a_host() {
        let client = Client::new(ClientConfig::default());

        let found = client.get_downlink(
            &Uri::from("warp://localhost:9001"),
            &Uri::from("/unit/a"),
            &Uri::from("info"),
        );

        assert!(found.is_none());
        assert!(client.hosts().is_empty());
    }
}
