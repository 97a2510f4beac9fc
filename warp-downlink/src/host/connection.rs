//! Routing table and outbound queue of one host.

use super::{EnvelopeSink, HostObserver};
use crate::config::ClientConfig;
use crate::envelope::{peek_address, Envelope};
use crate::model::{LinkEnv, LinkKey, LinkModel};
use crate::observability::{events, fields};
use crate::scheduler::Scheduler;
use crate::uri::Uri;
use crate::value::Value;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

const COMPONENT: &str = "host_connection";

type LaneAddress = (Uri, Uri);

/// Models registered on one host, keyed by `(node, lane)`, plus the FIFO of
/// envelopes waiting for the transport.
///
/// Locks are never held while calling into a model.
pub struct HostConnection {
    host: Uri,
    config: ClientConfig,
    scheduler: Arc<Scheduler>,
    this: Weak<HostConnection>,
    connected: AtomicBool,
    models: Mutex<HashMap<LaneAddress, Arc<dyn LinkModel>>>,
    outbound: Mutex<VecDeque<Envelope>>,
    outbound_ready: Notify,
    observers: ArcSwap<Vec<Arc<dyn HostObserver>>>,
    closed: watch::Sender<bool>,
}

impl HostConnection {
    pub fn new(host: Uri, config: ClientConfig, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new_cyclic(|this| Self {
            host,
            config,
            scheduler,
            this: this.clone(),
            connected: AtomicBool::new(false),
            models: Mutex::new(HashMap::new()),
            outbound: Mutex::new(VecDeque::new()),
            outbound_ready: Notify::new(),
            observers: ArcSwap::from_pointee(Vec::new()),
            closed,
        })
    }

    pub fn host_uri(&self) -> &Uri {
        &self.host
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Environment handed to models created for this host.
    pub fn env(&self) -> LinkEnv {
        let sink: Weak<dyn EnvelopeSink> = self.this.clone();
        LinkEnv {
            sink,
            scheduler: self.scheduler.clone(),
            linked_timeout: self.config.linked_timeout(),
            unlink_timeout: self.config.unlink_timeout(),
        }
    }

    pub fn observe(&self, observer: Arc<dyn HostObserver>) {
        self.observers.rcu(|observers| {
            let mut next = Vec::clone(observers);
            next.push(observer.clone());
            next
        });
    }

    /// Registers `model` unless its `(node, lane)` is taken, and returns the
    /// model that owns the address. A newly registered model is started.
    pub fn register(&self, model: Arc<dyn LinkModel>) -> Arc<dyn LinkModel> {
        let address = Self::address_of(model.key());
        {
            let mut models = self.models.lock();
            if let Some(existing) = models.get(&address) {
                return existing.clone();
            }
            models.insert(address, model.clone());
        }
        info!(
            event = events::MODEL_REGISTERED,
            component = COMPONENT,
            key = %fields::format_key(model.key()),
            kind = %model.kind(),
            "registered downlink model"
        );
        model.start();
        model
    }

    pub fn get(&self, node: &Uri, lane: &Uri) -> Option<Arc<dyn LinkModel>> {
        self.models
            .lock()
            .get(&(Self::normalize_node(node), lane.clone()))
            .cloned()
    }

    pub fn models(&self) -> Vec<Arc<dyn LinkModel>> {
        self.models.lock().values().cloned().collect()
    }

    pub fn model_count(&self) -> usize {
        self.models.lock().len()
    }

    /// Removes every retired model that no view re-attached to.
    pub fn sweep(&self) -> usize {
        let discarded: Vec<_> = {
            let mut models = self.models.lock();
            let addresses: Vec<_> = models
                .iter()
                .filter(|(_, model)| model.is_discardable())
                .map(|(address, _)| address.clone())
                .collect();
            addresses
                .into_iter()
                .filter_map(|address| models.remove(&address))
                .collect()
        };
        for model in &discarded {
            Self::log_discarded(model.as_ref());
        }
        discarded.len()
    }

    /// Drops the model registered under `key`, whatever its state.
    pub fn remove(&self, key: &LinkKey) -> Option<Arc<dyn LinkModel>> {
        let removed = self.models.lock().remove(&Self::address_of(key));
        if let Some(model) = &removed {
            Self::log_discarded(model.as_ref());
        }
        removed
    }

    pub fn did_connect(&self) {
        self.connected.store(true, Ordering::Release);
        info!(
            event = events::HOST_CONNECTED,
            component = COMPONENT,
            host = %self.host,
            "host connected"
        );
        for model in self.models() {
            model.did_connect();
        }
        for observer in self.observers.load().iter() {
            observer.did_connect(&self.host);
        }
    }

    /// Marks the transport lost. Queued envelopes are discarded, never replayed.
    pub fn did_disconnect(&self) {
        let was_connected = self.connected.swap(false, Ordering::AcqRel);
        let discarded = {
            let mut outbound = self.outbound.lock();
            let discarded = outbound.len();
            outbound.clear();
            discarded
        };
        if discarded > 0 {
            debug!(
                event = events::OUTBOUND_DISCARDED,
                component = COMPONENT,
                host = %self.host,
                discarded,
                "discarding queued envelopes"
            );
        }
        if !was_connected {
            return;
        }
        info!(
            event = events::HOST_DISCONNECTED,
            component = COMPONENT,
            host = %self.host,
            "host disconnected"
        );
        for model in self.models() {
            model.did_disconnect();
        }
        for observer in self.observers.load().iter() {
            observer.did_disconnect(&self.host);
        }
    }

    /// Decodes and routes one inbound frame.
    ///
    /// A frame that fails to decode but still names a registered lane fails
    /// that link.
    pub fn receive_frame(&self, frame: &str) {
        match Envelope::decode(frame) {
            Ok(envelope) => self.on_envelope(envelope),
            Err(err) => {
                warn!(
                    event = events::FRAME_MALFORMED,
                    component = COMPONENT,
                    host = %self.host,
                    err = %err,
                    "dropping malformed frame"
                );
                let model = peek_address(frame).and_then(|(node, lane)| self.get(&node, &lane));
                if let Some(model) = model {
                    model.fail(err.to_string());
                }
            }
        }
    }

    pub fn on_envelope(&self, envelope: Envelope) {
        if envelope.is_host_scoped() {
            self.on_host_envelope(envelope);
            return;
        }
        match self.get(envelope.node(), envelope.lane()) {
            Some(model) => model.on_envelope(envelope),
            None => debug!(
                event = events::ENVELOPE_UNROUTED,
                component = COMPONENT,
                host = %self.host,
                envelope = %fields::format_envelope(&envelope),
                "no model for envelope"
            ),
        }
    }

    pub fn authenticate(&self, body: Value) {
        self.push_envelope(Envelope::auth(body));
    }

    pub fn deauthenticate(&self, body: Value) {
        self.push_envelope(Envelope::deauth(body));
    }

    /// Takes every queued envelope, oldest first.
    pub fn drain_outbound(&self) -> Vec<Envelope> {
        self.outbound.lock().drain(..).collect()
    }

    pub fn outbound_len(&self) -> usize {
        self.outbound.lock().len()
    }

    /// Completes once an envelope has been queued since the last wait.
    pub async fn outbound_ready(&self) {
        self.outbound_ready.notified().await;
    }

    pub fn poll_timeouts(&self, now: Instant) {
        for model in self.models() {
            model.poll_timeouts(now);
        }
    }

    /// Runs deferred tasks, then drops discardable models.
    pub fn run_pending(&self) -> usize {
        let ran = self.scheduler.run_pending();
        self.sweep();
        ran
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
        self.did_disconnect();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    fn on_host_envelope(&self, envelope: Envelope) {
        info!(
            event = events::AUTH_CHANGED,
            component = COMPONENT,
            host = %self.host,
            tag = envelope.tag(),
            "host-scoped envelope"
        );
        let body = envelope.body().cloned().unwrap_or_default();
        let observers = self.observers.load_full();
        match envelope {
            Envelope::Authed(_) => {
                for observer in observers.iter() {
                    observer.did_authenticate(&self.host, &body);
                }
            }
            Envelope::Deauthed(_) => {
                for observer in observers.iter() {
                    observer.did_deauthenticate(&self.host, &body);
                }
            }
            other => debug!(
                event = events::ENVELOPE_UNROUTED,
                component = COMPONENT,
                host = %self.host,
                envelope = %fields::format_envelope(&other),
                "ignoring outbound-only envelope"
            ),
        }
    }

    fn address_of(key: &LinkKey) -> LaneAddress {
        (key.node().clone(), key.lane().clone())
    }

    fn normalize_node(node: &Uri) -> Uri {
        if node.is_absolute() {
            Uri::new(node.path())
        } else {
            node.clone()
        }
    }

    fn log_discarded(model: &dyn LinkModel) {
        info!(
            event = events::MODEL_DISCARDED,
            component = COMPONENT,
            key = %fields::format_key(model.key()),
            "discarded downlink model"
        );
    }
}

impl EnvelopeSink for HostConnection {
    fn push_envelope(&self, envelope: Envelope) {
        if !self.is_connected() {
            debug!(
                event = events::OUTBOUND_DISCARDED,
                component = COMPONENT,
                host = %self.host,
                envelope = %fields::format_envelope(&envelope),
                "not connected, dropping envelope"
            );
            return;
        }
        let queued = {
            let mut outbound = self.outbound.lock();
            outbound.push_back(envelope);
            outbound.len()
        };
        if queued > self.config.outbound_queue_warn {
            warn!(
                event = events::OUTBOUND_BACKLOG,
                component = COMPONENT,
                host = %self.host,
                queued,
                "outbound queue is backing up"
            );
        }
        self.outbound_ready.notify_one();
    }

    fn is_connected(&self) -> bool {
        HostConnection::is_connected(self)
    }

    fn release(&self, key: &LinkKey) {
        let address = Self::address_of(key);
        let removed = {
            let mut models = self.models.lock();
            match models.get(&address) {
                Some(model) if model.is_discardable() => models.remove(&address),
                _ => None,
            }
        };
        if let Some(model) = removed {
            Self::log_discarded(model.as_ref());
        }
    }
}
