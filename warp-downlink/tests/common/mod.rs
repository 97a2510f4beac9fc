#![allow(dead_code)]

use async_trait::async_trait;
use futures::{FutureExt, Stream, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use tokio::sync::{mpsc, Mutex};
use tracing_subscriber::EnvFilter;
use warp_downlink::{
    Client, ClientConfig, Connector, Envelope, HostConnection, Transport, TransportError, Uri,
};

pub const HOST: &str = "warp://localhost:9001";
pub const NODE: &str = "/unit/a";

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A client driven by hand, with its one host already connected.
pub struct Harness {
    pub client: Arc<Client>,
    pub host: Arc<HostConnection>,
}

impl Harness {
    pub fn connected() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        init_logging();
        let client = Client::new(config);
        let host = client.host(HOST);
        host.did_connect();
        Self { client, host }
    }

    pub fn deliver(&self, envelope: Envelope) {
        self.host.on_envelope(envelope);
    }

    pub fn flush(&self) {
        self.client.flush();
    }

    /// Drains the outbound queue.
    pub fn sent(&self) -> Vec<Envelope> {
        self.host.drain_outbound()
    }

    pub fn sent_tags(&self) -> Vec<&'static str> {
        self.sent().iter().map(Envelope::tag).collect()
    }

    /// Answers a `sync` with `linked`, the given events and `synced`.
    pub fn sync_with(&self, lane: &str, events: impl IntoIterator<Item = warp_downlink::Value>) {
        self.deliver(Envelope::linked(NODE, lane));
        for body in events {
            self.deliver(Envelope::event(NODE, lane, body));
        }
        self.deliver(Envelope::synced(NODE, lane));
    }
}

/// Everything a change stream has produced so far, without waiting.
pub fn drain<S>(stream: &mut S) -> Vec<S::Item>
where
    S: Stream + Unpin,
{
    let mut items = Vec::new();
    while let Some(Some(item)) = stream.next().now_or_never() {
        items.push(item);
    }
    items
}

/// Client half of an in-memory duplex channel.
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    inbound: Mutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, frame: String) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    async fn receive(&self) -> Result<String, TransportError> {
        self.inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }
}

/// Server half of one connection made through [`ChannelConnector`].
pub struct ServerSession {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerSession {
    pub fn send(&self, envelope: Envelope) {
        let frame = envelope.encode().expect("encodable envelope");
        self.to_client.send(frame).expect("client side is alive");
    }

    pub async fn next_envelope(&mut self) -> Envelope {
        let frame = self
            .from_client
            .recv()
            .await
            .expect("client side is alive");
        Envelope::decode(&frame).expect("client sent a valid frame")
    }
}

/// Connector that hands every new connection's server half to the test.
/// The first `failures` attempts are refused.
pub struct ChannelConnector {
    sessions: mpsc::UnboundedSender<ServerSession>,
    failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl ChannelConnector {
    pub fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSession>) {
        let (sessions, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            sessions,
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
        });
        (connector, accepted)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self, host: &Uri) -> Result<Arc<dyn Transport>, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::ConnectFailed {
                host: host.clone(),
                reason: "refused".to_string(),
            });
        }

        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        self.sessions
            .send(ServerSession {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Io("test dropped the session receiver".to_string()))?;
        Ok(Arc::new(ChannelTransport {
            outbound: client_tx,
            inbound: Mutex::new(client_rx),
        }))
    }
}
