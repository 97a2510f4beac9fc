//! Async task that keeps one [`HostConnection`] attached to a transport.

use super::{Backoff, Connector, HostConnection, Transport};
use crate::config::ClientConfig;
use crate::error::TransportError;
use crate::observability::events;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

const COMPONENT: &str = "host_driver";

enum SessionEnd {
    Closed,
    Lost(TransportError),
}

/// Connects, pumps and reconnects until the connection is closed.
pub(crate) async fn run(
    connection: Arc<HostConnection>,
    connector: Arc<dyn Connector>,
    config: ClientConfig,
) {
    let mut backoff = Backoff::new(&config.reconnect);
    let mut closed = connection.closed();

    loop {
        if *closed.borrow() {
            break;
        }

        let connected = tokio::select! {
            result = connector.connect(connection.host_uri()) => result,
            _ = closed.changed() => break,
        };
        let transport = match connected {
            Ok(transport) => {
                backoff.reset();
                transport
            }
            Err(err) => {
                let delay = backoff.next_delay();
                warn!(
                    event = events::HOST_CONNECT_FAILED,
                    component = COMPONENT,
                    host = %connection.host_uri(),
                    err = %err,
                    delay_ms = delay.as_millis() as u64,
                    "unable to connect, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = closed.changed() => break,
                }
            }
        };

        let session = Uuid::new_v4();
        debug!(
            component = COMPONENT,
            host = %connection.host_uri(),
            %session,
            "transport session started"
        );
        connection.did_connect();
        connection.run_pending();

        let end = pump(&connection, transport.as_ref(), &mut closed, &config).await;
        connection.did_disconnect();
        connection.run_pending();

        match end {
            SessionEnd::Closed => break,
            SessionEnd::Lost(err) => {
                let delay = backoff.next_delay();
                info!(
                    component = COMPONENT,
                    host = %connection.host_uri(),
                    %session,
                    err = %err,
                    delay_ms = delay.as_millis() as u64,
                    "transport lost, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = closed.changed() => break,
                }
            }
        }
    }

    debug!(
        component = COMPONENT,
        host = %connection.host_uri(),
        "host driver stopped"
    );
}

async fn pump(
    connection: &HostConnection,
    transport: &dyn Transport,
    closed: &mut watch::Receiver<bool>,
    config: &ClientConfig,
) -> SessionEnd {
    let mut ticker = tokio::time::interval(config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        for envelope in connection.drain_outbound() {
            let frame = match envelope.encode() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(
                        event = events::SEND_FAILED,
                        component = COMPONENT,
                        host = %connection.host_uri(),
                        err = %err,
                        "unable to encode envelope"
                    );
                    continue;
                }
            };
            if let Err(err) = transport.send(frame).await {
                return SessionEnd::Lost(err);
            }
        }

        tokio::select! {
            received = transport.receive() => match received {
                Ok(frame) => connection.receive_frame(&frame),
                Err(err) => return SessionEnd::Lost(err),
            },
            _ = connection.outbound_ready() => {}
            _ = ticker.tick() => connection.poll_timeouts(Instant::now()),
            _ = closed.changed() => return SessionEnd::Closed,
        }

        connection.run_pending();
    }
}
