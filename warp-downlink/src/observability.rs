//! Stable event names and field formatters shared by all `tracing` call sites.

pub mod events {
    pub const MODEL_REGISTERED: &str = "model_registered";
    pub const MODEL_DISCARDED: &str = "model_discarded";
    pub const LINK_REQUESTED: &str = "link_requested";
    pub const LINK_ESTABLISHED: &str = "link_established";
    pub const LINK_SYNCED: &str = "link_synced";
    pub const LINK_UNLINKED: &str = "link_unlinked";
    pub const UNLINK_REQUESTED: &str = "unlink_requested";
    pub const UNLINK_TIMED_OUT: &str = "unlink_timed_out";
    pub const EVENT_BUFFERED: &str = "event_buffered";
    pub const EVENT_DROPPED: &str = "event_dropped";
    pub const PROTOCOL_VIOLATION: &str = "protocol_violation";
    pub const COMMAND_DROPPED: &str = "command_dropped";
    pub const FORM_MISMATCH: &str = "form_mismatch";
    pub const VIEW_ATTACHED: &str = "view_attached";
    pub const VIEW_DETACHED: &str = "view_detached";
    pub const ENVELOPE_UNROUTED: &str = "envelope_unrouted";
    pub const FRAME_MALFORMED: &str = "frame_malformed";
    pub const HOST_CONNECTED: &str = "host_connected";
    pub const HOST_DISCONNECTED: &str = "host_disconnected";
    pub const HOST_CONNECT_FAILED: &str = "host_connect_failed";
    pub const OUTBOUND_DISCARDED: &str = "outbound_discarded";
    pub const OUTBOUND_BACKLOG: &str = "outbound_backlog";
    pub const SEND_FAILED: &str = "send_failed";
    pub const AUTH_CHANGED: &str = "auth_changed";
    pub const HOST_OPENED: &str = "host_opened";
    pub const CLIENT_CLOSED: &str = "client_closed";
}

pub mod fields {
    use crate::envelope::Envelope;
    use crate::model::LinkKey;

    pub fn format_key(key: &LinkKey) -> String {
        format!("{}{}#{}", key.host(), key.node(), key.lane())
    }

    pub fn format_envelope(envelope: &Envelope) -> String {
        format!(
            "{}(node: {}, lane: {})",
            envelope.tag(),
            envelope.node(),
            envelope.lane()
        )
    }
}
