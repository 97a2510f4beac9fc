//! Addressed protocol messages and their JSON frame codec.
//!
//! Every envelope is one JSON object whose `tag` field names the message kind:
//!
//! ```text
//! {"tag":"sync","node":"/unit/house","lane":"lights","prio":0.5}
//! {"tag":"event","node":"/unit/house","lane":"lights","body":{"@tag":"update","key":"hall","value":true}}
//! {"tag":"auth","body":{"token":"..."}}
//! ```
//!
//! `event`, `command` and the four auth kinds require a body; decoding a frame
//! without one fails.

use crate::error::EnvelopeError;
use crate::uri::Uri;
use crate::value::Value;
use serde::{Deserialize, Serialize};

fn is_zero(number: &f64) -> bool {
    *number == 0.0
}

/// Address, hints and optional body of `link`, `sync` and `linked`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub node: Uri,
    pub lane: Uri,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub prio: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rate: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl LinkRequest {
    pub fn new(node: impl Into<Uri>, lane: impl Into<Uri>) -> Self {
        Self {
            node: node.into(),
            lane: lane.into(),
            ..Default::default()
        }
    }
}

/// Bodiless lane address, used by `synced`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneAddress {
    pub node: Uri,
    pub lane: Uri,
}

/// Lane address with an optional body, used by `unlink` and `unlinked`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneMessage {
    pub node: Uri,
    pub lane: Uri,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Lane address with a required body, used by `event` and `command`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneEvent {
    pub node: Uri,
    pub lane: Uri,
    pub body: Value,
}

/// Host-scoped message with a required body, used by the auth kinds.
///
/// Node and lane are carried for uniform routing but are normally empty.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMessage {
    #[serde(default, skip_serializing_if = "Uri::is_empty")]
    pub node: Uri,
    #[serde(default, skip_serializing_if = "Uri::is_empty")]
    pub lane: Uri,
    pub body: Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum Envelope {
    Link(LinkRequest),
    Linked(LinkRequest),
    Sync(LinkRequest),
    Synced(LaneAddress),
    Unlink(LaneMessage),
    Unlinked(LaneMessage),
    Event(LaneEvent),
    Command(LaneEvent),
    Auth(HostMessage),
    Authed(HostMessage),
    Deauth(HostMessage),
    Deauthed(HostMessage),
}

impl Envelope {
    pub fn linked(node: impl Into<Uri>, lane: impl Into<Uri>) -> Self {
        Envelope::Linked(LinkRequest::new(node, lane))
    }

    pub fn synced(node: impl Into<Uri>, lane: impl Into<Uri>) -> Self {
        Envelope::Synced(LaneAddress {
            node: node.into(),
            lane: lane.into(),
        })
    }

    pub fn unlink(node: impl Into<Uri>, lane: impl Into<Uri>) -> Self {
        Envelope::Unlink(LaneMessage {
            node: node.into(),
            lane: lane.into(),
            body: None,
        })
    }

    pub fn unlinked(node: impl Into<Uri>, lane: impl Into<Uri>) -> Self {
        Envelope::Unlinked(LaneMessage {
            node: node.into(),
            lane: lane.into(),
            body: None,
        })
    }

    pub fn event(node: impl Into<Uri>, lane: impl Into<Uri>, body: impl Into<Value>) -> Self {
        Envelope::Event(LaneEvent {
            node: node.into(),
            lane: lane.into(),
            body: body.into(),
        })
    }

    pub fn command(node: impl Into<Uri>, lane: impl Into<Uri>, body: impl Into<Value>) -> Self {
        Envelope::Command(LaneEvent {
            node: node.into(),
            lane: lane.into(),
            body: body.into(),
        })
    }

    pub fn auth(body: impl Into<Value>) -> Self {
        Envelope::Auth(HostMessage {
            body: body.into(),
            ..Default::default()
        })
    }

    pub fn authed(body: impl Into<Value>) -> Self {
        Envelope::Authed(HostMessage {
            body: body.into(),
            ..Default::default()
        })
    }

    pub fn deauth(body: impl Into<Value>) -> Self {
        Envelope::Deauth(HostMessage {
            body: body.into(),
            ..Default::default()
        })
    }

    pub fn deauthed(body: impl Into<Value>) -> Self {
        Envelope::Deauthed(HostMessage {
            body: body.into(),
            ..Default::default()
        })
    }

    /// Wire tag of this envelope kind.
    pub fn tag(&self) -> &'static str {
        match self {
            Envelope::Link(_) => "link",
            Envelope::Linked(_) => "linked",
            Envelope::Sync(_) => "sync",
            Envelope::Synced(_) => "synced",
            Envelope::Unlink(_) => "unlink",
            Envelope::Unlinked(_) => "unlinked",
            Envelope::Event(_) => "event",
            Envelope::Command(_) => "command",
            Envelope::Auth(_) => "auth",
            Envelope::Authed(_) => "authed",
            Envelope::Deauth(_) => "deauth",
            Envelope::Deauthed(_) => "deauthed",
        }
    }

    pub fn node(&self) -> &Uri {
        match self {
            Envelope::Link(m) | Envelope::Linked(m) | Envelope::Sync(m) => &m.node,
            Envelope::Synced(m) => &m.node,
            Envelope::Unlink(m) | Envelope::Unlinked(m) => &m.node,
            Envelope::Event(m) | Envelope::Command(m) => &m.node,
            Envelope::Auth(m) | Envelope::Authed(m) | Envelope::Deauth(m) | Envelope::Deauthed(m) => {
                &m.node
            }
        }
    }

    pub fn lane(&self) -> &Uri {
        match self {
            Envelope::Link(m) | Envelope::Linked(m) | Envelope::Sync(m) => &m.lane,
            Envelope::Synced(m) => &m.lane,
            Envelope::Unlink(m) | Envelope::Unlinked(m) => &m.lane,
            Envelope::Event(m) | Envelope::Command(m) => &m.lane,
            Envelope::Auth(m) | Envelope::Authed(m) | Envelope::Deauth(m) | Envelope::Deauthed(m) => {
                &m.lane
            }
        }
    }

    pub fn body(&self) -> Option<&Value> {
        match self {
            Envelope::Link(m) | Envelope::Linked(m) | Envelope::Sync(m) => m.body.as_ref(),
            Envelope::Synced(_) => None,
            Envelope::Unlink(m) | Envelope::Unlinked(m) => m.body.as_ref(),
            Envelope::Event(m) | Envelope::Command(m) => Some(&m.body),
            Envelope::Auth(m) | Envelope::Authed(m) | Envelope::Deauth(m) | Envelope::Deauthed(m) => {
                Some(&m.body)
            }
        }
    }

    /// True for the host-scoped authentication kinds, which never route to a lane.
    pub fn is_host_scoped(&self) -> bool {
        matches!(
            self,
            Envelope::Auth(_) | Envelope::Authed(_) | Envelope::Deauth(_) | Envelope::Deauthed(_)
        )
    }

    pub fn encode(&self) -> Result<String, EnvelopeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Envelope, EnvelopeError> {
        Ok(serde_json::from_str(frame)?)
    }
}

/// Best-effort `(node, lane)` extraction from a frame that failed to decode.
pub(crate) fn peek_address(frame: &str) -> Option<(Uri, Uri)> {
    let json: serde_json::Value = serde_json::from_str(frame).ok()?;
    let node = json.get("node")?.as_str()?;
    let lane = json.get("lane")?.as_str()?;
    Some((Uri::from(node), Uri::from(lane)))
}

#[cfg(test)]
mod tests {
    use super::{peek_address, Envelope, LinkRequest};
    use crate::uri::Uri;
    use crate::value::Value;

    #[test]
    fn sync_frame_omits_zero_hints_and_missing_body() {
        let envelope = Envelope::Sync(LinkRequest::new("/unit/house", "lights"));

        let frame = envelope.encode().expect("encodes");

        assert_eq!(frame, r#"{"tag":"sync","node":"/unit/house","lane":"lights"}"#);
    }

    #[test]
    fn decodes_event_with_record_body() {
        let frame = r#"{"tag":"event","node":"/unit/house","lane":"lights","body":{"@tag":"update","key":"hall","value":true}}"#;

        let envelope = Envelope::decode(frame).expect("decodes");

        assert_eq!(envelope.tag(), "event");
        assert_eq!(envelope.node(), &Uri::from("/unit/house"));
        assert_eq!(envelope.lane(), &Uri::from("lights"));
        assert_eq!(
            envelope.body().and_then(|body| body.get("key")),
            Some(&Value::from("hall"))
        );
    }

    #[test]
    fn rejects_event_without_body() {
        let frame = r#"{"tag":"event","node":"/unit/house","lane":"lights"}"#;

        assert!(Envelope::decode(frame).is_err());
    }

    #[test]
    fn rejects_unknown_tag() {
        let frame = r#"{"tag":"shout","node":"/unit/house","lane":"lights"}"#;

        assert!(Envelope::decode(frame).is_err());
    }

    #[test]
    fn auth_envelopes_are_host_scoped() {
        let envelope = Envelope::decode(r#"{"tag":"authed","body":{"id":7}}"#).expect("decodes");

        assert!(envelope.is_host_scoped());
        assert!(envelope.node().is_empty());
        assert_eq!(
            envelope.body().and_then(|body| body.get("id")),
            Some(&Value::from(7))
        );
    }

    #[test]
    fn linked_frame_keeps_hints() {
        let frame = r#"{"tag":"linked","node":"/a","lane":"b","prio":0.5,"rate":2.0}"#;

        match Envelope::decode(frame).expect("decodes") {
            Envelope::Linked(request) => {
                assert_eq!(request.prio, 0.5);
                assert_eq!(request.rate, 2.0);
                assert!(request.body.is_none());
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn peek_address_recovers_lane_of_malformed_frame() {
        let frame = r#"{"tag":"event","node":"/unit/house","lane":"lights"}"#;

        assert_eq!(
            peek_address(frame),
            Some((Uri::from("/unit/house"), Uri::from("lights")))
        );
        assert_eq!(peek_address("not json"), None);
    }
}
