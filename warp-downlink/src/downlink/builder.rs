//! Builders for downlink handles.
//!
//! A builder carries the lane address and link settings. Retyping a builder
//! through [`ValueDownlinkBuilder::value_form`] or the map equivalents keeps
//! every setting and only swaps the form.

use super::{Form, MapDownlink, ValueDownlink, ValueForm};
use crate::config::DownlinkConfig;
use crate::context::DownlinkContext;
use crate::error::DownlinkError;
use crate::model::LinkKey;
use crate::uri::Uri;
use crate::value::Value;
use std::sync::Arc;

/// Address and settings shared by both builder kinds.
#[derive(Clone)]
struct Target {
    context: Arc<dyn DownlinkContext>,
    host: Uri,
    node: Uri,
    lane: Uri,
    config: DownlinkConfig,
    initial: Option<Value>,
}

impl Target {
    fn new(context: Arc<dyn DownlinkContext>) -> Self {
        Self {
            context,
            host: Uri::default(),
            node: Uri::default(),
            lane: Uri::default(),
            config: DownlinkConfig::default(),
            initial: None,
        }
    }

    fn key(&self) -> Result<LinkKey, DownlinkError> {
        LinkKey::new(&self.host, &self.node, &self.lane)
    }
}

macro_rules! target_setters {
    () => {
        /// Host URI. May be omitted when the node URI is absolute.
        pub fn host(mut self, host: impl Into<Uri>) -> Self {
            self.target.host = host.into();
            self
        }

        pub fn node(mut self, node: impl Into<Uri>) -> Self {
            self.target.node = node.into();
            self
        }

        pub fn lane(mut self, lane: impl Into<Uri>) -> Self {
            self.target.lane = lane.into();
            self
        }

        pub fn keep_linked(mut self, keep_linked: bool) -> Self {
            self.target.config.keep_linked = keep_linked;
            self
        }

        pub fn keep_synced(mut self, keep_synced: bool) -> Self {
            self.target.config.keep_synced = keep_synced;
            self
        }

        pub fn priority(mut self, priority: f64) -> Self {
            self.target.config.priority = priority;
            self
        }

        pub fn rate(mut self, rate: f64) -> Self {
            self.target.config.rate = rate;
            self
        }

        /// Body sent with the `link` or `sync` request.
        pub fn body(mut self, body: impl Into<Value>) -> Self {
            self.target.config.body = Some(body.into());
            self
        }

        /// Seeds the replica when this builder ends up creating the model.
        pub fn initial_state(mut self, initial: impl Into<Value>) -> Self {
            self.target.initial = Some(initial.into());
            self
        }

        /// Replaces all link settings at once.
        pub fn config(mut self, config: DownlinkConfig) -> Self {
            self.target.config = config;
            self
        }
    };
}

pub struct ValueDownlinkBuilder<F: Form = ValueForm> {
    target: Target,
    form: F,
}

impl ValueDownlinkBuilder<ValueForm> {
    pub(crate) fn new(context: Arc<dyn DownlinkContext>) -> Self {
        Self {
            target: Target::new(context),
            form: ValueForm,
        }
    }
}

impl<F: Form> ValueDownlinkBuilder<F> {
    target_setters!();

    pub fn value_form<G: Form>(self, form: G) -> ValueDownlinkBuilder<G> {
        ValueDownlinkBuilder {
            target: self.target,
            form,
        }
    }

    /// Validates the address and returns a closed handle.
    pub fn build(self) -> Result<ValueDownlink<F>, DownlinkError> {
        let key = self.target.key()?;
        Ok(ValueDownlink::new(
            self.target.context,
            key,
            self.target.config,
            self.target.initial,
            self.form,
        ))
    }

    pub fn open(self) -> Result<ValueDownlink<F>, DownlinkError> {
        let downlink = self.build()?;
        downlink.open()?;
        Ok(downlink)
    }
}

pub struct MapDownlinkBuilder<K: Form = ValueForm, V: Form = ValueForm> {
    target: Target,
    key_form: K,
    value_form: V,
}

impl MapDownlinkBuilder<ValueForm, ValueForm> {
    pub(crate) fn new(context: Arc<dyn DownlinkContext>) -> Self {
        Self {
            target: Target::new(context),
            key_form: ValueForm,
            value_form: ValueForm,
        }
    }
}

impl<K: Form, V: Form> MapDownlinkBuilder<K, V> {
    target_setters!();

    pub fn key_form<J: Form>(self, key_form: J) -> MapDownlinkBuilder<J, V> {
        MapDownlinkBuilder {
            target: self.target,
            key_form,
            value_form: self.value_form,
        }
    }

    pub fn value_form<W: Form>(self, value_form: W) -> MapDownlinkBuilder<K, W> {
        MapDownlinkBuilder {
            target: self.target,
            key_form: self.key_form,
            value_form,
        }
    }

    pub fn build(self) -> Result<MapDownlink<K, V>, DownlinkError> {
        let key = self.target.key()?;
        Ok(MapDownlink::new(
            self.target.context,
            key,
            self.target.config,
            self.target.initial,
            self.key_form,
            self.value_form,
        ))
    }

    pub fn open(self) -> Result<MapDownlink<K, V>, DownlinkError> {
        let downlink = self.build()?;
        downlink.open()?;
        Ok(downlink)
    }
}

#[cfg(test)]
mod tests {
    use crate::client::Client;
    use crate::config::ClientConfig;
    use crate::downlink::{IntForm, TextForm};
    use crate::value::Value;

    #[test]
    fn retyping_keeps_address_and_settings() {
        let client = Client::new(ClientConfig::default());

        let members = client
            .downlink_map()
            .host("warp://localhost:9001")
            .node("/unit/a")
            .lane("members")
            .keep_linked(false)
            .priority(0.5)
            .body(Value::from("hello"))
            .key_form(TextForm)
            .value_form(IntForm)
            .build()
            .expect("valid address");

        assert_eq!(members.key().to_string(), "warp://localhost:9001/unit/a#members");
        assert!(!members.config().keep_linked);
        assert_eq!(members.config().priority, 0.5);
        assert_eq!(members.config().body, Some(Value::from("hello")));
        assert!(!members.is_open());
    }

    #[test]
    fn relative_node_without_host_is_rejected() {
        let client = Client::new(ClientConfig::default());

        let result = client.downlink_value().node("/unit/a").lane("info").build();

        assert!(result.is_err());
    }
}
