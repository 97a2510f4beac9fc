//! Typed handle onto a shared map lane.

use super::observer::ChannelObserver;
use super::{attach_view, cast_or_unit, Attachment, Form, MapEvent, MapObserver, ValueForm};
use crate::coherence::{MapOutlet, MapSource};
use crate::config::DownlinkConfig;
use crate::context::DownlinkContext;
use crate::error::DownlinkError;
use crate::model::{
    DownlinkId, LinkKey, LinkModel, LinkState, MapChange, MapDownlinkModel, MapReplica, ModelView,
};
use crate::value::Value;
use arc_swap::ArcSwap;
use futures::channel::mpsc;
use futures::Stream;
use std::sync::Arc;

struct MapViewCore<K: Form, V: Form> {
    id: DownlinkId,
    key: LinkKey,
    key_form: K,
    value_form: V,
    attachment: Attachment<MapReplica>,
    observers: ArcSwap<Vec<Arc<dyn MapObserver<K::Item, V::Item>>>>,
}

impl<K: Form, V: Form> MapViewCore<K, V> {
    fn cast_key(&self, key: &Value) -> K::Item {
        cast_or_unit(&self.key_form, &self.key, key)
    }

    fn cast_value(&self, value: &Value) -> V::Item {
        cast_or_unit(&self.value_form, &self.key, value)
    }

    fn each(&self, notify: impl Fn(&dyn MapObserver<K::Item, V::Item>)) {
        for observer in self.observers.load_full().iter() {
            notify(observer.as_ref());
        }
    }
}

impl<K: Form, V: Form> ModelView<MapChange> for MapViewCore<K, V> {
    fn id(&self) -> DownlinkId {
        self.id
    }

    fn did_link(&self) {
        self.each(|observer| observer.did_link());
    }

    fn did_sync(&self) {
        self.each(|observer| observer.did_sync());
    }

    fn will_change(&self, change: &MapChange) {
        match change {
            MapChange::Update { key, value, .. } => {
                let key = self.cast_key(key);
                let value = self.cast_value(value);
                self.each(|observer| observer.will_update(&key, &value));
            }
            MapChange::Remove { key, .. } => {
                let key = self.cast_key(key);
                self.each(|observer| observer.will_remove(&key));
            }
            MapChange::Drop { count, .. } => self.each(|observer| observer.will_drop(*count)),
            MapChange::Take { count, .. } => self.each(|observer| observer.will_take(*count)),
            MapChange::Clear { .. } => self.each(|observer| observer.will_clear()),
        }
    }

    fn did_change(&self, change: &MapChange) {
        match change {
            MapChange::Update { key, value, old } => {
                let key = self.cast_key(key);
                let value = self.cast_value(value);
                let old = old.as_ref().map(|old| self.cast_value(old));
                self.each(|observer| observer.did_update(&key, &value, old.as_ref()));
            }
            MapChange::Remove { key, old } => {
                let key = self.cast_key(key);
                let old = old.as_ref().map(|old| self.cast_value(old));
                self.each(|observer| observer.did_remove(&key, old.as_ref()));
            }
            MapChange::Drop { count, .. } => self.each(|observer| observer.did_drop(*count)),
            MapChange::Take { count, .. } => self.each(|observer| observer.did_take(*count)),
            MapChange::Clear { .. } => self.each(|observer| observer.did_clear()),
        }
    }

    fn did_unlink(&self) {
        self.each(|observer| observer.did_unlink());
    }

    fn did_connect(&self) {
        self.each(|observer| observer.did_connect());
    }

    fn did_disconnect(&self) {
        self.each(|observer| observer.did_disconnect());
    }

    fn did_fail(&self, error: &DownlinkError) {
        self.each(|observer| observer.did_fail(error));
    }

    fn did_detach(&self) {
        let (was_open, _) = self.attachment.release();
        if was_open {
            self.each(|observer| observer.did_close());
        }
    }
}

/// Typed handle onto a shared map lane.
///
/// Reads go straight to the shared replica; writes are applied locally and
/// forwarded to the server as commands. Dropping the handle closes it.
pub struct MapDownlink<K: Form = ValueForm, V: Form = ValueForm> {
    context: Arc<dyn DownlinkContext>,
    config: DownlinkConfig,
    initial: Option<Value>,
    core: Arc<MapViewCore<K, V>>,
}

impl<K: Form, V: Form> MapDownlink<K, V> {
    pub(crate) fn new(
        context: Arc<dyn DownlinkContext>,
        key: LinkKey,
        config: DownlinkConfig,
        initial: Option<Value>,
        key_form: K,
        value_form: V,
    ) -> Self {
        Self {
            context,
            config,
            initial,
            core: Arc::new(MapViewCore {
                id: DownlinkId::new(),
                key,
                key_form,
                value_form,
                attachment: Attachment::new(),
                observers: ArcSwap::from_pointee(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> DownlinkId {
        self.core.id
    }

    pub fn key(&self) -> &LinkKey {
        &self.core.key
    }

    pub fn config(&self) -> &DownlinkConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.core.attachment.is_open()
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.model().ok().map(|model| model.link_state())
    }

    pub fn open(&self) -> Result<(), DownlinkError> {
        if self.is_open() {
            return Ok(());
        }
        let view: Arc<dyn ModelView<MapChange>> = self.core.clone();
        let model = attach_view::<MapReplica>(
            self.context.as_ref(),
            &self.core.key,
            &self.config,
            self.initial.clone(),
            view,
        )?;
        self.core.attachment.bind(&model);
        Ok(())
    }

    pub fn close(&self) {
        let (was_open, model) = self.core.attachment.release();
        if let Some(model) = model {
            model.detach(self.core.id);
        }
        if was_open {
            self.core.each(|observer| observer.did_close());
        }
    }

    pub fn unlink(&self) -> Result<(), DownlinkError> {
        let model: Arc<dyn LinkModel> = self.model()?;
        self.context.unlink_downlink(&model);
        Ok(())
    }

    pub fn get(&self, key: &K::Item) -> Option<V::Item> {
        let model = self.model().ok()?;
        let key = self.core.key_form.mold(key);
        model
            .with_replica(|replica| replica.get(&key).cloned())
            .map(|value| self.core.cast_value(&value))
    }

    pub fn contains_key(&self, key: &K::Item) -> bool {
        let Ok(model) = self.model() else {
            return false;
        };
        let key = self.core.key_form.mold(key);
        model.with_replica(|replica| replica.get(&key).is_some())
    }

    pub fn len(&self) -> usize {
        self.model()
            .map(|model| model.with_replica(|replica| replica.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries in key order. Empty when closed.
    pub fn snapshot(&self) -> Vec<(K::Item, V::Item)> {
        let Ok(model) = self.model() else {
            return Vec::new();
        };
        let entries: Vec<(Value, Value)> = model.with_replica(|replica| {
            replica
                .entries()
                .iter()
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect()
        });
        entries
            .iter()
            .map(|(key, value)| (self.core.cast_key(key), self.core.cast_value(value)))
            .collect()
    }

    pub fn update(&self, key: K::Item, value: V::Item) -> Result<(), DownlinkError> {
        let change = MapChange::update(
            self.core.key_form.mold(&key),
            self.core.value_form.mold(&value),
        );
        self.mutate(change)
    }

    pub fn remove(&self, key: &K::Item) -> Result<(), DownlinkError> {
        self.mutate(MapChange::remove(self.core.key_form.mold(key)))
    }

    /// Removes the first `count` entries.
    pub fn drop(&self, count: usize) -> Result<(), DownlinkError> {
        self.mutate(MapChange::drop(count))
    }

    /// Keeps the first `count` entries and removes the rest.
    pub fn take(&self, count: usize) -> Result<(), DownlinkError> {
        self.mutate(MapChange::take(count))
    }

    pub fn clear(&self) -> Result<(), DownlinkError> {
        self.mutate(MapChange::clear())
    }

    fn mutate(&self, change: MapChange) -> Result<(), DownlinkError> {
        self.model()?.mutate(change);
        Ok(())
    }

    pub fn observe(&self, observer: Arc<dyn MapObserver<K::Item, V::Item>>) {
        self.core.observers.rcu(|observers| {
            let mut next = Vec::clone(observers);
            next.push(observer.clone());
            next
        });
    }

    /// Stream of this handle's callbacks; it ends when the handle closes.
    pub fn changes(&self) -> impl Stream<Item = MapEvent<K::Item, V::Item>> {
        let (tx, rx) = mpsc::unbounded();
        self.observe(Arc::new(ChannelObserver::new(tx)));
        rx
    }

    pub fn outlet(&self) -> Result<Arc<MapOutlet>, DownlinkError> {
        let source: Arc<dyn MapSource> = self.model()?;
        Ok(MapOutlet::new(source))
    }

    pub fn model(&self) -> Result<Arc<MapDownlinkModel>, DownlinkError> {
        self.core.attachment.model()
    }
}

impl<K: Form, V: Form> Drop for MapDownlink<K, V> {
    fn drop(&mut self) {
        self.close();
    }
}
