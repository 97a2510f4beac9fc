//! Typed observer hooks for downlink handles.
//!
//! Every hook has a no-op default, so an observer implements only what it
//! needs. Observers never return errors; failures arrive through `did_fail`.

use crate::error::DownlinkError;
use futures::channel::mpsc::UnboundedSender;

pub trait ValueObserver<T>: Send + Sync {
    fn will_set(&self, _new: &T) {}

    fn did_set(&self, _new: &T, _old: &T) {}

    fn did_link(&self) {}

    fn did_sync(&self) {}

    fn did_unlink(&self) {}

    fn did_connect(&self) {}

    fn did_disconnect(&self) {}

    fn did_fail(&self, _error: &DownlinkError) {}

    /// The handle closed, either through `close()` or because its model let
    /// go of it after a failure or unlink.
    fn did_close(&self) {}
}

pub trait MapObserver<K, V>: Send + Sync {
    fn will_update(&self, _key: &K, _new: &V) {}

    fn did_update(&self, _key: &K, _new: &V, _old: Option<&V>) {}

    fn will_remove(&self, _key: &K) {}

    fn did_remove(&self, _key: &K, _old: Option<&V>) {}

    fn will_drop(&self, _count: usize) {}

    fn did_drop(&self, _count: usize) {}

    fn will_take(&self, _count: usize) {}

    fn did_take(&self, _count: usize) {}

    fn will_clear(&self) {}

    fn did_clear(&self) {}

    fn did_link(&self) {}

    fn did_sync(&self) {}

    fn did_unlink(&self) {}

    fn did_connect(&self) {}

    fn did_disconnect(&self) {}

    fn did_fail(&self, _error: &DownlinkError) {}

    fn did_close(&self) {}
}

/// Item of [`super::ValueDownlink::changes`].
#[derive(Clone, Debug, PartialEq)]
pub enum ValueEvent<T> {
    Linked,
    Synced,
    Set { new: T, old: T },
    Unlinked,
    Connected,
    Disconnected,
    Failed(DownlinkError),
    Closed,
}

/// Item of [`super::MapDownlink::changes`].
#[derive(Clone, Debug, PartialEq)]
pub enum MapEvent<K, V> {
    Linked,
    Synced,
    Update { key: K, value: V, old: Option<V> },
    Remove { key: K, old: Option<V> },
    Drop { count: usize },
    Take { count: usize },
    Clear,
    Unlinked,
    Connected,
    Disconnected,
    Failed(DownlinkError),
    Closed,
}

/// Forwards callbacks into an unbounded channel; a dropped receiver is ignored.
pub(crate) struct ChannelObserver<E> {
    tx: UnboundedSender<E>,
}

impl<E> ChannelObserver<E> {
    pub(crate) fn new(tx: UnboundedSender<E>) -> Self {
        Self { tx }
    }

    fn emit(&self, event: E) {
        let _ = self.tx.unbounded_send(event);
    }
}

impl<T> ValueObserver<T> for ChannelObserver<ValueEvent<T>>
where
    T: Clone + Send + Sync,
{
    fn did_set(&self, new: &T, old: &T) {
        self.emit(ValueEvent::Set {
            new: new.clone(),
            old: old.clone(),
        });
    }

    fn did_link(&self) {
        self.emit(ValueEvent::Linked);
    }

    fn did_sync(&self) {
        self.emit(ValueEvent::Synced);
    }

    fn did_unlink(&self) {
        self.emit(ValueEvent::Unlinked);
    }

    fn did_connect(&self) {
        self.emit(ValueEvent::Connected);
    }

    fn did_disconnect(&self) {
        self.emit(ValueEvent::Disconnected);
    }

    fn did_fail(&self, error: &DownlinkError) {
        self.emit(ValueEvent::Failed(error.clone()));
    }

    fn did_close(&self) {
        self.emit(ValueEvent::Closed);
        self.tx.close_channel();
    }
}

impl<K, V> MapObserver<K, V> for ChannelObserver<MapEvent<K, V>>
where
    K: Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn did_update(&self, key: &K, new: &V, old: Option<&V>) {
        self.emit(MapEvent::Update {
            key: key.clone(),
            value: new.clone(),
            old: old.cloned(),
        });
    }

    fn did_remove(&self, key: &K, old: Option<&V>) {
        self.emit(MapEvent::Remove {
            key: key.clone(),
            old: old.cloned(),
        });
    }

    fn did_drop(&self, count: usize) {
        self.emit(MapEvent::Drop { count });
    }

    fn did_take(&self, count: usize) {
        self.emit(MapEvent::Take { count });
    }

    fn did_clear(&self) {
        self.emit(MapEvent::Clear);
    }

    fn did_link(&self) {
        self.emit(MapEvent::Linked);
    }

    fn did_sync(&self) {
        self.emit(MapEvent::Synced);
    }

    fn did_unlink(&self) {
        self.emit(MapEvent::Unlinked);
    }

    fn did_connect(&self) {
        self.emit(MapEvent::Connected);
    }

    fn did_disconnect(&self) {
        self.emit(MapEvent::Disconnected);
    }

    fn did_fail(&self, error: &DownlinkError) {
        self.emit(MapEvent::Failed(error.clone()));
    }

    fn did_close(&self) {
        self.emit(MapEvent::Closed);
        self.tx.close_channel();
    }
}
