//! Replica contract and the single-value replica.

use super::DownlinkKind;
use crate::coherence::KeyEffect;
use crate::value::Value;

/// Replicated lane state owned by a [`super::DownlinkModel`].
///
/// Every mutation, remote or local, is expressed as a `Change`. The model
/// calls `prepare` to fill in what the change replaces, fans it out, then
/// `apply`s it.
pub trait Replica: Send + 'static {
    type Change: Clone + Send + Sync + 'static;

    const KIND: DownlinkKind;

    /// Builds the replica, seeded with an optional initial state.
    fn new(initial: Option<Value>) -> Self;

    /// Decodes an inbound `event` body. An `Err` is a protocol violation.
    fn decode_event(&mut self, body: Value) -> Result<Self::Change, String>;

    /// Body of the `command` envelope carrying a local change.
    fn command_body(change: &Self::Change) -> Value;

    fn prepare(&self, change: Self::Change) -> Self::Change;

    fn apply(&mut self, change: &Self::Change);

    /// Keys touched by a change. Empty means the whole replica.
    fn effects(change: &Self::Change) -> Vec<(Value, KeyEffect)>;

    /// A `sync` was requested; the next events up to `synced` are a bulk load.
    fn begin_sync(&mut self);

    /// The bulk load finished. Returns the changes that drop state the
    /// server did not re-deliver.
    fn end_sync(&mut self) -> Vec<Self::Change>;

    /// Current state expressed as changes, for replay to a newly attached view.
    fn replay(&self) -> Vec<Self::Change>;
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValueChange {
    pub new: Value,
    pub old: Value,
}

impl ValueChange {
    pub fn set(new: impl Into<Value>) -> Self {
        Self {
            new: new.into(),
            old: Value::Absent,
        }
    }
}

#[derive(Debug, Default)]
pub struct ValueReplica {
    value: Value,
    loading: bool,
    loaded: bool,
}

impl ValueReplica {
    pub fn value(&self) -> &Value {
        &self.value
    }
}

impl Replica for ValueReplica {
    type Change = ValueChange;

    const KIND: DownlinkKind = DownlinkKind::Value;

    fn new(initial: Option<Value>) -> Self {
        Self {
            value: initial.unwrap_or_default(),
            ..Default::default()
        }
    }

    fn decode_event(&mut self, body: Value) -> Result<ValueChange, String> {
        if self.loading {
            self.loaded = true;
        }
        Ok(ValueChange::set(body))
    }

    fn command_body(change: &ValueChange) -> Value {
        change.new.clone()
    }

    fn prepare(&self, change: ValueChange) -> ValueChange {
        ValueChange {
            new: change.new,
            old: self.value.clone(),
        }
    }

    fn apply(&mut self, change: &ValueChange) {
        self.value = change.new.clone();
    }

    fn effects(_change: &ValueChange) -> Vec<(Value, KeyEffect)> {
        Vec::new()
    }

    fn begin_sync(&mut self) {
        self.loading = true;
        self.loaded = false;
    }

    fn end_sync(&mut self) -> Vec<ValueChange> {
        let loaded = std::mem::take(&mut self.loaded);
        self.loading = false;
        if loaded || self.value.is_absent() {
            return Vec::new();
        }
        vec![ValueChange::set(Value::Absent)]
    }

    fn replay(&self) -> Vec<ValueChange> {
        if self.value.is_absent() {
            return Vec::new();
        }
        vec![ValueChange::set(self.value.clone())]
    }
}
