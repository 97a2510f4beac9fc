//! Derived nodes that lazily mirror an upstream value or map.

use super::{Coherence, KeyEffect, MapSource, Output, ValueSource, Version};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

type ValueMapper = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type EntryMapper = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

fn notify_decohere(outputs: Option<Vec<Arc<dyn Output>>>) {
    for output in outputs.into_iter().flatten() {
        output.decohere_input();
    }
}

struct ValueOutletState {
    value: Value,
    coherence: Coherence,
}

/// Cached, optionally transformed view of a [`ValueSource`].
pub struct ValueOutlet {
    source: Arc<dyn ValueSource>,
    mapper: Option<ValueMapper>,
    state: Mutex<ValueOutletState>,
}

impl ValueOutlet {
    pub fn new(source: Arc<dyn ValueSource>) -> Arc<Self> {
        Self::build(source, None)
    }

    pub fn map<F>(source: Arc<dyn ValueSource>, mapper: F) -> Arc<Self>
    where
        F: Fn(&Value) -> Value + Send + Sync + 'static,
    {
        Self::build(source, Some(Arc::new(mapper)))
    }

    fn build(source: Arc<dyn ValueSource>, mapper: Option<ValueMapper>) -> Arc<Self> {
        source.recohere_source();
        let value = Self::compute(&mapper, &source.source_value());
        let outlet = Arc::new(Self {
            source: source.clone(),
            mapper,
            state: Mutex::new(ValueOutletState {
                value,
                coherence: Coherence::new(),
            }),
        });
        let output: Weak<dyn Output> = Arc::downgrade(&outlet) as Weak<dyn Output>;
        source.bind_output(output);
        outlet
    }

    fn compute(mapper: &Option<ValueMapper>, value: &Value) -> Value {
        match mapper {
            Some(mapper) => mapper(value),
            None => value.clone(),
        }
    }

    /// Current value, recohering this outlet and its upstream first.
    pub fn get(&self) -> Value {
        self.recohere_now();
        self.state.lock().value.clone()
    }

    pub fn version(&self) -> Version {
        self.state.lock().coherence.version()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().coherence.is_dirty()
    }

    fn recohere_now(&self) {
        self.source.recohere_source();
        self.recohere(self.source.source_version());
    }

    pub fn recohere(&self, version: Version) {
        let Some(work) = self.state.lock().coherence.recohere(version) else {
            return;
        };
        let value = Self::compute(&self.mapper, &self.source.source_value());
        self.state.lock().value = value;
        for output in work.outputs {
            output.recohere_input(version);
        }
    }
}

impl Output for ValueOutlet {
    fn decohere_input(&self) {
        let outputs = self.state.lock().coherence.decohere();
        notify_decohere(outputs);
    }

    fn recohere_input(&self, version: Version) {
        self.recohere(version);
    }
}

impl ValueSource for ValueOutlet {
    fn recohere_source(&self) {
        self.recohere_now();
    }

    fn source_value(&self) -> Value {
        self.state.lock().value.clone()
    }

    fn source_version(&self) -> Version {
        self.version()
    }

    fn bind_output(&self, output: Weak<dyn Output>) {
        self.state.lock().coherence.bind_output(output);
    }
}

struct MapOutletState {
    entries: BTreeMap<Value, Value>,
    coherence: Coherence,
    full_refresh: bool,
}

/// Cached, optionally transformed view of a [`MapSource`].
///
/// Recoherence only re-reads keys that were decohered; an `Update` for a key
/// the upstream no longer holds deletes it here too.
pub struct MapOutlet {
    source: Arc<dyn MapSource>,
    mapper: Option<EntryMapper>,
    state: Mutex<MapOutletState>,
}

impl MapOutlet {
    pub fn new(source: Arc<dyn MapSource>) -> Arc<Self> {
        Self::build(source, None)
    }

    /// Mirrors `source` with every value passed through `mapper(key, value)`.
    pub fn map<F>(source: Arc<dyn MapSource>, mapper: F) -> Arc<Self>
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        Self::build(source, Some(Arc::new(mapper)))
    }

    fn build(source: Arc<dyn MapSource>, mapper: Option<EntryMapper>) -> Arc<Self> {
        source.recohere_source();
        let entries = Self::compute_all(&mapper, source.source_snapshot());
        let outlet = Arc::new(Self {
            source: source.clone(),
            mapper,
            state: Mutex::new(MapOutletState {
                entries,
                coherence: Coherence::new(),
                full_refresh: false,
            }),
        });
        let output: Weak<dyn Output> = Arc::downgrade(&outlet) as Weak<dyn Output>;
        source.bind_output(output);
        outlet
    }

    fn compute(mapper: &Option<EntryMapper>, key: &Value, value: Value) -> Value {
        match mapper {
            Some(mapper) => mapper(key, &value),
            None => value,
        }
    }

    fn compute_all(
        mapper: &Option<EntryMapper>,
        snapshot: BTreeMap<Value, Value>,
    ) -> BTreeMap<Value, Value> {
        snapshot
            .into_iter()
            .map(|(key, value)| {
                let value = Self::compute(mapper, &key, value);
                (key, value)
            })
            .collect()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.recohere_now();
        self.state.lock().entries.get(key).cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<Value, Value> {
        self.recohere_now();
        self.state.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.recohere_now();
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> Version {
        self.state.lock().coherence.version()
    }

    pub fn is_dirty(&self) -> bool {
        self.state.lock().coherence.is_dirty()
    }

    /// Number of keys waiting to be recohered.
    pub fn pending_keys(&self) -> usize {
        self.state.lock().coherence.pending_effects().len()
    }

    fn recohere_now(&self) {
        self.source.recohere_source();
        self.recohere(self.source.source_version());
    }

    pub fn recohere(&self, version: Version) {
        let (work, full_refresh) = {
            let mut state = self.state.lock();
            let Some(work) = state.coherence.recohere(version) else {
                return;
            };
            (work, std::mem::take(&mut state.full_refresh))
        };

        if full_refresh {
            let entries = Self::compute_all(&self.mapper, self.source.source_snapshot());
            self.state.lock().entries = entries;
        } else {
            let mut updates = Vec::with_capacity(work.effects.len());
            for (key, effect) in work.effects {
                let value = match effect {
                    KeyEffect::Update => self
                        .source
                        .source_entry(&key)
                        .map(|value| Self::compute(&self.mapper, &key, value)),
                    KeyEffect::Remove => None,
                };
                updates.push((key, value));
            }
            let mut state = self.state.lock();
            for (key, value) in updates {
                match value {
                    Some(value) => {
                        state.entries.insert(key, value);
                    }
                    None => {
                        state.entries.remove(&key);
                    }
                }
            }
        }

        for output in work.outputs {
            output.recohere_input(version);
        }
    }
}

impl Output for MapOutlet {
    fn decohere_input(&self) {
        let outputs = {
            let mut state = self.state.lock();
            state.full_refresh = true;
            state.coherence.decohere()
        };
        notify_decohere(outputs);
    }

    fn decohere_input_key(&self, key: &Value, effect: KeyEffect) {
        let outputs = self.state.lock().coherence.decohere_key(key, effect);
        for output in outputs.into_iter().flatten() {
            output.decohere_input_key(key, effect);
        }
    }

    fn recohere_input(&self, version: Version) {
        self.recohere(version);
    }
}

impl MapSource for MapOutlet {
    fn recohere_source(&self) {
        self.recohere_now();
    }

    fn source_entry(&self, key: &Value) -> Option<Value> {
        self.state.lock().entries.get(key).cloned()
    }

    fn source_snapshot(&self) -> BTreeMap<Value, Value> {
        self.state.lock().entries.clone()
    }

    fn source_version(&self) -> Version {
        self.version()
    }

    fn bind_output(&self, output: Weak<dyn Output>) {
        self.state.lock().coherence.bind_output(output);
    }
}
