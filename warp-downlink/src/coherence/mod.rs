//! Decohere / recohere invalidation layer.
//!
//! A change marks a node dirty (`decohere`) and pushes that mark downstream
//! once per dirty transition. Values are only recomputed when a node is
//! `recohere`d, either by the debounced pass scheduled after a change or by a
//! read, since every read path recoheres first.
//!
//! Map nodes additionally track a [`KeyEffect`] per touched key so that a
//! recoherence only re-reads the keys that actually changed.
//!
//! ```text
//! MapDownlinkModel --decohere_key(k, Update)--> MapOutlet --decohere_key--> MapOutlet
//!        ^                                         |
//!        +------------- source_entry(k) -----------+   (on recohere)
//! ```

pub(crate) mod outlet;

pub use outlet::{MapOutlet, ValueOutlet};

use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub type Version = i64;

/// Version of a node that must be recohered before it can be read.
pub const DIRTY: Version = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeyEffect {
    /// Re-read the key from upstream.
    Update,
    /// Delete the key.
    Remove,
}

/// Downstream end of an invalidation edge.
pub trait Output: Send + Sync {
    fn decohere_input(&self);

    fn decohere_input_key(&self, key: &Value, effect: KeyEffect) {
        let _ = (key, effect);
        self.decohere_input();
    }

    fn recohere_input(&self, version: Version);
}

/// Upstream end of a value edge.
pub trait ValueSource: Send + Sync {
    /// Recoheres the source if it is dirty.
    fn recohere_source(&self);
    /// Current value, without recohering.
    fn source_value(&self) -> Value;
    fn source_version(&self) -> Version;
    fn bind_output(&self, output: Weak<dyn Output>);
}

/// Upstream end of a keyed map edge.
pub trait MapSource: Send + Sync {
    fn recohere_source(&self);
    fn source_entry(&self, key: &Value) -> Option<Value>;
    fn source_snapshot(&self) -> BTreeMap<Value, Value>;
    fn source_version(&self) -> Version;
    fn bind_output(&self, output: Weak<dyn Output>);
}

/// Work a node must do after a dirty → clean transition.
pub struct Recoherence {
    pub effects: BTreeMap<Value, KeyEffect>,
    pub outputs: Vec<Arc<dyn Output>>,
}

/// Version, pending key effects and weak outputs of one node.
///
/// Owners keep this under their own lock; the methods only compute which
/// outputs must be notified so notification can happen after the lock is
/// released.
pub struct Coherence {
    version: Version,
    last_version: Version,
    effects: BTreeMap<Value, KeyEffect>,
    outputs: Vec<Weak<dyn Output>>,
}

impl Default for Coherence {
    fn default() -> Self {
        Self {
            version: 0,
            last_version: 0,
            effects: BTreeMap::new(),
            outputs: Vec::new(),
        }
    }
}

impl Coherence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn is_dirty(&self) -> bool {
        self.version == DIRTY
    }

    /// Version to stamp on the next recoherence pass.
    pub fn next_version(&self) -> Version {
        self.last_version + 1
    }

    pub fn pending_effects(&self) -> &BTreeMap<Value, KeyEffect> {
        &self.effects
    }

    pub fn bind_output(&mut self, output: Weak<dyn Output>) {
        self.outputs.retain(|existing| existing.strong_count() > 0);
        self.outputs.push(output);
    }

    pub fn output_count(&self) -> usize {
        self.outputs
            .iter()
            .filter(|output| output.strong_count() > 0)
            .count()
    }

    /// Marks the whole node dirty. Returns the outputs to decohere, or `None`
    /// when the node already was dirty.
    pub fn decohere(&mut self) -> Option<Vec<Arc<dyn Output>>> {
        if self.is_dirty() {
            return None;
        }
        self.version = DIRTY;
        Some(self.live_outputs())
    }

    /// Marks one key dirty with `effect`. The latest effect for a key wins;
    /// outputs are returned only the first time the key goes dirty.
    pub fn decohere_key(
        &mut self,
        key: &Value,
        effect: KeyEffect,
    ) -> Option<Vec<Arc<dyn Output>>> {
        self.version = DIRTY;
        match self.effects.insert(key.clone(), effect) {
            Some(_) => None,
            None => Some(self.live_outputs()),
        }
    }

    /// Stamps `version` on a dirty node and hands back its pending effects and
    /// outputs. Returns `None` for a clean node.
    pub fn recohere(&mut self, version: Version) -> Option<Recoherence> {
        if !self.is_dirty() {
            return None;
        }
        self.version = version.max(0);
        self.last_version = self.last_version.max(self.version);
        Some(Recoherence {
            effects: std::mem::take(&mut self.effects),
            outputs: self.live_outputs(),
        })
    }

    fn live_outputs(&mut self) -> Vec<Arc<dyn Output>> {
        self.outputs.retain(|output| output.strong_count() > 0);
        self.outputs.iter().filter_map(Weak::upgrade).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::{Coherence, KeyEffect, Output, Version};
    use crate::value::Value;
    use parking_lot::Mutex;
    use std::sync::{Arc, Weak};

    #[derive(Default)]
    struct CountingOutput {
        decohered: Mutex<Vec<Option<(Value, KeyEffect)>>>,
        recohered: Mutex<Vec<Version>>,
    }

    impl Output for CountingOutput {
        fn decohere_input(&self) {
            self.decohered.lock().push(None);
        }

        fn decohere_input_key(&self, key: &Value, effect: KeyEffect) {
            self.decohered.lock().push(Some((key.clone(), effect)));
        }

        fn recohere_input(&self, version: Version) {
            self.recohered.lock().push(version);
        }
    }

    fn bound(coherence: &mut Coherence) -> Arc<CountingOutput> {
        let output = Arc::new(CountingOutput::default());
        let weak: Weak<dyn Output> = Arc::downgrade(&output) as Weak<dyn Output>;
        coherence.bind_output(weak);
        output
    }

    #[test]
    fn decohere_twice_leaves_a_single_dirty_mark() {
        let mut coherence = Coherence::new();
        let output = bound(&mut coherence);

        let first = coherence.decohere().expect("clean node transitions");
        for output in first {
            output.decohere_input();
        }
        assert!(coherence.decohere().is_none());
        assert!(coherence.is_dirty());
        assert_eq!(output.decohered.lock().len(), 1);

        let recoherence = coherence.recohere(1).expect("dirty node recoheres");
        assert_eq!(recoherence.outputs.len(), 1);
        assert!(!coherence.is_dirty());
        assert_eq!(coherence.version(), 1);
        assert!(coherence.recohere(2).is_none());
    }

    #[test]
    fn key_effects_track_latest_effect_per_key() {
        let mut coherence = Coherence::new();
        let _output = bound(&mut coherence);

        assert!(coherence
            .decohere_key(&Value::from("a"), KeyEffect::Update)
            .is_some());
        assert!(coherence
            .decohere_key(&Value::from("b"), KeyEffect::Update)
            .is_some());
        assert!(coherence
            .decohere_key(&Value::from("a"), KeyEffect::Remove)
            .is_none());

        assert_eq!(
            coherence.pending_effects().get(&Value::from("a")),
            Some(&KeyEffect::Remove)
        );

        let recoherence = coherence.recohere(coherence.next_version()).expect("dirty");
        assert_eq!(recoherence.effects.len(), 2);
        assert!(coherence.pending_effects().is_empty());
    }

    #[test]
    fn dropped_outputs_are_pruned() {
        let mut coherence = Coherence::new();
        let output = bound(&mut coherence);
        assert_eq!(coherence.output_count(), 1);

        drop(output);

        assert_eq!(coherence.output_count(), 0);
        assert_eq!(coherence.decohere().map(|outputs| outputs.len()), Some(0));
    }
}
