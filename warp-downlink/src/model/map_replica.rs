//! Ordered key/value replica of a map lane.
//!
//! Map bodies are records tagged with `@tag`:
//!
//! ```json
//! {"@tag": "update", "key": "a", "value": 1}
//! {"@tag": "remove", "key": "a"}
//! {"@tag": "drop", "count": 2}
//! {"@tag": "take", "count": 2}
//! {"@tag": "clear"}
//! ```

use super::{DownlinkKind, Replica};
use crate::coherence::KeyEffect;
use crate::value::Value;
use std::collections::{BTreeMap, BTreeSet};

const TAG: &str = "@tag";
const KEY: &str = "key";
const VALUE: &str = "value";
const COUNT: &str = "count";

/// One map mutation. `old` / `removed` are filled in by
/// [`Replica::prepare`] and ignored on input.
#[derive(Clone, Debug, PartialEq)]
pub enum MapChange {
    Update {
        key: Value,
        value: Value,
        old: Option<Value>,
    },
    Remove {
        key: Value,
        old: Option<Value>,
    },
    /// Removes the first `count` entries.
    Drop {
        count: usize,
        removed: Vec<(Value, Value)>,
    },
    /// Keeps only the first `count` entries.
    Take {
        count: usize,
        removed: Vec<(Value, Value)>,
    },
    Clear {
        removed: Vec<(Value, Value)>,
    },
}

impl MapChange {
    pub fn update(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        MapChange::Update {
            key: key.into(),
            value: value.into(),
            old: None,
        }
    }

    pub fn remove(key: impl Into<Value>) -> Self {
        MapChange::Remove {
            key: key.into(),
            old: None,
        }
    }

    pub fn drop(count: usize) -> Self {
        MapChange::Drop {
            count,
            removed: Vec::new(),
        }
    }

    pub fn take(count: usize) -> Self {
        MapChange::Take {
            count,
            removed: Vec::new(),
        }
    }

    pub fn clear() -> Self {
        MapChange::Clear {
            removed: Vec::new(),
        }
    }

    /// Decodes a tagged map action body.
    pub fn from_body(body: &Value) -> Result<Self, String> {
        let tag = body
            .get(TAG)
            .and_then(Value::as_text)
            .ok_or_else(|| format!("map body without {TAG}: {body}"))?;
        let key = || {
            body.get(KEY)
                .cloned()
                .ok_or_else(|| format!("map {tag} without key"))
        };
        let count = || {
            body.get(COUNT)
                .and_then(Value::as_i64)
                .and_then(|count| usize::try_from(count).ok())
                .ok_or_else(|| format!("map {tag} without a valid count"))
        };
        match tag {
            "update" => Ok(MapChange::update(
                key()?,
                body.get(VALUE).cloned().unwrap_or(Value::Extant),
            )),
            "remove" => Ok(MapChange::remove(key()?)),
            "drop" => Ok(MapChange::drop(count()?)),
            "take" => Ok(MapChange::take(count()?)),
            "clear" => Ok(MapChange::clear()),
            other => Err(format!("unknown map action {other}")),
        }
    }

    pub fn to_body(&self) -> Value {
        match self {
            MapChange::Update { key, value, .. } => Value::record([
                (TAG, Value::from("update")),
                (KEY, key.clone()),
                (VALUE, value.clone()),
            ]),
            MapChange::Remove { key, .. } => {
                Value::record([(TAG, Value::from("remove")), (KEY, key.clone())])
            }
            MapChange::Drop { count, .. } => Value::record([
                (TAG, Value::from("drop")),
                (COUNT, Value::Int(*count as i64)),
            ]),
            MapChange::Take { count, .. } => Value::record([
                (TAG, Value::from("take")),
                (COUNT, Value::Int(*count as i64)),
            ]),
            MapChange::Clear { .. } => Value::record([(TAG, Value::from("clear"))]),
        }
    }
}

#[derive(Debug, Default)]
pub struct MapReplica {
    entries: BTreeMap<Value, Value>,
    loading: bool,
    last_loaded: Option<Value>,
    stale: BTreeSet<Value>,
}

impl MapReplica {
    pub fn entries(&self) -> &BTreeMap<Value, Value> {
        &self.entries
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn cloned_entries<'a>(
        entries: impl Iterator<Item = (&'a Value, &'a Value)>,
    ) -> Vec<(Value, Value)> {
        entries
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

impl Replica for MapReplica {
    type Change = MapChange;

    const KIND: DownlinkKind = DownlinkKind::Map;

    fn new(initial: Option<Value>) -> Self {
        let entries = match initial {
            Some(Value::Record(fields)) => fields
                .into_iter()
                .map(|(key, value)| (Value::Text(key), value))
                .collect(),
            _ => BTreeMap::new(),
        };
        Self {
            entries,
            ..Default::default()
        }
    }

    fn decode_event(&mut self, body: Value) -> Result<MapChange, String> {
        let change = MapChange::from_body(&body)?;
        if self.loading {
            match &change {
                MapChange::Update { key, .. } => {
                    if let Some(last) = &self.last_loaded {
                        if key < last {
                            return Err(format!("key {key} loaded out of order after {last}"));
                        }
                    }
                    self.stale.remove(key);
                    self.last_loaded = Some(key.clone());
                }
                MapChange::Remove { key, .. } => {
                    self.stale.remove(key);
                }
                _ => {}
            }
        }
        Ok(change)
    }

    fn command_body(change: &MapChange) -> Value {
        change.to_body()
    }

    fn prepare(&self, change: MapChange) -> MapChange {
        match change {
            MapChange::Update { key, value, .. } => {
                let old = self.entries.get(&key).cloned();
                MapChange::Update { key, value, old }
            }
            MapChange::Remove { key, .. } => {
                let old = self.entries.get(&key).cloned();
                MapChange::Remove { key, old }
            }
            MapChange::Drop { count, .. } => MapChange::Drop {
                count,
                removed: Self::cloned_entries(self.entries.iter().take(count)),
            },
            MapChange::Take { count, .. } => MapChange::Take {
                count,
                removed: Self::cloned_entries(self.entries.iter().skip(count)),
            },
            MapChange::Clear { .. } => MapChange::Clear {
                removed: Self::cloned_entries(self.entries.iter()),
            },
        }
    }

    fn apply(&mut self, change: &MapChange) {
        match change {
            MapChange::Update { key, value, .. } => {
                self.entries.insert(key.clone(), value.clone());
            }
            MapChange::Remove { key, .. } => {
                self.entries.remove(key);
            }
            MapChange::Drop { removed, .. }
            | MapChange::Take { removed, .. }
            | MapChange::Clear { removed } => {
                for (key, _) in removed {
                    self.entries.remove(key);
                }
            }
        }
    }

    fn effects(change: &MapChange) -> Vec<(Value, KeyEffect)> {
        match change {
            MapChange::Update { key, .. } => vec![(key.clone(), KeyEffect::Update)],
            MapChange::Remove { key, .. } => vec![(key.clone(), KeyEffect::Remove)],
            MapChange::Drop { removed, .. }
            | MapChange::Take { removed, .. }
            | MapChange::Clear { removed } => removed
                .iter()
                .map(|(key, _)| (key.clone(), KeyEffect::Remove))
                .collect(),
        }
    }

    fn begin_sync(&mut self) {
        self.loading = true;
        self.last_loaded = None;
        self.stale = self.entries.keys().cloned().collect();
    }

    fn end_sync(&mut self) -> Vec<MapChange> {
        self.loading = false;
        self.last_loaded = None;
        let stale = std::mem::take(&mut self.stale);
        stale
            .into_iter()
            .filter(|key| self.entries.contains_key(key))
            .map(MapChange::remove)
            .collect()
    }

    fn replay(&self) -> Vec<MapChange> {
        self.entries
            .iter()
            .map(|(key, value)| MapChange::Update {
                key: key.clone(),
                value: value.clone(),
                old: None,
            })
            .collect()
    }
}
