//! Data bucket store.
//!
//! Buckets start as unevaluated template strings. The first access evaluates
//! the template, parses it as JSON (keeping the plain string when it is not
//! JSON) and caches the result for the lifetime of the running instance.
//! Resource routes mutate the cached value in place.
//!
//! Each bucket has its own lock, so requests touching different buckets never
//! contend, and concurrent mutations of one bucket are serialized.

use crate::environment::Environment;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;

/// Evaluation state of one bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum BucketState {
    Unevaluated(String),
    Evaluated(Value),
}

impl BucketState {
    pub fn is_evaluated(&self) -> bool {
        matches!(self, BucketState::Evaluated(_))
    }
}

#[derive(Debug)]
struct BucketSlot {
    id: String,
    name: String,
    state: Mutex<BucketState>,
}

/// Arena of bucket states addressed by id or name.
#[derive(Debug, Default)]
pub struct BucketStore {
    slots: Vec<BucketSlot>,
    by_id: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
}

impl BucketStore {
    pub fn from_environment(environment: &Environment) -> Self {
        let mut store = BucketStore::default();
        for bucket in &environment.data {
            store.insert(&bucket.id, &bucket.name, &bucket.value);
        }
        store
    }

    fn insert(&mut self, id: &str, name: &str, template: &str) {
        let index = self.slots.len();
        self.slots.push(BucketSlot {
            id: id.to_string(),
            name: name.to_string(),
            state: Mutex::new(BucketState::Unevaluated(template.to_string())),
        });
        self.by_id.insert(id.to_string(), index);
        if !name.is_empty() {
            self.by_name.entry(name.to_string()).or_insert(index);
        }
    }

    fn slot(&self, id_or_name: &str) -> Option<&BucketSlot> {
        self.by_id
            .get(id_or_name)
            .or_else(|| self.by_name.get(id_or_name))
            .map(|&i| &self.slots[i])
    }

    pub fn contains(&self, id_or_name: &str) -> bool {
        self.slot(id_or_name).is_some()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Short ids of every bucket, in declaration order.
    pub fn ids(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.id.clone()).collect()
    }

    pub fn is_evaluated(&self, id_or_name: &str) -> bool {
        self.slot(id_or_name)
            .map(|s| s.state.lock().is_evaluated())
            .unwrap_or(false)
    }

    /// Snapshot of a bucket value. `evaluate` turns the template into a value
    /// and only runs on first access.
    pub fn value(&self, id_or_name: &str, evaluate: impl FnOnce(&str) -> Value) -> Option<Value> {
        self.with_value_mut(id_or_name, evaluate, |value| value.clone())
    }

    /// Run `f` on the cached value while holding the bucket lock.
    pub fn with_value_mut<R>(
        &self,
        id_or_name: &str,
        evaluate: impl FnOnce(&str) -> Value,
        f: impl FnOnce(&mut Value) -> R,
    ) -> Option<R> {
        let slot = self.slot(id_or_name)?;
        let mut state = slot.state.lock();
        if let BucketState::Unevaluated(template) = &*state {
            let value = evaluate(template);
            *state = BucketState::Evaluated(value);
        }
        match &mut *state {
            BucketState::Evaluated(value) => Some(f(value)),
            BucketState::Unevaluated(_) => None,
        }
    }

    /// Names under which templates may reference a bucket.
    pub fn aliases(&self, id_or_name: &str) -> Vec<String> {
        self.slot(id_or_name)
            .map(|s| {
                let mut aliases = vec![s.id.clone()];
                if !s.name.is_empty() && s.name != s.id {
                    aliases.push(s.name.clone());
                }
                aliases
            })
            .unwrap_or_default()
    }
}

/// Turn a rendered bucket template into its cached value.
pub fn parse_rendered(rendered: &str) -> Value {
    serde_json::from_str(rendered).unwrap_or_else(|_| Value::String(rendered.to_string()))
}
