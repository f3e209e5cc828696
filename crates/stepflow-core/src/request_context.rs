//! Per-run request context.
//!
//! A typed key/value bag carried through every step and condition of a run.
//! Values may be arbitrary Rust types (connection handles, closures); only
//! the values that encode to JSON survive into a snapshot, the rest are
//! silently dropped by [`RequestContext::to_json_map`].

use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

type Encoder = fn(&(dyn Any + Send + Sync)) -> Result<Value, String>;

struct ContextSlot {
    value: Arc<dyn Any + Send + Sync>,
    encode: Option<Encoder>,
}

fn encode_as<T: Serialize + 'static>(value: &(dyn Any + Send + Sync)) -> Result<Value, String> {
    let typed = value
        .downcast_ref::<T>()
        .ok_or_else(|| "request context slot holds an unexpected type".to_string())?;
    serde_json::to_value(typed).map_err(|e| e.to_string())
}

/// Shared, cloneable request context.
///
/// Clones share the same underlying map, so a value set by one step is
/// visible to every later step of the run.
#[derive(Clone, Default)]
pub struct RequestContext {
    inner: Arc<RwLock<IndexMap<String, ContextSlot>>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a context from a persisted snapshot projection.
    pub fn from_json_map(map: Map<String, Value>) -> Self {
        let ctx = Self::new();
        for (key, value) in map {
            ctx.set(key, value);
        }
        ctx
    }

    /// Store a value that is persisted with the run.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Serialize + Send + Sync + 'static,
    {
        self.insert_slot(
            key.into(),
            ContextSlot {
                value: Arc::new(value),
                encode: Some(encode_as::<T>),
            },
        );
    }

    /// Store a value that lives only for the current process.
    pub fn set_opaque<T>(&self, key: impl Into<String>, value: T)
    where
        T: Send + Sync + 'static,
    {
        self.insert_slot(
            key.into(),
            ContextSlot {
                value: Arc::new(value),
                encode: None,
            },
        );
    }

    fn insert_slot(&self, key: String, slot: ContextSlot) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, slot);
    }

    /// Typed lookup. Returns `None` when the key is missing or holds another type.
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(key)?.value.clone().downcast::<T>().ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(key)
            .is_some()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON projection for snapshots.
    ///
    /// Entries stored with [`set_opaque`](Self::set_opaque), and entries whose
    /// encoding fails (non-string map keys, failing `Serialize` impls), are
    /// omitted. Insertion order is preserved.
    pub fn to_json_map(&self) -> Map<String, Value> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut out = Map::new();
        for (key, slot) in map.iter() {
            let Some(encode) = slot.encode else {
                continue;
            };
            match encode(slot.value.as_ref()) {
                Ok(value) => {
                    out.insert(key.clone(), value);
                }
                Err(err) => {
                    tracing::debug!(key = %key, error = %err, "dropping unserializable request context entry");
                }
            }
        }
        out
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("keys", &self.keys())
            .finish()
    }
}
