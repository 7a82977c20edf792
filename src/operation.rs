//! Cacheable operations
//!
//! An [`Operation`] wraps one [`FunctionRef`] together with at most one cache
//! entry. The entry is keyed by the hash of the input *value*, so evaluating
//! again with an equal input returns the stored output without invoking the
//! callable.

use crate::error::{FlowError, Result};
use crate::function::{sha256_hex, Callable, FunctionRef, FunctionRegistry};
use crate::models::{decode_validated, decode_value, encode_value, CacheSnapshot, OperationSnapshot};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tracing::debug;

/// Output cached for a specific input
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub input_hash: String,
    pub value: Value,
}

/// A named, cacheable unit of computation
pub struct Operation<C = ()> {
    id: String,
    func: FunctionRef<C>,
    /// Held across the callable's await so one operation never runs twice at once
    eval_lock: Mutex<()>,
    cache: RwLock<Option<CacheEntry>>,
}

impl<C> Operation<C> {
    /// Create an uncached operation whose function id equals `id`
    pub fn new(id: impl Into<String>, callable: impl Callable<C> + 'static) -> Self {
        let id = id.into();
        let func = FunctionRef::new(id.clone(), Arc::new(callable));
        Self::with_function(id, func, None)
    }

    pub fn with_function(id: impl Into<String>, func: FunctionRef<C>, cache: Option<CacheEntry>) -> Self {
        Self {
            id: id.into(),
            func,
            eval_lock: Mutex::new(()),
            cache: RwLock::new(cache),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn func(&self) -> &FunctionRef<C> {
        &self.func
    }

    /// Content hash of the wrapped function
    pub fn hash(&self) -> &str {
        self.func.hash()
    }

    /// Whether a cached output exists
    pub fn done(&self) -> bool {
        self.read_cache().is_some()
    }

    /// Drop the cached output, if any
    pub fn clear(&self) {
        if self.write_cache().take().is_some() {
            debug!("Cleared cache of operation '{}'", self.id);
        }
    }

    /// Cached output
    pub fn value(&self) -> Result<Value> {
        self.read_cache()
            .as_ref()
            .map(|entry| entry.value.clone())
            .ok_or_else(|| FlowError::ValueNotComputed {
                id: self.id.clone(),
            })
    }

    /// Hash of the input the cached output was computed from
    pub fn input_hash(&self) -> Option<String> {
        self.read_cache()
            .as_ref()
            .map(|entry| entry.input_hash.clone())
    }

    pub fn cache_entry(&self) -> Option<CacheEntry> {
        self.read_cache().clone()
    }

    /// Whether the cache holds an output for `input`; never mutates
    pub fn test(&self, input: &Value) -> bool {
        let input_hash = hash_input(input);
        self.read_cache()
            .as_ref()
            .is_some_and(|entry| entry.input_hash == input_hash)
    }

    /// Evaluate with the cache
    ///
    /// Concurrent calls on the same operation are serialized. A failure of
    /// the callable is returned as-is and leaves the cache unchanged.
    pub async fn eval(&self, ctx: &C, input: Value) -> anyhow::Result<Value> {
        let input_hash = hash_input(&input);
        let _guard = self.eval_lock.lock().await;

        if let Some(value) = self.cached_for(&input_hash) {
            debug!("Operation '{}' cache hit", self.id);
            return Ok(value);
        }

        debug!("Operation '{}' cache miss, invoking '{}'", self.id, self.func.id());
        let value = self.func.invoke(ctx, input).await?;
        *self.write_cache() = Some(CacheEntry {
            input_hash,
            value: value.clone(),
        });
        Ok(value)
    }

    pub fn marshal(&self) -> OperationSnapshot {
        OperationSnapshot {
            id: self.id.clone(),
            func: self.func.to_snapshot(),
            cache: self.read_cache().as_ref().map(|entry| CacheSnapshot {
                hash: entry.input_hash.clone(),
                value: encode_value(&entry.value),
            }),
        }
    }

    /// Validate a raw snapshot value, then restore it against `registry`
    pub fn unmarshal(data: Value, registry: &FunctionRegistry<C>) -> Result<Self> {
        let snapshot: OperationSnapshot = decode_validated(data, &OperationSnapshot::shape())?;
        Self::from_snapshot(&snapshot, registry)
    }

    pub fn from_snapshot(snapshot: &OperationSnapshot, registry: &FunctionRegistry<C>) -> Result<Self> {
        Self::restore(snapshot, registry, "$")
    }

    /// Restore with decode errors reported under `path`
    pub(crate) fn restore(
        snapshot: &OperationSnapshot,
        registry: &FunctionRegistry<C>,
        path: &str,
    ) -> Result<Self> {
        let func = FunctionRef::from_snapshot(&snapshot.func, registry)?;
        let cache = match &snapshot.cache {
            Some(cache) => Some(CacheEntry {
                input_hash: cache.hash.clone(),
                value: decode_value(&format!("{}.cache.value", path), &cache.value)?,
            }),
            None => None,
        };
        Ok(Self::with_function(snapshot.id.clone(), func, cache))
    }

    fn cached_for(&self, input_hash: &str) -> Option<Value> {
        self.read_cache()
            .as_ref()
            .filter(|entry| entry.input_hash == input_hash)
            .map(|entry| entry.value.clone())
    }

    fn read_cache(&self) -> RwLockReadGuard<'_, Option<CacheEntry>> {
        self.cache.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Option<CacheEntry>> {
        self.cache.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C> fmt::Debug for Operation<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("func", &self.func)
            .field("cache", &*self.read_cache())
            .finish()
    }
}

/// Hash of an input value; `null` hashes like the empty object
pub fn hash_input(input: &Value) -> String {
    if input.is_null() {
        sha256_hex(b"{}")
    } else {
        sha256_hex(input.to_string().as_bytes())
    }
}
