//! Function references: stable identity plus content hash for callables
//!
//! A [`FunctionRef`] pairs a caller-chosen id with a SHA-256 hash of the
//! callable's normalized source text. Snapshots store only `{ id, hash }`;
//! restoring one looks the id up in a [`FunctionRegistry`] and recomputes the
//! hash from whatever callable is registered now.

use crate::error::{FlowError, Result};
use crate::models::FunctionSnapshot;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;

/// A unit of user logic invoked with a shared context and a JSON input
#[async_trait]
pub trait Callable<C = ()>: Send + Sync {
    /// Run the logic
    async fn call(&self, ctx: &C, input: Value) -> anyhow::Result<Value>;

    /// Source text identifying the logic; any edit must change it
    fn source(&self) -> Cow<'_, str>;
}

/// Adapter turning an async closure with typed input and output into a [`Callable`]
///
/// The closure receives an owned clone of the context. Its input is
/// deserialized from the erased JSON value and its output serialized back,
/// so the closure signature can mirror the exact upstream set it expects.
pub struct FnCallable<C, F, I, O> {
    source: String,
    f: F,
    _marker: PhantomData<fn(C, I) -> O>,
}

impl<C, F, I, O> FnCallable<C, F, I, O> {
    pub fn new<Fut>(source: impl Into<String>, f: F) -> Self
    where
        F: Fn(C, I) -> Fut,
        Fut: Future<Output = anyhow::Result<O>>,
    {
        Self {
            source: source.into(),
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F, I, O, Fut> Callable<C> for FnCallable<C, F, I, O>
where
    C: Clone + Send + Sync + 'static,
    F: Fn(C, I) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
    I: DeserializeOwned + Send,
    O: Serialize + Send,
{
    async fn call(&self, ctx: &C, input: Value) -> anyhow::Result<Value> {
        let input: I = serde_json::from_value(input)?;
        let output = (self.f)(ctx.clone(), input).await?;
        Ok(serde_json::to_value(output)?)
    }

    fn source(&self) -> Cow<'_, str> {
        Cow::Borrowed(&self.source)
    }
}

/// Build an [`FnCallable`] whose source is the closure's own token text
///
/// ```
/// use cacheflow::func;
///
/// let upper = func!(|_ctx: (), input: String| async move { anyhow::Ok(input.to_uppercase()) });
/// # let _ = upper;
/// ```
#[macro_export]
macro_rules! func {
    ($f:expr) => {
        $crate::function::FnCallable::new(stringify!($f), $f)
    };
}

/// Identity and content hash of a callable
pub struct FunctionRef<C = ()> {
    id: String,
    hash: String,
    callable: Arc<dyn Callable<C>>,
}

impl<C> FunctionRef<C> {
    /// Wrap `callable`, hashing its normalized source
    pub fn new(id: impl Into<String>, callable: Arc<dyn Callable<C>>) -> Self {
        let hash = sha256_hex(normalize_source(&callable.source()).as_bytes());
        Self {
            id: id.into(),
            hash,
            callable,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn callable(&self) -> Arc<dyn Callable<C>> {
        Arc::clone(&self.callable)
    }

    pub fn to_snapshot(&self) -> FunctionSnapshot {
        FunctionSnapshot {
            id: self.id.clone(),
            hash: self.hash.clone(),
        }
    }

    /// Resolve a snapshot against `registry`
    ///
    /// The hash is recomputed from the registered callable, never taken from
    /// the snapshot.
    pub fn from_snapshot(snapshot: &FunctionSnapshot, registry: &FunctionRegistry<C>) -> Result<Self> {
        let callable = registry.get(&snapshot.id).ok_or_else(|| {
            FlowError::SerializationFailed(format!(
                "Function '{}' is not present in the registry",
                snapshot.id
            ))
        })?;

        let function = Self::new(snapshot.id.clone(), callable);
        if function.hash != snapshot.hash {
            warn!(
                "Function '{}' changed since the snapshot was taken (stored {}, current {})",
                snapshot.id, snapshot.hash, function.hash
            );
        }
        Ok(function)
    }

    /// Validate a raw snapshot value, then resolve it against `registry`
    pub fn unmarshal(data: Value, registry: &FunctionRegistry<C>) -> Result<Self> {
        let snapshot: FunctionSnapshot =
            crate::models::decode_validated(data, &FunctionSnapshot::shape())?;
        Self::from_snapshot(&snapshot, registry)
    }

    /// Run the callable; its failure is returned unchanged
    pub async fn invoke(&self, ctx: &C, input: Value) -> anyhow::Result<Value> {
        self.callable.call(ctx, input).await
    }
}

impl<C> Clone for FunctionRef<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            hash: self.hash.clone(),
            callable: Arc::clone(&self.callable),
        }
    }
}

impl<C> fmt::Debug for FunctionRef<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRef")
            .field("id", &self.id)
            .field("hash", &self.hash)
            .finish_non_exhaustive()
    }
}

/// Caller-supplied mapping from function id to callable
pub struct FunctionRegistry<C = ()> {
    functions: HashMap<String, Arc<dyn Callable<C>>>,
}

impl<C> FunctionRegistry<C> {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Builder-style registration
    pub fn with(mut self, id: impl Into<String>, callable: impl Callable<C> + 'static) -> Self {
        self.register(id, callable);
        self
    }

    pub fn register(&mut self, id: impl Into<String>, callable: impl Callable<C> + 'static) {
        self.functions.insert(id.into(), Arc::new(callable));
    }

    pub fn register_shared(&mut self, id: impl Into<String>, callable: Arc<dyn Callable<C>>) {
        self.functions.insert(id.into(), callable);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Callable<C>>> {
        self.functions.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.functions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl<C> Default for FunctionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for FunctionRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.functions.keys().collect();
        ids.sort();
        f.debug_struct("FunctionRegistry").field("ids", &ids).finish()
    }
}

/// Strip comments and collapse whitespace outside of string literals
pub fn normalize_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'/') => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        break;
                    }
                }
                pending_space = true;
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut previous = '\0';
                for next in chars.by_ref() {
                    if previous == '*' && next == '/' {
                        break;
                    }
                    previous = next;
                }
                pending_space = true;
            }
            c if c.is_whitespace() => pending_space = true,
            '"' => {
                push_pending_space(&mut out, &mut pending_space);
                out.push('"');
                let mut escaped = false;
                for next in chars.by_ref() {
                    out.push(next);
                    if escaped {
                        escaped = false;
                    } else if next == '\\' {
                        escaped = true;
                    } else if next == '"' {
                        break;
                    }
                }
            }
            c => {
                push_pending_space(&mut out, &mut pending_space);
                out.push(c);
            }
        }
    }

    out
}

fn push_pending_space(out: &mut String, pending_space: &mut bool) {
    if *pending_space && !out.is_empty() {
        out.push(' ');
    }
    *pending_space = false;
}

/// Lowercase hex SHA-256 digest
pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
