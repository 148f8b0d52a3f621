//! Host handler registry.
//!
//! Handlers are keyed either by global op index or by an `Effect.op`
//! suffix. Suffix keys are resolved against an artifact's decoded effect
//! table when a run starts: a key that matches no operation, or more than
//! one, fails the run before the artifact is called.
//!
//! ```rust
//! use tern_host::HandlerRegistry;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.on("Async.await", |call, k| async move {
//!     Ok(Some(k.resume(call.arg(0)? + 1)))
//! });
//! assert_eq!(handlers.len(), 1);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use tern_abi::EffectTable;

use crate::continuation::{ContinuationAction, Continuations, EffectCall};
use crate::error::{HandlerError, RunError};

/// What a handler settles to. `Ok(None)` is a contract violation: the
/// handler did not produce a continuation action.
pub type HandlerResult = Result<Option<ContinuationAction>, HandlerError>;

/// A type-erased async handler.
pub type Handler = Arc<dyn Fn(EffectCall, Continuations) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Clone, PartialEq, Eq, Hash)]
enum HandlerKey {
    Index(u32),
    Suffix(String),
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKey::Index(i) => write!(f, "#{i}"),
            HandlerKey::Suffix(s) => f.write_str(s),
        }
    }
}

/// Handlers registered before a run.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(HandlerKey, Handler)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one global op index.
    pub fn on_op<F, Fut>(&mut self, op_index: u32, handler: F) -> &mut Self
    where
        F: Fn(EffectCall, Continuations) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(HandlerKey::Index(op_index), handler)
    }

    /// Register a handler for the operation named `Effect.op`.
    ///
    /// The effect part may be the full label or any trailing path of it
    /// (`Async.await`, `io/Async.await`).
    pub fn on<F, Fut>(&mut self, suffix: &str, handler: F) -> &mut Self
    where
        F: Fn(EffectCall, Continuations) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.insert(HandlerKey::Suffix(suffix.to_string()), handler)
    }

    fn insert<F, Fut>(&mut self, key: HandlerKey, handler: F) -> &mut Self
    where
        F: Fn(EffectCall, Continuations) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let erased: Handler = Arc::new(move |call, k| handler(call, k).boxed());
        self.entries.retain(|(k, _)| *k != key);
        self.entries.push((key, erased));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve every key against `table`.
    ///
    /// Later registrations for the same operation replace earlier ones.
    pub fn bind(&self, table: &EffectTable) -> Result<BoundHandlers, RunError> {
        let mut by_index = HashMap::with_capacity(self.entries.len());
        for (key, handler) in &self.entries {
            let index = match key {
                HandlerKey::Index(i) => {
                    if table.op(*i).is_none() {
                        return Err(RunError::UnknownOperation(key.to_string()));
                    }
                    *i
                }
                HandlerKey::Suffix(suffix) => {
                    let matches = table.resolve_suffix(suffix);
                    match matches.as_slice() {
                        [] => return Err(RunError::UnknownOperation(suffix.clone())),
                        [single] => *single,
                        _ => {
                            return Err(RunError::AmbiguousOperation {
                                key: suffix.clone(),
                                count: matches.len(),
                            })
                        }
                    }
                }
            };
            by_index.insert(index, Arc::clone(handler));
        }
        Ok(BoundHandlers { by_index })
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(k, _)| k.to_string()))
            .finish()
    }
}

/// Handlers resolved to op indices of one effect table.
#[derive(Clone, Default)]
pub struct BoundHandlers {
    by_index: HashMap<u32, Handler>,
}

impl BoundHandlers {
    pub fn get(&self, op_index: u32) -> Option<&Handler> {
        self.by_index.get(&op_index)
    }

    pub fn len(&self) -> usize {
        self.by_index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_index.is_empty()
    }
}

impl fmt::Debug for BoundHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_index.keys()).finish()
    }
}
