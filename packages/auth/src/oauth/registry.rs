// ABOUTME: Registry of one-shot callbacks awaiting an authorization redirect, keyed by state
// ABOUTME: Taking a callback removes it atomically so duplicate redirects cannot run it twice

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;

/// What a callback reports back to the listener for the result page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackResult {
    pub success: bool,
    pub message: String,
}

impl CallbackResult {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Exchange routine invoked with `(code, state)`
pub type CallbackFn = Box<dyn FnOnce(String, String) -> BoxFuture<'static, CallbackResult> + Send>;

#[derive(Default)]
struct Entries {
    pending: HashMap<String, CallbackFn>,
    processed: HashSet<String>,
}

/// Pending callbacks shared between the flow and the listener task
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    inner: Arc<Mutex<Entries>>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` for `state`, replacing any earlier registration
    pub fn register(&self, state: impl Into<String>, callback: CallbackFn) {
        let state = state.into();
        let mut entries = self.entries();
        entries.processed.remove(&state);
        entries.pending.insert(state, callback);
    }

    /// Remove and return the callback for `state`, marking the state processed
    pub fn take(&self, state: &str) -> Option<CallbackFn> {
        let mut entries = self.entries();
        let callback = entries.pending.remove(state)?;
        entries.processed.insert(state.to_string());
        Some(callback)
    }

    /// Whether a callback for `state` has already been taken
    pub fn is_processed(&self, state: &str) -> bool {
        self.entries().processed.contains(state)
    }

    pub fn unregister(&self, state: &str) -> bool {
        self.entries().pending.remove(state).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.entries().pending.len()
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("pending", &self.pending_count())
            .finish()
    }
}
