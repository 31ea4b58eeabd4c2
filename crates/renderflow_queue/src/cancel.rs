//! In-process registry of cancellation tokens, keyed by dispatch token.
//!
//! `revoke(terminate=true)` on a running task fires the matching token; the
//! worker races its handler against it and aborts the execution.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dispatch token at execution start. Returns the token the
    /// executor should watch.
    pub fn register(&self, dispatch_token: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .insert(dispatch_token.to_string(), token.clone());
        token
    }

    /// Drop a registration once the task finishes.
    pub fn remove(&self, dispatch_token: &str) {
        self.inner
            .lock()
            .expect("cancel registry poisoned")
            .remove(dispatch_token);
    }

    /// Fire the token for a dispatch token. Returns false when the task is
    /// not currently executing in this process.
    pub fn cancel(&self, dispatch_token: &str) -> bool {
        let inner = self.inner.lock().expect("cancel registry poisoned");
        match inner.get(dispatch_token) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}
