use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;

/// A mutex-guarded set of live resources, each represented by the token that
/// shuts it down.
#[derive(Debug, Default)]
pub struct Registry {
    live: Mutex<HashMap<u64, CancellationToken>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new resource. Once [`Registry::close_all`] has run, the
    /// returned token is already cancelled.
    pub fn add(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        if self.closed.is_cancelled() {
            token.cancel();
        } else {
            live.insert(id, token.clone());
        }
        (id, token)
    }

    /// Register a resource for as long as the returned guard lives.
    pub fn register(&self) -> Registration<'_> {
        let (id, token) = self.add();
        Registration {
            registry: self,
            id,
            token,
        }
    }

    pub fn remove(&self, id: u64) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    /// Cancel and forget every registered resource.
    pub fn close_all(&self) {
        let mut live = self.live.lock().unwrap_or_else(PoisonError::into_inner);
        self.closed.cancel();
        for (_, token) in live.drain() {
            token.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Removes its entry from the registry when dropped, unwinding included.
#[derive(Debug)]
pub struct Registration<'a> {
    registry: &'a Registry,
    id: u64,
    token: CancellationToken,
}

impl Registration<'_> {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}
