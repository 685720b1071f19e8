//! Snapshot store: one immutable [`FlowState`] plus change notification.
//!
//! Every update clones the current snapshot, applies the change to the clone
//! and swaps it in wholesale.  Readers holding an older `Arc<FlowState>` are
//! never affected by later updates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use stepflow_types::{FlowState, Result};

use crate::persistence::Persistence;

/// Callback invoked with the new snapshot after every replacement.
pub type Listener = Arc<dyn Fn(&FlowState) + Send + Sync>;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle to the flow's snapshot.
///
/// Cloning a `Store` yields another handle to the **same** snapshot.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: RwLock<Arc<FlowState>>,
    listeners: Mutex<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Store {
    /// Create a store holding `initial`, without persistence.
    pub fn new(initial: FlowState) -> Self {
        Self::build(initial, None)
    }

    /// Create a store backed by `persistence`.
    ///
    /// A previously saved snapshot replaces `initial` when `accept` approves
    /// it.  Busy flags from an interrupted session are cleared on load.
    pub fn with_persistence(
        initial: FlowState,
        persistence: Arc<dyn Persistence>,
        accept: impl Fn(&FlowState) -> bool,
    ) -> Self {
        let state = match persistence.load() {
            Ok(Some(mut saved)) if accept(&saved) => {
                tracing::debug!(step = %saved.step, "Restored persisted flow state");
                saved.is_loading = false;
                saved.is_transitioning = false;
                saved
            }
            Ok(Some(saved)) => {
                tracing::warn!(step = %saved.step, "Ignoring persisted flow state for unknown step");
                initial
            }
            Ok(None) => initial,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted flow state");
                initial
            }
        };
        Self::build(state, Some(persistence))
    }

    fn build(state: FlowState, persistence: Option<Arc<dyn Persistence>>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: RwLock::new(Arc::new(state)),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                persistence,
            }),
        }
    }

    /// The current snapshot.
    pub fn get(&self) -> Arc<FlowState> {
        Arc::clone(&read(&self.inner.state))
    }

    /// Replace the snapshot with a modified copy of the current one.
    pub fn update(&self, f: impl FnOnce(&mut FlowState)) {
        let committed = {
            let mut guard = write(&self.inner.state);
            let mut next = FlowState::clone(&guard);
            f(&mut next);
            let next = Arc::new(next);
            *guard = Arc::clone(&next);
            next
        };
        self.after_commit(&committed);
    }

    /// Like [`update`](Self::update), but the change is discarded when `f`
    /// fails.  The check and the commit happen under one write lock.
    pub fn try_update<T>(&self, f: impl FnOnce(&mut FlowState) -> Result<T>) -> Result<T> {
        let (committed, value) = {
            let mut guard = write(&self.inner.state);
            let mut next = FlowState::clone(&guard);
            let value = f(&mut next)?;
            let next = Arc::new(next);
            *guard = Arc::clone(&next);
            (next, value)
        };
        self.after_commit(&committed);
        Ok(value)
    }

    /// Register a listener; it runs after every replacement.
    pub fn subscribe(&self, listener: impl Fn(&FlowState) + Send + Sync + 'static) -> Subscription {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.listeners).push((id, Arc::new(listener)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
        }
    }

    /// Re-broadcast the current snapshot to listeners without changing it.
    pub fn notify(&self) {
        let current = self.get();
        self.broadcast(&current);
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.inner.listeners).len()
    }

    /// Ask the persistence collaborator to drop its saved snapshot.
    pub fn clear_persisted(&self) {
        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.clear() {
                tracing::warn!(error = %e, "Failed to clear persisted flow state");
            }
        }
    }

    fn after_commit(&self, state: &FlowState) {
        tracing::debug!(
            step = %state.step,
            transitioning = state.is_transitioning,
            loading = state.is_loading,
            "Flow state replaced"
        );
        if let Some(persistence) = &self.inner.persistence {
            if let Err(e) = persistence.save(state) {
                tracing::warn!(error = %e, step = %state.step, "Failed to persist flow state");
            }
        }
        self.broadcast(state);
    }

    fn broadcast(&self, state: &FlowState) {
        // Listeners run outside the lock so they may subscribe or read freely.
        let listeners: Vec<Listener> = lock(&self.inner.listeners)
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(state);
        }
    }
}

/// Handle returned by [`Store::subscribe`].
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
}

impl Subscription {
    /// Remove the listener. A no-op if the store is already gone.
    pub fn unsubscribe(self) {
        if let Some(inner) = self.store.upgrade() {
            lock(&inner.listeners).retain(|(id, _)| *id != self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use stepflow_types::{Context, FlowError};

    fn store() -> Store {
        Store::new(FlowState::initial("a", Context::new()))
    }

    #[test]
    fn update_replaces_snapshot_without_touching_old_one() {
        let store = store();
        let before = store.get();
        store.update(|s| s.context.set("k", json!(1)));

        assert!(before.context.get("k").is_none());
        assert_eq!(store.get().context.get("k"), Some(&json!(1)));
    }

    #[test]
    fn try_update_discards_on_error() {
        let store = store();
        let result: Result<()> = store.try_update(|s| {
            s.step = "zzz".into();
            Err(FlowError::Other("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.get().step, "a");
    }

    #[test]
    fn listeners_fire_after_each_replacement() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let _sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        store.update(|s| s.is_loading = true);
        store.update(|s| *s = FlowState::initial("b", Context::new()));
        store.notify();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn listener_sees_new_state() {
        let store = store();
        let seen = Arc::new(Mutex::new(String::new()));
        let s = seen.clone();
        let _sub = store.subscribe(move |state| *lock(&s) = state.step.clone());

        store.update(|st| st.step = "b".into());
        assert_eq!(*lock(&seen), "b");
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let sub = store.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(store.listener_count(), 1);

        sub.unsubscribe();
        store.update(|s| s.is_loading = true);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn saves_after_every_replacement() {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = Store::with_persistence(
            FlowState::initial("a", Context::new()),
            persistence.clone(),
            |_| true,
        );
        store.update(|s| s.context.set("saved", json!(true)));

        let saved = persistence.saved().unwrap();
        assert!(saved.context.get_bool("saved"));
    }

    #[test]
    fn loads_accepted_snapshot_and_clears_busy_flags() {
        let mut saved = FlowState::initial("b", Context::new());
        saved.is_transitioning = true;
        saved.is_loading = true;
        let persistence = Arc::new(MemoryPersistence::with_state(saved));

        let store = Store::with_persistence(
            FlowState::initial("a", Context::new()),
            persistence,
            |_| true,
        );
        let state = store.get();
        assert_eq!(state.step, "b");
        assert!(!state.is_transitioning);
        assert!(!state.is_loading);
    }

    #[test]
    fn rejected_snapshot_falls_back_to_initial() {
        let persistence = Arc::new(MemoryPersistence::with_state(FlowState::initial(
            "gone",
            Context::new(),
        )));
        let store = Store::with_persistence(
            FlowState::initial("a", Context::new()),
            persistence,
            |s| s.step != "gone",
        );
        assert_eq!(store.get().step, "a");
    }

    #[test]
    fn failing_persistence_does_not_block_updates() {
        struct Broken;
        impl Persistence for Broken {
            fn save(&self, _: &FlowState) -> Result<()> {
                Err(FlowError::Persistence("disk full".into()))
            }
            fn load(&self) -> Result<Option<FlowState>> {
                Err(FlowError::Persistence("unreadable".into()))
            }
            fn clear(&self) -> Result<()> {
                Err(FlowError::Persistence("read-only".into()))
            }
        }

        let store = Store::with_persistence(
            FlowState::initial("a", Context::new()),
            Arc::new(Broken),
            |_| true,
        );
        store.update(|s| s.step = "b".into());
        store.clear_persisted();
        assert_eq!(store.get().step, "b");
    }
}
