use crate::error::{ThreadError, ThreadResult};
use crate::thread::{ListenerId, State, ThreadHandle};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Callback invoked on the managed thread after every applied transition,
/// with `(thread, new_state, prev_state)`. Runs without the state lock held.
pub type StateChangeListener = dyn Fn(&ThreadHandle, State, State) + Send + Sync;

#[derive(Default)]
pub(crate) struct Listeners {
    next_id: AtomicU64,
    map: Mutex<BTreeMap<ListenerId, Arc<StateChangeListener>>>,
}

impl Listeners {
    fn snapshot(&self) -> Vec<Arc<StateChangeListener>> {
        self.map.lock().values().cloned().collect()
    }
}

impl ThreadHandle {
    /// Registers a state-change listener. Listeners fire in registration order.
    pub fn register_state_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ThreadHandle, State, State) + Send + Sync + 'static,
    {
        let listeners = &self.shared.listeners;
        let id = ListenerId(listeners.next_id.fetch_add(1, Ordering::Relaxed));
        listeners.map.lock().insert(id, Arc::new(listener));
        id
    }

    pub fn unregister_state_listener(&self, id: ListenerId) -> ThreadResult<()> {
        match self.shared.listeners.map.lock().remove(&id) {
            Some(_) => Ok(()),
            None => Err(ThreadError::not_registered(format!(
                "state listener {id} is not registered"
            ))),
        }
    }

    pub(crate) fn fire_listeners(&self, new_state: State, prev_state: State) {
        // snapshot so listeners may (un)register while being called
        for listener in self.shared.listeners.snapshot() {
            listener(self, new_state, prev_state);
        }
    }
}
