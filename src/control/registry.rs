//! Process-wide map from OS thread id to managed thread.
//!
//! Every managed thread registers itself when its OS thread starts and
//! unregisters right before it ends. Lock order is registry first, then the
//! thread's state lock.

use crate::thread::{ThreadHandle, ThreadStatus};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::LazyLock;
use std::thread::{self, ThreadId};

static REGISTRY: LazyLock<Mutex<AHashMap<ThreadId, ThreadHandle>>> =
    LazyLock::new(|| Mutex::new(AHashMap::new()));

/// Registers `handle` for the calling OS thread.
pub(crate) fn register(handle: ThreadHandle) -> ThreadId {
    let id = thread::current().id();
    if let Some(previous) = REGISTRY.lock().insert(id, handle) {
        tracing::warn!(
            "[ThreadRegistry] {:?} was still registered to '{}'",
            id,
            previous.name()
        );
    }
    id
}

pub(crate) fn unregister(id: ThreadId) -> Option<ThreadHandle> {
    REGISTRY.lock().remove(&id)
}

pub fn lookup(id: ThreadId) -> Option<ThreadHandle> {
    REGISTRY.lock().get(&id).cloned()
}

/// Managed thread running on the calling OS thread, if any.
pub fn current() -> Option<ThreadHandle> {
    lookup(thread::current().id())
}

/// Looks up a thread and captures its status while it is guaranteed to
/// still be registered.
pub fn lookup_status(id: ThreadId) -> Option<(ThreadHandle, ThreadStatus)> {
    let registry = REGISTRY.lock();
    let handle = registry.get(&id)?;
    let status = handle.status();
    Some((handle.clone(), status))
}

pub fn registered_count() -> usize {
    REGISTRY.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::{Blocking, ManagedThread, State};
    use std::sync::mpsc;

    #[test]
    fn unknown_id_is_absent() {
        let id = thread::spawn(|| thread::current().id()).join().unwrap();
        assert!(lookup(id).is_none());
        assert!(lookup_status(id).is_none());
        assert!(current().is_none());
    }

    #[test]
    fn register_and_unregister_round_trip() {
        let managed = ManagedThread::new("registry-manual", |_| Ok(()));
        let (tx, rx) = mpsc::channel();
        let handle = managed.handle();
        thread::spawn(move || {
            let id = register(handle.clone());
            let found = current().map(|h| h.ptr_eq(&handle));
            let removed = unregister(id).is_some();
            tx.send((found, removed, lookup(id).is_none())).unwrap();
        })
        .join()
        .unwrap();
        assert_eq!(rx.recv().unwrap(), (Some(true), true, true));
    }

    #[test]
    fn managed_thread_registers_itself() {
        let (tx, rx) = mpsc::channel();
        let thread = ManagedThread::new("registry-auto", move |ctl| {
            let me = current().map(|h| h.ptr_eq(ctl)).unwrap_or(false);
            tx.send(me).unwrap();
            while ctl.checkpoint().is_continue() {}
            Ok(())
        });
        thread.start(Blocking::On).unwrap();
        assert!(rx.recv().unwrap());

        let id = thread.thread_id().unwrap();
        let (handle, status) = lookup_status(id).unwrap();
        assert!(handle.ptr_eq(&thread));
        assert_eq!(status.name, "registry-auto");
        assert_eq!(status.state, State::Idle);

        thread.exit(Blocking::On).unwrap();
        assert!(lookup(id).is_none());
    }
}
