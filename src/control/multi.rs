//! Coordinated state change across several managed threads.

use crate::error::{ThreadError, ThreadResult};
use crate::thread::{Blocking, State, ThreadHandle, WaitMode};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;

/// Countdown shared by all participants of a synchronized Go transition.
///
/// Each participant arrives from inside its checkpoint after entering Go,
/// and none continues until the count reaches zero.
pub(crate) struct GoBarrier {
    pending: Mutex<usize>,
    cond: Condvar,
}

impl GoBarrier {
    fn new() -> Self {
        Self {
            pending: Mutex::new(0),
            cond: Condvar::new(),
        }
    }

    /// Counts the caller in and blocks until everyone else has arrived.
    pub(crate) fn arrive(&self) {
        let mut pending = self.pending.lock();
        debug_assert!(*pending > 0, "barrier arrival without a slot");
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.cond.notify_all();
            return;
        }
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }

    /// Gives a slot back without waiting, for participants that drop out.
    pub(crate) fn release(&self) {
        let mut pending = self.pending.lock();
        *pending = pending.saturating_sub(1);
        if *pending == 0 {
            self.cond.notify_all();
        }
    }

    fn wait_all(&self) {
        let mut pending = self.pending.lock();
        while *pending > 0 {
            self.cond.wait(&mut pending);
        }
    }
}

/// A participant that did not reach the requested state.
#[derive(Debug, Clone)]
pub struct StateChangeFailure {
    pub thread: ThreadHandle,
    pub error: ThreadError,
}

/// Moves every thread in `threads` to `target` concurrently.
///
/// For `Go` the participants are released together: none returns from the
/// checkpoint that applied Go until all of them have applied it. For
/// `Exited` each thread is asked to exit and waited for.
///
/// Returns the per-thread failures; an `Err` is only returned for a target
/// that can never be requested.
pub fn request_state_multiple(
    threads: &[ThreadHandle],
    target: State,
) -> ThreadResult<Vec<StateChangeFailure>> {
    if !target.is_requestable() && target != State::Exited {
        return Err(ThreadError::invalid_argument(format!(
            "state '{target}' cannot be requested"
        )));
    }

    let failures = Arc::new(Mutex::new(Vec::new()));
    let fail = |thread: &ThreadHandle, error: ThreadError| {
        failures.lock().push(StateChangeFailure {
            thread: thread.clone(),
            error,
        });
    };

    let mut participants: Vec<ThreadHandle> = Vec::with_capacity(threads.len());
    for thread in threads {
        if participants.iter().any(|p| p.ptr_eq(thread)) {
            fail(
                thread,
                ThreadError::invalid_argument("thread is listed more than once"),
            );
        } else if thread.is_current_thread() {
            fail(
                thread,
                ThreadError::deadlock_averted(
                    "coordinating thread cannot take part in its own transition",
                ),
            );
        } else {
            participants.push(thread.clone());
        }
    }

    let barrier = (target == State::Go).then(|| Arc::new(GoBarrier::new()));
    if let Some(barrier) = &barrier {
        // every slot is counted before the first thread can arrive; the
        // count lock is never held while taking a state lock
        *barrier.pending.lock() = participants.len();
        participants.retain(|thread| match thread.attach_barrier(barrier) {
            Ok(()) => true,
            Err(e) => {
                barrier.release();
                fail(thread, e);
                false
            }
        });
    }

    let mut helpers = Vec::with_capacity(participants.len());
    for thread in participants {
        let failures = failures.clone();
        let worker = thread.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-req", thread.name()))
            .spawn(move || {
                if let Err(error) = apply_state(&worker, target) {
                    failures.lock().push(StateChangeFailure {
                        thread: worker,
                        error,
                    });
                }
            });
        match spawned {
            Ok(join) => helpers.push((thread, join)),
            Err(e) => {
                if let Some(barrier) = &barrier {
                    thread.detach_barrier(barrier);
                }
                fail(
                    &thread,
                    ThreadError::unavailable(format!("couldn't spawn request helper: {e}")),
                );
            }
        }
    }

    if let Some(barrier) = &barrier {
        barrier.wait_all();
    }

    for (thread, join) in helpers {
        if join.join().is_err() {
            fail(&thread, ThreadError::failed("request helper panicked"));
        }
    }

    let failures = std::mem::take(&mut *failures.lock());
    if !failures.is_empty() {
        tracing::warn!(
            "[MultiRequest] {} of {} threads failed to reach '{}'",
            failures.len(),
            threads.len(),
            target
        );
    }
    Ok(failures)
}

fn apply_state(thread: &ThreadHandle, target: State) -> ThreadResult<()> {
    let res = if target == State::Exited {
        thread
            .exit(Blocking::Off)
            .and_then(|_| thread.state_wait(State::Exited, WaitMode::Forever))
    } else {
        thread.request_state(target, WaitMode::Forever)
    };
    res.map_err(|e| e.prepend(format!("thread '{}'", thread.name())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::thread::{CycleWait, ManagedThread};
    use std::time::Duration;

    fn spin_thread(name: &str) -> ManagedThread {
        ManagedThread::new(name, |ctl| {
            while ctl.checkpoint().is_continue() {}
            Ok(())
        })
        .with_cycle_wait(CycleWait::Relative, Duration::from_millis(1))
    }

    #[test]
    fn barrier_releases_on_last_arrival() {
        let barrier = Arc::new(GoBarrier::new());
        *barrier.pending.lock() = 3;
        let mut joins = Vec::new();
        for _ in 0..2 {
            let barrier = barrier.clone();
            joins.push(thread::spawn(move || barrier.arrive()));
        }
        barrier.release();
        barrier.wait_all();
        for join in joins {
            join.join().unwrap();
        }
        assert_eq!(*barrier.pending.lock(), 0);
    }

    #[test]
    fn rejects_unrequestable_target() {
        let err = request_state_multiple(&[], State::Init).unwrap_err();
        assert!(err.is(ErrorKind::InvalidArgument));
        assert!(request_state_multiple(&[], State::Go).unwrap().is_empty());
    }

    #[test]
    fn unstarted_thread_is_reported() {
        let idle = spin_thread("multi-unstarted");
        let failures = request_state_multiple(&[idle.handle()], State::Go).unwrap();
        assert_eq!(failures.len(), 1);
        assert!(failures[0].error.is(ErrorKind::NotInitialized));
    }

    #[test]
    fn duplicate_participant_is_rejected() {
        let thread = spin_thread("multi-dup")
            .with_cycle_wait(CycleWait::Relative, Duration::from_micros(20));
        thread.start(Blocking::On).unwrap();
        thread.run(Blocking::On).unwrap();
        let handle = thread.handle();

        let (tx, rx) = crossbeam::channel::bounded(1);
        let worker = thread::spawn(move || {
            for _ in 0..20 {
                let failures =
                    request_state_multiple(&[handle.clone(), handle.clone()], State::Go).unwrap();
                tx.send(failures).ok();
            }
        });
        for _ in 0..20 {
            let failures = rx.recv_timeout(Duration::from_secs(3)).expect("multi request hung");
            assert_eq!(failures.len(), 1, "{failures:?}");
            assert!(failures[0].error.is(ErrorKind::InvalidArgument));
        }
        worker.join().unwrap();
        assert_eq!(thread.state(), State::Go);
        thread.exit(Blocking::On).unwrap();
    }

    #[test]
    fn exits_all_threads() {
        let threads: Vec<_> = (0..3)
            .map(|i| spin_thread(&format!("multi-exit-{i}")))
            .collect();
        for thread in &threads {
            thread.start(Blocking::On).unwrap();
        }
        let handles: Vec<_> = threads.iter().map(|t| t.handle()).collect();
        let failures = request_state_multiple(&handles, State::Exited).unwrap();
        assert!(failures.is_empty(), "{failures:?}");
        assert!(handles.iter().all(|h| h.has_exited()));
    }
}
