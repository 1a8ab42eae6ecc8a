use crate::control::multi::GoBarrier;
use crate::control::registry;
use crate::error::{ErrorKind, ResultExt, ThreadError, ThreadResult};
use crate::thread::{CoreGuard, State, ThreadBody, ThreadHandle, WaitMode, deadline_for};
use crate::utils::try_pin_core;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

impl ThreadHandle {
    /// Spawns the OS thread. With `Blocking::On` returns once the thread has
    /// passed its first checkpoint (or exited early).
    pub fn start(&self, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        let mode = mode.into();
        let mut g = self.lock();
        if g.started {
            return Err(ThreadError::already_effective(
                "thread has already been started",
            ));
        }
        if self.shared.body.lock().is_none() {
            return Err(ThreadError::already_effective("thread body already consumed"));
        }

        g.started = true;
        g.requested = State::Idle;
        g.prev_cycle_at = Instant::now();
        self.set_state(&mut g, State::Init);

        let handle = self.clone();
        let mut builder = thread::Builder::new().name(self.shared.name.clone());
        if let Some(stack_size) = g.stack_size {
            builder = builder.stack_size(stack_size);
        }
        // the body stays in place until the thread runs, so a failed spawn
        // can be retried
        let spawned = builder.spawn(move || thread_main(handle));

        match spawned {
            Ok(join) => {
                g.thread_id = Some(join.thread().id());
                *self.shared.join.lock() = Some(join);
            }
            Err(e) => {
                g.started = false;
                g.requested = State::Invalid;
                self.set_state(&mut g, State::Invalid);
                return Err(ThreadError::unavailable(format!(
                    "failed to spawn thread '{}': {e}",
                    self.shared.name
                )));
            }
        }

        if mode.is_blocking() {
            let deadline = deadline_for(mode);
            while g.state == State::Init {
                if self.wait_on(&mut g, &self.shared.signals.state_ready, deadline) {
                    if g.state != State::Init {
                        break;
                    }
                    return Err(ThreadError::timed_out(
                        "thread did not reach its first checkpoint",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Asks the thread to enter `new_state`.
    ///
    /// Only Idle, Go and Exiting can be requested. A blocking request returns
    /// once the thread has entered `new_state`, the deadline passes, or the
    /// request is superseded by a different one.
    pub fn request_state(&self, new_state: State, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        let mode = mode.into();
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if !new_state.is_requestable() {
            return Err(ThreadError::invalid_argument(format!(
                "state '{new_state}' cannot be requested"
            )));
        }
        self.request_state_locked(&mut g, new_state, mode)
    }

    pub(crate) fn request_state_locked(
        &self,
        g: &mut CoreGuard<'_>,
        new_state: State,
        mode: WaitMode,
    ) -> ThreadResult<()> {
        match g.state {
            State::Exited => {
                return Err(ThreadError::unavailable(format!(
                    "thread has exited, ignoring request for state '{new_state}'"
                )));
            }
            State::Exiting if new_state == State::Exiting => return Ok(()),
            State::Exiting => {
                return Err(ThreadError::shutting_down(format!(
                    "thread is exiting, ignoring request for state '{new_state}'"
                )));
            }
            _ => {}
        }

        if new_state == State::Idle && g.multi.is_some() {
            // a synchronized Go is in flight
            return Err(ThreadError::interrupted(
                "synchronized transition to 'Go' in progress, ignoring request for state 'Idle'",
            ));
        }

        if g.paused {
            g.paused = false;
            self.shared.signals.unpause.notify_all();
        }
        if g.pause_pending {
            g.pause_pending = false;
            self.shared.signals.paused.notify_all();
        }

        if g.requested == State::Exiting && new_state != State::Exiting {
            return Err(ThreadError::shutting_down(format!(
                "exit already requested, ignoring request for state '{new_state}'"
            )));
        }

        if new_state == g.state {
            // cancels whatever is pending
            if g.requested != State::Invalid {
                g.requested = State::Invalid;
                self.notify_state_waiters();
            }
            return Ok(());
        }

        if mode.is_blocking() && ThreadHandle::is_current_locked(g) {
            return Err(ThreadError::deadlock_averted(format!(
                "blocking request for state '{new_state}' from the thread itself"
            )));
        }

        let seen = g.entered[new_state.index()];
        self.set_requested(g, new_state);
        if !mode.is_blocking() {
            return Ok(());
        }
        self.await_state(g, new_state, seen, deadline_for(mode), true)
    }

    /// Waits until `target` is entered after generation `seen`.
    ///
    /// With `track_request` the wait also ends once the pending request no
    /// longer names `target`.
    pub(crate) fn await_state(
        &self,
        g: &mut CoreGuard<'_>,
        target: State,
        seen: u64,
        deadline: Option<Instant>,
        track_request: bool,
    ) -> ThreadResult<()> {
        loop {
            if g.state == target || g.entered[target.index()] != seen {
                return Ok(());
            }
            match g.state {
                State::Exited if target == State::Exiting => return Ok(()),
                State::Exited => {
                    return Err(ThreadError::unavailable(format!(
                        "thread has exited, cancelling wait for state '{target}'"
                    )));
                }
                State::Exiting if target != State::Exited => {
                    return Err(ThreadError::shutting_down(format!(
                        "thread is exiting, cancelling wait for state '{target}'"
                    )));
                }
                _ => {}
            }
            if track_request && g.requested != target {
                if g.requested == State::Exiting {
                    return Err(ThreadError::shutting_down(format!(
                        "exit requested while waiting for state '{target}'"
                    )));
                }
                return Err(ThreadError::interrupted(format!(
                    "request for state '{target}' was superseded by '{}'",
                    g.requested.name_or("(none)")
                )));
            }
            let cond = self.cond_for(target);
            if self.wait_on(g, cond, deadline)
                && g.state != target
                && g.entered[target.index()] == seen
            {
                return Err(ThreadError::timed_out(format!(
                    "waiting for state '{target}', current state is '{}'",
                    g.state
                )));
            }
        }
    }

    /// Blocks until the thread is in (or has passed through) `target`.
    ///
    /// Must not be called from the managed thread itself.
    pub fn state_wait(&self, target: State, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        let mode = mode.into();
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if matches!(target, State::Init | State::Invalid) {
            return Err(ThreadError::invalid_argument(format!(
                "cannot wait for state '{target}'"
            )));
        }
        if ThreadHandle::is_current_locked(&g) {
            return Err(ThreadError::restricted(
                "a thread cannot wait for its own state",
            ));
        }
        let seen = g.entered[target.index()];
        self.await_state(&mut g, target, seen, deadline_for(mode), false)
    }

    pub fn run(&self, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        self.request_state(State::Go, mode)
    }

    pub fn idle(&self, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        self.request_state(State::Idle, mode)
    }

    /// Requests Exiting. A blocking exit waits for Exited and joins the OS
    /// thread. Calling it on a thread that already exited is a no-op.
    pub fn exit(&self, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        let mode = mode.into();
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }

        if g.state != State::Exited {
            if g.state != State::Exiting {
                match self.request_state_locked(&mut g, State::Exiting, WaitMode::NoWait) {
                    Ok(()) => {}
                    Err(e) if e.is(ErrorKind::ResourceUnavailable) => {}
                    Err(e) => return Err(e.prepend("couldn't request state 'Exiting'")),
                }
            }
            if !mode.is_blocking() {
                return Ok(());
            }
            if ThreadHandle::is_current_locked(&g) {
                return Err(ThreadError::deadlock_averted(
                    "blocking exit requested from the thread itself",
                ));
            }
            let seen = g.entered[State::Exited.index()];
            self.await_state(&mut g, State::Exited, seen, deadline_for(mode), false)
                .prepend("waiting for thread exit")?;
        }

        let own = ThreadHandle::is_current_locked(&g);
        drop(g);
        if !own {
            self.join_internal();
        }
        Ok(())
    }

    /// Marks the thread Exiting from inside its own body; the next
    /// checkpoint returns `Exit`.
    pub fn set_self_exiting(&self) -> ThreadResult<()> {
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if !ThreadHandle::is_current_locked(&g) {
            return Err(ThreadError::restricted(
                "only the managed thread can mark itself exiting",
            ));
        }
        if g.state.is_terminal() {
            return Ok(());
        }
        g.requested = State::Invalid;
        self.set_state(&mut g, State::Exiting);
        let prev = g.prev;
        drop(g);
        self.fire_listeners(State::Exiting, prev);
        Ok(())
    }

    pub(crate) fn join_internal(&self) {
        let join = self.shared.join.lock().take();
        if let Some(join) = join
            && join.join().is_err()
        {
            tracing::error!(
                "[ManagedThread:{}] wrapper thread panicked",
                self.shared.name
            );
        }
    }

    /// Enrolls the thread in a synchronized Go transition.
    pub(crate) fn attach_barrier(&self, barrier: &Arc<GoBarrier>) -> ThreadResult<()> {
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if !g.is_available() {
            return Err(ThreadError::shutting_down(
                "thread is exiting, not joining synchronized transition",
            ));
        }
        if g.multi.is_some() {
            return Err(ThreadError::invalid_argument(
                "thread already takes part in a synchronized transition",
            ));
        }
        g.multi = Some(barrier.clone());
        self.shared.signals.run.notify_one();
        Ok(())
    }

    /// Withdraws from `barrier` if still enrolled, releasing the slot.
    pub(crate) fn detach_barrier(&self, barrier: &Arc<GoBarrier>) {
        let mut g = self.lock();
        if let Some(attached) = &g.multi
            && Arc::ptr_eq(attached, barrier)
        {
            g.multi = None;
            barrier.release();
        }
    }

    fn finish(&self, result: ThreadResult<()>) {
        let mut g = self.lock();
        if let Some(barrier) = g.multi.take() {
            barrier.release();
        }
        g.result = Some(result.clone());
        g.pause_pending = false;
        g.paused = false;
        g.skip_orig = State::Invalid;
        g.skip_count = 0;
        g.requested = State::Invalid;
        self.set_state(&mut g, State::Exited);

        let signals = &self.shared.signals;
        signals.skip_advance.notify_all();
        signals.unpause.notify_all();
        signals.run.notify_all();
        if g.wait_count == 0 {
            signals.none_waiting.notify_all();
        }

        let prev = g.prev;
        let log = g.internal_logging;
        drop(g);

        self.fire_listeners(State::Exited, prev);

        if log {
            match &result {
                Ok(()) => tracing::info!(
                    "[ManagedThread:{}] exited after {} cycles",
                    self.shared.name,
                    self.cycle_count()
                ),
                Err(e) => tracing::error!(
                    "[ManagedThread:{}] exited with error: {}",
                    self.shared.name,
                    e
                ),
            }
        }
    }
}

fn thread_main(handle: ThreadHandle) {
    let id = registry::register(handle.clone());
    let body = handle.shared.body.lock().take();

    let (core_id, log) = {
        let g = handle.lock();
        (g.core_id, g.internal_logging)
    };
    if let Some(core_id) = core_id {
        match try_pin_core(core_id) {
            Ok(core_id) => {
                tracing::info!("[ManagedThread:{}] pinned to core: {}", handle.name(), core_id)
            }
            Err(e) => tracing::warn!("[ManagedThread:{}] cannot pin core: {}", handle.name(), e),
        }
    }
    if log {
        tracing::info!("[ManagedThread:{}] started: {}", handle.name(), handle.status());
    }

    let result = match body {
        Some(body) => run_body(&handle, body),
        None => Err(ThreadError::failed("thread body missing at start")),
    };

    handle.finish(result);
    registry::unregister(id);
}

fn run_body(handle: &ThreadHandle, body: ThreadBody) -> ThreadResult<()> {
    match panic::catch_unwind(AssertUnwindSafe(|| body(handle))) {
        Ok(result) => result,
        Err(payload) => Err(ThreadError::failed(format!(
            "thread body panicked: {}",
            panic_message(payload.as_ref())
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
