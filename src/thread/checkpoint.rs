use crate::error::{ThreadError, ThreadResult};
use crate::thread::{
    CheckpointResult, CoreGuard, CycleWait, State, ThreadHandle, WaitMode, deadline_for,
};
use std::sync::atomic::Ordering;
use std::time::Instant;

enum CycleSleep {
    /// Period elapsed, or there was nothing to wait for.
    Elapsed,
    /// Woken early; pending work must be examined.
    Woken,
}

impl ThreadHandle {
    /// Per-cycle synchronization point. Must be called by the managed thread
    /// at the top of each loop iteration.
    ///
    /// Sleeps according to the cycle-wait policy, applies pending state
    /// requests (parking while Idle), honours pauses and fires listeners.
    /// Returns [`CheckpointResult::Exit`] once the thread is Exiting.
    pub fn checkpoint(&self) -> CheckpointResult {
        let mut g = self.lock();
        if !ThreadHandle::is_current_locked(&g) {
            tracing::error!(
                "[ManagedThread:{}] checkpoint called from a foreign thread",
                self.shared.name
            );
            debug_assert!(false, "checkpoint called from a foreign thread");
            return CheckpointResult::Exit;
        }

        self.shared.cycle_count.fetch_add(1, Ordering::AcqRel);

        if g.state == State::Exiting {
            self.consider_pause(&mut g);
            return CheckpointResult::Exit;
        }

        if g.skip_orig != State::Invalid {
            self.shared.signals.skip_advance.notify_all();
            if g.requested == State::Invalid {
                if g.skip_count > 0 {
                    g.skip_count -= 1;
                    self.consider_pause(&mut g);
                    return CheckpointResult::Continue;
                }
                if g.skip_orig == State::Idle {
                    g.requested = State::Idle;
                }
            }
            g.skip_orig = State::Invalid;
            g.skip_count = 0;
        }

        g.between_cycles = true;

        if g.requested == State::Invalid
            && g.multi.is_none()
            && let CycleSleep::Elapsed = self.cycle_sleep(&mut g)
        {
            g.between_cycles = false;
            self.consider_pause(&mut g);
            return CheckpointResult::Continue;
        }

        let mut result = CheckpointResult::Continue;
        let mut fired = None;

        if g.requested == g.state {
            g.requested = State::Invalid;
        }
        while g.requested != State::Invalid {
            match g.requested {
                State::Go => {
                    g.requested = State::Invalid;
                    self.set_state(&mut g, State::Go);
                    fired = Some((State::Go, g.prev));
                }
                State::Idle if g.multi.is_some() => {
                    // a synchronized Go overrides the idle request
                    g.requested = State::Go;
                }
                State::Idle => {
                    g.requested = State::Invalid;
                    self.set_state(&mut g, State::Idle);
                    let prev = g.prev;
                    fired = None;
                    g.unlocked(|| self.fire_listeners(State::Idle, prev));
                    if g.requested != State::Invalid {
                        continue;
                    }
                    while g.requested == State::Invalid {
                        self.wait_on(&mut g, &self.shared.signals.run, None);
                    }
                    g.prev_cycle_at = Instant::now();
                    if g.skip_orig != State::Invalid {
                        g.skip_count = g.skip_count.saturating_sub(1);
                    }
                }
                State::Exiting => {
                    g.requested = State::Invalid;
                    self.set_state(&mut g, State::Exiting);
                    fired = Some((State::Exiting, g.prev));
                    result = CheckpointResult::Exit;
                }
                other => {
                    debug_assert!(false, "unexpected requested state {other}");
                    g.requested = State::Invalid;
                }
            }
        }

        if let Some(barrier) = g.multi.take() {
            // state lock stays held so no participant leaves early
            barrier.arrive();
        }

        if let Some((new_state, prev)) = fired {
            g.unlocked(|| self.fire_listeners(new_state, prev));
        }

        g.between_cycles = false;
        self.consider_pause(&mut g);
        result
    }

    /// Sleeps out the cycle wait. Must only run with no request pending.
    fn cycle_sleep(&self, g: &mut CoreGuard<'_>) -> CycleSleep {
        let sleep_start = Instant::now();
        loop {
            if g.pause_pending {
                self.consider_pause(g);
            }
            if g.requested != State::Invalid || g.multi.is_some() {
                break;
            }

            // a period too large to represent waits like Indefinite
            let deadline = match g.cycle_wait {
                CycleWait::Indefinite => None,
                CycleWait::Relative => sleep_start.checked_add(g.period),
                CycleWait::Absolute => g.prev_cycle_at.checked_add(g.period),
            };
            if let Some(deadline) = deadline
                && deadline <= Instant::now()
            {
                g.prev_cycle_at = Instant::now();
                return CycleSleep::Elapsed;
            }

            g.cycle_wait_changed = false;
            if self.wait_on(g, &self.shared.signals.run, deadline) {
                g.prev_cycle_at = Instant::now();
                return CycleSleep::Elapsed;
            }

            if g.skip_orig != State::Invalid {
                if g.requested == State::Invalid {
                    g.skip_count = g.skip_count.saturating_sub(1);
                } else {
                    g.skip_orig = State::Invalid;
                    g.skip_count = 0;
                }
                break;
            }
            if g.requested != State::Invalid || g.multi.is_some() {
                break;
            }
            if g.cycle_wait_changed {
                g.cycle_wait_changed = false;
                if g.cycle_wait == CycleWait::Relative {
                    break;
                }
            }
            // pause requests and spurious wakeups go round again
        }
        g.prev_cycle_at = Instant::now();
        CycleSleep::Woken
    }

    /// Parks the managed thread while a pause is in effect.
    fn consider_pause(&self, g: &mut CoreGuard<'_>) {
        if !g.pause_pending {
            return;
        }
        g.pause_pending = false;
        g.paused = true;
        g.paused_count += 1;
        self.shared.signals.paused.notify_all();
        while g.paused {
            self.wait_on(g, &self.shared.signals.unpause, None);
        }
    }

    /// Pauses the thread at its next checkpoint exit, or right away if it is
    /// parked in Idle. When the thread is in Go and the caller is another
    /// thread, returns once the pause took effect or can no longer take
    /// effect. Any state request lifts the pause.
    pub fn pause(&self) -> ThreadResult<()> {
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if g.paused {
            return Err(ThreadError::already_effective("thread is already paused"));
        }
        if !g.is_available() {
            return Err(ThreadError::unavailable(
                "thread is exiting, cannot pause",
            ));
        }

        if g.state == State::Idle && g.requested == State::Invalid {
            // already parked; the next request clears the pause
            g.paused = true;
            g.paused_count += 1;
            self.shared.signals.paused.notify_all();
            return Ok(());
        }

        g.pause_pending = true;
        self.shared.signals.run.notify_one();

        if g.state == State::Go && !ThreadHandle::is_current_locked(&g) {
            let target = g.paused_count + 1;
            while g.paused_count < target
                && g.pause_pending
                && g.state == State::Go
                && g.is_available()
            {
                self.wait_on(&mut g, &self.shared.signals.paused, None);
            }
        }
        Ok(())
    }

    /// Resumes a paused thread, or cancels a pause that has not taken effect.
    pub fn unpause(&self) -> ThreadResult<()> {
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if !g.paused {
            if g.pause_pending {
                g.pause_pending = false;
                self.shared.signals.paused.notify_all();
                return Ok(());
            }
            return Err(ThreadError::already_effective("thread isn't paused"));
        }
        g.paused = false;
        self.shared.signals.unpause.notify_all();
        Ok(())
    }

    /// Interruptible sleep for the managed thread itself.
    ///
    /// Returns `InterruptedOperation` as soon as a state change is pending,
    /// `Ok` once `max` has elapsed undisturbed.
    pub fn sleep(&self, max: impl Into<WaitMode>) -> ThreadResult<()> {
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if !ThreadHandle::is_current_locked(&g) {
            return Err(ThreadError::restricted(
                "sleep is only available to the managed thread",
            ));
        }
        let deadline = deadline_for(max.into());
        loop {
            if g.requested != State::Invalid {
                return Err(ThreadError::interrupted(format!(
                    "sleep interrupted by request for state '{}'",
                    g.requested
                )));
            }
            if let Some(deadline) = deadline
                && deadline <= Instant::now()
            {
                return Ok(());
            }
            self.wait_on(&mut g, &self.shared.signals.run, deadline);
        }
    }

    pub fn run_one_cycle(&self, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        self.run_n_cycles(1, mode)
    }

    /// Runs `n` cycles without waiting between them, then returns to the
    /// state the thread was in. An Idle thread is brought to Go for the
    /// duration. Overlapping calls merge into the larger remaining count.
    ///
    /// A blocking call returns after the `n`-th checkpoint, or with
    /// `InterruptedOperation` if a state request cancels the run first.
    pub fn run_n_cycles(&self, n: u64, mode: impl Into<WaitMode>) -> ThreadResult<()> {
        let mode = mode.into();
        let mut g = self.lock();
        if !g.started {
            return Err(ThreadError::not_initialized());
        }
        if n == 0 {
            return Ok(());
        }
        let own = ThreadHandle::is_current_locked(&g);
        if mode.is_blocking() && own {
            return Err(ThreadError::deadlock_averted(
                "blocking cycle run requested from the thread itself",
            ));
        }
        let deadline = deadline_for(mode);

        // the first checkpoint would cancel the skip in favour of the
        // pending startup request
        while g.state == State::Init && !own {
            if self.wait_on(&mut g, &self.shared.signals.state_ready, deadline)
                && g.state == State::Init
            {
                return Err(ThreadError::timed_out(
                    "thread did not reach its first checkpoint",
                ));
            }
        }

        if g.state.is_terminal() || g.requested == State::Exiting {
            return Err(ThreadError::shutting_down(
                "thread is exiting, cannot run cycles",
            ));
        }

        g.skip_count = g.skip_count.max(n);
        if g.skip_orig == State::Invalid {
            g.skip_orig = g.state;
        }
        if g.state == State::Idle {
            self.request_state_locked(&mut g, State::Go, WaitMode::NoWait)?;
        } else {
            self.shared.signals.run.notify_one();
        }

        if !mode.is_blocking() {
            return Ok(());
        }

        let mut stop = self.cycle_count().saturating_add(n);
        if !g.between_cycles {
            stop = stop.saturating_add(1);
        }
        while self.cycle_count() < stop
            && g.skip_orig != State::Invalid
            && !g.state.is_terminal()
        {
            if self.wait_on(&mut g, &self.shared.signals.skip_advance, deadline)
                && self.cycle_count() < stop
                && g.skip_orig != State::Invalid
            {
                return Err(ThreadError::timed_out(format!(
                    "waiting for {n} cycles to complete"
                )));
            }
        }
        if g.state == State::Exited {
            return Err(ThreadError::unavailable(
                "thread exited while running cycles",
            ));
        }
        if self.cycle_count() < stop && !g.state.is_terminal() {
            return Err(ThreadError::interrupted(format!(
                "run of {n} cycles cancelled by a state request"
            )));
        }
        Ok(())
    }
}
