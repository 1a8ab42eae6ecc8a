//! Managed worker threads.
//!
//! A [`ManagedThread`] owns one OS thread running a user body. The body
//! drives a small state machine by calling [`ThreadHandle::checkpoint`] at the
//! top of every loop iteration:
//!
//! ```text
//! Invalid --start()--> Init --(first checkpoint)--> Idle
//! Idle    --run()-->   Go
//! Go      --idle()-->  Idle
//! Go|Idle --exit()-->  Exiting --(body returns)--> Exited
//! ```
//!
//! Other threads only ever *request* states; the managed thread applies them
//! itself inside `checkpoint`. All mutable scheduling fields live behind a
//! single non-reentrant state lock.

mod checkpoint;
mod lifecycle;
mod listeners;
pub(crate) mod monitor;
mod types;

pub use listeners::StateChangeListener;
pub use types::*;

use crate::control::multi::GoBarrier;
use crate::error::ThreadResult;
use crate::thread::listeners::Listeners;
use crate::thread::monitor::{StateGuard, StateLock};
use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::thread::{JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// User-supplied thread body.
pub type ThreadBody = Box<dyn FnOnce(&ThreadHandle) -> ThreadResult<()> + Send + 'static>;

/// Fields guarded by the state lock.
pub(crate) struct Core {
    pub(crate) started: bool,
    pub(crate) thread_id: Option<ThreadId>,
    pub(crate) core_id: Option<usize>,

    pub(crate) state: State,
    pub(crate) requested: State,
    pub(crate) prev: State,
    /// How many times each state has been entered.
    pub(crate) entered: [u64; State::COUNT],
    pub(crate) entered_at: [Option<Instant>; State::COUNT],

    pub(crate) cycle_wait: CycleWait,
    pub(crate) period: Duration,
    pub(crate) cycle_wait_changed: bool,
    pub(crate) prev_cycle_at: Instant,

    /// Remaining checkpoints that skip the cycle wait.
    pub(crate) skip_count: u64,
    /// State at skip activation; `Invalid` while no skip is active.
    pub(crate) skip_orig: State,

    pub(crate) between_cycles: bool,
    pub(crate) pause_pending: bool,
    pub(crate) paused: bool,
    pub(crate) paused_count: u64,

    /// Threads currently parked on one of the signals.
    pub(crate) wait_count: usize,

    pub(crate) multi: Option<Arc<GoBarrier>>,
    pub(crate) stack_size: Option<usize>,
    pub(crate) result: Option<ThreadResult<()>>,

    pub(crate) internal_logging: bool,
    pub(crate) log_transitions: bool,
}

impl Core {
    fn new() -> Self {
        Self {
            started: false,
            thread_id: None,
            core_id: None,
            state: State::Invalid,
            requested: State::Invalid,
            prev: State::Invalid,
            entered: [0; State::COUNT],
            entered_at: [None; State::COUNT],
            cycle_wait: CycleWait::Absolute,
            period: Duration::ZERO,
            cycle_wait_changed: false,
            prev_cycle_at: Instant::now(),
            skip_count: 0,
            skip_orig: State::Invalid,
            between_cycles: false,
            pause_pending: false,
            paused: false,
            paused_count: 0,
            wait_count: 0,
            multi: None,
            stack_size: None,
            result: None,
            internal_logging: true,
            log_transitions: false,
        }
    }

    #[inline]
    pub(crate) fn is_available(&self) -> bool {
        !self.state.is_terminal() && !self.requested.is_terminal()
    }
}

/// Condition variables, all paired with the state lock.
#[derive(Default)]
pub(crate) struct Signals {
    /// Any state change.
    pub(crate) state_ready: Condvar,
    pub(crate) go_ready: Condvar,
    pub(crate) idle_ready: Condvar,
    /// Wakes the managed thread from its cycle wait, idle park or sleep.
    pub(crate) run: Condvar,
    pub(crate) skip_advance: Condvar,
    pub(crate) paused: Condvar,
    pub(crate) unpause: Condvar,
    pub(crate) none_waiting: Condvar,
}

pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) core: StateLock<Core>,
    pub(crate) signals: Signals,
    pub(crate) cycle_count: CachePadded<AtomicU64>,
    state_snapshot: AtomicU8,
    pub(crate) listeners: Listeners,
    pub(crate) body: Mutex<Option<ThreadBody>>,
    pub(crate) join: Mutex<Option<JoinHandle<()>>>,
}

/// Shared controller of a managed thread.
///
/// Cheap to clone; every clone addresses the same thread. Dropping a handle
/// never stops the thread, only dropping the owning [`ManagedThread`] does.
#[derive(Clone)]
pub struct ThreadHandle {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) type CoreGuard<'a> = StateGuard<'a, Core>;

impl ThreadHandle {
    fn new(name: String, body: ThreadBody) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                core: StateLock::new(Core::new()),
                signals: Signals::default(),
                cycle_count: CachePadded::new(AtomicU64::new(0)),
                state_snapshot: AtomicU8::new(State::Invalid as u8),
                listeners: Listeners::default(),
                body: Mutex::new(Some(body)),
                join: Mutex::new(None),
            }),
        }
    }

    #[inline]
    pub(crate) fn lock(&self) -> CoreGuard<'_> {
        self.shared.core.lock()
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// True if both handles control the same thread.
    #[inline]
    pub fn ptr_eq(&self, other: &ThreadHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn thread_id(&self) -> Option<ThreadId> {
        self.lock().thread_id
    }

    pub fn is_current_thread(&self) -> bool {
        self.lock().thread_id == Some(std::thread::current().id())
    }

    #[inline]
    pub(crate) fn is_current_locked(core: &Core) -> bool {
        core.thread_id == Some(std::thread::current().id())
    }

    /// Current effective state. Lock-free; only guaranteed current while
    /// nobody else can change it.
    #[inline]
    pub fn state(&self) -> State {
        State::from_u8(self.shared.state_snapshot.load(Ordering::Acquire))
    }

    /// Number of checkpoints passed so far; never reset.
    #[inline]
    pub fn cycle_count(&self) -> u64 {
        self.shared.cycle_count.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn has_exited(&self) -> bool {
        self.state() == State::Exited
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// False once Exiting has been requested or entered.
    pub fn is_available(&self) -> bool {
        self.lock().is_available()
    }

    /// True while a requested state has not been applied yet.
    pub fn is_state_changing(&self) -> bool {
        self.lock().requested != State::Invalid
    }

    pub fn requested_state(&self) -> State {
        self.lock().requested
    }

    pub fn prev_state(&self) -> State {
        self.lock().prev
    }

    /// Result returned by the thread body; `None` until the thread exits.
    pub fn thread_result(&self) -> Option<ThreadResult<()>> {
        self.lock().result.clone()
    }

    /// When `state` was most recently entered.
    pub fn state_timestamp(&self, state: State) -> Option<Instant> {
        self.lock().entered_at[state.index()]
    }

    pub fn cycle_wait(&self) -> CycleWait {
        self.lock().cycle_wait
    }

    pub fn cycle_wait_period(&self) -> Duration {
        self.lock().period
    }

    pub fn set_cycle_wait(&self, cycle_wait: CycleWait) {
        let mut g = self.lock();
        if g.cycle_wait != cycle_wait {
            g.cycle_wait = cycle_wait;
            g.cycle_wait_changed = true;
            self.shared.signals.run.notify_one();
        }
    }

    pub fn set_cycle_wait_period(&self, period: Duration) {
        let mut g = self.lock();
        if g.period != period {
            g.period = period;
            g.cycle_wait_changed = true;
            self.shared.signals.run.notify_one();
        }
    }

    /// Toggles the start/exit log lines emitted by the thread wrapper.
    pub fn set_internal_logging_enabled(&self, enable: bool) {
        self.lock().internal_logging = enable;
    }

    /// Emits a `debug!` line for every applied transition.
    pub fn set_transition_logging(&self, enable: bool) {
        self.lock().log_transitions = enable;
    }

    pub fn status(&self) -> ThreadStatus {
        let g = self.lock();
        self.status_locked(&g)
    }

    pub(crate) fn status_locked(&self, core: &Core) -> ThreadStatus {
        ThreadStatus {
            name: self.shared.name.clone(),
            started: core.started,
            state: core.state,
            requested_state: core.requested,
            prev_state: core.prev,
            cycle_count: self.cycle_count(),
            cycle_wait: core.cycle_wait,
            cycle_wait_period: core.period,
            is_paused: core.paused,
            pause_pending: core.pause_pending,
            cycle_skip_remaining: if core.skip_orig == State::Invalid {
                0
            } else {
                core.skip_count
            },
        }
    }

    /// Applies `new_state` and wakes everyone interested in it.
    pub(crate) fn set_state(&self, g: &mut CoreGuard<'_>, new_state: State) {
        debug_assert!(
            !(g.state.is_terminal() && !new_state.is_terminal()),
            "thread left a terminal state: {} -> {}",
            g.state,
            new_state
        );
        g.prev = g.state;
        g.state = new_state;
        g.entered[new_state.index()] += 1;
        g.entered_at[new_state.index()] = Some(Instant::now());
        self.shared
            .state_snapshot
            .store(new_state as u8, Ordering::Release);

        if g.log_transitions {
            tracing::debug!(
                "[ManagedThread:{}] {} -> {} at cycle {}",
                self.shared.name,
                g.prev,
                new_state,
                self.cycle_count()
            );
        }

        let signals = &self.shared.signals;
        signals.state_ready.notify_all();
        match new_state {
            State::Go => {
                signals.go_ready.notify_all();
            }
            State::Idle => {
                signals.idle_ready.notify_all();
            }
            State::Exiting | State::Exited => {
                signals.go_ready.notify_all();
                signals.idle_ready.notify_all();
            }
            State::Init | State::Invalid => {}
        }
        signals.paused.notify_all();
    }

    /// Records a pending request, waking waiters of a superseded one.
    pub(crate) fn set_requested(&self, g: &mut CoreGuard<'_>, requested: State) {
        if g.requested != State::Invalid && g.requested != requested {
            self.notify_state_waiters();
        }
        g.requested = requested;
        self.shared.signals.run.notify_one();
    }

    pub(crate) fn notify_state_waiters(&self) {
        let signals = &self.shared.signals;
        signals.state_ready.notify_all();
        signals.go_ready.notify_all();
        signals.idle_ready.notify_all();
        signals.paused.notify_all();
    }

    /// Parks on `cond` with the state lock released; `true` on timeout.
    pub(crate) fn wait_on(
        &self,
        g: &mut CoreGuard<'_>,
        cond: &Condvar,
        deadline: Option<Instant>,
    ) -> bool {
        g.wait_count += 1;
        let timed_out = g.wait_deadline(cond, deadline);
        g.wait_count -= 1;
        if g.state == State::Exited && g.wait_count == 0 {
            self.shared.signals.none_waiting.notify_all();
        }
        timed_out
    }

    pub(crate) fn cond_for(&self, state: State) -> &Condvar {
        match state {
            State::Go => &self.shared.signals.go_ready,
            State::Idle => &self.shared.signals.idle_ready,
            _ => &self.shared.signals.state_ready,
        }
    }
}

/// Converts a wait mode into an absolute deadline; `None` waits forever.
pub(crate) fn deadline_for(mode: WaitMode) -> Option<Instant> {
    let now = Instant::now();
    match mode {
        WaitMode::NoWait => Some(now),
        WaitMode::For(timeout) => now.checked_add(timeout),
        WaitMode::Forever => None,
    }
}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("cycle_count", &self.cycle_count())
            .finish()
    }
}

/// Owner of a managed thread.
///
/// Dropping it requests Exiting, waits for Exited and joins the OS thread.
/// It must therefore never be dropped from inside the thread it owns.
pub struct ManagedThread {
    handle: ThreadHandle,
}

impl ManagedThread {
    /// Creates a thread in the `Invalid` state; nothing runs until `start`.
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: FnOnce(&ThreadHandle) -> ThreadResult<()> + Send + 'static,
    {
        Self {
            handle: ThreadHandle::new(name.into(), Box::new(body)),
        }
    }

    /// Creates a thread with the name, cycle-wait policy, pinning and
    /// logging options taken from `cfg`.
    pub fn from_config<F>(cfg: &crate::config::ThreadConfig, body: F) -> Self
    where
        F: FnOnce(&ThreadHandle) -> ThreadResult<()> + Send + 'static,
    {
        let thread = Self::new(cfg.name.clone(), body);
        {
            let mut g = thread.handle.lock();
            g.cycle_wait = cfg.cycle_wait;
            g.period = cfg.period();
            g.core_id = cfg.core_id;
            g.stack_size = cfg.stack_size;
            g.log_transitions = cfg.log_transitions;
        }
        thread
    }

    /// Builder-style cycle-wait configuration.
    pub fn with_cycle_wait(self, cycle_wait: CycleWait, period: Duration) -> Self {
        {
            let mut g = self.handle.lock();
            g.cycle_wait = cycle_wait;
            g.period = period;
        }
        self
    }

    /// Pins the OS thread to `core_id` when it starts.
    pub fn with_core(self, core_id: usize) -> Self {
        self.handle.lock().core_id = Some(core_id);
        self
    }

    /// Stack size for the OS thread, in bytes.
    pub fn with_stack_size(self, stack_size: usize) -> Self {
        self.handle.lock().stack_size = Some(stack_size);
        self
    }

    pub fn handle(&self) -> ThreadHandle {
        self.handle.clone()
    }
}

impl Deref for ManagedThread {
    type Target = ThreadHandle;

    fn deref(&self) -> &ThreadHandle {
        &self.handle
    }
}

impl fmt::Debug for ManagedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ManagedThread").field(&self.handle).finish()
    }
}

impl Drop for ManagedThread {
    fn drop(&mut self) {
        let handle = &self.handle;
        {
            let g = handle.lock();
            if !g.started {
                return;
            }
            if ThreadHandle::is_current_locked(&g) {
                tracing::error!(
                    "[ManagedThread:{}] dropped from its own context, leaving it detached",
                    handle.name()
                );
                return;
            }
        }

        if let Err(e) = handle.exit(Blocking::On) {
            tracing::warn!("[ManagedThread:{}] exit on drop failed: {}", handle.name(), e);
        }

        // let other waiters observe Exited before the owner goes away
        let mut g = handle.lock();
        while g.wait_count > 0 {
            g.wait(&handle.shared.signals.none_waiting);
        }
        drop(g);

        handle.join_internal();
    }
}
