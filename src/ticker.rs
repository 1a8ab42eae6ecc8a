use crate::config::TickerConfig;
use crate::error::{ResultExt, ThreadError, ThreadResult};
use crate::thread::{Blocking, CycleWait, ManagedThread, State, ThreadHandle, WaitMode};
use crate::warn_throttled;
use parking_lot::Mutex;
use signal_hook::SigId;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::{flag, low_level};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

/// One tick of a [`Ticker`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Tick {
    /// Zero-based tick number.
    pub index: u64,
    /// `index * interval`: when the tick was scheduled.
    pub virtual_time: Duration,
    /// Time since the first tick actually started.
    pub real_time: Duration,
}

impl Tick {
    /// How far the tick runs behind its schedule.
    pub fn lag(&self) -> Duration {
        self.real_time.saturating_sub(self.virtual_time)
    }
}

pub trait TickHandler: Send + 'static {
    fn on_tick(&mut self, tick: Tick) -> anyhow::Result<()>;
}

impl<F> TickHandler for F
where
    F: FnMut(Tick) -> anyhow::Result<()> + Send + 'static,
{
    #[inline]
    fn on_tick(&mut self, tick: Tick) -> anyhow::Result<()> {
        self(tick)
    }
}

type SharedHandler = Arc<Mutex<Box<dyn TickHandler>>>;

/// Calls a handler at a fixed rate on a dedicated managed thread.
///
/// Ticks are scheduled on an absolute cadence, so time spent in the handler
/// does not accumulate drift. A failing handler stops the ticker; its error
/// is reported by [`Ticker::stop`] or [`Ticker::wait`].
pub struct Ticker {
    cfg: TickerConfig,
    handler: SharedHandler,
    start_time: Arc<Mutex<Option<Instant>>>,
    thread: Option<ManagedThread>,
}

impl Ticker {
    pub fn new(cfg: TickerConfig, handler: impl TickHandler) -> Self {
        Self {
            cfg,
            handler: Arc::new(Mutex::new(Box::new(handler))),
            start_time: Arc::new(Mutex::new(None)),
            thread: None,
        }
    }

    pub fn with_interval(interval: Duration, handler: impl TickHandler) -> Self {
        let cfg = TickerConfig {
            interval: u64::try_from(interval.as_nanos()).unwrap_or(u64::MAX),
            interval_unit: crate::utils::time::TimeUnit::Nanos,
            ..TickerConfig::default()
        };
        Self::new(cfg, handler)
    }

    pub fn interval(&self) -> Duration {
        self.cfg.interval()
    }

    /// Spawns the ticker thread and returns once it is ticking.
    pub fn start(&mut self) -> ThreadResult<()> {
        if self.thread.is_some() {
            return Err(ThreadError::already_effective(
                "ticker has already been started; call stop() first",
            ));
        }
        let interval = self.cfg.interval();
        if interval.is_zero() {
            return Err(ThreadError::invalid_argument(
                "ticker interval must be non-zero",
            ));
        }

        let body = tick_loop(
            self.cfg.name.clone(),
            interval,
            self.cfg.handle_term_signals,
            self.handler.clone(),
            self.start_time.clone(),
        );
        let mut thread = ManagedThread::new(self.cfg.name.clone(), body)
            .with_cycle_wait(CycleWait::Absolute, interval);
        if let Some(core_id) = self.cfg.core_id {
            thread = thread.with_core(core_id);
        }

        *self.start_time.lock() = None;
        thread.start(Blocking::On).prepend("starting ticker")?;
        thread.run(Blocking::On).prepend("starting ticker")?;
        tracing::info!("[Ticker:{}] ticking every {:?}", self.cfg.name, interval);
        self.thread = Some(thread);
        Ok(())
    }

    /// Stops the ticker and joins its thread. Returns the handler's failure
    /// if that is what stopped it. Stopping an idle ticker is a no-op.
    pub fn stop(&mut self) -> ThreadResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.exit(Blocking::On).prepend("stopping ticker")?;
        let result = thread.thread_result().unwrap_or(Ok(()));
        tracing::info!(
            "[Ticker:{}] stopped after {} cycles",
            self.cfg.name,
            thread.cycle_count()
        );
        result
    }

    /// Blocks until the ticker stops on its own (handler failure or a
    /// termination signal), then behaves like [`Ticker::stop`].
    pub fn wait(&mut self) -> ThreadResult<()> {
        let Some(thread) = self.thread.as_ref() else {
            return Err(ThreadError::not_initialized());
        };
        thread
            .state_wait(State::Exited, WaitMode::Forever)
            .prepend("waiting for ticker")?;
        self.stop()
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|t| t.state() == State::Go)
    }

    /// When the first tick started; `None` before that.
    pub fn start_time(&self) -> Option<Instant> {
        *self.start_time.lock()
    }

    pub fn handle(&self) -> Option<ThreadHandle> {
        self.thread.as_ref().map(ManagedThread::handle)
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            tracing::error!("[Ticker:{}] {}", self.cfg.name, e);
        }
    }
}

struct WatchCount {
    active: usize,
    defaults_installed: bool,
}

static WATCHES: Mutex<WatchCount> = Mutex::new(WatchCount {
    active: 0,
    defaults_installed: false,
});
static RESTORE_DEFAULT: LazyLock<Arc<AtomicBool>> =
    LazyLock::new(|| Arc::new(AtomicBool::new(false)));

/// Routes termination signals into a flag for as long as it lives.
///
/// Once the last watch is dropped the signals get their default action
/// back, so a stopped ticker leaves Ctrl+C working.
struct TermWatch {
    flag: Arc<AtomicBool>,
    ids: Vec<SigId>,
}

impl TermWatch {
    fn register(name: &str) -> Self {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ids = Vec::with_capacity(TERM_SIGNALS.len());
        let mut watches = WATCHES.lock();
        for sig in TERM_SIGNALS {
            match flag::register(*sig, flag.clone()) {
                Ok(id) => ids.push(id),
                Err(e) => tracing::warn!("[Ticker:{}] cannot watch signal {}: {}", name, sig, e),
            }
        }
        if !watches.defaults_installed {
            for sig in TERM_SIGNALS {
                if let Err(e) = flag::register_conditional_default(*sig, RESTORE_DEFAULT.clone()) {
                    tracing::warn!(
                        "[Ticker:{}] cannot install default action for signal {}: {}",
                        name,
                        sig,
                        e
                    );
                }
            }
            watches.defaults_installed = true;
        }
        watches.active += 1;
        RESTORE_DEFAULT.store(false, Ordering::SeqCst);
        Self { flag, ids }
    }

    fn triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

impl Drop for TermWatch {
    fn drop(&mut self) {
        let mut watches = WATCHES.lock();
        for id in self.ids.drain(..) {
            low_level::unregister(id);
        }
        watches.active = watches.active.saturating_sub(1);
        if watches.active == 0 {
            RESTORE_DEFAULT.store(true, Ordering::SeqCst);
        }
    }
}

fn tick_loop(
    name: String,
    interval: Duration,
    handle_term_signals: bool,
    handler: SharedHandler,
    start_time: Arc<Mutex<Option<Instant>>>,
) -> impl FnOnce(&ThreadHandle) -> ThreadResult<()> + Send + 'static {
    move |ctl| {
        let term = handle_term_signals.then(|| TermWatch::register(&name));

        let mut handler = handler.lock();
        let mut start: Option<Instant> = None;
        let mut index: u64 = 0;

        while ctl.checkpoint().is_continue() {
            if term.as_ref().is_some_and(TermWatch::triggered) {
                tracing::warn!("[Ticker:{}] termination signal received", name);
                ctl.set_self_exiting()?;
                continue;
            }

            let started = *start.get_or_insert_with(|| {
                let now = Instant::now();
                *start_time.lock() = Some(now);
                now
            });
            let tick = Tick {
                index,
                virtual_time: Duration::from_nanos(
                    u64::try_from(interval.as_nanos())
                        .unwrap_or(u64::MAX)
                        .saturating_mul(index),
                ),
                real_time: started.elapsed(),
            };
            if tick.lag() > interval {
                warn_throttled!(
                    Duration::from_secs(5),
                    "[Ticker:{}] tick {} is {:?} behind schedule",
                    name,
                    index,
                    tick.lag()
                );
            }

            if let Err(e) = handler.on_tick(tick) {
                tracing::error!("[Ticker:{}] tick {} failed: {:#}", name, index, e);
                return Err(
                    ThreadError::failed(format!("{e:#}")).prepend("tick handler failed")
                );
            }
            index += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crossbeam::channel;

    #[test]
    fn ticks_in_order_until_stopped() {
        let (tx, rx) = channel::unbounded();
        let mut ticker = Ticker::with_interval(
            Duration::from_millis(2),
            move |tick: Tick| -> anyhow::Result<()> {
                tx.send(tick).ok();
                Ok(())
            },
        );
        ticker.start().unwrap();
        assert!(ticker.is_running());

        let ticks: Vec<Tick> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        ticker.stop().unwrap();
        assert!(!ticker.is_running());

        for (i, tick) in ticks.iter().enumerate() {
            assert_eq!(tick.index, i as u64);
            assert_eq!(tick.virtual_time, Duration::from_millis(2 * i as u64));
        }
        assert!(ticker.start_time().is_some());
    }

    #[test]
    fn double_start_is_rejected() {
        let mut ticker =
            Ticker::with_interval(Duration::from_millis(5), |_: Tick| -> anyhow::Result<()> {
                Ok(())
            });
        ticker.start().unwrap();
        let err = ticker.start().unwrap_err();
        assert!(err.is(ErrorKind::AlreadyEffective));
        ticker.stop().unwrap();
        // restartable after stop
        ticker.start().unwrap();
        ticker.stop().unwrap();
    }

    #[test]
    fn failing_handler_stops_ticker() {
        let mut ticker =
            Ticker::with_interval(Duration::from_millis(1), |tick: Tick| -> anyhow::Result<()> {
                if tick.index == 3 {
                    anyhow::bail!("boom at {}", tick.index);
                }
                Ok(())
            });
        ticker.start().unwrap();
        let err = ticker.wait().unwrap_err();
        assert!(err.is(ErrorKind::Failed));
        assert!(err.to_string().contains("boom at 3"));
        assert!(ticker.handle().is_none());
    }

    #[test]
    fn term_watch_unregisters_on_drop() {
        let watch = TermWatch::register("sig-test");
        let ids = watch.ids.clone();
        assert_eq!(ids.len(), TERM_SIGNALS.len());
        assert!(!RESTORE_DEFAULT.load(Ordering::SeqCst));
        assert!(!watch.triggered());

        drop(watch);
        for id in ids {
            // already gone
            assert!(!low_level::unregister(id));
        }
        assert!(RESTORE_DEFAULT.load(Ordering::SeqCst));
        assert_eq!(WATCHES.lock().active, 0);
    }

    #[test]
    fn zero_interval_is_invalid() {
        let mut ticker =
            Ticker::with_interval(Duration::ZERO, |_: Tick| -> anyhow::Result<()> { Ok(()) });
        assert!(ticker.start().unwrap_err().is(ErrorKind::InvalidArgument));
    }
}
