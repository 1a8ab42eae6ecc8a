use anyhow::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default)]
pub struct LoggerConfig {
    /// Default level, used when `filter` is not set.
    pub level: String,
    /// Full `EnvFilter` directive string, e.g. `"info,cyclert=debug"`.
    pub filter: Option<String>,
    pub file_dir: Option<String>,
    pub file_prefix: Option<String>,
    pub rolling: Option<String>,
    pub max_files: usize,
    /// Prefix every line with the OS thread name, i.e. the managed thread name.
    pub thread_names: bool,
}

impl LoggerConfig {
    /// Reads LOG_LEVEL, LOG_FILTER, LOG_FILE_DIR, LOG_FILE_PREFIX and
    /// LOG_ROLLING, falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            level: std::env::var("LOG_LEVEL").unwrap_or(defaults.level),
            filter: std::env::var("LOG_FILTER").ok(),
            file_dir: std::env::var("LOG_FILE_DIR").ok(),
            file_prefix: std::env::var("LOG_FILE_PREFIX").ok(),
            rolling: std::env::var("LOG_ROLLING").ok().or(defaults.rolling),
            ..defaults
        }
    }

    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let directives = self.filter.as_deref().unwrap_or(&self.level);
        EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter '{directives}'"))
    }

    fn rotation(&self) -> Rotation {
        match self.rolling.as_deref() {
            Some("minutely") => Rotation::MINUTELY,
            Some("hourly") => Rotation::HOURLY,
            Some("never") => Rotation::NEVER,
            _ => Rotation::DAILY,
        }
    }

    /// Installs the global subscriber. Keep the returned guard alive for as
    /// long as file logging should be flushed. A subscriber that is already
    /// installed is left in place.
    pub fn init(&self) -> anyhow::Result<Option<WorkerGuard>> {
        let filter = self.env_filter()?;
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_thread_names(self.thread_names);

        let Some(dir) = self.file_dir.as_deref() else {
            let _ = builder.try_init();
            tracing::info!("[Logger] logging to stdout");
            return Ok(None);
        };

        let prefix = self.file_prefix.as_deref().unwrap_or("cyclert");
        let appender = RollingFileAppender::builder()
            .rotation(self.rotation())
            .max_log_files(self.max_files)
            .filename_prefix(prefix)
            .build(dir)
            .with_context(|| format!("failed to create rolling appender in {dir}"))?;
        let (writer, guard) = tracing_appender::non_blocking(appender);

        let _ = builder.with_ansi(false).with_writer(writer).try_init();
        tracing::info!(
            "[Logger] logging to dir: {}, prefix: {}, rotation: {:?}",
            dir,
            prefix,
            self.rolling
        );
        Ok(Some(guard))
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            filter: None,
            file_dir: None,
            file_prefix: None,
            rolling: Some("daily".to_string()),
            max_files: 2,
            thread_names: true,
        }
    }
}

/// Rate limiter for a single log call site.
///
/// At most one line passes per `interval`; the next line that passes reports
/// how many were dropped in between. Used through the `*_throttled!` macros:
///
/// ```ignore
/// warn_throttled!(Duration::from_secs(5), "tick {} overran", index);
/// ```
pub struct Throttle {
    last: Mutex<Option<Instant>>,
    suppressed: AtomicU64,
    interval: Duration,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last: Mutex::new(None),
            suppressed: AtomicU64::new(0),
            interval,
        }
    }

    /// `Some(suppressed)` if the caller may log now.
    #[inline]
    pub fn poll(&self) -> Option<u64> {
        let now = Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(at) if now.duration_since(at) < self.interval => {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                None
            }
            _ => {
                *last = Some(now);
                Some(self.suppressed.swap(0, Ordering::Relaxed))
            }
        }
    }
}

/// Level-generic form; one [`Throttle`] per call site.
#[macro_export]
macro_rules! log_throttled {
    ($level:ident, $interval:expr, $($arg:tt)*) => {{
        static THROTTLE: std::sync::OnceLock<$crate::utils::logger::Throttle> =
            std::sync::OnceLock::new();
        let throttle = THROTTLE.get_or_init(|| $crate::utils::logger::Throttle::new($interval));
        if let Some(suppressed) = throttle.poll() {
            if suppressed > 0 {
                tracing::$level!(suppressed, $($arg)*);
            } else {
                tracing::$level!($($arg)*);
            }
        }
    }};
}

#[macro_export]
macro_rules! error_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(error, $interval, $($arg)*); } }
#[macro_export]
macro_rules! warn_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(warn,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! info_throttled  { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(info,  $interval, $($arg)*); } }
#[macro_export]
macro_rules! debug_throttled { ($interval:expr, $($arg:tt)*) => { $crate::log_throttled!(debug, $interval, $($arg)*); } }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_counts_suppressed_lines() {
        let throttle = Throttle::new(Duration::from_secs(60));
        assert_eq!(throttle.poll(), Some(0));
        assert_eq!(throttle.poll(), None);
        assert_eq!(throttle.poll(), None);
        assert_eq!(throttle.suppressed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn zero_interval_never_suppresses() {
        let throttle = Throttle::new(Duration::ZERO);
        for _ in 0..3 {
            assert_eq!(throttle.poll(), Some(0));
        }
    }

    #[test]
    fn filter_directives_override_level() {
        let cfg = LoggerConfig {
            level: "warn".into(),
            filter: Some("info,cyclert=trace".into()),
            ..LoggerConfig::default()
        };
        assert!(cfg.env_filter().is_ok());

        let bad = LoggerConfig {
            filter: Some("cyclert=notalevel".into()),
            ..LoggerConfig::default()
        };
        assert!(bad.env_filter().is_err());
    }
}
