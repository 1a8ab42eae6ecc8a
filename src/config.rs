use crate::thread::CycleWait;
use crate::utils::time::TimeUnit;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings applied by [`ManagedThread::from_config`](crate::thread::ManagedThread::from_config).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ThreadConfig {
    pub name: String,
    pub cycle_wait: CycleWait,
    /// Cycle-wait period in `period_unit`.
    pub period: u64,
    pub period_unit: TimeUnit,
    pub core_id: Option<usize>,
    /// OS thread stack size in bytes; the platform default when unset.
    pub stack_size: Option<usize>,
    pub log_transitions: bool,
}

impl ThreadConfig {
    pub fn period(&self) -> Duration {
        self.period_unit.duration(self.period)
    }
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            name: "managed".to_string(),
            cycle_wait: CycleWait::Absolute,
            period: 0,
            period_unit: TimeUnit::Millis,
            core_id: None,
            stack_size: None,
            log_transitions: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct TickerConfig {
    pub name: String,
    pub interval: u64,
    pub interval_unit: TimeUnit,
    pub core_id: Option<usize>,
    /// Stop the ticker on SIGTERM/SIGINT.
    pub handle_term_signals: bool,
}

impl TickerConfig {
    pub fn interval(&self) -> Duration {
        self.interval_unit.duration(self.interval)
    }
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self {
            name: "ticker".to_string(),
            interval: 1,
            interval_unit: TimeUnit::Millis,
            core_id: None,
            handle_term_signals: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thread_config_fills_defaults() {
        let cfg: ThreadConfig = serde_json::from_value(json!({
            "name": "worker",
            "cycle_wait": "relative",
            "period": 250,
            "period_unit": "micros",
        }))
        .unwrap();
        assert_eq!(cfg.name, "worker");
        assert_eq!(cfg.cycle_wait, CycleWait::Relative);
        assert_eq!(cfg.period(), Duration::from_micros(250));
        assert_eq!(cfg.core_id, None);
        assert_eq!(cfg.stack_size, None);
        assert!(!cfg.log_transitions);
    }

    #[test]
    fn ticker_config_defaults_to_one_millisecond() {
        let cfg: TickerConfig = serde_json::from_value(json!({})).unwrap();
        assert_eq!(cfg.interval(), Duration::from_millis(1));
        assert!(!cfg.handle_term_signals);
    }
}
