use cyclert::prelude::*;
use std::time::Duration;

pub fn main() -> anyhow::Result<()> {
    let _guard = LoggerConfig::from_env().init()?;

    let cfg = TickerConfig {
        name: "demo-ticker".to_string(),
        interval: 100,
        handle_term_signals: true,
        ..TickerConfig::default()
    };

    let mut ticker = Ticker::new(cfg, |tick: Tick| -> anyhow::Result<()> {
        tracing::info!(
            "tick {} virtual {:?} real {:?}",
            tick.index,
            tick.virtual_time,
            tick.real_time
        );
        anyhow::ensure!(tick.index < 50, "demo ran out of ticks");
        Ok(())
    });
    ticker.start()?;

    if let Some(handle) = ticker.handle() {
        std::thread::sleep(Duration::from_millis(550));
        handle.pause()?;
        tracing::info!("paused: {}", handle.status());
        std::thread::sleep(Duration::from_millis(300));
        handle.unpause()?;
    }

    std::thread::sleep(Duration::from_secs(1));
    ticker.stop()?;
    Ok(())
}
