use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::executor::TradingBot;

/// Sender half flips to `true` to stop the bot.
pub fn shutdown_channel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

/// Why `sleep_or_shutdown` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Elapsed,
    Shutdown,
}

async fn sleep_or_shutdown(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> Wake {
    if *shutdown.borrow() {
        return Wake::Shutdown;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Wake::Elapsed,
        changed = shutdown.changed() => match changed {
            Ok(()) if *shutdown.borrow() => Wake::Shutdown,
            Ok(()) => Wake::Elapsed,
            // Sender dropped: nobody can stop us any more, so stop now.
            Err(_) => Wake::Shutdown,
        },
    }
}

impl TradingBot {
    /// Poll loop: run a cycle, sleep, repeat until `shutdown` turns true.
    ///
    /// A failed cycle is logged and followed by the shorter error backoff.
    /// Shutdown is checked between cycles and wakes the sleep early; a cycle
    /// already talking to the broker runs to completion.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            bot = %self.name(),
            poll_secs = self.poll_interval.as_secs(),
            backoff_secs = self.error_backoff.as_secs(),
            "Bot loop starting"
        );
        let mut cycles: u64 = 0;

        loop {
            if *shutdown.borrow() {
                break;
            }
            cycles += 1;
            let pause = match self.run_strategy_cycle().await {
                Ok(_) => self.poll_interval,
                Err(e) => {
                    error!(bot = %self.name(), cycle = cycles, error = %e, "Strategy cycle failed");
                    warn!(secs = self.error_backoff.as_secs(), "Backing off before next cycle");
                    self.error_backoff
                }
            };
            if sleep_or_shutdown(pause, &mut shutdown).await == Wake::Shutdown {
                break;
            }
        }

        info!(bot = %self.name(), cycles, "Bot loop stopped");
    }
}
