//! Periodic signals delivered through a channel.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::debug;

use crate::channel::Channel;
use crate::scheduler::Scheduler;

/// Delivers `true` on its channel once per period.
///
/// The signal channel has a capacity of one and the periodic send is
/// non-blocking, so a slow consumer misses ticks instead of stalling the
/// timer.
///
/// # Examples
///
/// ```no_run
/// use rendezvous::Ticker;
/// use std::time::Duration;
///
/// let mut ticker = Ticker::new(Duration::from_millis(100));
/// for _ in 0..3 {
///     assert_eq!(ticker.channel().recv(), Some(true));
/// }
/// ticker.stop();
/// ```
pub struct Ticker {
    timer: Scheduler,
    driver: Option<JoinHandle<()>>,
    signal: Channel<bool>,
}

impl Ticker {
    /// Start a ticker firing every `period`, with the first tick one full
    /// period from now.
    pub fn new(period: Duration) -> Self {
        let signal = Channel::new(1);
        let timer = Scheduler::new();

        let tick = signal.clone();
        timer.schedule_every(
            move || {
                let _ = tick.try_send(true);
            },
            period,
            period,
        );

        let runner = timer.clone();
        let driver = thread::Builder::new()
            .name("rendezvous-ticker".into())
            .spawn(move || runner.run())
            .expect("failed to spawn ticker driver");
        debug!(?period, "ticker started");

        Ticker {
            timer,
            driver: Some(driver),
            signal,
        }
    }

    /// The channel the ticks arrive on.
    #[must_use]
    pub fn channel(&self) -> &Channel<bool> {
        &self.signal
    }

    /// Stop the timer and join the driver thread. Idempotent; also invoked
    /// on drop.
    pub fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            self.timer.stop(false);
            let _ = driver.join();
            debug!("ticker stopped");
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
