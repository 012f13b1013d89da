//! Rearmable one-shot timers.
//!
//! Each zone owns at most two of these: the SOA poll timer and the
//! expire/eviction timer. A [`Timer`] wraps a pinned [`Sleep`] so that a
//! rearm resets the existing future instead of allocating a new one.
//! Rearming replaces any prior schedule; stopping an idle timer is a
//! no-op; [`Timer::wait`] on a stopped timer never completes, which is
//! exactly what a `select!` arm wants.

use core::time::Duration;
use std::future::pending;
use std::pin::Pin;

use tokio::time::{sleep_until, Instant, Sleep};

//------------ Timer ---------------------------------------------------------

pub struct Timer {
    sleep: Pin<Box<Sleep>>,
    armed: bool,
}

impl Timer {
    /// Creates a stopped timer.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(sleep_until(Instant::now())),
            armed: false,
        }
    }

    /// Schedules the timer, replacing any prior schedule.
    pub fn rearm(&mut self, after: Duration) {
        self.sleep.as_mut().reset(Instant::now() + after);
        self.armed = true;
    }

    /// Cancels the schedule if there is one.
    pub fn stop(&mut self) {
        self.armed = false;
    }

    /// Whether the timer is scheduled and has not fired yet.
    pub fn pending(&self) -> bool {
        self.armed
    }

    /// Completes when the timer fires; never completes while stopped.
    ///
    /// Cancellation safe: dropping the future leaves the schedule
    /// untouched.
    pub async fn wait(&mut self) {
        if !self.armed {
            pending::<()>().await;
            unreachable!();
        }
        self.sleep.as_mut().await;
        self.armed = false;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_the_rearm_duration() {
        let mut timer = Timer::new();
        timer.rearm(Duration::from_secs(5));
        assert!(timer.pending());
        timer.wait().await;
        assert!(!timer.pending());
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_the_schedule() {
        let mut timer = Timer::new();
        timer.rearm(Duration::from_secs(5));
        timer.rearm(Duration::from_secs(60));
        let start = Instant::now();
        timer.wait().await;
        assert!(Instant::now() - start >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_timer_never_fires() {
        let mut timer = Timer::new();
        timer.rearm(Duration::from_secs(1));
        timer.stop();
        assert!(!timer.pending());
        tokio::select! {
            _ = timer.wait() => panic!("stopped timer fired"),
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stopping_an_idle_timer_is_a_no_op() {
        let mut timer = Timer::new();
        timer.stop();
        assert!(!timer.pending());
    }
}
