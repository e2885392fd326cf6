//! One-shot timers for the dispatch loop.
//!
//! The session keeps at most one deadline per [`Timer`]. Scheduling a timer
//! that is already pending moves its deadline; cancelling a timer that is not
//! pending does nothing. The loop sleeps until [`Timers::next_deadline`] and
//! then drains [`Timers::pop_expired`].

use std::{collections::HashMap, future, time::Duration};

use tokio::time::Instant;

/// Everything the session may schedule.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Timer {
    /// Retry after a lost or failed connection.
    AutoReconnect,

    /// Send the next heartbeat.
    Heartbeat,

    /// The last heartbeat went unanswered for too long.
    HeartbeatExpired,

    /// Forget calls that will never be answered.
    Sweep,

    /// Disconnect after the last client left.
    AutoDisconnect,

    /// Reconnect in case the connectivity signal never arrives.
    Failsafe,
}

#[derive(Debug, Default)]
pub struct Timers {
    deadlines: HashMap<Timer, Instant>,
}

impl Timers {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires `timer` after `delay`, replacing any earlier schedule.
    pub fn schedule(&mut self, timer: Timer, delay: Duration) {
        trace!("scheduling {timer:?} in {delay:?}");
        self.deadlines.insert(timer, Instant::now() + delay);
    }

    /// Returns whether the timer was pending.
    pub fn cancel(&mut self, timer: Timer) -> bool {
        self.deadlines.remove(&timer).is_some()
    }

    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.values().min().copied()
    }

    /// Removes and returns the earliest timer whose deadline has passed.
    /// Timers due at the same instant come out in declaration order.
    pub fn pop_expired(&mut self) -> Option<Timer> {
        let now = Instant::now();
        let timer = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .min_by_key(|(timer, deadline)| (**deadline, **timer))
            .map(|(timer, _)| *timer)?;

        self.deadlines.remove(&timer);
        Some(timer)
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

/// Sleeps until `deadline`, or forever if there is none.
pub async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_in_deadline_order() {
        let mut timers = Timers::new();
        timers.schedule(Timer::Sweep, Duration::from_secs(30));
        timers.schedule(Timer::Heartbeat, Duration::from_millis(3_500));
        timers.schedule(Timer::AutoReconnect, Duration::from_secs(2));
        assert_eq!(timers.pop_expired(), None);

        sleep_until(timers.next_deadline()).await;
        assert_eq!(timers.pop_expired(), Some(Timer::AutoReconnect));
        assert_eq!(timers.pop_expired(), None);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(timers.pop_expired(), Some(Timer::Heartbeat));
        assert_eq!(timers.pop_expired(), Some(Timer::Sweep));
        assert_eq!(timers.next_deadline(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_moves_the_deadline() {
        let mut timers = Timers::new();
        timers.schedule(Timer::AutoDisconnect, Duration::from_secs(1));
        tokio::time::advance(Duration::from_millis(900)).await;
        timers.schedule(Timer::AutoDisconnect, Duration::from_secs(1));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(timers.pop_expired(), None);
        assert!(timers.next_deadline().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn ties_break_by_declaration_order() {
        let mut timers = Timers::new();
        timers.schedule(Timer::Failsafe, Duration::ZERO);
        timers.schedule(Timer::HeartbeatExpired, Duration::ZERO);
        assert_eq!(timers.pop_expired(), Some(Timer::HeartbeatExpired));
        assert_eq!(timers.pop_expired(), Some(Timer::Failsafe));
    }

    #[test]
    fn cancel_reports_whether_pending() {
        let mut timers = Timers::new();
        assert!(!timers.cancel(Timer::Failsafe));
        timers.schedule(Timer::Failsafe, Duration::from_secs(2));
        assert!(timers.cancel(Timer::Failsafe));
        assert_eq!(timers.next_deadline(), None);
    }
}
