//! Periodic and one-shot timers, grounded on the C reference's
//! `timer_init`/`timers_get_soonest`/`timers_apply` (`timers.c`), adapted
//! to `tokio::time::Instant` in place of hand-rolled monotonic-clock
//! arithmetic. Each timer carries a payload, mirroring the original
//! `struct timer`'s embedded `event` (itself holding its own call
//! arguments).

use std::time::Duration;

use tokio::time::Instant;

pub type TimerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Periodic(Duration),
    OneShot,
}

#[derive(Debug, Clone)]
struct ScheduledTimer<P> {
    id: TimerId,
    name: &'static str,
    kind: TimerKind,
    expire: Instant,
    payload: P,
}

/// The timer list the event loop consults once per poll cycle.
pub struct TimerWheel<P> {
    timers: Vec<ScheduledTimer<P>>,
    next_id: TimerId,
}

impl<P> Default for TimerWheel<P> {
    fn default() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 0,
        }
    }
}

impl<P: Clone> TimerWheel<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a timer that refires every `period` indefinitely.
    pub fn schedule_periodic(&mut self, name: &'static str, period: Duration, now: Instant, payload: P) -> TimerId {
        self.insert(name, TimerKind::Periodic(period), now + period, payload)
    }

    /// Schedule a timer that fires once, `delay` from now, then forgets
    /// itself.
    pub fn schedule_once(&mut self, name: &'static str, delay: Duration, now: Instant, payload: P) -> TimerId {
        self.insert(name, TimerKind::OneShot, now + delay, payload)
    }

    fn insert(&mut self, name: &'static str, kind: TimerKind, expire: Instant, payload: P) -> TimerId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(timer = name, id, "timer scheduled");
        self.timers.push(ScheduledTimer {
            id,
            name,
            kind,
            expire,
            payload,
        });
        id
    }

    /// Remove a timer before it fires. No-op if it already fired (one-shot)
    /// or was never scheduled.
    pub fn cancel(&mut self, id: TimerId) {
        self.timers.retain(|t| t.id != id);
    }

    /// Deadline of the soonest pending timer, used as the event loop's
    /// `sleep_until` argument -- `None` means block on sockets alone.
    pub fn soonest_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.expire).min()
    }

    /// Fire every timer whose deadline has passed as of `now`. A periodic
    /// timer that missed more than one period (the loop was pumped late)
    /// fires once per missed period, matching `timers_apply`'s `while
    /// (expire <= tack)` loop rather than a single `if`. One-shot timers
    /// are removed after firing. Returns `(name, payload)` pairs in
    /// timer-list order.
    pub fn expire(&mut self, now: Instant) -> Vec<(&'static str, P)> {
        let mut fired = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            let mut removed = false;
            while self.timers[i].expire <= now {
                fired.push((self.timers[i].name, self.timers[i].payload.clone()));
                match self.timers[i].kind {
                    TimerKind::Periodic(period) => {
                        self.timers[i].expire += period;
                    }
                    TimerKind::OneShot => {
                        self.timers.remove(i);
                        removed = true;
                        break;
                    }
                }
            }
            if !removed {
                i += 1;
            }
        }
        fired
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn one_shot_fires_once_then_is_removed() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_once("bootstrap", Duration::from_millis(10), now, ());

        tokio::time::advance(Duration::from_millis(15)).await;
        let fired = wheel.expire(Instant::now());
        assert_eq!(fired, vec![("bootstrap", ())]);
        assert!(wheel.is_empty());

        let fired_again = wheel.expire(Instant::now());
        assert!(fired_again.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_fires_floor_elapsed_over_period_times() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_periodic("refresh", Duration::from_millis(10), now, ());

        tokio::time::advance(Duration::from_millis(35)).await;
        let fired = wheel.expire(Instant::now());
        assert_eq!(fired.len(), 3, "floor(35/10) = 3 catch-up fires");
        assert!(!wheel.is_empty(), "periodic timer stays scheduled");
    }

    #[tokio::test(start_paused = true)]
    async fn soonest_deadline_picks_minimum_across_timers() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_once("slow", Duration::from_secs(10), now, ());
        wheel.schedule_once("fast", Duration::from_millis(5), now, ());
        assert_eq!(wheel.soonest_deadline(), Some(now + Duration::from_millis(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_removes_pending_timer() {
        let mut wheel: TimerWheel<()> = TimerWheel::new();
        let now = Instant::now();
        let id = wheel.schedule_once("bootstrap", Duration::from_millis(10), now, ());
        wheel.cancel(id);
        assert!(wheel.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn payload_is_threaded_through_to_the_fired_event() {
        let mut wheel: TimerWheel<u32> = TimerWheel::new();
        let now = Instant::now();
        wheel.schedule_once("probe-timeout", Duration::from_millis(10), now, 42);
        tokio::time::advance(Duration::from_millis(10)).await;
        let fired = wheel.expire(Instant::now());
        assert_eq!(fired, vec![("probe-timeout", 42)]);
    }
}
