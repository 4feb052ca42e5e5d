//! Controlled-delay overload detection for the claim queue.
//!
//! The pool samples a claim's *sojourn time* (now minus enqueue time) at the
//! moment it attempts to pair the claim with an idle connection and feeds the
//! sample to the controller, which answers whether that claim should be shed.
//! Two real variants are provided: the interval/minimum formulation used by
//! Facebook's services and the original Nichols/Jacobson control law. The
//! controller also derives the ceiling on how long an unused idle connection
//! may be kept when the pool is under sustained pressure.

use std::time::Duration;

use tokio::time::Instant;

use crate::options::{CodelOptions, OverloadOptions};

/// Per-pool overload controller. Owned by the pool worker; all methods are
/// called from the worker task.
#[derive(Debug)]
pub(crate) enum OverloadController {
    Disabled,
    Modified(ModifiedCodel),
    Original(OriginalCodel),
}

impl OverloadController {
    pub(crate) fn new(options: &OverloadOptions, now: Instant) -> Self {
        match options {
            OverloadOptions::Disabled => OverloadController::Disabled,
            OverloadOptions::ModifiedCodel(opts) => {
                OverloadController::Modified(ModifiedCodel::new(opts.clone(), now))
            }
            OverloadOptions::OriginalCodel(opts) => {
                OverloadController::Original(OriginalCodel::new(opts.clone(), now))
            }
        }
    }

    /// Record one sojourn sample and decide whether to shed the sampled claim.
    pub(crate) fn observe(&mut self, now: Instant, sojourn: Duration) -> bool {
        match self {
            OverloadController::Disabled => false,
            OverloadController::Modified(codel) => codel.observe(now, sojourn),
            OverloadController::Original(codel) => codel.observe(now, sojourn),
        }
    }

    /// Note that the ready set transitioned from non-empty to empty or
    /// all-claimed.
    pub(crate) fn note_empty(&mut self, now: Instant) {
        match self {
            OverloadController::Disabled => {}
            OverloadController::Modified(codel) => codel.busyness.note_empty(now),
            OverloadController::Original(codel) => codel.busyness.note_empty(now),
        }
    }

    /// Lifetime ceiling for unused idle connections, or `None` when overload
    /// control is disabled.
    pub(crate) fn max_idle(&self, now: Instant) -> Option<Duration> {
        match self {
            OverloadController::Disabled => None,
            OverloadController::Modified(codel) => Some(codel.busyness.max_idle(now)),
            OverloadController::Original(codel) => Some(codel.busyness.max_idle(now)),
        }
    }
}

/// Tracks how recently the pool was last empty, shared by both variants.
#[derive(Debug)]
struct Busyness {
    target_delay: Duration,
    last_empty_bound: Duration,
    last_empty: Instant,
}

impl Busyness {
    fn new(target_delay: Duration, last_empty_bound: Duration, now: Instant) -> Self {
        Self {
            target_delay,
            last_empty_bound,
            // Start as if the pool had just been empty so a fresh pool is
            // never treated as overloaded.
            last_empty: now,
        }
    }

    fn note_empty(&mut self, now: Instant) {
        self.last_empty = now;
    }

    fn max_idle(&self, now: Instant) -> Duration {
        if now.saturating_duration_since(self.last_empty) >= self.last_empty_bound {
            // Continuously busy for the whole bound: recycle idle capacity
            // aggressively.
            self.target_delay * 3
        } else {
            self.last_empty_bound
        }
    }
}

/// Interval/minimum variant: tracks the minimum sojourn over a sliding
/// interval and flags overload when even the minimum exceeds the target.
#[derive(Debug)]
pub(crate) struct ModifiedCodel {
    interval: Duration,
    target_delay: Duration,
    min_delay: Option<Duration>,
    interval_end: Instant,
    overloaded: bool,
    busyness: Busyness,
}

impl ModifiedCodel {
    fn new(options: CodelOptions, now: Instant) -> Self {
        Self {
            interval: options.interval,
            target_delay: options.target_delay,
            min_delay: None,
            interval_end: now + options.interval,
            overloaded: false,
            busyness: Busyness::new(options.target_delay, options.last_empty_bound, now),
        }
    }

    fn observe(&mut self, now: Instant, sojourn: Duration) -> bool {
        if now >= self.interval_end {
            self.overloaded = self.min_delay.is_some_and(|min| min > self.target_delay);
            self.interval_end = now + self.interval;
            self.min_delay = Some(sojourn);
        } else {
            self.min_delay = Some(match self.min_delay {
                Some(min) => min.min(sojourn),
                None => sojourn,
            });
        }

        self.overloaded && sojourn > self.target_delay * 2
    }
}

/// The original control law: once sojourns stay above the target for a full
/// interval, shed claims at a rate growing with the square root of the drop
/// count.
#[derive(Debug)]
pub(crate) struct OriginalCodel {
    interval: Duration,
    target_delay: Duration,
    first_above_time: Option<Instant>,
    dropping: bool,
    count: u32,
    drop_next: Option<Instant>,
    busyness: Busyness,
}

impl OriginalCodel {
    fn new(options: CodelOptions, now: Instant) -> Self {
        Self {
            interval: options.interval,
            target_delay: options.target_delay,
            first_above_time: None,
            dropping: false,
            count: 0,
            drop_next: None,
            busyness: Busyness::new(options.target_delay, options.last_empty_bound, now),
        }
    }

    fn observe(&mut self, now: Instant, sojourn: Duration) -> bool {
        if sojourn <= self.target_delay {
            self.first_above_time = None;
            self.dropping = false;
            return false;
        }

        let first_above = *self.first_above_time.get_or_insert(now);
        let can_drop = now >= first_above + self.interval;

        if self.dropping {
            match self.drop_next {
                Some(drop_next) if now >= drop_next => {
                    self.count += 1;
                    self.drop_next = Some(now + control_interval(self.interval, self.count));
                    true
                }
                _ => false,
            }
        } else if can_drop {
            self.dropping = true;
            // Resume near the previous shed rate when the last shed was
            // recent, per the control law.
            self.count = match self.drop_next {
                Some(drop_next) if now < drop_next + self.interval && self.count > 2 => {
                    self.count - 2
                }
                _ => 1,
            };
            self.drop_next = Some(now + control_interval(self.interval, self.count));
            false
        } else {
            false
        }
    }
}

/// `interval / sqrt(count)`.
fn control_interval(interval: Duration, count: u32) -> Duration {
    Duration::from_secs_f64(interval.as_secs_f64() / (count.max(1) as f64).sqrt())
}

#[cfg(test)]
mod test {
    use super::*;

    fn modified(now: Instant) -> OverloadController {
        OverloadController::new(&OverloadOptions::ModifiedCodel(CodelOptions::default()), now)
    }

    fn original(now: Instant) -> OverloadController {
        OverloadController::new(&OverloadOptions::OriginalCodel(CodelOptions::default()), now)
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn disabled_never_sheds() {
        let now = Instant::now();
        let mut controller = OverloadController::new(&OverloadOptions::Disabled, now);
        assert!(!controller.observe(now, ms(60_000)));
        assert_eq!(controller.max_idle(now), None);
    }

    #[test]
    fn modified_sheds_after_a_saturated_interval() {
        let t0 = Instant::now();
        let mut controller = modified(t0);

        // Backlog pairs for the first time at t=1200ms; the interval covering
        // it has long expired but there is no prior minimum, so nothing sheds.
        assert!(!controller.observe(t0 + ms(1200), ms(1200)));

        // Next pairing lands past the freshly started interval; the previous
        // interval's minimum (1200ms) exceeds the target, and the sample's
        // sojourn exceeds twice the target, so the claim is shed.
        assert!(controller.observe(t0 + ms(1350), ms(1350)));
        assert!(controller.observe(t0 + ms(1360), ms(1360)));

        // A claim under the 2x-target bar is served even while overloaded.
        assert!(!controller.observe(t0 + ms(1370), ms(900)));
    }

    #[test]
    fn modified_recovers_after_a_quiet_interval() {
        let t0 = Instant::now();
        let mut controller = modified(t0);

        assert!(!controller.observe(t0 + ms(1200), ms(1200)));
        assert!(controller.observe(t0 + ms(1350), ms(1350)));

        // An interval of short sojourns clears the flag at the next rollover.
        assert!(!controller.observe(t0 + ms(1500), ms(10)));
        assert!(!controller.observe(t0 + ms(1700), ms(1200)));
    }

    #[test]
    fn original_requires_a_full_interval_above_target() {
        let t0 = Instant::now();
        let mut controller = original(t0);

        assert!(!controller.observe(t0 + ms(0), ms(600)));
        assert!(!controller.observe(t0 + ms(50), ms(700)));
        // First observation at least one interval after the excursion began
        // arms the dropper without shedding yet.
        assert!(!controller.observe(t0 + ms(100), ms(800)));
        // Shedding begins once the control clock elapses.
        assert!(controller.observe(t0 + ms(200), ms(900)));
    }

    #[test]
    fn original_shed_rate_grows_with_sqrt_count() {
        let t0 = Instant::now();
        let mut controller = original(t0);

        controller.observe(t0 + ms(0), ms(600));
        controller.observe(t0 + ms(100), ms(800));
        assert!(controller.observe(t0 + ms(200), ms(900)));

        // Second shed is due interval/sqrt(2) ~= 70ms later, not 100ms.
        assert!(!controller.observe(t0 + ms(250), ms(900)));
        assert!(controller.observe(t0 + ms(275), ms(900)));
    }

    #[test]
    fn original_resets_when_sojourn_recovers() {
        let t0 = Instant::now();
        let mut controller = original(t0);

        controller.observe(t0 + ms(0), ms(600));
        controller.observe(t0 + ms(100), ms(800));
        assert!(controller.observe(t0 + ms(200), ms(900)));

        assert!(!controller.observe(t0 + ms(210), ms(100)));
        // The excursion clock starts over.
        assert!(!controller.observe(t0 + ms(220), ms(800)));
        assert!(!controller.observe(t0 + ms(300), ms(800)));
    }

    #[test]
    fn max_idle_tightens_under_sustained_pressure() {
        let t0 = Instant::now();
        let mut controller = modified(t0);

        // Recently empty: relaxed ceiling.
        assert_eq!(controller.max_idle(t0 + ms(1000)), Some(ms(10_000)));

        // Never empty for the whole bound: aggressive ceiling of 3x target.
        assert_eq!(controller.max_idle(t0 + ms(10_000)), Some(ms(1500)));

        // Going empty resets the clock.
        controller.note_empty(t0 + ms(10_000));
        assert_eq!(controller.max_idle(t0 + ms(11_000)), Some(ms(10_000)));
    }
}
