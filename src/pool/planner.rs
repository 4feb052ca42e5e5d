//! Decides how many slots the pool should run against each backend.
//!
//! [`plan`] is a pure function from an observed state to a list of actions;
//! the pool worker applies the actions and replans when something it cares
//! about changes (membership, backend health, a slot terminating, claim
//! pressure). Keeping the decision pure keeps it testable against exact
//! distributions.

use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet},
    time::Duration,
};

use tokio::time::Instant;

use super::SlotId;

/// The phase a slot is in, as the planner sees it. Draining and terminated
/// slots are not the planner's to touch and are never included.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SlotPhase {
    Starting,
    Idle,
    Claimed,
}

impl SlotPhase {
    /// Retirement preference: connecting slots are the cheapest to give up,
    /// claimed ones the most expensive.
    fn retire_rank(self) -> u8 {
        match self {
            SlotPhase::Starting => 0,
            SlotPhase::Idle => 1,
            SlotPhase::Claimed => 2,
        }
    }
}

/// One live normal-mode slot, as presented to the planner.
#[derive(Clone, Debug)]
pub(crate) struct SlotView {
    pub(crate) id: SlotId,
    pub(crate) backend: String,
    pub(crate) phase: SlotPhase,
    pub(crate) unwanted: bool,
}

/// Everything the planner looks at.
#[derive(Clone, Debug, Default)]
pub(crate) struct PlanInput {
    /// Healthy backend keys, earliest-added first.
    pub(crate) healthy: Vec<String>,

    /// Dead backend keys.
    pub(crate) dead: Vec<String>,

    /// Dead backends already covered by a monitor slot.
    pub(crate) monitored: BTreeSet<String>,

    /// Live normal-mode slots. Monitor slots are tracked separately and never
    /// counted here.
    pub(crate) slots: Vec<SlotView>,

    /// The slot count the pool aims for, demand envelope already applied.
    pub(crate) target: u32,

    /// Hard cap on concurrently live slots.
    pub(crate) maximum: u32,
}

/// An action the worker applies on the planner's behalf.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum PlanAction {
    /// Create a normal slot against the named backend.
    Create { backend: String },

    /// Create a monitor slot probing the named dead backend.
    CreateMonitor { backend: String },

    /// Mark a surplus slot to drain at its next opportunity.
    MarkUnwanted { slot: SlotId },
}

/// Map the observed state to the actions that move it toward the desired
/// distribution.
pub(crate) fn plan(input: &PlanInput) -> Vec<PlanAction> {
    let mut actions = Vec::new();

    for key in &input.dead {
        if !input.monitored.contains(key) {
            actions.push(PlanAction::CreateMonitor {
                backend: key.clone(),
            });
        }
    }

    // Index live, not-yet-draining slots by backend.
    let mut by_backend: BTreeMap<&str, Vec<&SlotView>> = BTreeMap::new();
    let mut live = 0u32;
    for slot in &input.slots {
        live += 1;
        if !slot.unwanted {
            by_backend.entry(slot.backend.as_str()).or_default().push(slot);
        }
    }

    // Any slot whose backend is no longer healthy drains; the dead-backend
    // protocol and membership removal normally get there first, but the
    // planner states it declaratively too.
    let healthy: BTreeSet<&str> = input.healthy.iter().map(String::as_str).collect();
    for slot in &input.slots {
        if !slot.unwanted && !healthy.contains(slot.backend.as_str()) {
            actions.push(PlanAction::MarkUnwanted { slot: slot.id });
        }
    }

    if input.healthy.is_empty() {
        return actions;
    }

    // Spread the target as evenly as possible; the remainder goes to the
    // earliest-added backends.
    let total = input.target.min(input.maximum);
    let n = input.healthy.len() as u32;
    let base = total / n;
    let remainder = (total % n) as usize;

    // New slots may not push the live count past the cap, even while surplus
    // slots are still draining.
    let mut create_budget = input.maximum.saturating_sub(live);

    for (index, key) in input.healthy.iter().enumerate() {
        let desired = (base + u32::from(index < remainder)) as usize;
        let mut have: Vec<&SlotView> = by_backend.remove(key.as_str()).unwrap_or_default();

        if have.len() > desired {
            // Retire the surplus, preferring connecting slots over idle over
            // claimed, newest first within a phase.
            have.sort_by_key(|slot| (slot.phase.retire_rank(), Reverse(slot.id)));
            for slot in have.iter().take(have.len() - desired) {
                actions.push(PlanAction::MarkUnwanted { slot: slot.id });
            }
        } else {
            for _ in have.len()..desired {
                if create_budget == 0 {
                    break;
                }
                create_budget -= 1;
                actions.push(PlanAction::Create {
                    backend: key.clone(),
                });
            }
        }
    }

    actions
}

/// Decaying envelope of recent peak demand. Holds the effective slot target
/// up after a burst so the pool does not thrash when demand oscillates.
#[derive(Debug)]
pub(crate) struct LowPass {
    value: f64,
    last: Instant,
    tau: Duration,
}

impl LowPass {
    pub(crate) fn new(tau: Duration, now: Instant) -> Self {
        Self {
            value: 0.0,
            last: now,
            tau,
        }
    }

    /// Feed one demand sample (claimed plus queued) and return the envelope.
    pub(crate) fn observe(&mut self, now: Instant, sample: f64) -> f64 {
        self.decay_to(now);
        self.value = self.value.max(sample);
        self.value
    }

    /// The envelope rounded up to a slot count.
    pub(crate) fn target(&mut self, now: Instant) -> u32 {
        self.decay_to(now);
        self.value.ceil() as u32
    }

    fn decay_to(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last);
        if !dt.is_zero() {
            self.value *= (-dt.as_secs_f64() / self.tau.as_secs_f64()).exp();
            self.last = now;
        }
    }
}

#[cfg(test)]
mod test {
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    use super::*;

    fn slot(id: SlotId, backend: &str, phase: SlotPhase) -> SlotView {
        SlotView {
            id,
            backend: backend.to_string(),
            phase,
            unwanted: false,
        }
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("backend-{i}#100")).collect()
    }

    #[test]
    fn spreads_target_with_remainder_to_earliest_backends() {
        let input = PlanInput {
            healthy: keys(3),
            target: 5,
            maximum: 10,
            ..Default::default()
        };

        let actions = plan(&input);
        let creates: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                PlanAction::Create { backend } => Some(backend.as_str()),
                _ => None,
            })
            .collect();

        // Even spread of 5 over 3 is [2, 2, 1], extras to the earliest.
        assert_eq!(
            creates,
            vec![
                "backend-0#100",
                "backend-0#100",
                "backend-1#100",
                "backend-1#100",
                "backend-2#100",
            ]
        );
    }

    #[test]
    fn stops_creating_at_the_live_cap() {
        let input = PlanInput {
            healthy: keys(1),
            slots: vec![
                slot(1, "backend-0#100", SlotPhase::Idle),
                slot(2, "backend-0#100", SlotPhase::Idle),
            ],
            target: 8,
            maximum: 3,
            ..Default::default()
        };

        let creates = plan(&input)
            .into_iter()
            .filter(|a| matches!(a, PlanAction::Create { .. }))
            .count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn retires_surplus_preferring_starting_then_idle_then_claimed() {
        let input = PlanInput {
            healthy: keys(1),
            slots: vec![
                slot(1, "backend-0#100", SlotPhase::Claimed),
                slot(2, "backend-0#100", SlotPhase::Idle),
                slot(3, "backend-0#100", SlotPhase::Starting),
                slot(4, "backend-0#100", SlotPhase::Idle),
            ],
            target: 2,
            maximum: 10,
            ..Default::default()
        };

        let unwanted: Vec<_> = plan(&input)
            .into_iter()
            .filter_map(|a| match a {
                PlanAction::MarkUnwanted { slot } => Some(slot),
                _ => None,
            })
            .collect();

        // Two must go: the starting slot first, then the newest idle one.
        assert_eq!(unwanted, vec![3, 4]);
    }

    #[test]
    fn already_draining_slots_are_not_counted_or_re_marked() {
        let mut draining = slot(1, "backend-0#100", SlotPhase::Idle);
        draining.unwanted = true;
        let input = PlanInput {
            healthy: keys(1),
            slots: vec![draining, slot(2, "backend-0#100", SlotPhase::Idle)],
            target: 2,
            maximum: 10,
            ..Default::default()
        };

        let actions = plan(&input);
        assert_eq!(
            actions,
            vec![PlanAction::Create {
                backend: "backend-0#100".to_string()
            }]
        );
    }

    #[test]
    fn creates_monitors_for_unmonitored_dead_backends() {
        let mut monitored = BTreeSet::new();
        monitored.insert("dead-1#100".to_string());
        let input = PlanInput {
            healthy: keys(1),
            dead: vec!["dead-0#100".to_string(), "dead-1#100".to_string()],
            monitored,
            target: 1,
            maximum: 10,
            ..Default::default()
        };

        let actions = plan(&input);
        assert!(actions.contains(&PlanAction::CreateMonitor {
            backend: "dead-0#100".to_string()
        }));
        assert!(!actions.contains(&PlanAction::CreateMonitor {
            backend: "dead-1#100".to_string()
        }));
    }

    #[test]
    fn drains_slots_for_backends_that_left_the_service() {
        let input = PlanInput {
            healthy: keys(1),
            slots: vec![
                slot(1, "backend-0#100", SlotPhase::Idle),
                slot(2, "gone#100", SlotPhase::Claimed),
            ],
            target: 1,
            maximum: 10,
            ..Default::default()
        };

        let actions = plan(&input);
        assert_eq!(actions, vec![PlanAction::MarkUnwanted { slot: 2 }]);
    }

    #[test]
    fn empty_backend_list_plans_nothing_but_monitors() {
        let input = PlanInput {
            dead: vec!["dead-0#100".to_string()],
            target: 4,
            maximum: 8,
            ..Default::default()
        };

        assert_eq!(
            plan(&input),
            vec![PlanAction::CreateMonitor {
                backend: "dead-0#100".to_string()
            }]
        );
    }

    #[test]
    fn lowpass_holds_peaks_and_decays() {
        let t0 = Instant::now();
        let mut filter = LowPass::new(Duration::from_secs(10), t0);

        assert_relative_eq!(filter.observe(t0, 8.0), 8.0);
        // A smaller sample does not pull the envelope down.
        assert_relative_eq!(filter.observe(t0 + Duration::from_secs(1), 2.0), 8.0, max_relative = 0.11);

        // After one time constant the envelope has decayed toward 1/e.
        let later = t0 + Duration::from_secs(11);
        assert_relative_eq!(
            filter.observe(later, 0.0),
            8.0 * (-1.0f64).exp(),
            max_relative = 0.15
        );

        assert_eq!(filter.target(later), 3);
    }
}
