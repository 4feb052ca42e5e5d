//! Retry budgets and exponential backoff schedules computed from a recovery
//! descriptor.
//!
//! A [`Recovery`] descriptor maps an *action* name (e.g. `"default"`,
//! `"connect"`) to a [`RecoveryPolicy`]. The `"default"` entry is mandatory
//! and is used for any action that has no entry of its own. Each policy
//! produces a [`BackoffSchedule`]: attempt `n` runs with timeout
//! `min(max_timeout, timeout * 2^(n-1))` and, on failure, waits
//! `min(max_delay, delay * 2^(n-1))` before attempt `n + 1`. Once the retry
//! budget is spent the schedule is exhausted.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::serde_util;

/// The action name every [`Recovery`] descriptor must contain.
pub const DEFAULT_ACTION: &str = "default";

/// A retry budget: either a finite number of attempts or no limit at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retries {
    /// At most this many attempts. Zero means the action is exhausted without
    /// ever being attempted.
    Finite(u32),

    /// Never exhausts. Used by monitor schedules probing dead backends.
    Infinite,
}

impl Serialize for Retries {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Retries::Finite(n) => serializer.serialize_u32(*n),
            Retries::Infinite => serializer.serialize_str("infinite"),
        }
    }
}

impl<'de> Deserialize<'de> for Retries {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(u32),
            Keyword(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Retries::Finite(n)),
            Repr::Keyword(s) if s == "infinite" => Ok(Retries::Infinite),
            Repr::Keyword(s) => Err(serde::de::Error::custom(format!(
                "expected a retry count or \"infinite\", got {:?}",
                s
            ))),
        }
    }
}

/// Retry and backoff parameters for one action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct RecoveryPolicy {
    /// The retry budget for the action.
    pub retries: Retries,

    /// Base timeout for the first attempt, in milliseconds on the wire.
    #[serde(
        serialize_with = "serde_util::serialize_duration_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_from_u64_millis"
    )]
    pub timeout: Duration,

    /// Base delay between the first failure and the second attempt.
    #[serde(
        serialize_with = "serde_util::serialize_duration_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_from_u64_millis"
    )]
    pub delay: Duration,

    /// Ceiling applied to the doubled timeout.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub max_timeout: Option<Duration>,

    /// Ceiling applied to the doubled delay.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub max_delay: Option<Duration>,
}

impl RecoveryPolicy {
    /// A policy with the given budget and base values and no ceilings.
    pub fn new(retries: u32, timeout: Duration, delay: Duration) -> Self {
        Self {
            retries: Retries::Finite(retries),
            timeout,
            delay,
            max_timeout: None,
            max_delay: None,
        }
    }

    /// The timeout used for the last attempt the budget allows.
    fn final_timeout(&self) -> Duration {
        match self.retries {
            Retries::Finite(r) if r > 1 => scaled(self.timeout, r, self.max_timeout),
            _ => self.timeout.min(self.max_timeout.unwrap_or(Duration::MAX)),
        }
    }

    /// The delay used after the last attempt the budget allows.
    fn final_delay(&self) -> Duration {
        match self.retries {
            Retries::Finite(r) if r > 1 => scaled(self.delay, r, self.max_delay),
            _ => self.delay.min(self.max_delay.unwrap_or(Duration::MAX)),
        }
    }
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            retries: Retries::Finite(3),
            timeout: Duration::from_secs(1),
            delay: Duration::from_millis(100),
            max_timeout: Some(Duration::from_secs(30)),
            max_delay: Some(Duration::from_secs(10)),
        }
    }
}

/// A mapping from action name to [`RecoveryPolicy`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Recovery {
    policies: HashMap<String, RecoveryPolicy>,
}

impl Recovery {
    /// A descriptor containing only the given `"default"` policy.
    pub fn with_default(policy: RecoveryPolicy) -> Self {
        let mut policies = HashMap::new();
        policies.insert(DEFAULT_ACTION.to_string(), policy);
        Self { policies }
    }

    /// Add or replace the policy for `action`.
    pub fn insert(&mut self, action: impl Into<String>, policy: RecoveryPolicy) -> &mut Self {
        self.policies.insert(action.into(), policy);
        self
    }

    /// Look up the policy for `action`, falling back to `"default"`.
    ///
    /// Callers must have validated the descriptor (see
    /// [`has_default`](Self::has_default)) before relying on the fallback.
    pub fn policy(&self, action: &str) -> &RecoveryPolicy {
        self.policies
            .get(action)
            .or_else(|| self.policies.get(DEFAULT_ACTION))
            .expect("recovery descriptor validated to contain a default entry")
    }

    /// Whether the mandatory `"default"` entry is present.
    pub fn has_default(&self) -> bool {
        self.policies.contains_key(DEFAULT_ACTION)
    }
}

impl Default for Recovery {
    fn default() -> Self {
        Self::with_default(RecoveryPolicy::default())
    }
}

/// Consumable attempt schedule derived from one [`RecoveryPolicy`].
#[derive(Clone, Debug)]
pub(crate) struct BackoffSchedule {
    policy: RecoveryPolicy,
    /// Attempts begun so far.
    attempt: u32,
    /// Pool-wide clamp on any computed delay.
    chain_clamp: Option<Duration>,
}

impl BackoffSchedule {
    pub(crate) fn new(policy: RecoveryPolicy, chain_clamp: Option<Duration>) -> Self {
        Self {
            policy,
            attempt: 0,
            chain_clamp,
        }
    }

    /// Whether the retry budget is spent. With `retries = 0` this is true
    /// before any attempt begins.
    pub(crate) fn exhausted(&self) -> bool {
        match self.policy.retries {
            Retries::Finite(r) => self.attempt >= r,
            Retries::Infinite => false,
        }
    }

    /// Begin the next attempt, returning its timeout. Must not be called when
    /// [`exhausted`](Self::exhausted).
    pub(crate) fn begin_attempt(&mut self) -> Duration {
        debug_assert!(!self.exhausted());
        self.attempt += 1;
        scaled(self.policy.timeout, self.attempt, self.policy.max_timeout)
    }

    /// The delay to wait after the failure of the attempt begun most recently.
    pub(crate) fn next_delay(&self) -> Duration {
        let delay = scaled(self.policy.delay, self.attempt.max(1), self.policy.max_delay);
        match self.chain_clamp {
            Some(clamp) => delay.min(clamp),
            None => delay,
        }
    }

    /// One-based index of the attempt begun most recently; zero before the
    /// first attempt.
    pub(crate) fn current_attempt(&self) -> u32 {
        self.attempt
    }

    /// Restart the schedule with a fresh retry budget.
    pub(crate) fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Derive the schedule a monitor uses after this one exhausts: infinite
    /// retries with the final attempt's timeout and delay frozen.
    /// `check_timeout`, when set, caps the frozen timeout.
    pub(crate) fn monitor(&self, check_timeout: Option<Duration>) -> BackoffSchedule {
        let mut timeout = self.policy.final_timeout();
        if let Some(cap) = check_timeout {
            timeout = timeout.min(cap);
        }
        let delay = self.policy.final_delay();
        BackoffSchedule::new(
            RecoveryPolicy {
                retries: Retries::Infinite,
                timeout,
                delay,
                max_timeout: Some(timeout),
                max_delay: Some(delay),
            },
            self.chain_clamp,
        )
    }
}

/// `base * 2^(attempt - 1)`, saturating, optionally capped.
fn scaled(base: Duration, attempt: u32, cap: Option<Duration>) -> Duration {
    let exp = attempt.saturating_sub(1).min(31);
    let value = base.saturating_mul(1u32 << exp);
    match cap {
        Some(cap) => value.min(cap),
        None => value,
    }
}
