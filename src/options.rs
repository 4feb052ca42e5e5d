//! Options for configuring a [`Pool`](crate::Pool).

use std::{fmt, sync::Arc, time::Duration};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use typed_builder::TypedBuilder;

use crate::{
    backoff::Recovery,
    error::{Error, Result},
    event::PoolEventHandler,
    serde_util,
};

/// One endpoint of a logical service.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[display("{address}:{port}")]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct Backend {
    /// Hostname or IP address.
    pub address: String,

    /// Port number.
    pub port: u16,
}

impl Backend {
    /// Construct a backend from an address and port.
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// The stable identifier used to key this backend in the pool's tables.
    pub fn key(&self) -> String {
        format!("{}#{}", self.address, self.port)
    }
}

/// Parameters shared by both controlled-delay variants.
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct CodelOptions {
    /// Width of the measurement interval.
    #[builder(default = Duration::from_millis(100))]
    #[serde(
        default = "CodelOptions::default_interval",
        serialize_with = "serde_util::serialize_duration_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_from_u64_millis"
    )]
    pub interval: Duration,

    /// Queue sojourn the controller tries to keep the minimum below.
    #[builder(default = Duration::from_millis(500))]
    #[serde(
        default = "CodelOptions::default_target_delay",
        serialize_with = "serde_util::serialize_duration_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_from_u64_millis"
    )]
    pub target_delay: Duration,

    /// How long the pool must go without an empty ready set before idle
    /// connections are reclaimed aggressively.
    #[builder(default = Duration::from_millis(10_000))]
    #[serde(
        default = "CodelOptions::default_last_empty_bound",
        serialize_with = "serde_util::serialize_duration_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_from_u64_millis"
    )]
    pub last_empty_bound: Duration,
}

impl CodelOptions {
    fn default_interval() -> Duration {
        Duration::from_millis(100)
    }

    fn default_target_delay() -> Duration {
        Duration::from_millis(500)
    }

    fn default_last_empty_bound() -> Duration {
        Duration::from_millis(10_000)
    }
}

impl Default for CodelOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Which overload controller the pool runs on its claim queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
#[non_exhaustive]
pub enum OverloadOptions {
    /// Never shed claims.
    Disabled,

    /// The interval/minimum variant.
    ModifiedCodel(CodelOptions),

    /// The original Nichols/Jacobson control law.
    OriginalCodel(CodelOptions),
}

impl Default for OverloadOptions {
    fn default() -> Self {
        OverloadOptions::Disabled
    }
}

/// Options used to configure a [`Pool`](crate::Pool).
#[derive(Clone, Serialize, Deserialize, TypedBuilder)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PoolOptions {
    /// The logical service name. Used only for diagnostics (events and log
    /// lines).
    #[builder(default, setter(into, strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// The number of warm connections the pool keeps ready beyond current
    /// demand. Must be at least 1.
    pub spares: u32,

    /// The maximum number of slots the pool will run, counting connecting and
    /// claimed slots. Must be at least `spares`.
    pub maximum: u32,

    /// The number of slots the pool aims to run when demand is quiet.
    /// Defaults to `spares`. Demand bursts raise the effective target above
    /// this value, up to `maximum`.
    #[builder(default, setter(strip_option))]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<u32>,

    /// Retry and backoff behavior for connection attempts.
    #[builder(default)]
    #[serde(default)]
    pub recovery: Recovery,

    /// When set, idle connections are recycled in randomized order over this
    /// interval so their ages stay decorrelated.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub decoherence_interval: Option<Duration>,

    /// Time constant of the demand envelope that holds the slot target up
    /// after a burst. Defaults to 10 seconds.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub lowpass_decay: Option<Duration>,

    /// Upper bound on any computed backoff delay, regardless of how far the
    /// exponential schedule has escalated.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub max_chained_backoff: Option<Duration>,

    /// Cap on the timeout a monitor uses for each probe of a dead backend.
    #[builder(default, setter(strip_option))]
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serde_util::serialize_duration_option_as_u64_millis",
        deserialize_with = "serde_util::deserialize_duration_option_from_u64_millis"
    )]
    pub check_timeout: Option<Duration>,

    /// Overload controller for the claim queue.
    #[builder(default)]
    #[serde(default)]
    pub overload: OverloadOptions,

    /// The handler notified of pool lifecycle events.
    #[builder(default, setter(strip_option))]
    #[serde(skip)]
    pub event_handler: Option<Arc<dyn PoolEventHandler>>,
}

impl PoolOptions {
    /// The configured slot target, defaulting to `spares`.
    pub(crate) fn configured_target(&self) -> u32 {
        self.target.unwrap_or(self.spares)
    }

    pub(crate) fn lowpass_decay_or_default(&self) -> Duration {
        self.lowpass_decay.unwrap_or(Duration::from_secs(10))
    }

    /// Check invariants between the options. Called by
    /// [`Pool::start`](crate::Pool::start).
    pub(crate) fn validate(&self) -> Result<()> {
        if self.spares == 0 {
            return Err(Error::invalid_argument("spares must be at least 1"));
        }
        if self.maximum < self.spares {
            return Err(Error::invalid_argument(format!(
                "maximum ({}) must be at least spares ({})",
                self.maximum, self.spares
            )));
        }
        if let Some(target) = self.target {
            if target == 0 || target > self.maximum {
                return Err(Error::invalid_argument(format!(
                    "target ({}) must be between 1 and maximum ({})",
                    target, self.maximum
                )));
            }
        }
        if !self.recovery.has_default() {
            return Err(Error::invalid_argument(
                "recovery descriptor must contain a \"default\" entry",
            ));
        }
        let codel = match &self.overload {
            OverloadOptions::Disabled => None,
            OverloadOptions::ModifiedCodel(opts) | OverloadOptions::OriginalCodel(opts) => {
                Some(opts)
            }
        };
        if let Some(opts) = codel {
            if opts.interval.is_zero() || opts.target_delay.is_zero() {
                return Err(Error::invalid_argument(
                    "overload interval and targetDelay must be nonzero",
                ));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PoolOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolOptions")
            .field("domain", &self.domain)
            .field("spares", &self.spares)
            .field("maximum", &self.maximum)
            .field("target", &self.target)
            .field("recovery", &self.recovery)
            .field("decoherence_interval", &self.decoherence_interval)
            .field("lowpass_decay", &self.lowpass_decay)
            .field("max_chained_backoff", &self.max_chained_backoff)
            .field("check_timeout", &self.check_timeout)
            .field("overload", &self.overload)
            .field("event_handler", &self.event_handler.as_ref().map(|_| ".."))
            .finish()
    }
}

/// Per-claim options for [`Pool::claim_with`](crate::Pool::claim_with).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[non_exhaustive]
pub struct ClaimOptions {
    /// Fail the claim with a timeout error if it waits in the queue longer
    /// than this.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<Duration>,
}
