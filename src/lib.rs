#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod backoff;
mod codel;
pub mod conn;
pub mod error;
pub mod event;
pub mod options;
mod pool;
pub mod resolver;
pub(crate) mod runtime;
mod serde_util;

pub use crate::{
    backoff::{Recovery, RecoveryPolicy, Retries},
    conn::{Connect, Established},
    error::{Error, ErrorKind, Result},
    options::{Backend, ClaimOptions, CodelOptions, OverloadOptions, PoolOptions},
    pool::{Claim, Pool, PoolState, PoolStats},
    resolver::{BackendSink, Resolver, StaticResolver},
};
