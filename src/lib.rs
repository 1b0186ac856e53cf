#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Lease-based key expiration for a replicated key-value store.
//!
//! A [`Lessor`] grants time-bounded leases, binds keys to them, extends
//! them on keep-alive and revokes them together with every attached key.
//! Every state change is committed through a [`CommitLog`] before it is
//! applied, so a revocation is observed either entirely or not at all.

pub mod commit_log;
pub mod config;
pub mod error;
pub mod lease;
pub mod message;
pub mod storage;
pub mod time;

pub mod test_utils;

pub use commit_log::{CommitLog, InMemoryCommitLog};
pub use config::LessorConfig;
pub use error::{Error, Result};
pub use lease::{KeepAliveResponse, KeepAliveStream, LeaseStatus, Lessor};
pub use storage::{InMemoryStorage, KeyValue, Storage};
pub use time::{Clock, ManualClock, MonotonicClock};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a lease.
///
/// Rendered as 16 lowercase hex digits, the form clients print and parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseId(pub i64);

impl LeaseId {
    /// Placeholder for "no lease"; never granted.
    pub const NONE: LeaseId = LeaseId(0);

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for LeaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for LeaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        u64::from_str_radix(s.trim(), 16)
            .map(|raw| LeaseId(raw as i64))
            .map_err(|e| Error::Other(anyhow::anyhow!("invalid lease id {s:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_id_hex_form() {
        let id = LeaseId(0x694d_7a1c_5b3e_9f01);
        assert_eq!(id.to_string(), "694d7a1c5b3e9f01");
        assert_eq!("694d7a1c5b3e9f01".parse::<LeaseId>().unwrap(), id);
        assert_eq!(LeaseId(10).to_string(), "000000000000000a");
    }

    #[test]
    fn test_lease_id_rejects_garbage() {
        assert!("not-a-lease".parse::<LeaseId>().is_err());
        assert!(LeaseId::NONE.is_none());
    }
}
