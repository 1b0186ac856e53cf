use crate::LeaseId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One state change carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Grant { lease: LeaseId, ttl: i64 },
    Renew { lease: LeaseId },
    Revoke { lease: LeaseId },
    Put {
        key: String,
        value: Bytes,
        lease: LeaseId,
    },
    Delete { key: String },
    Attach { lease: LeaseId, key: String },
    Detach { lease: LeaseId, key: String },
}

/// A unit of durable commitment. All mutations apply, or none do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub mutations: Vec<Mutation>,
}

impl LogEntry {
    /// Entry not yet assigned a log position.
    pub fn new(mutations: Vec<Mutation>) -> Self {
        Self {
            index: 0,
            mutations,
        }
    }

    pub fn single(mutation: Mutation) -> Self {
        Self::new(vec![mutation])
    }
}
