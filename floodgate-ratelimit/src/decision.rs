//! Admission decisions

use crate::time::{Timestamp, duration_secs};
use serde::Serialize;
use std::time::Duration;

/// Outcome of evaluating a policy for one caller key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the caller must be rejected or throttled now
    pub limited: bool,
    /// Diagnostic information about what was compared
    pub detail: Option<DecisionDetail>,
}

/// What a policy compared to reach its decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecisionDetail {
    /// Counter-based policies: events counted against the limit
    Count {
        /// Events counted in the window, including this one if counted
        current: u64,
        /// Limit in force for this evaluation
        limit: u64,
    },
    /// Multi-tier log: the tier that fired
    Tier {
        /// Tier name
        name: String,
        /// Tier span
        #[serde(serialize_with = "duration_secs::serialize")]
        unit: Duration,
        /// Tier limit
        limit: u64,
        /// Timestamp of the entry that brought the tier to its limit
        tripped_at: Timestamp,
    },
    /// Bucket policies: level after the evaluation
    Bucket {
        /// Tokens in the bucket after this evaluation
        tokens: u64,
        /// Bucket capacity in force for this evaluation
        capacity: u64,
    },
}

impl Decision {
    /// Admit the caller
    pub fn allowed(detail: Option<DecisionDetail>) -> Self {
        Self {
            limited: false,
            detail,
        }
    }

    /// Reject the caller
    pub fn limited(detail: Option<DecisionDetail>) -> Self {
        Self {
            limited: true,
            detail,
        }
    }

    /// Counter-style decision: limited when `current > limit`
    pub fn from_count(current: u64, limit: u64) -> Self {
        Self {
            limited: current > limit,
            detail: Some(DecisionDetail::Count { current, limit }),
        }
    }

    /// Whether the caller may proceed
    pub fn is_allowed(&self) -> bool {
        !self.limited
    }

    /// Name of the tier that fired, if any
    pub fn tier_name(&self) -> Option<&str> {
        match &self.detail {
            Some(DecisionDetail::Tier { name, .. }) => Some(name),
            _ => None,
        }
    }
}
