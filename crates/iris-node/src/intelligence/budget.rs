//! Hop and time budget arithmetic.
//!
//! All instants are local (`tokio::time::Instant`). Budgets cross the wire
//! only as relative durations, so the remote clock never matters.

use std::time::Duration;

use tokio::time::Instant;

use super::IntelligenceSettings;
use crate::error::IntelligenceError;

/// A request's budget as seen by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    pub ttl:      u32,
    pub deadline: Instant,
}

/// Budget handed to every neighbor in one forwarding round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildBudget {
    /// Always the parent's TTL minus one.
    pub ttl: u32,
    /// How long this node waits on the forward.
    pub wait_until: Instant,
    /// Deadline promised to the child: `wait_until` minus the propagation
    /// margin, leaving the child time to send its aggregate back.
    pub deadline: Instant,
}

impl ChildBudget {
    /// Relative budget sent on the wire.
    pub fn timeout_ms(&self, now: Instant) -> u64 {
        self.deadline.saturating_duration_since(now).as_millis() as u64
    }
}

impl Budget {
    /// Budget of a query this node originates.
    pub fn originated(
        settings: &IntelligenceSettings,
        ttl:      Option<u32>,
        timeout:  Option<Duration>,
        now:      Instant,
    ) -> Self {
        Self {
            ttl:      ttl.unwrap_or(settings.ttl).min(settings.max_ttl),
            deadline: now + timeout.unwrap_or(settings.root_timeout),
        }
    }

    /// Budget of a query received from a parent. Neither the hop count nor the
    /// waiting time may exceed what this node is configured to accept.
    pub fn received(
        settings: &IntelligenceSettings,
        ttl:      u32,
        timeout:  Duration,
        now:      Instant,
    ) -> Self {
        Self {
            ttl:      ttl.min(settings.max_ttl),
            deadline: now + timeout.min(settings.max_parent_timeout),
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Budget for forwards started at `now`.
    ///
    /// TTL and time are independent stopping conditions: forwarding stops as
    /// soon as either is exhausted.
    pub fn child(
        &self,
        settings: &IntelligenceSettings,
        now:      Instant,
    ) -> Result<ChildBudget, IntelligenceError> {
        let exhausted = || IntelligenceError::BudgetExhausted {
            ttl:          self.ttl,
            remaining_ms: self.remaining(now).as_millis() as u64,
        };
        if self.ttl == 0 {
            return Err(exhausted());
        }
        let wait_until = self.deadline.min(now + settings.max_parent_timeout);
        let deadline = wait_until
            .checked_sub(settings.propagation_margin)
            .ok_or_else(exhausted)?;
        // Sub-millisecond budgets cannot be expressed on the wire.
        if deadline <= now + Duration::from_millis(1) {
            return Err(exhausted());
        }
        Ok(ChildBudget { ttl: self.ttl - 1, wait_until, deadline })
    }
}
