//! Shared resource budget for unit executions.
//!
//! Five dimensions are tracked: concurrent units, memory, CPU share,
//! tokens per minute and cost per minute. Allocation is all-or-nothing and
//! every mutation happens under one lock, so aggregate usage never exceeds
//! the limits at grant time and no partial update is observable.

use crate::agent::UnitKind;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

const USAGE_HISTORY_CAPACITY: usize = 100;

/// Resources a single unit needs while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub tokens_per_minute: u64,
    pub cost_per_minute: f64,
}

impl ResourceRequirements {
    pub fn new(
        memory_mb: u64,
        cpu_percent: f64,
        tokens_per_minute: u64,
        cost_per_minute: f64,
    ) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            tokens_per_minute,
            cost_per_minute,
        }
    }
}

/// Upper bounds of the shared budget.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub max_concurrent_agents: usize,
    pub max_memory_mb: u64,
    pub max_cpu_percent: f64,
    pub max_tokens_per_minute: u64,
    pub max_cost_per_minute: f64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 5,
            max_memory_mb: 2_048,
            max_cpu_percent: 80.0,
            max_tokens_per_minute: 40_000,
            max_cost_per_minute: 2.0,
        }
    }
}

/// Aggregate usage across all live grants.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub concurrent_agents: usize,
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub tokens_per_minute: u64,
    pub cost_per_minute: f64,
}

impl ResourceUsage {
    fn fits(&self, extra: &ResourceUsage, limits: &ResourceLimits) -> bool {
        self.concurrent_agents + extra.concurrent_agents <= limits.max_concurrent_agents
            && self.memory_mb + extra.memory_mb <= limits.max_memory_mb
            && self.cpu_percent + extra.cpu_percent <= limits.max_cpu_percent
            && self.tokens_per_minute + extra.tokens_per_minute <= limits.max_tokens_per_minute
            && self.cost_per_minute + extra.cost_per_minute <= limits.max_cost_per_minute
    }

    fn add(&mut self, requirements: &ResourceRequirements) {
        self.concurrent_agents += 1;
        self.memory_mb += requirements.memory_mb;
        self.cpu_percent += requirements.cpu_percent;
        self.tokens_per_minute += requirements.tokens_per_minute;
        self.cost_per_minute += requirements.cost_per_minute;
    }

    fn subtract(&mut self, requirements: &ResourceRequirements) {
        self.concurrent_agents = self.concurrent_agents.saturating_sub(1);
        self.memory_mb = self.memory_mb.saturating_sub(requirements.memory_mb);
        self.cpu_percent = (self.cpu_percent - requirements.cpu_percent).max(0.0);
        self.tokens_per_minute = self
            .tokens_per_minute
            .saturating_sub(requirements.tokens_per_minute);
        self.cost_per_minute = (self.cost_per_minute - requirements.cost_per_minute).max(0.0);
    }

    fn of(requirements: &[ResourceRequirements]) -> Self {
        let mut usage = ResourceUsage::default();
        for requirement in requirements {
            usage.add(requirement);
        }
        usage
    }
}

/// Identifies a grant: one unit within one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    pub run_id: Uuid,
    pub unit: UnitKind,
}

impl GrantKey {
    pub fn new(run_id: Uuid, unit: UnitKind) -> Self {
        Self { run_id, unit }
    }
}

impl fmt::Display for GrantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.run_id, self.unit)
    }
}

/// A live allocation.
#[derive(Debug, Clone, Copy)]
pub struct ResourceGrant {
    pub allocated_at: Instant,
    pub requirements: ResourceRequirements,
}

/// One released grant, kept in the bounded usage history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub key: GrantKey,
    pub requirements: ResourceRequirements,
    pub held_for: Duration,
    pub released_at: DateTime<Utc>,
    /// True when the cleanup sweep released the grant.
    pub forced: bool,
}

/// Point-in-time view of the budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUtilization {
    pub usage: ResourceUsage,
    pub limits: ResourceLimits,
    pub active_grants: usize,
    /// Per-dimension usage as a percentage of its limit.
    pub percent: HashMap<String, f64>,
}

#[derive(Debug, Default)]
struct LedgerState {
    usage: ResourceUsage,
    grants: HashMap<GrantKey, ResourceGrant>,
    history: VecDeque<UsageRecord>,
}

impl LedgerState {
    fn release(&mut self, key: GrantKey, forced: bool) -> Option<Duration> {
        let grant = self.grants.remove(&key)?;
        self.usage.subtract(&grant.requirements);
        let held_for = grant.allocated_at.elapsed();

        if self.history.len() == USAGE_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(UsageRecord {
            key,
            requirements: grant.requirements,
            held_for,
            released_at: Utc::now(),
            forced,
        });
        Some(held_for)
    }
}

/// Thread-safe ledger of resource grants against fixed limits.
#[derive(Debug)]
pub struct ResourceLedger {
    limits: ResourceLimits,
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// True if one more unit with `requirements` fits every dimension right now.
    pub fn can_allocate(&self, requirements: &ResourceRequirements) -> bool {
        self.can_allocate_all(std::slice::from_ref(requirements))
    }

    /// True if all of `requirements` fit together right now.
    pub fn can_allocate_all(&self, requirements: &[ResourceRequirements]) -> bool {
        let state = self.state.lock();
        state.usage.fits(&ResourceUsage::of(requirements), &self.limits)
    }

    /// True if `requirements` could fit together in an empty ledger.
    pub fn fits_within_limits(&self, requirements: &[ResourceRequirements]) -> bool {
        ResourceUsage::default().fits(&ResourceUsage::of(requirements), &self.limits)
    }

    /// Grants `requirements` to `key` if they fit; no mutation otherwise.
    ///
    /// Returns false if the key already holds a grant.
    pub fn allocate(&self, key: GrantKey, requirements: ResourceRequirements) -> bool {
        let mut state = self.state.lock();
        if state.grants.contains_key(&key) {
            return false;
        }
        if !state
            .usage
            .fits(&ResourceUsage::of(std::slice::from_ref(&requirements)), &self.limits)
        {
            debug!(grant = %key, "Allocation denied");
            return false;
        }

        state.usage.add(&requirements);
        state.grants.insert(
            key,
            ResourceGrant {
                allocated_at: Instant::now(),
                requirements,
            },
        );
        debug!(grant = %key, concurrent = state.usage.concurrent_agents, "Resources allocated");
        true
    }

    /// Releases the grant held by `key`.
    ///
    /// Releasing an unknown or already released key is a no-op. Returns how
    /// long the grant was held.
    pub fn release(&self, key: GrantKey) -> Option<Duration> {
        let held_for = self.state.lock().release(key, false);
        if let Some(held) = held_for {
            debug!(grant = %key, held_ms = held.as_millis() as u64, "Resources released");
        }
        held_for
    }

    /// Force-releases every grant older than `max_age`.
    pub fn cleanup_expired(&self, max_age: Duration) -> Vec<GrantKey> {
        let mut state = self.state.lock();
        let expired: Vec<GrantKey> = state
            .grants
            .iter()
            .filter(|(_, grant)| grant.allocated_at.elapsed() >= max_age)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            state.release(*key, true);
            warn!(grant = %key, "Force-released expired resource grant");
        }
        expired
    }

    /// Current aggregate usage.
    pub fn current_usage(&self) -> ResourceUsage {
        self.state.lock().usage
    }

    /// Returns true if `key` holds a grant.
    pub fn is_allocated(&self, key: GrantKey) -> bool {
        self.state.lock().grants.contains_key(&key)
    }

    /// Most recent released grants, oldest first.
    pub fn usage_history(&self) -> Vec<UsageRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    /// Usage, limits and per-dimension percentages.
    pub fn utilization(&self) -> ResourceUtilization {
        let (usage, active_grants) = {
            let state = self.state.lock();
            (state.usage, state.grants.len())
        };
        let limits = self.limits;

        let ratio = |used: f64, limit: f64| if limit > 0.0 { used / limit * 100.0 } else { 0.0 };
        let percent = HashMap::from([
            (
                "concurrent_agents".to_string(),
                ratio(usage.concurrent_agents as f64, limits.max_concurrent_agents as f64),
            ),
            (
                "memory_mb".to_string(),
                ratio(usage.memory_mb as f64, limits.max_memory_mb as f64),
            ),
            (
                "cpu_percent".to_string(),
                ratio(usage.cpu_percent, limits.max_cpu_percent),
            ),
            (
                "tokens_per_minute".to_string(),
                ratio(usage.tokens_per_minute as f64, limits.max_tokens_per_minute as f64),
            ),
            (
                "cost_per_minute".to_string(),
                ratio(usage.cost_per_minute, limits.max_cost_per_minute),
            ),
        ]);

        ResourceUtilization {
            usage,
            limits,
            active_grants,
            percent,
        }
    }
}
