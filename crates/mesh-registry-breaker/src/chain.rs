//! Transition serialization and derived-set publication.
//!
//! [`ChainData`] is the sole mutator of per-instance circuit state. A
//! transition names the owner that drives it, the expected current state and
//! the target state; a mismatch on either is rejected without emitting an
//! event. Every accepted transition republishes the `{open, half_open →
//! budget, preserved}` sets to the service side-band under a new version.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use mesh_registry_core::events::EventListeners;
use mesh_registry_core::{CircuitState, Service};

use crate::CircuitEvent;

/// Owner index used by the active health checker when it drives states.
pub const HEALTH_CHECK_OWNER: usize = usize::MAX - 1;

#[derive(Debug, Clone, Copy)]
struct OwnedState {
    state: CircuitState,
    owner: Option<usize>,
    change_seq: u64,
}

impl Default for OwnedState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            owner: None,
            change_seq: 0,
        }
    }
}

pub struct ChainData {
    service: Arc<Service>,
    states: Mutex<HashMap<String, OwnedState>>,
    /// Half-open probe budget per plugin index.
    budgets: Vec<u32>,
    health_budget: u32,
    auto_half_open: AtomicBool,
    listeners: EventListeners<CircuitEvent>,
}

impl ChainData {
    pub fn new(
        service: Arc<Service>,
        budgets: Vec<u32>,
        health_budget: u32,
        listeners: EventListeners<CircuitEvent>,
    ) -> Self {
        Self {
            service,
            states: Mutex::new(HashMap::new()),
            budgets,
            health_budget,
            auto_half_open: AtomicBool::new(true),
            listeners,
        }
    }

    pub fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Disabled while an active health checker owns recovery transitions.
    pub fn auto_half_open_enabled(&self) -> bool {
        self.auto_half_open.load(Ordering::Relaxed)
    }

    pub fn set_auto_half_open(&self, enabled: bool) {
        self.auto_half_open.store(enabled, Ordering::Relaxed);
    }

    pub fn state_of(&self, instance_id: &str) -> CircuitState {
        self.states
            .lock()
            .get(instance_id)
            .map(|owned| owned.state)
            .unwrap_or(CircuitState::Closed)
    }

    fn budget_for(&self, owner: usize) -> u32 {
        if owner == HEALTH_CHECK_OWNER {
            self.health_budget
        } else {
            self.budgets.get(owner).copied().unwrap_or(1)
        }
    }

    /// Attempts the transition `from → to` on behalf of `owner`. Rejected
    /// when the current state differs from `from`, or when the state is
    /// owned by a different plugin. Returns whether the transition was
    /// applied.
    pub fn translate(
        &self,
        owner: usize,
        instance_id: &str,
        from: CircuitState,
        to: CircuitState,
    ) -> bool {
        {
            let mut states = self.states.lock();
            let entry = states.entry(instance_id.to_string()).or_default();
            if entry.state != from {
                return false;
            }
            if from != CircuitState::Closed && entry.owner != Some(owner) {
                return false;
            }
            entry.state = to;
            entry.owner = if to == CircuitState::Closed {
                None
            } else {
                Some(owner)
            };
            entry.change_seq += 1;
        }
        self.republish(instance_id, owner, from, to);
        true
    }

    /// Health-checker path: promotes an `Open` instance to `HalfOpen` on
    /// behalf of whichever plugin owns it.
    pub fn promote_half_open(&self, instance_id: &str) -> bool {
        let owner = {
            let states = self.states.lock();
            match states.get(instance_id) {
                Some(owned) if owned.state == CircuitState::Open => owned.owner,
                _ => None,
            }
        };
        match owner {
            Some(owner) => self.translate(owner, instance_id, CircuitState::Open, CircuitState::HalfOpen),
            None => false,
        }
    }

    /// Always-on health checking: a failed probe opens a closed instance
    /// on behalf of the health checker.
    pub fn open_by_health(&self, instance_id: &str) -> bool {
        self.translate(
            HEALTH_CHECK_OWNER,
            instance_id,
            CircuitState::Closed,
            CircuitState::Open,
        )
    }

    /// Always-on health checking: a successful probe closes an open
    /// instance on behalf of whichever owner drove it open.
    pub fn close_by_health(&self, instance_id: &str) -> bool {
        let owner = {
            let states = self.states.lock();
            match states.get(instance_id) {
                Some(owned) if owned.state == CircuitState::Open => owned.owner,
                _ => None,
            }
        };
        match owner {
            Some(owner) => self.translate(
                owner,
                instance_id,
                CircuitState::Open,
                CircuitState::Closed,
            ),
            None => false,
        }
    }

    /// Drops a forgotten instance's record after its state was closed.
    pub fn forget(&self, instance_id: &str) {
        self.states.lock().remove(instance_id);
    }

    fn republish(&self, instance_id: &str, owner: usize, from: CircuitState, to: CircuitState) {
        let previous = self.service.circuit();
        let mut open = HashSet::new();
        let mut half_open = HashMap::new();
        let mut preserved = HashSet::new();
        {
            let states = self.states.lock();
            for (id, owned) in states.iter() {
                match owned.state {
                    CircuitState::Open => {
                        open.insert(id.clone());
                    }
                    CircuitState::HalfOpen => {
                        // A fresh half-open entry gets the owner's budget;
                        // an existing one keeps its remaining tokens.
                        let budget = previous
                            .half_open
                            .get(id)
                            .copied()
                            .unwrap_or_else(|| self.budget_for(owned.owner.unwrap_or(owner)));
                        half_open.insert(id.clone(), budget);
                    }
                    CircuitState::Preserved => {
                        preserved.insert(id.clone());
                    }
                    CircuitState::Closed => {}
                }
            }
        }
        let version = self.service.publish_circuit(open, half_open, preserved);
        tracing::info!(
            service = %self.service.key(),
            instance = instance_id,
            ?from,
            ?to,
            version,
            "circuit state transition"
        );
        #[cfg(feature = "metrics")]
        metrics::counter!(
            "registry_circuit_transitions_total",
            "service" => self.service.key().to_string(),
            "to" => match to {
                CircuitState::Closed => "closed",
                CircuitState::Open => "open",
                CircuitState::HalfOpen => "half_open",
                CircuitState::Preserved => "preserved",
            }
        )
        .increment(1);
        self.listeners.emit(&CircuitEvent::Transition {
            service: self.service.key().clone(),
            instance_id: instance_id.to_string(),
            from,
            to,
            version,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_registry_core::ServiceKey;

    fn chain() -> ChainData {
        let service = Arc::new(Service::new(ServiceKey::new("Test", "echo"), 0));
        ChainData::new(service, vec![3, 5], 3, EventListeners::new())
    }

    #[test]
    fn transition_from_wrong_state_is_rejected() {
        let chain = chain();
        assert!(!chain.translate(0, "a", CircuitState::Open, CircuitState::HalfOpen));
        assert_eq!(chain.state_of("a"), CircuitState::Closed);
    }

    #[test]
    fn only_owner_may_move_state_back() {
        let chain = chain();
        assert!(chain.translate(0, "a", CircuitState::Closed, CircuitState::Open));
        // Plugin 1 did not open it and may not recover it.
        assert!(!chain.translate(1, "a", CircuitState::Open, CircuitState::HalfOpen));
        assert!(chain.translate(0, "a", CircuitState::Open, CircuitState::HalfOpen));
        assert_eq!(chain.state_of("a"), CircuitState::HalfOpen);
    }

    #[test]
    fn published_sets_follow_transitions() {
        let chain = chain();
        chain.translate(1, "a", CircuitState::Closed, CircuitState::Open);
        let view = chain.service().circuit();
        assert!(view.open.contains("a"));

        chain.translate(1, "a", CircuitState::Open, CircuitState::HalfOpen);
        let view = chain.service().circuit();
        assert!(!view.open.contains("a"));
        // Owner plugin 1 configured 5 probe tokens.
        assert_eq!(view.half_open.get("a"), Some(&5));
    }

    #[test]
    fn republish_keeps_remaining_half_open_budget() {
        let chain = chain();
        chain.translate(0, "a", CircuitState::Closed, CircuitState::Open);
        chain.translate(0, "a", CircuitState::Open, CircuitState::HalfOpen);
        assert!(chain.service().try_claim_half_open("a"));
        assert_eq!(chain.service().half_open_budget("a"), Some(2));

        // An unrelated transition republishes; the claimed token stays
        // spent.
        chain.translate(0, "b", CircuitState::Closed, CircuitState::Open);
        assert_eq!(chain.service().half_open_budget("a"), Some(2));
    }

    #[test]
    fn promote_half_open_uses_current_owner() {
        let chain = chain();
        chain.translate(1, "a", CircuitState::Closed, CircuitState::Open);
        assert!(chain.promote_half_open("a"));
        assert_eq!(chain.state_of("a"), CircuitState::HalfOpen);
        assert!(!chain.promote_half_open("a"));
    }

    #[test]
    fn closing_releases_ownership() {
        let chain = chain();
        chain.translate(0, "a", CircuitState::Closed, CircuitState::Open);
        chain.translate(0, "a", CircuitState::Open, CircuitState::HalfOpen);
        chain.translate(0, "a", CircuitState::HalfOpen, CircuitState::Closed);
        // Another plugin may now open it.
        assert!(chain.translate(1, "a", CircuitState::Closed, CircuitState::Open));
    }
}
