//! Allocation planner: read-only, earliest-expiry-first candidate selection
use crate::compatibility::CompatibilityPolicy;
use crate::error::EngineResult;
use crate::store::Store;
use crate::types::{BloodType, TimeStamp, Urgency};
use crate::unit::Unit;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanRequest {
    pub blood_type: BloodType,
    pub volume_ml: u32,
    pub urgency: Urgency,
    pub deadline: TimeStamp,
}

/// Advisory result; may be stale by the time it is executed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationPlan {
    pub unit_ids: Vec<String>,
    pub planned_ml: u32,
    pub unmet_ml: u32,
}

impl AllocationPlan {
    pub fn is_complete(&self) -> bool {
        self.unmet_ml == 0
    }
}

/// Greedy selection over `units`: compatible, available and unexpired units,
/// earliest expiry first (ties broken by oldest collection), accumulated until
/// `volume_ml` is covered or the pool runs out.
pub fn select_candidates(
    units: &[Unit],
    blood_type: BloodType,
    volume_ml: u32,
    policy: &dyn CompatibilityPolicy,
    now: &TimeStamp,
) -> AllocationPlan {
    let mut pool: Vec<&Unit> = units
        .iter()
        .filter(|u| u.is_allocatable_at(now))
        .filter(|u| policy.is_compatible(u.blood_type, blood_type))
        .collect();
    pool.sort_by(|a, b| {
        a.expires_at
            .cmp(&b.expires_at)
            .then_with(|| a.collected_at.cmp(&b.collected_at))
    });

    let mut plan = AllocationPlan::default();
    for unit in pool {
        if plan.planned_ml >= volume_ml {
            break;
        }
        plan.planned_ml = plan.planned_ml.saturating_add(unit.volume_ml);
        plan.unit_ids.push(unit.id.clone());
    }
    plan.unmet_ml = volume_ml.saturating_sub(plan.planned_ml);
    plan
}

pub struct AllocationPlanner<S: Store> {
    store: Arc<S>,
    policy: Arc<dyn CompatibilityPolicy>,
}

impl<S: Store> Clone for AllocationPlanner<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            policy: Arc::clone(&self.policy),
        }
    }
}

impl<S: Store> AllocationPlanner<S> {
    pub fn new(store: Arc<S>, policy: Arc<dyn CompatibilityPolicy>) -> Self {
        Self { store, policy }
    }

    pub fn plan(&self, request: &PlanRequest, now: TimeStamp) -> EngineResult<AllocationPlan> {
        let units = self.store.units()?;
        let plan = select_candidates(
            &units,
            request.blood_type,
            request.volume_ml,
            self.policy.as_ref(),
            &now,
        );

        debug!(
            blood_type = %request.blood_type,
            urgency = %request.urgency,
            wanted_ml = request.volume_ml,
            candidates = plan.unit_ids.len(),
            unmet_ml = plan.unmet_ml,
            "allocation planned"
        );
        Ok(plan)
    }
}
