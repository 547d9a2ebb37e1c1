//! Unit ledger: the only writer of unit lifecycle state
use crate::error::{EngineError, EngineResult};
use crate::store::Store;
use crate::types::{BloodType, TimeStamp};
use crate::unit::{Unit, UnitRegistration, UnitState};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub blood_type: Option<BloodType>,
    pub state: Option<UnitState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockLevel {
    pub blood_type: BloodType,
    pub total: usize,
    pub available: usize,
    pub reserved: usize,
    pub assigned: usize,
    pub issued: usize,
    pub expired: usize,
    pub available_ml: u64,
}

impl StockLevel {
    fn empty(blood_type: BloodType) -> Self {
        Self {
            blood_type,
            total: 0,
            available: 0,
            reserved: 0,
            assigned: 0,
            issued: 0,
            expired: 0,
            available_ml: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpiryOutcome {
    /// Another writer expired the unit first
    AlreadyExpired,
    /// The unit expired now, freeing the reservation it held, if any
    Expired { released_request: Option<String> },
}

pub struct UnitLedger<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for UnitLedger<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> UnitLedger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn get(&self, unit_id: &str) -> EngineResult<Unit> {
        self.store
            .get_unit(unit_id)?
            .ok_or_else(|| EngineError::unit_not_found(unit_id))
    }

    pub fn register_unit(&self, registration: UnitRegistration) -> EngineResult<Unit> {
        let unit = registration.finalise(TimeStamp::new())?;
        self.store.insert_unit(&unit)?;

        info!(
            unit_id = %unit.id,
            blood_type = %unit.blood_type,
            volume_ml = unit.volume_ml,
            expires_at = %unit.expires_at,
            "unit registered"
        );
        Ok(unit)
    }

    pub fn submit_for_testing(&self, unit_id: &str) -> EngineResult<Unit> {
        self.advance(unit_id, UnitState::Collected, UnitState::TestingPending)
    }

    pub fn record_test_result(&self, unit_id: &str, passed: bool) -> EngineResult<Unit> {
        let next = if passed {
            UnitState::Available
        } else {
            UnitState::FailedTesting
        };

        let updated = self.advance(unit_id, UnitState::TestingPending, next)?;
        info!(unit_id, passed, "test result recorded");
        Ok(updated)
    }

    /// Claim an available unit for `request_id`. A single compare and swap;
    /// losing it (or finding the unit in any other state) is a `Conflict`.
    pub fn try_reserve(&self, unit_id: &str, request_id: &str) -> EngineResult<Unit> {
        self.try_reserve_at(unit_id, request_id, TimeStamp::new())
    }

    pub fn try_reserve_at(
        &self,
        unit_id: &str,
        request_id: &str,
        now: TimeStamp,
    ) -> EngineResult<Unit> {
        let unit = self.get(unit_id)?;
        if !unit.is_allocatable_at(&now) {
            return Err(EngineError::Conflict(unit_id.to_string()));
        }

        let reserved = unit.transition(UnitState::Reserved, Some(request_id), now)?;
        if !self.store.swap_unit(&unit, &reserved)? {
            debug!(unit_id, request_id, "lost reservation race");
            return Err(EngineError::Conflict(unit_id.to_string()));
        }

        debug!(unit_id, request_id, "unit reserved");
        Ok(reserved)
    }

    pub fn release(&self, unit_id: &str) -> EngineResult<Unit> {
        let unit = self.advance(unit_id, UnitState::Reserved, UnitState::Available)?;
        debug!(unit_id, "reservation released");
        Ok(unit)
    }

    pub fn mark_assigned(&self, unit_id: &str) -> EngineResult<Unit> {
        self.advance(unit_id, UnitState::Reserved, UnitState::Assigned)
    }

    pub fn mark_issued(&self, unit_id: &str) -> EngineResult<Unit> {
        let unit = self.advance(unit_id, UnitState::Assigned, UnitState::Issued)?;
        info!(unit_id, request_id = ?unit.request_id, "unit issued");
        Ok(unit)
    }

    /// Retire a unit past its validity window. Units already committed to a
    /// request (`assigned`, `issued`) or rejected by testing cannot expire.
    pub fn mark_expired(&self, unit_id: &str) -> EngineResult<ExpiryOutcome> {
        self.mark_expired_at(unit_id, TimeStamp::new())
    }

    pub fn mark_expired_at(&self, unit_id: &str, now: TimeStamp) -> EngineResult<ExpiryOutcome> {
        loop {
            let unit = self.get(unit_id)?;
            if unit.state == UnitState::Expired {
                return Ok(ExpiryOutcome::AlreadyExpired);
            }

            let expired = unit.transition(UnitState::Expired, None, now)?;
            if self.store.swap_unit(&unit, &expired)? {
                info!(
                    unit_id,
                    previous = %unit.state,
                    released_request = ?unit.request_id,
                    "unit expired"
                );
                // `unit` is exactly what the swap replaced
                return Ok(ExpiryOutcome::Expired {
                    released_request: unit.request_id,
                });
            }
        }
    }

    // Read, validate and swap, retrying whenever another writer got in between.
    // The unit must be in `from` at the moment of the swap.
    fn advance(&self, unit_id: &str, from: UnitState, next: UnitState) -> EngineResult<Unit> {
        loop {
            let unit = self.get(unit_id)?;
            if unit.state != from {
                return Err(EngineError::InvalidTransition {
                    id: unit.id,
                    from: unit.state,
                    to: next,
                });
            }
            let updated = unit.transition(next, None, TimeStamp::new())?;

            if self.store.swap_unit(&unit, &updated)? {
                return Ok(updated);
            }
        }
    }

    /// Units matching `filter`, earliest expiry first
    pub fn list_units(&self, filter: UnitFilter) -> EngineResult<Vec<Unit>> {
        let mut units: Vec<Unit> = self
            .store
            .units()?
            .into_iter()
            .filter(|u| filter.blood_type.is_none_or(|bt| u.blood_type == bt))
            .filter(|u| filter.state.is_none_or(|s| u.state == s))
            .collect();
        units.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.collected_at.cmp(&b.collected_at))
        });
        Ok(units)
    }

    /// Unit counts per blood type, every type present even when empty
    pub fn stock_by_type(&self) -> EngineResult<Vec<StockLevel>> {
        let mut levels: Vec<StockLevel> = BloodType::ALL.into_iter().map(StockLevel::empty).collect();

        for unit in self.store.units()? {
            let Some(level) = levels.iter_mut().find(|l| l.blood_type == unit.blood_type) else {
                continue;
            };
            level.total += 1;
            match unit.state {
                UnitState::Available => {
                    level.available += 1;
                    level.available_ml += u64::from(unit.volume_ml);
                }
                UnitState::Reserved => level.reserved += 1,
                UnitState::Assigned => level.assigned += 1,
                UnitState::Issued => level.issued += 1,
                UnitState::Expired => level.expired += 1,
                _ => {}
            }
        }
        Ok(levels)
    }

    /// Available or reserved units expiring in `[now, now + days)`
    pub fn expiring_within(&self, now: TimeStamp, days: i64) -> EngineResult<Vec<Unit>> {
        let horizon = now.plus_days(days);
        let mut units: Vec<Unit> = self
            .store
            .units()?
            .into_iter()
            .filter(|u| matches!(u.state, UnitState::Available | UnitState::Reserved))
            .filter(|u| u.expires_at >= now && u.expires_at < horizon)
            .collect();
        units.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::store::SledStore;

    fn ledger() -> UnitLedger<SledStore> {
        UnitLedger::new(Arc::new(SledStore::temporary().unwrap()))
    }

    fn tested_unit(ledger: &UnitLedger<SledStore>, days: i64) -> Unit {
        let now = TimeStamp::new();
        let unit = ledger
            .register_unit(UnitRegistration::new(BloodType::ONeg, 450, now, now.plus_days(days)))
            .unwrap();
        ledger.submit_for_testing(&unit.id).unwrap();
        ledger.record_test_result(&unit.id, true).unwrap()
    }

    #[test]
    fn register_rejects_bad_volume() {
        let now = TimeStamp::new();
        let err = ledger()
            .register_unit(UnitRegistration::new(BloodType::APos, 0, now, now.plus_days(1)))
            .unwrap_err();

        assert!(matches!(err, EngineError::InvalidUnit(ValidationError::Volume(0))));
    }

    #[test]
    fn test_result_requires_pending_testing() {
        let ledger = ledger();
        let now = TimeStamp::new();
        let unit = ledger
            .register_unit(UnitRegistration::new(BloodType::APos, 450, now, now.plus_days(5)))
            .unwrap();

        assert!(matches!(
            ledger.record_test_result(&unit.id, true),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(matches!(
            ledger.record_test_result("unit_missing", true),
            Err(EngineError::NotFound { .. })
        ));

        ledger.submit_for_testing(&unit.id).unwrap();
        let failed = ledger.record_test_result(&unit.id, false).unwrap();
        assert_eq!(failed.state, UnitState::FailedTesting);
        assert!(ledger.mark_expired(&unit.id).is_err());
    }

    #[test]
    fn second_reservation_conflicts() {
        let ledger = ledger();
        let unit = tested_unit(&ledger, 10);

        let reserved = ledger.try_reserve(&unit.id, "req_a").unwrap();
        assert_eq!(reserved.state, UnitState::Reserved);

        let err = ledger.try_reserve(&unit.id, "req_b").unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(
            ledger.get(&unit.id).unwrap().request_id.as_deref(),
            Some("req_a")
        );
    }

    #[test]
    fn release_returns_unit_to_pool() {
        let ledger = ledger();
        let unit = tested_unit(&ledger, 10);
        ledger.try_reserve(&unit.id, "req_a").unwrap();

        let released = ledger.release(&unit.id).unwrap();
        assert_eq!(released.state, UnitState::Available);
        assert!(released.request_id.is_none());
    }

    #[test]
    fn assign_and_issue_validate_prior_state() {
        let ledger = ledger();
        let unit = tested_unit(&ledger, 10);

        assert!(ledger.mark_assigned(&unit.id).is_err());
        ledger.try_reserve(&unit.id, "req_a").unwrap();
        assert!(ledger.mark_issued(&unit.id).is_err());

        ledger.mark_assigned(&unit.id).unwrap();
        let issued = ledger.mark_issued(&unit.id).unwrap();
        assert_eq!(issued.state, UnitState::Issued);
        assert_eq!(issued.request_id.as_deref(), Some("req_a"));
        assert!(ledger.mark_expired(&unit.id).is_err());
    }

    #[test]
    fn mark_expired_is_idempotent() {
        let ledger = ledger();
        let unit = tested_unit(&ledger, 10);
        ledger.try_reserve(&unit.id, "req_a").unwrap();

        assert_eq!(
            ledger.mark_expired(&unit.id).unwrap(),
            ExpiryOutcome::Expired {
                released_request: Some("req_a".to_string())
            }
        );
        assert_eq!(ledger.mark_expired(&unit.id).unwrap(), ExpiryOutcome::AlreadyExpired);

        let expired = ledger.get(&unit.id).unwrap();
        assert_eq!(expired.state, UnitState::Expired);
        assert!(expired.request_id.is_none());
    }

    #[test]
    fn expiry_is_stamped_with_the_given_time() {
        let ledger = ledger();
        let unit = tested_unit(&ledger, 3);
        let sweep_time = TimeStamp::new().plus_days(4);

        ledger.mark_expired_at(&unit.id, sweep_time).unwrap();
        assert_eq!(ledger.get(&unit.id).unwrap().updated_at, sweep_time);
    }

    #[test]
    fn stock_and_expiring_views() {
        let ledger = ledger();
        let soon = tested_unit(&ledger, 2);
        let later = tested_unit(&ledger, 20);
        ledger.try_reserve(&later.id, "req_a").unwrap();

        let levels = ledger.stock_by_type().unwrap();
        let o_neg = levels
            .iter()
            .find(|l| l.blood_type == BloodType::ONeg)
            .unwrap();
        assert_eq!(levels.len(), 8);
        assert_eq!((o_neg.total, o_neg.available, o_neg.reserved), (2, 1, 1));
        assert_eq!(o_neg.available_ml, 450);

        let expiring = ledger.expiring_within(TimeStamp::new(), 7).unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].id, soon.id);

        let available = ledger
            .list_units(UnitFilter {
                blood_type: Some(BloodType::ONeg),
                state: Some(UnitState::Available),
            })
            .unwrap();
        assert_eq!(available.len(), 1);
    }
}
