//! Physical blood units and their lifecycle state machine
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::types::{BloodType, TimeStamp};
use crate::utils::{UNIT_HRP, new_uuid_to_bech32};
use std::fmt;

pub const DEFAULT_COMPONENT: &str = "Whole Blood";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitState {
    #[n(0)]
    Collected,
    #[n(1)]
    TestingPending,
    #[n(2)]
    Available,
    #[n(3)]
    Reserved,
    #[n(4)]
    Assigned,
    #[n(5)]
    Issued,
    #[n(6)]
    Expired,
    #[n(7)]
    FailedTesting,
}

impl UnitState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitState::Issued | UnitState::Expired | UnitState::FailedTesting
        )
    }

    /// Edges of the unit lifecycle. Expiry may interrupt anything that has not
    /// yet been committed to a request. An assigned unit that never left the
    /// bank can be returned to stock.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;

        matches!(
            (self, next),
            (Collected, TestingPending)
                | (TestingPending, Available)
                | (TestingPending, FailedTesting)
                | (Available, Reserved)
                | (Reserved, Available)
                | (Reserved, Assigned)
                | (Assigned, Available)
                | (Assigned, Issued)
                | (Collected | TestingPending | Available | Reserved, Expired)
        )
    }

    /// Held in stock and not tied to a request, so its recorded volume may
    /// still be corrected
    pub fn is_adjustable(&self) -> bool {
        matches!(
            self,
            UnitState::Collected | UnitState::TestingPending | UnitState::Available
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UnitState::Collected => "collected",
            UnitState::TestingPending => "testing_pending",
            UnitState::Available => "available",
            UnitState::Reserved => "reserved",
            UnitState::Assigned => "assigned",
            UnitState::Issued => "issued",
            UnitState::Expired => "expired",
            UnitState::FailedTesting => "failed_testing",
        };
        f.write_str(s)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestingStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Passed,
    #[n(2)]
    Failed,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "unit_" prefix
    #[n(1)]
    pub bag_number: String,
    #[n(2)]
    pub blood_type: BloodType,
    #[n(3)]
    pub volume_ml: u32,
    #[n(4)]
    pub component_type: String,
    #[n(5)]
    pub storage_location: Option<String>,
    #[n(6)]
    pub collected_at: TimeStamp,
    #[n(7)]
    pub expires_at: TimeStamp,
    #[n(8)]
    pub state: UnitState,
    #[n(9)]
    pub request_id: Option<String>,
    #[n(10)]
    pub testing: TestingStatus,
    #[n(11)]
    pub updated_at: TimeStamp,
}

impl Unit {
    pub fn is_expired_at(&self, now: &TimeStamp) -> bool {
        *now >= self.expires_at
    }

    pub fn is_allocatable_at(&self, now: &TimeStamp) -> bool {
        self.state == UnitState::Available && !self.is_expired_at(now)
    }

    /// Produce the next version of this unit, enforcing the lifecycle edges and
    /// the request link invariant. `request_id` is only consulted on reservation.
    pub fn transition(
        &self,
        next: UnitState,
        request_id: Option<&str>,
        now: TimeStamp,
    ) -> EngineResult<Unit> {
        if !self.state.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }

        let mut updated = self.clone();
        updated.state = next;
        updated.updated_at = now;

        match next {
            UnitState::Reserved => {
                let Some(request_id) = request_id else {
                    return Err(EngineError::InvalidTransition {
                        id: self.id.clone(),
                        from: self.state,
                        to: next,
                    });
                };
                updated.request_id = Some(request_id.to_string());
            }
            UnitState::Available => {
                updated.request_id = None;
                updated.testing = TestingStatus::Passed;
            }
            UnitState::FailedTesting => updated.testing = TestingStatus::Failed,
            // an expired unit is freed from whatever reservation it held
            UnitState::Expired => updated.request_id = None,
            _ => {}
        }

        Ok(updated)
    }
}

/// Intake data for a freshly collected unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRegistration {
    blood_type: BloodType,
    volume_ml: u32,
    collected_at: TimeStamp,
    expires_at: TimeStamp,
    bag_number: Option<String>,
    component_type: Option<String>,
    storage_location: Option<String>,
}

impl UnitRegistration {
    pub fn new(
        blood_type: BloodType,
        volume_ml: u32,
        collected_at: TimeStamp,
        expires_at: TimeStamp,
    ) -> Self {
        Self {
            blood_type,
            volume_ml,
            collected_at,
            expires_at,
            bag_number: None,
            component_type: None,
            storage_location: None,
        }
    }
    pub fn set_bag_number(mut self, bag_number: &str) -> Self {
        self.bag_number = Some(bag_number.to_string());
        self
    }
    pub fn set_component_type(mut self, component: &str) -> Self {
        self.component_type = Some(component.to_string());
        self
    }
    pub fn set_storage_location(mut self, location: &str) -> Self {
        self.storage_location = Some(location.to_string());
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.volume_ml == 0 {
            return Err(ValidationError::Volume(self.volume_ml));
        }
        if self.expires_at <= self.collected_at {
            return Err(ValidationError::ExpiryBeforeCollection {
                collected_at: self.collected_at.to_iso8601(),
                expires_at: self.expires_at.to_iso8601(),
            });
        }
        if matches!(&self.bag_number, Some(b) if b.trim().is_empty()) {
            return Err(ValidationError::BagNumber);
        }
        Ok(())
    }

    // Checks fields and assigns a fresh id. The unit starts out `collected`.
    pub fn finalise(self, now: TimeStamp) -> EngineResult<Unit> {
        self.validate()?;

        let id = new_uuid_to_bech32(UNIT_HRP)?;
        let bag_number = self.bag_number.unwrap_or_else(|| id.clone());

        Ok(Unit {
            id,
            bag_number,
            blood_type: self.blood_type,
            volume_ml: self.volume_ml,
            component_type: self
                .component_type
                .unwrap_or_else(|| DEFAULT_COMPONENT.to_string()),
            storage_location: self.storage_location,
            collected_at: self.collected_at,
            expires_at: self.expires_at,
            state: UnitState::Collected,
            request_id: None,
            testing: TestingStatus::Pending,
            updated_at: now,
        })
    }
}
