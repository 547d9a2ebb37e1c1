//! Hospital demand requests and their fulfillment accounting
use crate::error::{EngineResult, ValidationError};
use crate::types::{BloodType, TimeStamp, Urgency};
use crate::utils::{REQUEST_HRP, new_uuid_to_bech32};
use std::cmp::Ordering;
use std::fmt;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    #[n(0)]
    Pending,
    #[n(1)]
    PartiallyFulfilled,
    #[n(2)]
    Fulfilled,
    #[n(3)]
    Rejected,
    #[n(4)]
    ExpiredUnfulfilled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Fulfilled | RequestState::Rejected | RequestState::ExpiredUnfulfilled
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestState::Pending => "pending",
            RequestState::PartiallyFulfilled => "partially_fulfilled",
            RequestState::Fulfilled => "fulfilled",
            RequestState::Rejected => "rejected",
            RequestState::ExpiredUnfulfilled => "expired_unfulfilled",
        };
        f.write_str(s)
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Request {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7, "req_" prefix
    #[n(1)]
    pub hospital_id: String,
    #[n(2)]
    pub blood_type: BloodType,
    #[n(3)]
    pub requested_ml: u32,
    #[n(4)]
    pub fulfilled_ml: u32,
    #[n(5)]
    pub urgency: Urgency,
    #[n(6)]
    pub required_by: TimeStamp,
    #[n(7)]
    pub state: RequestState,
    #[n(8)]
    pub rejection_reason: Option<String>,
    #[n(9)]
    pub created_at: TimeStamp,
}

impl Request {
    pub fn new(
        hospital_id: &str,
        blood_type: BloodType,
        requested_ml: u32,
        urgency: Urgency,
        required_by: TimeStamp,
        now: TimeStamp,
    ) -> EngineResult<Self> {
        if requested_ml == 0 {
            return Err(ValidationError::Quantity.into());
        }

        Ok(Self {
            id: new_uuid_to_bech32(REQUEST_HRP)?,
            hospital_id: hospital_id.to_string(),
            blood_type,
            requested_ml,
            fulfilled_ml: 0,
            urgency,
            required_by,
            state: RequestState::Pending,
            rejection_reason: None,
            created_at: now,
        })
    }

    /// Whether the request can still receive units
    pub fn is_open(&self) -> bool {
        !self.state.is_terminal()
    }

    pub fn remaining_ml(&self) -> u32 {
        self.requested_ml.saturating_sub(self.fulfilled_ml)
    }

    pub fn is_past_deadline(&self, now: &TimeStamp) -> bool {
        *now > self.required_by
    }

    /// Credit an assigned unit against this request. The credited amount is
    /// capped at what is still outstanding so `fulfilled <= requested` holds
    /// even when the last bag overshoots. Returns the credited volume.
    pub fn credit(&mut self, volume_ml: u32) -> u32 {
        let credited = volume_ml.min(self.remaining_ml());
        self.fulfilled_ml += credited;
        self.state = self.derived_state();
        credited
    }

    /// State implied by the accounting alone; terminal states set explicitly
    /// (rejection, deadline expiry) are preserved.
    pub fn derived_state(&self) -> RequestState {
        match self.state {
            RequestState::Rejected | RequestState::ExpiredUnfulfilled => self.state,
            _ if self.fulfilled_ml >= self.requested_ml => RequestState::Fulfilled,
            _ if self.fulfilled_ml > 0 => RequestState::PartiallyFulfilled,
            _ => RequestState::Pending,
        }
    }

    /// Final bookkeeping after an allocation attempt
    pub fn settle(&mut self, now: &TimeStamp) {
        self.state = self.derived_state();
        if self.state == RequestState::Pending && self.is_past_deadline(now) {
            self.state = RequestState::ExpiredUnfulfilled;
        }
    }

    /// Fulfillment priority: most urgent first, then earliest deadline, then oldest
    pub fn priority_cmp(&self, other: &Request) -> Ordering {
        other
            .urgency
            .cmp(&self.urgency)
            .then_with(|| self.required_by.cmp(&other.required_by))
            .then_with(|| self.created_at.cmp(&other.created_at))
    }
}
