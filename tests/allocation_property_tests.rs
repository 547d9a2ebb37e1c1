//! Property-based tests for candidate selection and request crediting
//!
//! Selection is checked in memory against arbitrary inventories; the
//! fulfillment properties run against a real sled store, so they use a small
//! case count.

mod common;

use bloodbank_allocation::{
    compatibility::{AboRhCompatibility, CompatibilityPolicy, ExactMatch},
    planner::select_candidates,
    request::{Request, RequestState},
    types::{BloodType, TimeStamp, Urgency},
    unit::{Unit, UnitRegistration, UnitState},
};
use common::{BAG_ML, available_unit, service};
use proptest::prelude::*;
use std::collections::HashSet;

// PROPERTY TEST STRATEGIES

fn blood_type_strategy() -> impl Strategy<Value = BloodType> {
    (0usize..BloodType::ALL.len()).prop_map(|i| BloodType::ALL[i])
}

/// (blood type, days until expiry, volume) for one unit
fn unit_spec_strategy() -> impl Strategy<Value = (BloodType, i64, u32)> {
    (blood_type_strategy(), 1i64..60, 100u32..=500)
}

fn available_at(now: TimeStamp, blood_type: BloodType, expires_in_days: i64, volume_ml: u32) -> Unit {
    let unit = UnitRegistration::new(
        blood_type,
        volume_ml,
        now.plus_days(-1),
        now.plus_days(expires_in_days),
    )
    .finalise(now)
    .unwrap();
    let unit = unit.transition(UnitState::TestingPending, None, now).unwrap();
    unit.transition(UnitState::Available, None, now).unwrap()
}

// SELECTION PROPERTIES

proptest! {
    /// Everything selected is compatible, available and unexpired
    #[test]
    fn selection_only_offers_allocatable_compatible_units(
        specs in prop::collection::vec(unit_spec_strategy(), 0..30),
        wanted in blood_type_strategy(),
        volume in 1u32..5000,
    ) {
        let now = TimeStamp::new_with(2025, 3, 1, 12, 0, 0).unwrap();
        let units: Vec<Unit> = specs
            .iter()
            .map(|(bt, days, ml)| available_at(now, *bt, *days, *ml))
            .collect();

        let plan = select_candidates(&units, wanted, volume, &AboRhCompatibility, &now);

        let unique: HashSet<_> = plan.unit_ids.iter().collect();
        prop_assert_eq!(unique.len(), plan.unit_ids.len());
        for id in &plan.unit_ids {
            let unit = units.iter().find(|u| &u.id == id).unwrap();
            prop_assert!(unit.is_allocatable_at(&now));
            prop_assert!(AboRhCompatibility.donors_for(wanted).contains(&unit.blood_type));
        }
    }

    /// The plan covers the volume when stock allows, and never takes a unit
    /// it did not need
    #[test]
    fn selection_is_greedy_and_minimal(
        specs in prop::collection::vec((1i64..60, 100u32..=500), 0..30),
        volume in 1u32..8000,
    ) {
        let now = TimeStamp::new_with(2025, 3, 1, 12, 0, 0).unwrap();
        let units: Vec<Unit> = specs
            .iter()
            .map(|(days, ml)| available_at(now, BloodType::ONeg, *days, *ml))
            .collect();
        let stock: u32 = units.iter().map(|u| u.volume_ml).sum();

        let plan = select_candidates(&units, BloodType::ONeg, volume, &ExactMatch, &now);

        prop_assert_eq!(plan.unmet_ml, volume.saturating_sub(plan.planned_ml));
        if stock >= volume {
            prop_assert!(plan.is_complete());
        } else {
            prop_assert_eq!(plan.unit_ids.len(), units.len());
            prop_assert_eq!(plan.unmet_ml, volume - stock);
        }

        // dropping the last pick would leave the volume uncovered
        if let Some(last) = plan.unit_ids.last() {
            let last_ml = units.iter().find(|u| &u.id == last).unwrap().volume_ml;
            prop_assert!(plan.planned_ml - last_ml < volume);
        }
    }

    /// Nothing left in the pool expires earlier than a selected unit
    #[test]
    fn selection_prefers_earliest_expiry(
        specs in prop::collection::vec(unit_spec_strategy(), 1..30),
        volume in 1u32..3000,
    ) {
        let now = TimeStamp::new_with(2025, 3, 1, 12, 0, 0).unwrap();
        let units: Vec<Unit> = specs
            .iter()
            .map(|(_, days, ml)| available_at(now, BloodType::BPos, *days, *ml))
            .collect();

        let plan = select_candidates(&units, BloodType::BPos, volume, &ExactMatch, &now);
        let chosen: HashSet<_> = plan.unit_ids.iter().cloned().collect();

        let latest_chosen = units
            .iter()
            .filter(|u| chosen.contains(&u.id))
            .map(|u| u.expires_at)
            .max();
        if let Some(latest) = latest_chosen {
            for unit in units.iter().filter(|u| !chosen.contains(&u.id)) {
                prop_assert!(unit.expires_at >= latest);
            }
        }
    }
}

// REQUEST CREDIT PROPERTIES

proptest! {
    /// Crediting never pushes a request past what it asked for, and the
    /// derived state always agrees with the amounts
    #[test]
    fn credit_is_capped_and_state_tracks_amounts(
        requested in 1u32..5000,
        credits in prop::collection::vec(0u32..1000, 0..12),
    ) {
        let now = TimeStamp::new_with(2025, 3, 1, 12, 0, 0).unwrap();
        let mut request = Request::new(
            "hosp_prop",
            BloodType::ABNeg,
            requested,
            Urgency::Routine,
            now.plus_days(1),
            now,
        )
        .unwrap();

        let mut previous = 0;
        for volume in credits {
            request.credit(volume);
            prop_assert!(request.fulfilled_ml >= previous);
            prop_assert!(request.fulfilled_ml <= request.requested_ml);
            previous = request.fulfilled_ml;

            let expected = if request.fulfilled_ml == 0 {
                RequestState::Pending
            } else if request.fulfilled_ml == request.requested_ml {
                RequestState::Fulfilled
            } else {
                RequestState::PartiallyFulfilled
            };
            prop_assert_eq!(request.state, expected);
        }
    }
}

// FULFILLMENT PROPERTIES (sled backed)

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Interleaving stock arrivals with fulfillment attempts keeps the
    /// request monotonic, capped, and backed one-to-one by transactions
    #[test]
    fn repeated_fulfillment_is_monotonic_and_capped(
        requested_bags in 1u32..6,
        arrivals in prop::collection::vec(0usize..3, 1..5),
    ) {
        let (_dir, service) = service().unwrap();
        let request = service
            .submit_request(
                "hosp_prop",
                BloodType::OPos,
                requested_bags * BAG_ML,
                Urgency::High,
                TimeStamp::new().plus_days(1),
            )
            .unwrap();

        let mut previous = 0;
        for (round, bags) in arrivals.into_iter().enumerate() {
            for i in 0..bags {
                available_unit(&service, BloodType::OPos, 5 + (round + i) as i64).unwrap();
            }

            let current = service.request(&request.id).unwrap();
            if current.state.is_terminal() {
                break;
            }
            let outcome = service.fulfill(&request.id).unwrap();
            prop_assert!(outcome.request.fulfilled_ml >= previous);
            prop_assert!(outcome.request.fulfilled_ml <= outcome.request.requested_ml);
            previous = outcome.request.fulfilled_ml;
        }

        let txns = service.transactions_for(&request.id).unwrap();
        let units: HashSet<_> = txns.iter().map(|t| t.unit_id.clone()).collect();
        prop_assert_eq!(units.len(), txns.len());

        let final_request = service.request(&request.id).unwrap();
        let delivered: u32 = txns.iter().map(|t| t.volume_ml).sum();
        prop_assert_eq!(final_request.fulfilled_ml, delivered.min(final_request.requested_ml));
    }
}
