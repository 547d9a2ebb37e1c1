#![allow(dead_code)]

use bloodbank_allocation::{
    BloodBankService,
    compatibility::{CompatibilityPolicy, ExactMatch},
    config::EngineConfig,
    store::SledStore,
    types::{BloodType, TimeStamp},
    unit::{Unit, UnitRegistration},
};
use std::sync::Arc;
use tempfile::TempDir;

pub const BAG_ML: u32 = 450;

// Sled locks its directory, so every test gets its own database under a
// temp dir that is cleaned up when the returned guard drops.
pub fn service() -> anyhow::Result<(TempDir, BloodBankService)> {
    service_with(Arc::new(ExactMatch))
}

pub fn service_with(
    policy: Arc<dyn CompatibilityPolicy>,
) -> anyhow::Result<(TempDir, BloodBankService)> {
    let temp_dir = tempfile::tempdir()?;
    let store = Arc::new(SledStore::open(temp_dir.path().join("bank.db"))?);
    let service = BloodBankService::new(store, policy, EngineConfig::default());
    Ok((temp_dir, service))
}

/// Register a unit and take it through testing so it is allocatable
pub fn available_unit<S: bloodbank_allocation::store::Store>(
    service: &BloodBankService<S>,
    blood_type: BloodType,
    expires_in_days: i64,
) -> anyhow::Result<Unit> {
    let now = TimeStamp::new();
    let unit = service.register_unit(UnitRegistration::new(
        blood_type,
        BAG_ML,
        now.plus_days(-1),
        now.plus_days(expires_in_days),
    ))?;
    service.submit_for_testing(&unit.id)?;
    Ok(service.record_test_result(&unit.id, true)?)
}

/// Like [`available_unit`], but expiring `millis` from now
pub fn short_lived_unit<S: bloodbank_allocation::store::Store>(
    service: &BloodBankService<S>,
    blood_type: BloodType,
    millis: i64,
) -> anyhow::Result<Unit> {
    let now = TimeStamp::new();
    let expires_at = TimeStamp::from(chrono::Utc::now() + chrono::Duration::milliseconds(millis));
    let unit = service.register_unit(UnitRegistration::new(
        blood_type,
        BAG_ML,
        now.plus_days(-1),
        expires_at,
    ))?;
    service.submit_for_testing(&unit.id)?;
    Ok(service.record_test_result(&unit.id, true)?)
}
