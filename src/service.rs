//! Service layer API: the operations exposed to callers of the engine
use crate::compatibility::CompatibilityPolicy;
use crate::config::EngineConfig;
use crate::coordinator::{FulfillmentCoordinator, FulfillmentOutcome, RequestFilter};
use crate::error::EngineResult;
use crate::ledger::{StockLevel, UnitFilter, UnitLedger};
use crate::planner::{AllocationPlan, AllocationPlanner, PlanRequest};
use crate::request::Request;
use crate::store::{SledStore, Store};
use crate::sweeper::{ExpirySweeper, SweepReport, SweeperHandle};
use crate::transaction::{Transaction, TransactionNote};
use crate::types::{BloodType, TimeStamp, Urgency};
use crate::unit::{Unit, UnitRegistration};
use std::sync::Arc;

pub struct BloodBankService<S: Store = SledStore> {
    config: EngineConfig,
    ledger: UnitLedger<S>,
    planner: AllocationPlanner<S>,
    coordinator: FulfillmentCoordinator<S>,
    sweeper: ExpirySweeper<S>,
}

impl BloodBankService<SledStore> {
    /// Open (or create) the sled database named by the configuration
    pub fn open(config: EngineConfig) -> EngineResult<Self> {
        let store = Arc::new(SledStore::open(&config.db_path)?);
        let policy: Arc<dyn CompatibilityPolicy> = Arc::from(config.compatibility.policy());
        Ok(Self::new(store, policy, config))
    }
}

impl<S: Store> BloodBankService<S> {
    pub fn new(store: Arc<S>, policy: Arc<dyn CompatibilityPolicy>, config: EngineConfig) -> Self {
        let ledger = UnitLedger::new(Arc::clone(&store));
        let planner = AllocationPlanner::new(store, policy);
        let coordinator = FulfillmentCoordinator::new(ledger.clone(), planner.clone());
        let sweeper = ExpirySweeper::new(ledger.clone());

        Self {
            config,
            ledger,
            planner,
            coordinator,
            sweeper,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &UnitLedger<S> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &FulfillmentCoordinator<S> {
        &self.coordinator
    }

    // Units

    pub fn register_unit(&self, registration: UnitRegistration) -> EngineResult<Unit> {
        self.ledger.register_unit(registration)
    }

    pub fn submit_for_testing(&self, unit_id: &str) -> EngineResult<Unit> {
        self.ledger.submit_for_testing(unit_id)
    }

    pub fn record_test_result(&self, unit_id: &str, passed: bool) -> EngineResult<Unit> {
        self.ledger.record_test_result(unit_id, passed)
    }

    pub fn unit(&self, unit_id: &str) -> EngineResult<Unit> {
        self.ledger.get(unit_id)
    }

    pub fn list_units(&self, filter: UnitFilter) -> EngineResult<Vec<Unit>> {
        self.ledger.list_units(filter)
    }

    pub fn stock_by_type(&self) -> EngineResult<Vec<StockLevel>> {
        self.ledger.stock_by_type()
    }

    /// Units expiring within the configured window
    pub fn expiring_soon(&self, now: TimeStamp) -> EngineResult<Vec<Unit>> {
        self.ledger
            .expiring_within(now, self.config.expiring_window_days)
    }

    // Requests

    pub fn submit_request(
        &self,
        hospital_id: &str,
        blood_type: BloodType,
        quantity_ml: u32,
        urgency: Urgency,
        required_by: TimeStamp,
    ) -> EngineResult<Request> {
        self.coordinator
            .submit_request(hospital_id, blood_type, quantity_ml, urgency, required_by)
    }

    pub fn request(&self, request_id: &str) -> EngineResult<Request> {
        self.coordinator.get_request(request_id)
    }

    pub fn list_requests(&self, filter: &RequestFilter) -> EngineResult<Vec<Request>> {
        self.coordinator.list_requests(filter)
    }

    pub fn reject(&self, request_id: &str, reason: &str) -> EngineResult<Request> {
        self.coordinator.reject(request_id, reason)
    }

    pub fn issue(&self, request_id: &str) -> EngineResult<Vec<Unit>> {
        self.coordinator.issue(request_id)
    }

    pub fn return_unit(&self, unit_id: &str, note: &TransactionNote) -> EngineResult<(Unit, Transaction)> {
        self.coordinator.return_unit(unit_id, note)
    }

    pub fn adjust_volume(
        &self,
        unit_id: &str,
        volume_ml: u32,
        note: &TransactionNote,
    ) -> EngineResult<(Unit, Transaction)> {
        self.coordinator.adjust_volume(unit_id, volume_ml, note)
    }

    pub fn transactions_for(&self, request_id: &str) -> EngineResult<Vec<Transaction>> {
        self.coordinator.transactions_for(request_id)
    }

    // Allocation

    pub fn plan(
        &self,
        blood_type: BloodType,
        volume_ml: u32,
        urgency: Urgency,
        deadline: TimeStamp,
    ) -> EngineResult<AllocationPlan> {
        let request = PlanRequest {
            blood_type,
            volume_ml,
            urgency,
            deadline,
        };
        self.planner.plan(&request, TimeStamp::new())
    }

    pub fn fulfill(&self, request_id: &str) -> EngineResult<FulfillmentOutcome> {
        self.coordinator.fulfill(request_id)
    }

    pub fn fulfill_pending(&self) -> EngineResult<Vec<FulfillmentOutcome>> {
        self.coordinator.fulfill_pending(TimeStamp::new())
    }

    pub fn sweep_expired(&self, now: TimeStamp) -> EngineResult<SweepReport> {
        self.sweeper.sweep_expired(now)
    }
}

impl<S: Store + 'static> BloodBankService<S> {
    /// Start the periodic expiry sweep on the configured interval
    pub fn start_sweeper(&self) -> anyhow::Result<SweeperHandle> {
        ExpirySweeper::new(self.ledger.clone()).spawn(self.config.sweep_interval)
    }
}
