//! Fulfillment coordinator
//!
//! Turns an advisory plan into committed assignments. Each candidate is first
//! claimed through the ledger's compare and swap, then committed together with
//! its request credit and `issue` transaction in one store transaction. Losing
//! a race for a unit is not an error, the coordinator moves on to the next
//! candidate (replanning once the plan is used up) and reports any shortfall
//! as `partially_fulfilled`.
use crate::error::{EngineError, EngineResult};
use crate::ledger::{UnitFilter, UnitLedger};
use crate::planner::{AllocationPlanner, PlanRequest};
use crate::request::{Request, RequestState};
use crate::store::Store;
use crate::transaction::{Transaction, TransactionNote};
use crate::types::{BloodType, TimeStamp, Urgency};
use crate::unit::{Unit, UnitState};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FulfillmentOutcome {
    pub request: Request,
    pub transactions: Vec<Transaction>,
    pub unmet_ml: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub state: Option<RequestState>,
    pub hospital_id: Option<String>,
}

pub struct FulfillmentCoordinator<S: Store> {
    store: Arc<S>,
    ledger: UnitLedger<S>,
    planner: AllocationPlanner<S>,
}

impl<S: Store> FulfillmentCoordinator<S> {
    pub fn new(ledger: UnitLedger<S>, planner: AllocationPlanner<S>) -> Self {
        Self {
            store: Arc::clone(ledger.store()),
            ledger,
            planner,
        }
    }

    pub fn get_request(&self, request_id: &str) -> EngineResult<Request> {
        self.store
            .get_request(request_id)?
            .ok_or_else(|| EngineError::request_not_found(request_id))
    }

    /// Requests matching `filter`, newest first
    pub fn list_requests(&self, filter: &RequestFilter) -> EngineResult<Vec<Request>> {
        let mut requests: Vec<Request> = self
            .store
            .requests()?
            .into_iter()
            .filter(|r| filter.state.is_none_or(|s| r.state == s))
            .filter(|r| {
                filter
                    .hospital_id
                    .as_deref()
                    .is_none_or(|h| r.hospital_id == h)
            })
            .collect();
        requests.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(requests)
    }

    pub fn submit_request(
        &self,
        hospital_id: &str,
        blood_type: BloodType,
        quantity_ml: u32,
        urgency: Urgency,
        required_by: TimeStamp,
    ) -> EngineResult<Request> {
        let request = Request::new(
            hospital_id,
            blood_type,
            quantity_ml,
            urgency,
            required_by,
            TimeStamp::new(),
        )?;
        self.store.insert_request(&request)?;

        info!(
            request_id = %request.id,
            hospital_id,
            blood_type = %blood_type,
            quantity_ml,
            urgency = %urgency,
            "request submitted"
        );
        Ok(request)
    }

    pub fn fulfill(&self, request_id: &str) -> EngineResult<FulfillmentOutcome> {
        self.fulfill_at(request_id, TimeStamp::new())
    }

    pub fn fulfill_at(&self, request_id: &str, now: TimeStamp) -> EngineResult<FulfillmentOutcome> {
        let request = self.get_request(request_id)?;
        if request.state.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                id: request.id,
                state: request.state,
            });
        }

        let mut transactions = Vec::new();
        let mut current = request;

        // Each pass plans against what is left. Another pass only follows a
        // lost race, and every lost race means some unit left the pool, so
        // the number of passes is bounded by the inventory.
        'passes: loop {
            let plan = self.planner.plan(
                &PlanRequest {
                    blood_type: current.blood_type,
                    volume_ml: current.remaining_ml(),
                    urgency: current.urgency,
                    deadline: current.required_by,
                },
                now,
            )?;
            if plan.unit_ids.is_empty() {
                break;
            }

            let mut lost_race = false;
            for unit_id in &plan.unit_ids {
                match self.ledger.try_reserve_at(unit_id, request_id, now) {
                    Ok(_) => {}
                    Err(EngineError::Conflict(_)) => {
                        lost_race = true;
                        continue;
                    }
                    Err(e) => return Err(e),
                }

                // the unit may have expired since it was planned
                let commit_at = TimeStamp::new().max(now);
                match self.store.commit_assignment(unit_id, request_id, commit_at) {
                    Ok((_, txn)) => transactions.push(txn),
                    Err(EngineError::Conflict(_)) => {
                        lost_race = true;
                        self.abandon_reservation(unit_id, request_id, commit_at)?;
                    }
                    Err(EngineError::AlreadyTerminal { .. }) => {
                        // closed underneath us, stop claiming units for it
                        self.abandon_reservation(unit_id, request_id, commit_at)?;
                        break 'passes;
                    }
                    Err(e) => {
                        if let Err(release_err) = self.abandon_reservation(unit_id, request_id, commit_at) {
                            warn!(unit_id, error = %release_err, "could not release reservation after failed commit");
                        }
                        return Err(e);
                    }
                }
            }

            if !lost_race {
                break;
            }
            current = self.get_request(request_id)?;
            if current.state.is_terminal() || current.remaining_ml() == 0 {
                break;
            }
            debug!(request_id, remaining_ml = current.remaining_ml(), "replanning after lost race");
        }

        let request = self.settle(request_id, now)?;
        info!(
            request_id,
            state = %request.state,
            fulfilled_ml = request.fulfilled_ml,
            requested_ml = request.requested_ml,
            assigned = transactions.len(),
            "fulfillment attempt finished"
        );

        Ok(FulfillmentOutcome {
            unmet_ml: request.remaining_ml(),
            request,
            transactions,
        })
    }

    // A reservation that could not be committed is either expired (if its
    // validity ran out meanwhile) or handed back to the pool.
    fn abandon_reservation(&self, unit_id: &str, request_id: &str, now: TimeStamp) -> EngineResult<()> {
        let unit = self.ledger.get(unit_id)?;
        if unit.state != UnitState::Reserved || unit.request_id.as_deref() != Some(request_id) {
            // the sweeper or another writer already moved it on
            return Ok(());
        }

        let outcome = if unit.is_expired_at(&now) {
            self.ledger.mark_expired_at(unit_id, now).map(|_| ())
        } else {
            self.ledger.release(unit_id).map(|_| ())
        };
        match outcome {
            Err(EngineError::InvalidTransition { .. }) => {
                debug!(unit_id, "reservation changed hands while abandoning it");
                Ok(())
            }
            other => other,
        }
    }

    // Final state bookkeeping, only ever moving an untouched request past its deadline.
    fn settle(&self, request_id: &str, now: TimeStamp) -> EngineResult<Request> {
        loop {
            let current = self.get_request(request_id)?;
            if current.state.is_terminal() {
                return Ok(current);
            }

            let mut settled = current.clone();
            settled.settle(&now);
            if settled == current || self.store.swap_request(&current, &settled)? {
                return Ok(settled);
            }
        }
    }

    /// Fulfill every open request, most urgent first. Requests closed by a
    /// concurrent caller in the meantime are skipped.
    pub fn fulfill_pending(&self, now: TimeStamp) -> EngineResult<Vec<FulfillmentOutcome>> {
        let mut queue: Vec<Request> = self
            .store
            .requests()?
            .into_iter()
            .filter(Request::is_open)
            .collect();
        queue.sort_by(|a, b| a.priority_cmp(b));

        let mut outcomes = Vec::with_capacity(queue.len());
        for request in queue {
            match self.fulfill_at(&request.id, now) {
                Ok(outcome) => outcomes.push(outcome),
                Err(EngineError::AlreadyTerminal { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    pub fn reject(&self, request_id: &str, reason: &str) -> EngineResult<Request> {
        loop {
            let current = self.get_request(request_id)?;
            if current.state.is_terminal() {
                return Err(EngineError::AlreadyTerminal {
                    id: current.id,
                    state: current.state,
                });
            }

            let mut rejected = current.clone();
            rejected.state = RequestState::Rejected;
            rejected.rejection_reason = Some(reason.to_string());

            if self.store.swap_request(&current, &rejected)? {
                info!(request_id, reason, "request rejected");
                return Ok(rejected);
            }
        }
    }

    /// Hand over every unit assigned to the request
    pub fn issue(&self, request_id: &str) -> EngineResult<Vec<Unit>> {
        self.get_request(request_id)?;

        let assigned = self.ledger.list_units(UnitFilter {
            blood_type: None,
            state: Some(UnitState::Assigned),
        })?;

        assigned
            .iter()
            .filter(|u| u.request_id.as_deref() == Some(request_id))
            .map(|u| self.ledger.mark_issued(&u.id))
            .collect()
    }

    /// Bring a unit assigned to a rejected request back into stock
    pub fn return_unit(&self, unit_id: &str, note: &TransactionNote) -> EngineResult<(Unit, Transaction)> {
        let (unit, txn) = self.store.commit_return(unit_id, note, TimeStamp::new())?;
        info!(
            unit_id,
            request_id = ?txn.request_id,
            issued_by = ?note.issued_by,
            "unit returned to stock"
        );
        Ok((unit, txn))
    }

    /// Correct the recorded volume of a unit that is still in stock
    pub fn adjust_volume(
        &self,
        unit_id: &str,
        volume_ml: u32,
        note: &TransactionNote,
    ) -> EngineResult<(Unit, Transaction)> {
        let (unit, txn) = self
            .store
            .commit_adjustment(unit_id, volume_ml, note, TimeStamp::new())?;
        info!(unit_id, volume_ml, issued_by = ?note.issued_by, "unit volume adjusted");
        Ok((unit, txn))
    }

    pub fn transactions_for(&self, request_id: &str) -> EngineResult<Vec<Transaction>> {
        self.store.transactions_for(request_id)
    }
}
