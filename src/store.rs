//! Record stores for units, requests and the transaction log
//!
//! The engine only talks to a [`Store`]. Every mutation of an existing record
//! goes through a conditional swap against the exact bytes the caller last
//! read, so two writers racing on the same unit cannot both win.
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::request::{Request, RequestState};
use crate::transaction::{Transaction, TransactionNote, TransactionType};
use crate::types::TimeStamp;
use crate::unit::{Unit, UnitState};
use crate::utils::{TRANSACTION_HRP, new_uuid_to_bech32};
use sled::Transactional;
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use std::path::Path;
use tracing::debug;

const UNITS_TREE: &str = "units";
const REQUESTS_TREE: &str = "requests";
const TRANSACTIONS_TREE: &str = "transactions";

pub trait Store: Send + Sync {
    fn insert_unit(&self, unit: &Unit) -> EngineResult<()>;
    fn get_unit(&self, id: &str) -> EngineResult<Option<Unit>>;
    fn units(&self) -> EngineResult<Vec<Unit>>;
    /// Replace `current` with `next` only if the stored record is still `current`
    fn swap_unit(&self, current: &Unit, next: &Unit) -> EngineResult<bool>;

    fn insert_request(&self, request: &Request) -> EngineResult<()>;
    fn get_request(&self, id: &str) -> EngineResult<Option<Request>>;
    fn requests(&self) -> EngineResult<Vec<Request>>;
    fn swap_request(&self, current: &Request, next: &Request) -> EngineResult<bool>;

    fn transactions(&self) -> EngineResult<Vec<Transaction>>;

    /// Move a reserved unit to `assigned`, credit the owning request and append
    /// an `issue` transaction, all or nothing.
    ///
    /// Fails with `Conflict` if the unit is no longer reserved for `request_id`
    /// or has passed its expiry, and with `AlreadyTerminal` if the request has
    /// been closed in the meantime.
    fn commit_assignment(
        &self,
        unit_id: &str,
        request_id: &str,
        now: TimeStamp,
    ) -> EngineResult<(Request, Transaction)>;

    /// Put an assigned unit back into stock and append a `return` transaction,
    /// all or nothing. Only units of a rejected request may come back; the
    /// request's fulfilled volume is left as it was.
    fn commit_return(
        &self,
        unit_id: &str,
        note: &TransactionNote,
        now: TimeStamp,
    ) -> EngineResult<(Unit, Transaction)>;

    /// Correct the recorded volume of a unit still in stock and append an
    /// `adjustment` transaction, all or nothing.
    fn commit_adjustment(
        &self,
        unit_id: &str,
        volume_ml: u32,
        note: &TransactionNote,
        now: TimeStamp,
    ) -> EngineResult<(Unit, Transaction)>;

    fn transactions_for(&self, request_id: &str) -> EngineResult<Vec<Transaction>> {
        let mut txns: Vec<Transaction> = self
            .transactions()?
            .into_iter()
            .filter(|t| t.belongs_to(request_id))
            .collect();
        txns.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(txns)
    }
}

fn encode<T: minicbor::Encode<()>>(value: &T) -> EngineResult<Vec<u8>> {
    Ok(minicbor::to_vec(value)?)
}

fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> EngineResult<T> {
    Ok(minicbor::decode(bytes)?)
}

fn abort<T>(result: EngineResult<T>) -> Result<T, ConflictableTransactionError<EngineError>> {
    result.map_err(ConflictableTransactionError::Abort)
}

/// sled backed store, one tree per record kind keyed by record id
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    units: sled::Tree,
    requests: sled::Tree,
    transactions: sled::Tree,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        Self::with_db(sled::open(path)?)
    }

    /// A database removed from disk when dropped
    pub fn temporary() -> EngineResult<Self> {
        Self::with_db(sled::Config::new().temporary(true).open()?)
    }

    pub fn with_db(db: sled::Db) -> EngineResult<Self> {
        Ok(Self {
            units: db.open_tree(UNITS_TREE)?,
            requests: db.open_tree(REQUESTS_TREE)?,
            transactions: db.open_tree(TRANSACTIONS_TREE)?,
            db,
        })
    }

    pub fn flush(&self) -> EngineResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn scan<T: for<'b> minicbor::Decode<'b, ()>>(tree: &sled::Tree) -> EngineResult<Vec<T>> {
        tree.iter()
            .map(|entry| {
                let (_, value) = entry?;
                decode(&value)
            })
            .collect()
    }

    fn swap(tree: &sled::Tree, id: &str, current: Vec<u8>, next: Vec<u8>) -> EngineResult<bool> {
        match tree.compare_and_swap(id.as_bytes(), Some(current), Some(next))? {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

fn abort_with<T>(e: EngineError) -> Result<T, ConflictableTransactionError<EngineError>> {
    Err(ConflictableTransactionError::Abort(e))
}

fn settle_tx<T>(result: Result<T, TransactionError<EngineError>>) -> EngineResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

fn load_tx<T: for<'b> minicbor::Decode<'b, ()>>(
    tree: &TransactionalTree,
    id: &str,
) -> Result<Option<T>, ConflictableTransactionError<EngineError>> {
    match tree.get(id.as_bytes())? {
        Some(bytes) => abort(decode(&bytes)).map(Some),
        None => Ok(None),
    }
}

impl Store for SledStore {
    fn insert_unit(&self, unit: &Unit) -> EngineResult<()> {
        self.units.insert(unit.id.as_bytes(), encode(unit)?)?;
        Ok(())
    }

    fn get_unit(&self, id: &str) -> EngineResult<Option<Unit>> {
        self.units
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn units(&self) -> EngineResult<Vec<Unit>> {
        Self::scan(&self.units)
    }

    fn swap_unit(&self, current: &Unit, next: &Unit) -> EngineResult<bool> {
        Self::swap(&self.units, &current.id, encode(current)?, encode(next)?)
    }

    fn insert_request(&self, request: &Request) -> EngineResult<()> {
        self.requests
            .insert(request.id.as_bytes(), encode(request)?)?;
        Ok(())
    }

    fn get_request(&self, id: &str) -> EngineResult<Option<Request>> {
        self.requests
            .get(id.as_bytes())?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn requests(&self) -> EngineResult<Vec<Request>> {
        Self::scan(&self.requests)
    }

    fn swap_request(&self, current: &Request, next: &Request) -> EngineResult<bool> {
        Self::swap(&self.requests, &current.id, encode(current)?, encode(next)?)
    }

    fn transactions(&self) -> EngineResult<Vec<Transaction>> {
        Self::scan(&self.transactions)
    }

    fn commit_assignment(
        &self,
        unit_id: &str,
        request_id: &str,
        now: TimeStamp,
    ) -> EngineResult<(Request, Transaction)> {
        // generated up front, the closure below may run more than once
        let txn_id = new_uuid_to_bech32(TRANSACTION_HRP)?;

        let result = (&self.units, &self.requests, &self.transactions).transaction(
            |(units, requests, transactions)| {
                let unit: Unit = load_tx(units, unit_id)?
                    .ok_or_else(|| ConflictableTransactionError::Abort(EngineError::unit_not_found(unit_id)))?;

                if unit.state != UnitState::Reserved
                    || unit.request_id.as_deref() != Some(request_id)
                    || unit.is_expired_at(&now)
                {
                    return Err(ConflictableTransactionError::Abort(EngineError::Conflict(
                        unit_id.to_string(),
                    )));
                }

                let mut request: Request = load_tx(requests, request_id)?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(EngineError::request_not_found(request_id))
                })?;

                if request.state.is_terminal() {
                    return Err(ConflictableTransactionError::Abort(
                        EngineError::AlreadyTerminal {
                            id: request.id.clone(),
                            state: request.state,
                        },
                    ));
                }

                let assigned = abort(unit.transition(UnitState::Assigned, None, now))?;
                request.credit(unit.volume_ml);

                let txn = Transaction {
                    id: txn_id.clone(),
                    request_id: Some(request_id.to_string()),
                    unit_id: unit_id.to_string(),
                    volume_ml: unit.volume_ml,
                    timestamp: now,
                    kind: TransactionType::Issue,
                    issued_by: None,
                    remarks: None,
                };

                units.insert(unit_id.as_bytes(), abort(encode(&assigned))?)?;
                requests.insert(request_id.as_bytes(), abort(encode(&request))?)?;
                transactions.insert(txn.id.as_bytes(), abort(encode(&txn))?)?;

                Ok((request, txn))
            },
        );

        let (request, txn) = settle_tx(result)?;
        debug!(
            unit_id,
            request_id,
            txn_id = %txn.id,
            fulfilled_ml = request.fulfilled_ml,
            "assignment committed"
        );
        Ok((request, txn))
    }

    fn commit_return(
        &self,
        unit_id: &str,
        note: &TransactionNote,
        now: TimeStamp,
    ) -> EngineResult<(Unit, Transaction)> {
        let txn_id = new_uuid_to_bech32(TRANSACTION_HRP)?;

        let result = (&self.units, &self.requests, &self.transactions).transaction(
            |(units, requests, transactions)| {
                let unit: Unit = match load_tx(units, unit_id)? {
                    Some(unit) => unit,
                    None => return abort_with(EngineError::unit_not_found(unit_id)),
                };
                let request_id = match (&unit.state, &unit.request_id) {
                    (UnitState::Assigned, Some(request_id)) => request_id.clone(),
                    _ => {
                        return abort_with(EngineError::InvalidTransition {
                            id: unit.id.clone(),
                            from: unit.state,
                            to: UnitState::Available,
                        });
                    }
                };

                let request: Request = match load_tx(requests, &request_id)? {
                    Some(request) => request,
                    None => return abort_with(EngineError::request_not_found(&request_id)),
                };
                if request.state != RequestState::Rejected {
                    return abort_with(EngineError::ReturnRefused {
                        request_id,
                        state: request.state,
                    });
                }

                let returned = abort(unit.transition(UnitState::Available, None, now))?;
                let txn = Transaction {
                    id: txn_id.clone(),
                    request_id: Some(request_id),
                    unit_id: unit_id.to_string(),
                    volume_ml: unit.volume_ml,
                    timestamp: now,
                    kind: TransactionType::Return,
                    issued_by: note.issued_by.clone(),
                    remarks: note.remarks.clone(),
                };

                units.insert(unit_id.as_bytes(), abort(encode(&returned))?)?;
                transactions.insert(txn.id.as_bytes(), abort(encode(&txn))?)?;

                Ok((returned, txn))
            },
        );

        let (unit, txn) = settle_tx(result)?;
        debug!(unit_id, txn_id = %txn.id, request_id = ?txn.request_id, "return committed");
        Ok((unit, txn))
    }

    fn commit_adjustment(
        &self,
        unit_id: &str,
        volume_ml: u32,
        note: &TransactionNote,
        now: TimeStamp,
    ) -> EngineResult<(Unit, Transaction)> {
        if volume_ml == 0 {
            return Err(ValidationError::Volume(volume_ml).into());
        }
        let txn_id = new_uuid_to_bech32(TRANSACTION_HRP)?;

        let result = (&self.units, &self.transactions).transaction(|(units, transactions)| {
            let unit: Unit = match load_tx(units, unit_id)? {
                Some(unit) => unit,
                None => return abort_with(EngineError::unit_not_found(unit_id)),
            };
            if !unit.state.is_adjustable() {
                return abort_with(EngineError::NotAdjustable {
                    id: unit.id.clone(),
                    state: unit.state,
                });
            }

            let mut adjusted = unit.clone();
            adjusted.volume_ml = volume_ml;
            adjusted.updated_at = now;

            let txn = Transaction {
                id: txn_id.clone(),
                request_id: None,
                unit_id: unit_id.to_string(),
                volume_ml,
                timestamp: now,
                kind: TransactionType::Adjustment,
                issued_by: note.issued_by.clone(),
                remarks: note.remarks.clone(),
            };

            units.insert(unit_id.as_bytes(), abort(encode(&adjusted))?)?;
            transactions.insert(txn.id.as_bytes(), abort(encode(&txn))?)?;

            Ok((unit.volume_ml, adjusted, txn))
        });

        let (previous_ml, unit, txn) = settle_tx(result)?;
        debug!(unit_id, txn_id = %txn.id, previous_ml, volume_ml, "adjustment committed");
        Ok((unit, txn))
    }
}
