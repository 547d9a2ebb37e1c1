//! Expiry sweeper: retires units whose validity window has closed
use crate::error::{EngineError, EngineResult};
use crate::ledger::{ExpiryOutcome, UnitLedger};
use crate::store::Store;
use crate::types::TimeStamp;
use crate::unit::UnitState;
use anyhow::Context;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired_unit_ids: Vec<String>,
    /// Requests that lost a reservation; they stay open for a later attempt
    pub released_request_ids: Vec<String>,
}

pub struct ExpirySweeper<S: Store> {
    ledger: UnitLedger<S>,
}

impl<S: Store> ExpirySweeper<S> {
    pub fn new(ledger: UnitLedger<S>) -> Self {
        Self { ledger }
    }

    /// Expire every available or reserved unit with `expires_at <= now`.
    ///
    /// A reserved unit never contributed to its request's fulfilled volume, so
    /// freeing it needs no correction on the request side.
    pub fn sweep_expired(&self, now: TimeStamp) -> EngineResult<SweepReport> {
        let mut report = SweepReport::default();

        let due = self
            .ledger
            .store()
            .units()?
            .into_iter()
            .filter(|u| matches!(u.state, UnitState::Available | UnitState::Reserved))
            .filter(|u| u.is_expired_at(&now));

        for unit in due {
            match self.ledger.mark_expired_at(&unit.id, now) {
                Ok(ExpiryOutcome::Expired { released_request }) => {
                    report.released_request_ids.extend(released_request);
                    report.expired_unit_ids.push(unit.id);
                }
                Ok(ExpiryOutcome::AlreadyExpired) => {}
                // committed to a request before we got to it
                Err(EngineError::InvalidTransition { .. }) => {
                    debug!(unit_id = %unit.id, "unit moved on before it could be expired");
                }
                Err(e) => return Err(e),
            }
        }

        if !report.expired_unit_ids.is_empty() {
            info!(
                expired = report.expired_unit_ids.len(),
                released_requests = report.released_request_ids.len(),
                "expiry sweep finished"
            );
        }
        Ok(report)
    }
}

impl<S: Store + 'static> ExpirySweeper<S> {
    /// Run `sweep_expired` every `interval` on a background thread
    pub fn spawn(self, interval: Duration) -> anyhow::Result<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("expiry-sweeper".to_string())
            .spawn(move || self.run(interval, shutdown_rx))
            .context("failed to spawn expiry sweeper thread")?;

        info!(interval_secs = interval.as_secs(), "expiry sweeper started");
        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(&self, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
        loop {
            match shutdown_rx.recv_timeout(interval) {
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.sweep_expired(TimeStamp::new()) {
                        warn!(error = %err, "expiry sweep failed");
                    }
                }
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("expiry sweeper stopped");
    }
}

/// Handle to stop and join the background sweeper
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}
