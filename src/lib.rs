//! Blood unit inventory allocation and fulfillment engine
//!
//! Units move through a validated lifecycle in the [`ledger`]; the [`planner`]
//! picks earliest-expiring compatible stock for a request; the [`coordinator`]
//! claims and commits those units atomically; the [`sweeper`] retires units
//! whose validity window has closed. All state lives behind a [`store::Store`],
//! backed by sled.

pub mod compatibility;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod planner;
pub mod request;
pub mod service;
pub mod store;
pub mod sweeper;
pub mod transaction;
pub mod types;
pub mod unit;
pub mod utils;

pub use error::{EngineError, EngineResult, ValidationError};
pub use service::BloodBankService;
