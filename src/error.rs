use crate::request::RequestState;
use crate::unit::UnitState;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("volume must be a positive number of millilitres, got {0}")]
    Volume(u32),
    #[error("expiry {expires_at} must be after collection {collected_at}")]
    ExpiryBeforeCollection {
        collected_at: String,
        expires_at: String,
    },
    #[error("requested quantity must be positive")]
    Quantity,
    #[error("unknown blood type {0:?}")]
    BloodType(String),
    #[error("unknown urgency {0:?}")]
    Urgency(String),
    #[error("malformed timestamp {0}")]
    Timestamp(String),
    #[error("bag number must not be empty")]
    BagNumber,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid unit: {0}")]
    InvalidUnit(#[from] ValidationError),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("unit {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: UnitState,
        to: UnitState,
    },
    #[error("unit {0} is no longer available")]
    Conflict(String),
    #[error("request {id} is already {state}")]
    AlreadyTerminal { id: String, state: RequestState },
    #[error("units of request {request_id} cannot be returned while it is {state}")]
    ReturnRefused {
        request_id: String,
        state: RequestState,
    },
    #[error("unit {id} is {state}, its volume can no longer be adjusted")]
    NotAdjustable { id: String, state: UnitState },
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("record encoding failure: {0}")]
    Encoding(String),
}

impl EngineError {
    pub fn unit_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "unit",
            id: id.to_string(),
        }
    }
    pub fn request_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "request",
            id: id.to_string(),
        }
    }
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for EngineError {
    fn from(e: minicbor::encode::Error<E>) -> Self {
        EngineError::Encoding(e.to_string())
    }
}

impl From<minicbor::decode::Error> for EngineError {
    fn from(e: minicbor::decode::Error) -> Self {
        EngineError::Encoding(e.to_string())
    }
}

impl From<bech32::EncodeError> for EngineError {
    fn from(e: bech32::EncodeError) -> Self {
        EngineError::Encoding(e.to_string())
    }
}

impl From<bech32::primitives::hrp::Error> for EngineError {
    fn from(e: bech32::primitives::hrp::Error) -> Self {
        EngineError::Encoding(e.to_string())
    }
}
