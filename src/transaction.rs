//! Append-only audit records of unit movements
use crate::types::TimeStamp;

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    #[n(0)]
    Issue,
    #[n(1)]
    Return,
    #[n(2)]
    Adjustment,
}

// Written once, in the same store transaction as the unit change it records,
// never updated or removed.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    #[n(0)]
    pub id: String,
    /// Absent for stock adjustments of units not tied to any request
    #[n(1)]
    pub request_id: Option<String>,
    #[n(2)]
    pub unit_id: String,
    /// Volume moved; for an adjustment, the corrected volume of the unit
    #[n(3)]
    pub volume_ml: u32,
    #[n(4)]
    pub timestamp: TimeStamp,
    #[n(5)]
    pub kind: TransactionType,
    #[n(6)]
    pub issued_by: Option<String>,
    #[n(7)]
    pub remarks: Option<String>,
}

/// Who performed a movement and why, carried onto its transaction
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionNote {
    pub issued_by: Option<String>,
    pub remarks: Option<String>,
}

impl TransactionNote {
    pub fn new(issued_by: &str, remarks: &str) -> Self {
        Self {
            issued_by: Some(issued_by.to_string()),
            remarks: Some(remarks.to_string()),
        }
    }
}

impl Transaction {
    pub fn belongs_to(&self, request_id: &str) -> bool {
        self.request_id.as_deref() == Some(request_id)
    }
}
