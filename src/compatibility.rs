//! Donor/recipient compatibility policies
//!
//! Allocation consults a [`CompatibilityPolicy`] to decide whether a unit of a
//! given donor type may satisfy a request for a recipient type. Exact matching
//! is the default; [`AboRhCompatibility`] implements the red-cell cross matrix.
use crate::types::BloodType;
use std::str::FromStr;

pub trait CompatibilityPolicy: Send + Sync {
    fn is_compatible(&self, donor: BloodType, recipient: BloodType) -> bool;

    /// Every donor type acceptable for `recipient`
    fn donors_for(&self, recipient: BloodType) -> Vec<BloodType> {
        BloodType::ALL
            .into_iter()
            .filter(|donor| self.is_compatible(*donor, recipient))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExactMatch;

impl CompatibilityPolicy for ExactMatch {
    fn is_compatible(&self, donor: BloodType, recipient: BloodType) -> bool {
        donor == recipient
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AboRhCompatibility;

impl CompatibilityPolicy for AboRhCompatibility {
    fn is_compatible(&self, donor: BloodType, recipient: BloodType) -> bool {
        use BloodType::*;

        // Rh- recipients only take Rh- blood
        if recipient.is_rh_negative() && !donor.is_rh_negative() {
            return false;
        }
        match donor {
            ONeg | OPos => true,
            ANeg | APos => matches!(recipient, ANeg | APos | ABNeg | ABPos),
            BNeg | BPos => matches!(recipient, BNeg | BPos | ABNeg | ABPos),
            ABNeg | ABPos => matches!(recipient, ABNeg | ABPos),
        }
    }
}

/// Selectable policy, used by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompatibilityMode {
    #[default]
    Exact,
    AboRh,
}

impl CompatibilityMode {
    pub fn policy(&self) -> Box<dyn CompatibilityPolicy> {
        match self {
            CompatibilityMode::Exact => Box::new(ExactMatch),
            CompatibilityMode::AboRh => Box::new(AboRhCompatibility),
        }
    }
}

impl FromStr for CompatibilityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(CompatibilityMode::Exact),
            "abo-rh" | "abo_rh" | "aborh" => Ok(CompatibilityMode::AboRh),
            other => Err(format!("unknown compatibility mode {other:?}")),
        }
    }
}
