//! Identifier generation for stored records

use crate::error::EngineResult;
use bech32::Bech32m;
use uuid7::uuid7;

pub const UNIT_HRP: &str = "unit_";
pub const REQUEST_HRP: &str = "req_";
pub const TRANSACTION_HRP: &str = "txn_";

// construct a unique, time ordered id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> EngineResult<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}
