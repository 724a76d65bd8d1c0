use sha2::{Digest, Sha256};

use crate::error::ControllerError;

/// Check a submitted operator PIN against the configured hash.
///
/// The PIN must be exactly four ASCII digits; anything else is rejected
/// before hashing so callers can distinguish bad input from a wrong PIN.
pub fn verify_pin(pin: &str, expected_hash_hex: &str) -> Result<bool, ControllerError> {
    if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ControllerError::InvalidInput(
            "PIN must be exactly 4 digits".to_string(),
        ));
    }
    let digest = Sha256::digest(pin.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    Ok(hex.eq_ignore_ascii_case(expected_hash_hex))
}
