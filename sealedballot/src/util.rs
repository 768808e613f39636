use rand::RngCore;
use std::time::{SystemTime, UNIX_EPOCH};

/// Elections are identified by their ledger number
pub type ElectionId = u64;

/// Fill a fresh buffer from the OS random source
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

/// Addresses are compared lowercased with surrounding whitespace removed
pub fn normalize_address(address: &str) -> String {
    address.trim().to_lowercase()
}

/// Milliseconds since the unix epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Short hex prefix for logging public values
pub(crate) fn preview(bytes: &[u8]) -> String {
    let mut s = hex::encode(&bytes[..bytes.len().min(5)]);
    s.push_str("...");
    s
}
