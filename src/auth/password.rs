/// Compares a supplied credential with the stored one by exact value.
///
/// Credentials are kept in plaintext, matching the existing account data. This is a
/// known weakness; switching to a password hash is a migration, not a drop-in fix.
pub fn credentials_match(supplied: &str, stored: &str) -> bool {
    let supplied = supplied.as_bytes();
    let stored = stored.as_bytes();
    if supplied.len() != stored.len() {
        return false;
    }
    supplied
        .iter()
        .zip(stored)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
