//! Password check for the intro handshake.

/// Compare a client-presented password against the server's configured
/// value in constant time, so a timing side-channel can't be used to guess
/// the password one byte at a time.
///
/// An empty `configured` means "no authentication required" and always
/// passes, regardless of what the client sent.
pub fn verify_password(configured: &str, presented: &str) -> bool {
    if configured.is_empty() {
        return true;
    }

    let configured = configured.as_bytes();
    let presented = presented.as_bytes();

    if configured.len() != presented.len() {
        return false;
    }

    let mut diff = 0u8;
    for (a, b) in configured.iter().zip(presented.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}
