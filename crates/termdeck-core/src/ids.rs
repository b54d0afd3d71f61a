//! Random identifier generation for sessions and recovery tokens.

use rand::Rng;

/// Generate a random session ID (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    random_hex(16)
}

/// Generate a recovery token (hex-encoded, 32 bytes = 64 hex chars).
///
/// Tokens are generated once per session and never reused after the
/// session terminates.
pub fn generate_recovery_token() -> String {
    random_hex(32)
}

fn random_hex(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    let buf: Vec<u8> = (0..bytes).map(|_| rng.gen()).collect();
    hex::encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tokens_are_unique() {
        let a = generate_recovery_token();
        let b = generate_recovery_token();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }
}
