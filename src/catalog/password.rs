//! PBKDF2-HMAC-SHA256 password hashing with legacy-plaintext fallback.
//!
//! Wire format: `salt$hex(pbkdf2_hmac_sha256(password, salt, 10_000))`. A
//! stored value with no `$` is legacy plaintext and compared for equality —
//! ported byte-for-byte (same algorithm, same format, not the same source
//! language) from the original catalog's `hash_password`/`verify_password`.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

const ITERATIONS: u32 = 10_000;
const SALT_BYTES: usize = 16;
const KEY_BYTES: usize = 32;

/// Hash `password` under a freshly generated random salt.
pub fn hash_password(password: &str) -> String {
    let mut salt_bytes = [0u8; SALT_BYTES];
    rand::thread_rng().fill_bytes(&mut salt_bytes);
    let salt = hex::encode(salt_bytes);
    hash_with_salt(password, &salt)
}

fn hash_with_salt(password: &str, salt: &str) -> String {
    let mut key = [0u8; KEY_BYTES];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt.as_bytes(), ITERATIONS, &mut key);
    format!("{salt}${}", hex::encode(key))
}

/// Outcome of a password check: whether it matched, and whether the stored
/// row should be rewritten to the salted form (legacy plaintext that just
/// verified correctly).
pub struct VerifyOutcome {
    pub matches: bool,
    pub needs_upgrade: bool,
}

/// Verify `provided` against `stored`, which is either `salt$hex` or a
/// legacy plaintext password.
pub fn verify_password(stored: &str, provided: &str) -> VerifyOutcome {
    match stored.split_once('$') {
        None => VerifyOutcome {
            matches: stored == provided,
            needs_upgrade: stored == provided,
        },
        Some((salt, _)) => {
            let recomputed = hash_with_salt(provided, salt);
            VerifyOutcome {
                matches: recomputed == stored,
                needs_upgrade: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_round_trips() {
        let hash = hash_password("s3cret");
        let outcome = verify_password(&hash, "s3cret");
        assert!(outcome.matches);
        assert!(!outcome.needs_upgrade);
    }

    #[test]
    fn wrong_password_fails() {
        let hash = hash_password("s3cret");
        let outcome = verify_password(&hash, "nope");
        assert!(!outcome.matches);
    }

    #[test]
    fn legacy_plaintext_verifies_and_flags_upgrade() {
        let outcome = verify_password("plaintext-pw", "plaintext-pw");
        assert!(outcome.matches);
        assert!(outcome.needs_upgrade);
    }

    #[test]
    fn legacy_plaintext_mismatch_does_not_flag_upgrade() {
        let outcome = verify_password("plaintext-pw", "other");
        assert!(!outcome.matches);
        assert!(!outcome.needs_upgrade);
    }

    #[test]
    fn same_password_different_salts_differ() {
        let a = hash_password("s3cret");
        let b = hash_password("s3cret");
        assert_ne!(a, b);
    }
}
