use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

/// Freshly minted reset token. `raw` goes to the user, only `hash` is stored.
#[derive(Debug, Clone)]
pub struct ResetToken {
    pub raw: String,
    pub hash: String,
    pub expires_at: OffsetDateTime,
}

pub fn hash_reset_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

pub fn create_password_reset_token(now: OffsetDateTime, ttl: Duration) -> ResetToken {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let raw = hex::encode(bytes);
    let hash = hash_reset_token(&raw);
    ResetToken {
        raw,
        hash,
        expires_at: now + ttl,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stored_hash_matches_raw_token_digest() {
        let now = OffsetDateTime::now_utc();
        let token = create_password_reset_token(now, Duration::minutes(10));
        assert_eq!(token.raw.len(), 64);
        assert_ne!(token.raw, token.hash);
        assert_eq!(hash_reset_token(&token.raw), token.hash);
        assert_eq!(token.expires_at, now + Duration::minutes(10));
    }

    #[test]
    fn tokens_are_unique() {
        let now = OffsetDateTime::now_utc();
        let a = create_password_reset_token(now, Duration::minutes(10));
        let b = create_password_reset_token(now, Duration::minutes(10));
        assert_ne!(a.raw, b.raw);
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            hash_reset_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
