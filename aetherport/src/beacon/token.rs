//! The beacon registration token.
//!
//! A master proves it owns the ingress identity by sealing 32 random bytes to
//! the beacon's public key from its own X25519 private key. The box nonce is
//! derived from the request's `date` header (little-endian Unix seconds in the
//! first 8 of 24 bytes), which also bounds how long a captured token stays
//! usable.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use crypto_box::{
    aead::Aead,
    Nonce, PublicKey, SalsaBox, SecretKey,
};
use rand::RngCore;

use crate::Error;

/// Maximum tolerated difference between the `date` header and the beacon's
/// clock.
pub const MAX_DATE_SKEW_SECONDS: i64 = 5;

/// Seals a registration token for the given `date`.
pub fn seal_token(private_key: &[u8], beacon_public: &[u8; 32], date: DateTime<Utc>) -> Result<String, Error> {
    let key: [u8; 32] = private_key
        .try_into()
        .map_err(|_| Error::CryptoMaterialInvalid("x25519 private key must be 32 bytes".to_string()))?;
    let sealer = SalsaBox::new(&PublicKey::from(*beacon_public), &SecretKey::from(key));

    let mut blob = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut blob);

    let sealed = sealer
        .encrypt(&nonce_for(date), blob.as_slice())
        .map_err(|_| Error::CryptoMaterialInvalid("sealing beacon token failed".to_string()))?;

    Ok(URL_SAFE_NO_PAD.encode(sealed))
}

/// Opens a registration token allegedly sealed by `peer_public` at `date`.
pub fn open_token(beacon_secret: &SecretKey, peer_public: &[u8; 32], date: DateTime<Utc>, token: &str) -> bool {
    let sealed = match URL_SAFE_NO_PAD.decode(token) {
        Ok(sealed) => sealed,
        Err(_) => return false,
    };

    let opener = SalsaBox::new(&PublicKey::from(*peer_public), beacon_secret);
    opener.decrypt(&nonce_for(date), sealed.as_slice()).is_ok()
}

fn nonce_for(date: DateTime<Utc>) -> Nonce {
    let mut nonce = [0u8; 24];
    nonce[..8].copy_from_slice(&(date.timestamp() as u64).to_le_bytes());
    Nonce::from(nonce)
}

pub fn skew_ok(now: DateTime<Utc>, date: DateTime<Utc>) -> bool {
    (now - date).abs() <= chrono::Duration::seconds(MAX_DATE_SKEW_SECONDS)
}

pub fn format_http_date(date: DateTime<Utc>) -> String {
    date.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

pub fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(s).ok().map(|date| date.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use crypto_box::SecretKey;

    use super::{format_http_date, open_token, parse_http_date, seal_token, skew_ok};

    fn keypair() -> ([u8; 32], [u8; 32]) {
        let secret = SecretKey::generate(&mut rand::rngs::OsRng);
        (secret.to_bytes(), *secret.public_key().as_bytes())
    }

    #[test]
    fn sealed_tokens_open_with_the_matching_keys_and_date() {
        let (ingress_secret, ingress_public) = keypair();
        let beacon_secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let beacon_public = *beacon_secret.public_key().as_bytes();

        let date = Utc::now();
        let token = seal_token(&ingress_secret, &beacon_public, date).unwrap();

        assert!(open_token(&beacon_secret, &ingress_public, date, &token));
    }

    #[test]
    fn a_shifted_date_breaks_the_nonce() {
        let (ingress_secret, ingress_public) = keypair();
        let beacon_secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let beacon_public = *beacon_secret.public_key().as_bytes();

        let date = Utc::now();
        let token = seal_token(&ingress_secret, &beacon_public, date).unwrap();

        assert!(!open_token(&beacon_secret, &ingress_public, date + Duration::seconds(10), &token));
    }

    #[test]
    fn foreign_keys_do_not_open_the_token() {
        let (ingress_secret, _) = keypair();
        let (_, other_public) = keypair();
        let beacon_secret = SecretKey::generate(&mut rand::rngs::OsRng);
        let beacon_public = *beacon_secret.public_key().as_bytes();

        let date = Utc::now();
        let token = seal_token(&ingress_secret, &beacon_public, date).unwrap();

        assert!(!open_token(&beacon_secret, &other_public, date, &token));
        assert!(!open_token(&beacon_secret, &other_public, date, "@@not-base64@@"));
    }

    #[test]
    fn skew_is_bounded_to_five_seconds() {
        let now = Utc::now();
        assert!(skew_ok(now, now));
        assert!(skew_ok(now, now - Duration::seconds(5)));
        assert!(skew_ok(now, now + Duration::seconds(5)));
        assert!(!skew_ok(now, now - Duration::seconds(10)));
        assert!(!skew_ok(now, now + Duration::seconds(10)));
    }

    #[test]
    fn http_dates_round_trip() {
        let now = Utc::now();
        let parsed = parse_http_date(&format_http_date(now)).unwrap();
        assert_eq!(parsed.timestamp(), now.timestamp());
    }
}
