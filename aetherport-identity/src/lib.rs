//! Certificate format, CA pool and identity material for aetherport.
//!
//! Peers prove who they are with a compact binary certificate: a `details`
//! record (name, labels, validity window, public key, CA flag, issuer
//! fingerprint) plus an Ed25519 signature over the canonical serialization of
//! that record. Certificate authorities are self-signed Ed25519 certificates;
//! leaves carry X25519 keys and are signed by a CA. A [`CaPool`] indexes the
//! trusted CAs by their SHA-256 fingerprint, and an [`Identity`] binds a
//! private key to a certificate and derives the pre-shared keys used to guard
//! the session handshake.

mod certificate;
mod error;
mod identity;
mod label;
mod pem;
mod pool;

pub use certificate::{generate_ca, generate_leaf, re_sign, Certificate, CertificateDetails};
pub use error::Error;
pub use identity::Identity;
pub use label::Label;
pub use pem::{
    certificate_from_pem, certificate_to_pem, ed25519_private_key_from_pem, ed25519_private_key_to_pem,
    ed25519_public_key_from_pem, ed25519_public_key_to_pem, x25519_private_key_from_pem, x25519_private_key_to_pem,
    x25519_public_key_from_pem, x25519_public_key_to_pem, CERTIFICATE_BANNER, ED25519_PRIVATE_KEY_BANNER,
    ED25519_PUBLIC_KEY_BANNER, X25519_PRIVATE_KEY_BANNER, X25519_PUBLIC_KEY_BANNER,
};
pub use pool::CaPool;

/// Length in bytes of an X25519 key and of an Ed25519 public key.
pub const KEY_LEN: usize = 32;

/// Length in bytes of an Ed25519 private key (seed followed by public half).
pub const ED25519_PRIVATE_KEY_LEN: usize = 64;
