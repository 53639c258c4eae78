use thiserror::Error;

/// Everything that can go wrong while decoding, signing or verifying
/// certificate material.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("certificate is expired")]
    Expired,

    #[error("certificate is not a CA")]
    NotCa,

    #[error("certificate is not self-signed")]
    NotSelfSigned,

    #[error("no issuer in certificate")]
    NoIssuer,

    #[error("could not find a CA for the certificate")]
    IssuerNotFound,

    #[error("certificate signature did not match")]
    SignatureMismatch,

    #[error("certificate has been blocked")]
    Blocklisted,

    #[error("certificate validity exceeds that of the signing certificate")]
    DateContainment,

    #[error("certificate name does not comply with IDNA2008: {0}")]
    Idna(String),

    #[error("public key was {0} bytes, expected 32")]
    PublicKeyLength(usize),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("invalid certificate: {0}")]
    Decode(String),

    #[error("cannot marshal certificate: {0}")]
    Encode(String),

    #[error("invalid PEM block: {0}")]
    Pem(String),

    #[error("invalid label: {0}")]
    Label(String),
}
