use std::fmt;

use chrono::{DateTime, Duration, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use prost::Message;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{CaPool, Error, Label, ED25519_PRIVATE_KEY_LEN, KEY_LEN};

/// The signed part of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateDetails {
    /// Domain-style name, validated against IDNA2008 lookup rules.
    pub name: String,
    /// Ordered `key=value` pairs. Order is preserved across the wire.
    pub labels: Vec<Label>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// Ed25519 public key for CAs, X25519 public key for leaves. Always 32 bytes.
    pub public_key: Vec<u8>,
    pub is_ca: bool,
    /// Lowercase hex fingerprint of the signing CA, empty when self-signed.
    pub issuer: String,
}

/// A certificate: signed details plus the Ed25519 signature over their
/// canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    pub details: CertificateDetails,
    pub signature: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct RawCertificateDetails {
    #[prost(string, tag = "1")]
    name: String,
    #[prost(string, repeated, tag = "2")]
    labels: Vec<String>,
    #[prost(int64, tag = "3")]
    not_before: i64,
    #[prost(int64, tag = "4")]
    not_after: i64,
    #[prost(bytes = "vec", tag = "5")]
    public_key: Vec<u8>,
    #[prost(bool, tag = "6")]
    is_ca: bool,
    #[prost(bytes = "vec", tag = "7")]
    issuer: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
struct RawCertificate {
    #[prost(message, optional, tag = "1")]
    details: Option<RawCertificateDetails>,
    #[prost(bytes = "vec", tag = "2")]
    signature: Vec<u8>,
}

impl Certificate {
    /// Parses a certificate from its binary serialization.
    pub fn unmarshal(b: &[u8]) -> Result<Certificate, Error> {
        if b.is_empty() {
            return Err(Error::Decode("empty input".to_string()));
        }

        let raw = RawCertificate::decode(b).map_err(|error| Error::Decode(error.to_string()))?;
        let details = match raw.details {
            Some(details) => details,
            None => return Err(Error::Decode("the certificate does not contain any details".to_string())),
        };

        let mut labels = Vec::with_capacity(details.labels.len());
        for label in &details.labels {
            labels.push(label.parse::<Label>()?);
        }

        if details.public_key.len() != KEY_LEN {
            return Err(Error::PublicKeyLength(details.public_key.len()));
        }

        check_name(&details.name)?;

        Ok(Certificate {
            details: CertificateDetails {
                name: details.name,
                labels,
                not_before: DateTime::from_timestamp_nanos(details.not_before),
                not_after: DateTime::from_timestamp_nanos(details.not_after),
                public_key: details.public_key,
                is_ca: details.is_ca,
                issuer: hex::encode(details.issuer),
            },
            signature: raw.signature,
        })
    }

    /// Serializes the full certificate, signature included.
    pub fn marshal(&self) -> Result<Vec<u8>, Error> {
        let raw = RawCertificate {
            details: Some(self.details_raw()?),
            signature: self.signature.clone(),
        };
        Ok(raw.encode_to_vec())
    }

    fn details_raw(&self) -> Result<RawCertificateDetails, Error> {
        check_name(&self.details.name)?;
        let issuer = hex::decode(&self.details.issuer)
            .map_err(|error| Error::Encode(format!("invalid issuer ({}): {error}", self.details.issuer)))?;

        Ok(RawCertificateDetails {
            name: self.details.name.clone(),
            labels: self.details.labels.iter().map(Label::to_string).collect(),
            not_before: timestamp_nanos(self.details.not_before)?,
            not_after: timestamp_nanos(self.details.not_after)?,
            public_key: self.details.public_key.clone(),
            is_ca: self.details.is_ca,
            issuer,
        })
    }

    /// The canonical serialization of the details record, the exact bytes the
    /// signature covers.
    fn details_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(self.details_raw()?.encode_to_vec())
    }

    /// Lowercase hex SHA-256 over the canonical full-certificate serialization.
    pub fn sha256_sum(&self) -> Result<String, Error> {
        Ok(hex::encode(Sha256::digest(self.marshal()?)))
    }

    /// Signs the certificate with an Ed25519 keypair (64 bytes). When `signer`
    /// is given, the issuer field is set to its fingerprint first; otherwise
    /// the certificate is left self-signed.
    pub fn sign(&mut self, key: &[u8], signer: Option<&Certificate>) -> Result<(), Error> {
        if let Some(signer) = signer {
            self.details.issuer = signer.sha256_sum()?;
        }

        let key: &[u8; ED25519_PRIVATE_KEY_LEN] = key
            .try_into()
            .map_err(|_| Error::InvalidKeyMaterial(format!("signing key was {} bytes, expected 64", key.len())))?;
        let key = SigningKey::from_keypair_bytes(key).map_err(|error| Error::InvalidKeyMaterial(error.to_string()))?;

        self.signature = key.sign(&self.details_bytes()?).to_bytes().to_vec();
        Ok(())
    }

    /// Returns whether the signature verifies under the given Ed25519 public key.
    pub fn check_signature(&self, key: &[u8]) -> bool {
        let key: &[u8; KEY_LEN] = match key.try_into() {
            Ok(key) => key,
            Err(_) => return false,
        };
        let key = match VerifyingKey::from_bytes(key) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let signature = match Signature::from_slice(&self.signature) {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        let details = match self.details_bytes() {
            Ok(details) => details,
            Err(_) => return false,
        };

        key.verify(&details, &signature).is_ok()
    }

    /// Verifies the certificate against a CA pool at instant `t`.
    pub fn verify(&self, t: DateTime<Utc>, pool: &CaPool) -> Result<(), Error> {
        if pool.is_blocklisted(self) {
            return Err(Error::Blocklisted);
        }

        let signer = pool.resolve_issuer(self)?;

        if signer.expired(t) {
            return Err(Error::Expired);
        }
        if self.expired(t) {
            return Err(Error::Expired);
        }

        if !self.check_signature(&signer.details.public_key) {
            return Err(Error::SignatureMismatch);
        }

        self.check_containment(signer)?;
        Ok(())
    }

    /// Fails unless this certificate's validity window fits inside the signer's.
    pub fn check_containment(&self, signer: &Certificate) -> Result<(), Error> {
        if self.details.not_after > signer.details.not_after || self.details.not_before < signer.details.not_before {
            return Err(Error::DateContainment);
        }
        Ok(())
    }

    pub fn expired(&self, t: DateTime<Utc>) -> bool {
        self.details.not_before > t || self.details.not_after < t
    }

    /// Checks that `key` is the private half of the certificate's public key:
    /// a 64-byte Ed25519 keypair for CAs, a 32-byte X25519 secret for leaves.
    pub fn verify_private_key(&self, key: &[u8]) -> Result<(), Error> {
        match self.details.is_ca {
            true => {
                let key: &[u8; ED25519_PRIVATE_KEY_LEN] = key.try_into().map_err(|_| {
                    Error::InvalidKeyMaterial(format!("key was {} bytes, not a valid ed25519 private key", key.len()))
                })?;
                let key = SigningKey::from_keypair_bytes(key).map_err(|error| Error::InvalidKeyMaterial(error.to_string()))?;

                if key.verifying_key().as_bytes() != self.details.public_key.as_slice() {
                    return Err(Error::InvalidKeyMaterial(
                        "public key in certificate and private key supplied don't match".to_string(),
                    ));
                }
            }
            false => {
                let key: [u8; KEY_LEN] = key.try_into().map_err(|_| {
                    Error::InvalidKeyMaterial(format!("key was {} bytes, not a valid x25519 private key", key.len()))
                })?;
                let public = PublicKey::from(&StaticSecret::from(key));

                if public.as_bytes() != self.details.public_key.as_slice() {
                    return Err(Error::InvalidKeyMaterial(
                        "public key in certificate and private key supplied don't match".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.details.name)?;
        match self.details.is_ca {
            true => write!(f, "(ca)")?,
            false => write!(f, "(leaf)")?,
        }
        write!(f, " {} .. {}", self.details.not_before, self.details.not_after)
    }
}

fn check_name(name: &str) -> Result<(), Error> {
    idna::domain_to_ascii_strict(name).map_err(|error| Error::Idna(format!("{error:?}")))?;
    Ok(())
}

fn timestamp_nanos(t: DateTime<Utc>) -> Result<i64, Error> {
    t.timestamp_nanos_opt()
        .ok_or_else(|| Error::Encode(format!("timestamp out of range: {t}")))
}

/// Generates a self-signed Ed25519 CA certificate valid for `duration` from
/// `now`. Returns the 64-byte keypair and the certificate.
pub fn generate_ca(
    name: &str,
    labels: Vec<Label>,
    now: DateTime<Utc>,
    duration: Duration,
) -> Result<(Vec<u8>, Certificate), Error> {
    let key = SigningKey::generate(&mut OsRng);

    let mut cert = Certificate {
        details: CertificateDetails {
            name: name.to_string(),
            labels,
            not_before: now,
            not_after: now + duration,
            public_key: key.verifying_key().as_bytes().to_vec(),
            is_ca: true,
            issuer: String::new(),
        },
        signature: Vec::new(),
    };
    cert.sign(&key.to_keypair_bytes(), None)?;

    Ok((key.to_keypair_bytes().to_vec(), cert))
}

/// Generates an X25519 leaf certificate signed by the given CA, valid for
/// `duration` from `now`. Returns the 32-byte secret and the certificate.
pub fn generate_leaf(
    name: &str,
    labels: Vec<Label>,
    now: DateTime<Utc>,
    duration: Duration,
    ca_key: &[u8],
    ca_cert: &Certificate,
) -> Result<(Vec<u8>, Certificate), Error> {
    let secret = StaticSecret::random_from_rng(OsRng);

    let mut cert = Certificate {
        details: CertificateDetails {
            name: name.to_string(),
            labels,
            not_before: now,
            not_after: now + duration,
            public_key: PublicKey::from(&secret).as_bytes().to_vec(),
            is_ca: false,
            issuer: String::new(),
        },
        signature: Vec::new(),
    };
    cert.sign(ca_key, Some(ca_cert))?;

    Ok((secret.to_bytes().to_vec(), cert))
}

/// Re-signs an existing certificate with a fresh validity window, keeping its
/// key. Produces a new certificate; the input is left untouched.
pub fn re_sign(
    cert: &Certificate,
    now: DateTime<Utc>,
    duration: Option<Duration>,
    ca_key: &[u8],
    ca_cert: &Certificate,
) -> Result<Certificate, Error> {
    let duration = duration.unwrap_or(cert.details.not_after - cert.details.not_before);

    let mut cert = cert.clone();
    cert.details.not_before = now;
    cert.details.not_after = now + duration;
    cert.sign(ca_key, Some(ca_cert))?;

    Ok(cert)
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use crate::{generate_ca, generate_leaf, re_sign, CaPool, Certificate, Error, Label};

    fn now() -> chrono::DateTime<Utc> {
        // Certificate timestamps travel as whole nanoseconds; truncation keeps
        // equality assertions exact.
        chrono::DateTime::from_timestamp_nanos(Utc::now().timestamp_nanos_opt().unwrap())
    }

    #[test]
    fn marshal_round_trips_structurally() {
        let t = now();
        let (_, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();

        let parsed = Certificate::unmarshal(&ca.marshal().unwrap()).unwrap();
        assert_eq!(ca, parsed);
    }

    #[test]
    fn labels_keep_their_order() {
        let t = now();
        let labels = vec![Label::new("b", "2"), Label::new("a", "1"), Label::new("a", "0")];
        let (_, ca) = generate_ca("aetherport.ca", labels.clone(), t, Duration::hours(1)).unwrap();

        let parsed = Certificate::unmarshal(&ca.marshal().unwrap()).unwrap();
        assert_eq!(parsed.details.labels, labels);
    }

    #[test]
    fn sha256_sum_is_stable() {
        let t = now();
        let (_, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();

        let parsed = Certificate::unmarshal(&ca.marshal().unwrap()).unwrap();
        assert_eq!(ca.sha256_sum().unwrap(), parsed.sha256_sum().unwrap());
    }

    #[test]
    fn sign_and_verify_within_ca_window() {
        let t = now();
        let (ca_key, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        let (_, leaf) = generate_leaf("alpha", Vec::new(), t, Duration::minutes(30), &ca_key, &ca).unwrap();

        let mut pool = CaPool::new();
        pool.add(ca).unwrap();

        leaf.verify(t, &pool).unwrap();
        assert_eq!(leaf.verify(t + Duration::hours(2), &pool), Err(Error::Expired));
    }

    #[test]
    fn verify_rejects_dates_outside_the_signer_window() {
        let t = now();
        let (ca_key, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        let (_, leaf) = generate_leaf("alpha", Vec::new(), t, Duration::hours(2), &ca_key, &ca).unwrap();

        let mut pool = CaPool::new();
        pool.add(ca).unwrap();

        assert_eq!(leaf.verify(t, &pool), Err(Error::DateContainment));
    }

    #[test]
    fn verify_rejects_a_foreign_signature() {
        let t = now();
        let (ca_key, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        let (other_key, _) = generate_ca("other.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        let (_, mut leaf) = generate_leaf("alpha", Vec::new(), t, Duration::minutes(30), &ca_key, &ca).unwrap();

        // Forge: re-sign the details with an unrelated key, keeping the issuer.
        leaf.sign(&other_key, None).unwrap();

        let mut pool = CaPool::new();
        pool.add(ca).unwrap();
        assert_eq!(leaf.verify(t, &pool), Err(Error::SignatureMismatch));
    }

    #[test]
    fn unmarshal_rejects_bad_material() {
        assert!(matches!(Certificate::unmarshal(&[]), Err(Error::Decode(_))));
        assert!(Certificate::unmarshal(&[0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn unmarshal_rejects_short_public_keys() {
        let t = now();
        let (_, mut ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        ca.details.public_key.truncate(16);

        let b = ca.marshal().unwrap();
        assert_eq!(Certificate::unmarshal(&b), Err(Error::PublicKeyLength(16)));
    }

    #[test]
    fn verify_private_key_matches_only_its_own_certificate() {
        let t = now();
        let (ca_key, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(1)).unwrap();
        let (leaf_key, leaf) = generate_leaf("alpha", Vec::new(), t, Duration::minutes(30), &ca_key, &ca).unwrap();
        let (other_key, _) = generate_leaf("beta", Vec::new(), t, Duration::minutes(30), &ca_key, &ca).unwrap();

        ca.verify_private_key(&ca_key).unwrap();
        leaf.verify_private_key(&leaf_key).unwrap();
        assert!(leaf.verify_private_key(&other_key).is_err());
        assert!(leaf.verify_private_key(&ca_key).is_err());
    }

    #[test]
    fn re_sign_produces_a_fresh_window_with_the_same_key() {
        let t = now();
        let (ca_key, ca) = generate_ca("aetherport.ca", Vec::new(), t, Duration::hours(10)).unwrap();
        let (_, leaf) = generate_leaf("alpha", Vec::new(), t, Duration::minutes(30), &ca_key, &ca).unwrap();

        let later = t + Duration::hours(1);
        let renewed = re_sign(&leaf, later, None, &ca_key, &ca).unwrap();

        assert_eq!(renewed.details.public_key, leaf.details.public_key);
        assert_eq!(renewed.details.not_before, later);
        assert_eq!(renewed.details.not_after, later + Duration::minutes(30));
        assert_ne!(renewed.signature, leaf.signature);
    }
}
