use std::{
    collections::{HashMap, HashSet},
    sync::RwLock,
};

use chrono::Utc;

use crate::{pem, Certificate, Error};

/// The set of trusted certificate authorities, indexed by fingerprint, plus a
/// blocklist of individual certificate fingerprints.
///
/// The CA map is fixed once loading is done; the blocklist is append-only and
/// safe to grow while other tasks are verifying peers.
#[derive(Debug, Default)]
pub struct CaPool {
    cas: HashMap<String, Certificate>,
    blocklist: RwLock<HashSet<String>>,
}

impl CaPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads every CA block in a PEM bundle. Expired CAs are still inserted so
    /// their leaves can be named in errors; their fingerprints are returned so
    /// the caller can see the partial success.
    pub fn from_pem(pem: &[u8]) -> Result<(CaPool, Vec<String>), Error> {
        let mut pool = CaPool::new();
        let mut expired = Vec::new();

        let mut rest = pem;
        loop {
            let (cert, remaining) = pem::certificate_from_pem(rest)?;
            let fingerprint = pool.add(cert)?;
            if let Some(fingerprint) = fingerprint {
                expired.push(fingerprint);
            }

            rest = remaining;
            if std::str::from_utf8(rest).map(|s| s.trim().is_empty()).unwrap_or(false) {
                break;
            }
        }

        Ok((pool, expired))
    }

    /// Parses one CA certificate out of `pem` and inserts it, returning the
    /// remaining input and whether the CA was already expired at load time.
    pub fn add_from_pem<'a>(&mut self, pem: &'a [u8]) -> Result<(&'a [u8], bool), Error> {
        let (cert, rest) = pem::certificate_from_pem(pem)?;
        let expired = self.add(cert)?;
        Ok((rest, expired.is_some()))
    }

    /// Inserts a CA certificate. It must be a CA and self-signed. An expired
    /// certificate is inserted anyway; its fingerprint is returned so callers
    /// can surface the warning.
    pub fn add(&mut self, cert: Certificate) -> Result<Option<String>, Error> {
        if !cert.details.is_ca {
            return Err(Error::NotCa);
        }
        if !cert.check_signature(&cert.details.public_key) {
            return Err(Error::NotSelfSigned);
        }

        let fingerprint = cert.sha256_sum()?;
        let expired = cert.expired(Utc::now());
        self.cas.insert(fingerprint.clone(), cert);

        match expired {
            true => Ok(Some(fingerprint)),
            false => Ok(None),
        }
    }

    /// Adds a fingerprint to the blocklist.
    pub fn blocklist(&self, fingerprint: &str) {
        self.blocklist.write().unwrap().insert(fingerprint.to_string());
    }

    /// Whether the certificate's fingerprint is blocklisted. A certificate
    /// that cannot be hashed is treated as blocklisted.
    pub fn is_blocklisted(&self, cert: &Certificate) -> bool {
        let fingerprint = match cert.sha256_sum() {
            Ok(fingerprint) => fingerprint,
            Err(_) => return true,
        };

        self.blocklist.read().unwrap().contains(&fingerprint)
    }

    /// Finds the CA that signed the given certificate.
    pub fn resolve_issuer(&self, cert: &Certificate) -> Result<&Certificate, Error> {
        if cert.details.issuer.is_empty() {
            return Err(Error::NoIssuer);
        }

        self.cas.get(&cert.details.issuer).ok_or(Error::IssuerNotFound)
    }

    /// The trusted CAs, in no particular order.
    pub fn cas(&self) -> impl Iterator<Item = (&String, &Certificate)> {
        self.cas.iter()
    }

    pub fn len(&self) -> usize {
        self.cas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cas.is_empty()
    }
}
