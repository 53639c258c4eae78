use std::{fmt, sync::Arc};

use chrono::Utc;
use hkdf::Hkdf;
use sha2::Sha256;

use crate::{CaPool, Certificate, Error};

/// A node's identity: its private key, its certificate, the pool of CAs it
/// trusts, and material derived from all three.
///
/// The pre-shared keys guard the session handshake: one is derived per trusted
/// CA (HKDF-SHA256 over the CA's signature), with the key for the identity's
/// own CA placed first so initiators lead with it. The payload is the
/// marshalled certificate, sent to the peer inside the handshake.
///
/// The private key lives here and nowhere else; it is not printed by the
/// [`fmt::Debug`] impl and never serialized.
pub struct Identity {
    key: Vec<u8>,
    cert: Certificate,
    pool: Arc<CaPool>,
    psks: Vec<[u8; 32]>,
    payload: Vec<u8>,
}

impl Identity {
    /// Binds a private key and certificate to a CA pool. The certificate's own
    /// CA must be present in the pool.
    pub fn new(key: Vec<u8>, cert: Certificate, pool: Arc<CaPool>) -> Result<Identity, Error> {
        let payload = cert.marshal()?;
        let psks = derive_preshared_keys(&cert, &pool)?;

        Ok(Identity {
            key,
            cert,
            pool,
            psks,
            payload,
        })
    }

    /// The derived pre-shared keys, the identity's own CA first.
    pub fn preshared_keys(&self) -> &[[u8; 32]] {
        &self.psks
    }

    /// The marshalled certificate, used as the handshake payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn private_key(&self) -> &[u8] {
        &self.key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.cert
    }

    pub fn ca_pool(&self) -> &Arc<CaPool> {
        &self.pool
    }

    /// Unmarshals a peer's handshake payload and verifies the certificate
    /// against the trusted pool at the current instant.
    pub fn validate_peer(&self, payload: &[u8]) -> Result<Certificate, Error> {
        let cert = Certificate::unmarshal(payload)?;
        cert.verify(Utc::now(), &self.pool)?;
        Ok(cert)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("cert", &self.cert.details.name)
            .field("cas", &self.pool.len())
            .finish_non_exhaustive()
    }
}

fn derive_preshared_keys(cert: &Certificate, pool: &CaPool) -> Result<Vec<[u8; 32]>, Error> {
    let own_ca = pool.resolve_issuer(cert)?;
    let own_fingerprint = &cert.details.issuer;

    let mut psks = Vec::with_capacity(pool.len());
    psks.push(derive_psk(own_ca));
    for (fingerprint, ca) in pool.cas() {
        if fingerprint != own_fingerprint {
            psks.push(derive_psk(ca));
        }
    }

    Ok(psks)
}

fn derive_psk(ca: &Certificate) -> [u8; 32] {
    let mut psk = [0u8; 32];
    Hkdf::<Sha256>::new(None, &ca.signature)
        .expand(&[], &mut psk)
        .expect("32 bytes is a valid HKDF-SHA256 output length");
    psk
}
