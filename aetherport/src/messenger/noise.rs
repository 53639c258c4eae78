use std::future::Future;

use aetherport_identity::{Certificate, Identity};
use snow::{Builder, HandshakeState, StatelessTransportState};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{messenger::Messenger, Error};

/// Noise IX with a pre-shared key mixed in before any DH.
const PATTERN: &str = "Noise_IXpsk0_25519_ChaChaPoly_SHA256";

/// Noise bounds a single message, handshake or transport, to 64 KiB.
const MAX_MESSAGE: usize = 65_535;

/// Authenticated encryption over any [`Messenger`].
///
/// A two-message IX handshake carries each party's full certificate as its
/// payload, guarded by a pre-shared key derived from the CA chain (see
/// [`Identity::preshared_keys`]). The initiator leads with the key of its own
/// CA; the responder, which cannot know which CA signed the initiator, tries
/// every key it holds and keeps the first that authenticates. After the
/// handshake every message is one AEAD record; the wrapped messenger provides
/// the length delimitation.
pub struct NoiseMessenger<M> {
    inner: M,
    transport: StatelessTransportState,
    send_nonce: Mutex<u64>,
    recv_nonce: Mutex<u64>,
    peer_cert: Certificate,
}

impl<M: Messenger> NoiseMessenger<M> {
    /// Runs the initiator side of the handshake.
    pub async fn initiate(inner: M, identity: &Identity) -> Result<NoiseMessenger<M>, Error> {
        let psk = identity
            .preshared_keys()
            .first()
            .ok_or_else(|| Error::ConfigInvalid("identity has no pre-shared keys".to_string()))?;
        let mut handshake = builder(identity, psk)?
            .build_initiator()
            .map_err(|error| Error::HandshakeFailed(format!("create handshake failed: {error}")))?;

        let mut buf = vec![0u8; MAX_MESSAGE];
        let len = handshake
            .write_message(identity.payload(), &mut buf)
            .map_err(|error| Error::HandshakeFailed(format!("write handshake message failed: {error}")))?;
        inner.send(&buf[..len]).await?;

        let msg = inner.recv().await?;
        let mut payload = vec![0u8; MAX_MESSAGE];
        let len = handshake
            .read_message(&msg, &mut payload)
            .map_err(|error| Error::HandshakeFailed(format!("read handshake message failed: {error}")))?;
        let peer_cert = identity.validate_peer(&payload[..len]).map_err(Error::HandshakePayloadInvalid)?;

        NoiseMessenger::finish(inner, handshake, peer_cert)
    }

    /// Runs the responder side of the handshake, trying each pre-shared key
    /// against the initiator's first message and stopping at the first one
    /// that authenticates.
    pub async fn respond(inner: M, identity: &Identity) -> Result<NoiseMessenger<M>, Error> {
        let msg = inner.recv().await?;

        let mut accepted = None;
        for psk in identity.preshared_keys() {
            let mut handshake = builder(identity, psk)?
                .build_responder()
                .map_err(|error| Error::HandshakeFailed(format!("create handshake failed: {error}")))?;

            let mut payload = vec![0u8; MAX_MESSAGE];
            match handshake.read_message(&msg, &mut payload) {
                Ok(len) => {
                    accepted = Some((handshake, payload[..len].to_vec()));
                    break;
                }
                Err(error) => debug!("pre-shared key did not authenticate the initiator: {error}"),
            }
        }

        let (mut handshake, payload) = accepted.ok_or(Error::HandshakePskMismatch)?;
        let peer_cert = identity.validate_peer(&payload).map_err(Error::HandshakePayloadInvalid)?;

        let mut buf = vec![0u8; MAX_MESSAGE];
        let len = handshake
            .write_message(identity.payload(), &mut buf)
            .map_err(|error| Error::HandshakeFailed(format!("write handshake message failed: {error}")))?;
        inner.send(&buf[..len]).await?;

        NoiseMessenger::finish(inner, handshake, peer_cert)
    }

    fn finish(inner: M, handshake: HandshakeState, peer_cert: Certificate) -> Result<NoiseMessenger<M>, Error> {
        let transport = handshake
            .into_stateless_transport_mode()
            .map_err(|error| Error::HandshakeFailed(format!("no cipher states at the end of handshake: {error}")))?;

        Ok(NoiseMessenger {
            inner,
            transport,
            send_nonce: Mutex::new(0),
            recv_nonce: Mutex::new(0),
            peer_cert,
        })
    }

    /// The peer's certificate, validated during the handshake.
    pub fn peer_certificate(&self) -> &Certificate {
        &self.peer_cert
    }
}

fn builder<'a>(identity: &'a Identity, psk: &'a [u8]) -> Result<Builder<'a>, Error> {
    let params = PATTERN
        .parse()
        .map_err(|_| Error::CryptoMaterialInvalid(format!("invalid noise pattern: {PATTERN}")))?;

    Ok(Builder::new(params).local_private_key(identity.private_key()).psk(0, psk))
}

impl<M: Messenger> Messenger for NoiseMessenger<M> {
    fn recv(&self) -> impl Future<Output = Result<Vec<u8>, Error>> + Send {
        async {
            let mut nonce = self.recv_nonce.lock().await;
            let msg = self.inner.recv().await?;

            let mut buf = vec![0u8; msg.len()];
            let len = self
                .transport
                .read_message(*nonce, &msg, &mut buf)
                .map_err(|error| Error::TransportFailed(format!("decrypting record failed: {error}")))?;
            *nonce += 1;

            buf.truncate(len);
            Ok(buf)
        }
    }

    fn send(&self, msg: &[u8]) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let mut nonce = self.send_nonce.lock().await;

            let mut buf = vec![0u8; msg.len() + 16];
            let len = self
                .transport
                .write_message(*nonce, msg, &mut buf)
                .map_err(|error| Error::TransportFailed(format!("encrypting record failed: {error}")))?;

            self.inner.send(&buf[..len]).await?;
            *nonce += 1;
            Ok(())
        }
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use aetherport_identity::{generate_ca, generate_leaf, CaPool, Identity};
    use chrono::{Duration, Utc};

    use super::NoiseMessenger;
    use crate::{
        messenger::{ChunkedMessenger, Messenger},
        Error,
    };

    fn identity(name: &str, extra_cas: usize) -> Identity {
        let now = Utc::now();
        let (ca_key, ca) = generate_ca(&format!("{name}.ca"), Vec::new(), now, Duration::hours(1)).unwrap();
        let (leaf_key, leaf) = generate_leaf(name, Vec::new(), now, Duration::minutes(30), &ca_key, &ca).unwrap();

        let mut pool = CaPool::new();
        pool.add(ca).unwrap();
        for i in 0..extra_cas {
            let (_, other) = generate_ca(&format!("extra{i}.{name}.ca"), Vec::new(), now, Duration::hours(1)).unwrap();
            pool.add(other).unwrap();
        }

        Identity::new(leaf_key, leaf, Arc::new(pool)).unwrap()
    }

    fn shared_ca_identities() -> (Identity, Identity) {
        let now = Utc::now();
        let (ca_key, ca) = generate_ca("shared.ca", Vec::new(), now, Duration::hours(1)).unwrap();
        let (alpha_key, alpha) = generate_leaf("alpha", Vec::new(), now, Duration::minutes(30), &ca_key, &ca).unwrap();
        let (beta_key, beta) = generate_leaf("beta", Vec::new(), now, Duration::minutes(30), &ca_key, &ca).unwrap();

        let mut pool_a = CaPool::new();
        pool_a.add(ca.clone()).unwrap();
        let mut pool_b = CaPool::new();
        pool_b.add(ca).unwrap();

        (
            Identity::new(alpha_key, alpha, Arc::new(pool_a)).unwrap(),
            Identity::new(beta_key, beta, Arc::new(pool_b)).unwrap(),
        )
    }

    #[tokio::test]
    async fn peers_sharing_a_ca_complete_the_handshake() {
        let (alpha, beta) = shared_ca_identities();
        let (near, far) = tokio::io::duplex(1024 * 1024);

        let (initiator, responder) = tokio::join!(
            NoiseMessenger::initiate(ChunkedMessenger::new(near), &alpha),
            NoiseMessenger::respond(ChunkedMessenger::new(far), &beta),
        );
        let (initiator, responder) = (initiator.unwrap(), responder.unwrap());

        assert_eq!(initiator.peer_certificate().details.name, "beta");
        assert_eq!(responder.peer_certificate().details.name, "alpha");

        initiator.send(b"up the wire").await.unwrap();
        assert_eq!(responder.recv().await.unwrap(), b"up the wire");
        responder.send(b"and back").await.unwrap();
        assert_eq!(initiator.recv().await.unwrap(), b"and back");
    }

    #[tokio::test]
    async fn responder_finds_the_psk_among_many() {
        let now = Utc::now();
        let (ca_key, ca) = generate_ca("shared.ca", Vec::new(), now, Duration::hours(1)).unwrap();
        let (alpha_key, alpha) = generate_leaf("alpha", Vec::new(), now, Duration::minutes(30), &ca_key, &ca).unwrap();
        let (beta_key, beta) = generate_leaf("beta", Vec::new(), now, Duration::minutes(30), &ca_key, &ca).unwrap();

        let mut pool_a = CaPool::new();
        pool_a.add(ca.clone()).unwrap();
        let alpha = Identity::new(alpha_key, alpha, Arc::new(pool_a)).unwrap();

        // The responder trusts several CAs; only one of them matches the
        // initiator's, and it is not the responder's own (so not first).
        let (other_key, other) = generate_ca("other.ca", Vec::new(), now, Duration::hours(1)).unwrap();
        let (gamma_key, gamma) = generate_leaf("gamma", Vec::new(), now, Duration::minutes(30), &other_key, &other).unwrap();
        let mut pool_b = CaPool::new();
        pool_b.add(other).unwrap();
        pool_b.add(ca).unwrap();
        let beta = Identity::new(gamma_key, gamma, Arc::new(pool_b)).unwrap();
        let _ = beta_key;
        let _ = beta;

        let (near, far) = tokio::io::duplex(1024 * 1024);
        let (initiator, responder) = tokio::join!(
            NoiseMessenger::initiate(ChunkedMessenger::new(near), &alpha),
            NoiseMessenger::respond(ChunkedMessenger::new(far), &beta),
        );

        // The handshake's key search succeeds, but alpha's certificate chains
        // to a CA the responder knows while gamma's CA is unknown to alpha.
        let responder = responder.unwrap();
        assert_eq!(responder.peer_certificate().details.name, "alpha");
        assert!(matches!(initiator, Err(Error::HandshakePayloadInvalid(_))));
    }

    #[tokio::test]
    async fn unrelated_authorities_fail_with_a_psk_mismatch() {
        let alpha = identity("alpha", 2);
        let beta = identity("beta", 2);

        let (near, far) = tokio::io::duplex(1024 * 1024);
        let (initiator, responder) = tokio::join!(
            NoiseMessenger::initiate(ChunkedMessenger::new(near), &alpha),
            NoiseMessenger::respond(ChunkedMessenger::new(far), &beta),
        );

        assert!(matches!(responder, Err(Error::HandshakePskMismatch)));
        assert!(initiator.is_err());
    }

    /// Flips one byte of every received message after letting `skip` messages
    /// through untouched.
    struct Tamper<M> {
        inner: M,
        skip: usize,
        seen: AtomicUsize,
    }

    impl<M: Messenger> Messenger for Tamper<M> {
        async fn recv(&self) -> Result<Vec<u8>, Error> {
            let mut msg = self.inner.recv().await?;
            if self.seen.fetch_add(1, Ordering::Relaxed) >= self.skip {
                if let Some(byte) = msg.last_mut() {
                    *byte ^= 0x01;
                }
            }
            Ok(msg)
        }

        async fn send(&self, msg: &[u8]) -> Result<(), Error> {
            self.inner.send(msg).await
        }

        async fn close(&self) -> Result<(), Error> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn tampered_records_are_rejected() {
        let (alpha, beta) = shared_ca_identities();
        let (near, far) = tokio::io::duplex(1024 * 1024);

        let tampered = Tamper {
            inner: ChunkedMessenger::new(far),
            skip: 1, // let the handshake message through
            seen: AtomicUsize::new(0),
        };

        let (initiator, responder) = tokio::join!(
            NoiseMessenger::initiate(ChunkedMessenger::new(near), &alpha),
            NoiseMessenger::respond(tampered, &beta),
        );
        let (initiator, responder) = (initiator.unwrap(), responder.unwrap());

        initiator.send(b"integrity matters").await.unwrap();
        assert!(matches!(responder.recv().await, Err(Error::TransportFailed(_))));
    }
}
