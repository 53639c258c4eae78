use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use aetherport_mux::Session as MuxSession;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::{data_channel::RTCDataChannel, peer_connection::sdp::session_description::RTCSessionDescription};

use crate::{
    channel::open_channel_stream,
    peer::{spawn_trickle_ice, wait_gathering_complete, PeerTransport},
    proxy::{mux_config, spawn_state_watcher, DEFAULT_SIGNAL_TIMEOUT},
    relay::relay,
    signal::Signal,
    Endpoint, EndpointAuthorizer, Error,
};

/// The end of the tunnel that holds the remote services.
///
/// Answers the SDP offer, accepts labelled data channels, authorizes each
/// channel's remote address, and dials one TCP connection per multiplexer
/// stream.
pub struct IngressProxy<S> {
    signal: Arc<S>,
    peer: PeerTransport,
    authorizer: Arc<EndpointAuthorizer>,
    signal_timeout: Duration,
}

impl<S: Signal + 'static> IngressProxy<S> {
    pub fn new(signal: S, peer: PeerTransport, authorizer: EndpointAuthorizer) -> Self {
        Self {
            signal: Arc::new(signal),
            peer,
            authorizer: Arc::new(authorizer),
            signal_timeout: DEFAULT_SIGNAL_TIMEOUT,
        }
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }

    /// Runs the ingress until the peer connection ends or `token` cancels.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        let session = token.child_token();
        let failed = Arc::new(AtomicBool::new(false));
        spawn_state_watcher(&self.peer, session.clone(), Arc::clone(&failed));

        self.install_channel_listener(&session);

        let result = tokio::time::timeout(self.signal_timeout, self.signal_phase(&session))
            .await
            .unwrap_or(Err(Error::SignalTimeout));

        if let Err(error) = self.signal.close().await {
            debug!("ingress: closing signal failed: {error}");
        }
        if let Err(error) = result {
            let _ = self.peer.close().await;
            return Err(error);
        }

        session.cancelled().await;
        let _ = self.peer.close().await;

        match failed.load(Ordering::SeqCst) {
            true => Err(Error::PeerUnreachable),
            false => Ok(()),
        }
    }

    /// Every incoming labelled channel becomes one tunnel; the empty label is
    /// the SCTP placeholder and is dropped.
    fn install_channel_listener(&self, session: &CancellationToken) {
        let authorizer = Arc::clone(&self.authorizer);
        let session = session.clone();

        self.peer.connection().on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let authorizer = Arc::clone(&authorizer);
            let token = session.child_token();

            Box::pin(async move {
                if token.is_cancelled() {
                    return;
                }

                let label = dc.label().to_string();
                if label.is_empty() {
                    return;
                }

                let endpoint: Endpoint = match label.parse() {
                    Ok(endpoint) => endpoint,
                    Err(error) => {
                        warn!("ingress: got invalid endpoint ({label}): {error}");
                        let _ = dc.close().await;
                        return;
                    }
                };

                if !authorizer.allows(&endpoint) {
                    warn!("ingress: unallowed endpoint: {label}");
                    let _ = dc.close().await;
                    return;
                }

                debug!("ingress: got data channel: {label}");
                tokio::spawn(async move {
                    if let Err(error) = serve_channel(dc, endpoint, token).await {
                        warn!("ingress: tunnel failed: {error}");
                    }
                });
            })
        }));
    }

    async fn signal_phase(&self, session: &CancellationToken) -> Result<(), Error> {
        let pc = Arc::clone(self.peer.connection());

        let candidates = match self.signal.supports_trickle() {
            true => Some(self.peer.subscribe_candidates()),
            false => None,
        };

        let offer = self.signal.recv_offer().await?;
        pc.set_remote_description(RTCSessionDescription::offer(offer)?).await?;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer).await?;

        let gather_done = match candidates {
            Some(candidates) => Some(spawn_trickle_ice(
                Arc::clone(&pc),
                candidates,
                Arc::clone(&self.signal),
                session.clone(),
            )),
            None => {
                wait_gathering_complete(&pc).await;
                None
            }
        };

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::TransportFailed("no local description after answer".to_string()))?;
        self.signal.send_answer(&local.sdp).await?;

        if let Some(done) = gather_done {
            let _ = done.await;
        }
        Ok(())
    }
}

async fn serve_channel(dc: Arc<RTCDataChannel>, endpoint: Endpoint, token: CancellationToken) -> Result<(), Error> {
    let stream = open_channel_stream(dc).await?;
    let session = MuxSession::server(stream, mux_config());
    serve_streams(session, endpoint.remote, token).await
}

/// Dials the remote address once per accepted mux stream and relays. Dial
/// failures are logged and the stream is dropped; the loop keeps accepting.
pub(crate) async fn serve_streams(session: MuxSession, remote: String, token: CancellationToken) -> Result<(), Error> {
    loop {
        let stream = tokio::select! {
            _ = token.cancelled() => break,
            _ = session.closed() => break,
            accepted = session.accept_stream() => match accepted {
                Ok(stream) => stream,
                Err(_) => break,
            },
        };

        let remote = remote.clone();
        tokio::spawn(async move {
            let conn = match TcpStream::connect(&remote).await {
                Ok(conn) => conn,
                Err(error) => {
                    warn!("ingress: dial {remote} error: {error}");
                    return;
                }
            };
            debug!("ingress: dialed {remote}");

            match relay(conn, stream).await {
                Ok((sent, received)) => debug!("ingress: connection ended after {sent} bytes out, {received} bytes back"),
                Err(error) => debug!("ingress: relay error: {error}"),
            }
        });
    }

    Ok(())
}
