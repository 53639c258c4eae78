use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use aetherport_mux::Session as MuxSession;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::{
    data_channel::RTCDataChannel,
    peer_connection::{sdp::session_description::RTCSessionDescription, RTCPeerConnection},
};

use crate::{
    channel::open_channel_stream,
    peer::{spawn_trickle_ice, wait_gathering_complete, PeerTransport},
    proxy::{create_dummy_channel, mux_config, spawn_state_watcher, DEFAULT_SIGNAL_TIMEOUT},
    relay::relay,
    signal::Signal,
    Endpoint, Error,
};

/// The end of the tunnel that holds local listeners.
///
/// Drives the SDP offer, opens one labelled data channel per forwarded
/// endpoint, and bridges every accepted TCP connection over a multiplexer
/// stream on that endpoint's channel.
pub struct EgressProxy<S> {
    signal: Arc<S>,
    peer: PeerTransport,
    endpoints: Vec<Endpoint>,
    signal_timeout: Duration,
}

impl<S: Signal + 'static> EgressProxy<S> {
    pub fn new(signal: S, peer: PeerTransport, endpoints: Vec<Endpoint>) -> Self {
        Self {
            signal: Arc::new(signal),
            peer,
            endpoints,
            signal_timeout: DEFAULT_SIGNAL_TIMEOUT,
        }
    }

    pub fn with_signal_timeout(mut self, timeout: Duration) -> Self {
        self.signal_timeout = timeout;
        self
    }

    /// Runs the egress until the peer connection ends or `token` cancels.
    pub async fn run(&self, token: CancellationToken) -> Result<(), Error> {
        let session = token.child_token();
        let failed = Arc::new(AtomicBool::new(false));
        spawn_state_watcher(&self.peer, session.clone(), Arc::clone(&failed));

        let result = tokio::time::timeout(self.signal_timeout, self.signal_phase(&session))
            .await
            .unwrap_or(Err(Error::SignalTimeout));

        // The signal channel's job ends with the SDP/ICE phase.
        if let Err(error) = self.signal.close().await {
            debug!("egress: closing signal failed: {error}");
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

    async fn signal_phase(&self, session: &CancellationToken) -> Result<(), Error> {
        let pc = Arc::clone(self.peer.connection());

        // Candidate subscription must be in place before gathering starts.
        let candidates = match self.signal.supports_trickle() {
            true => Some(self.peer.subscribe_candidates()),
            false => None,
        };

        create_dummy_channel(&pc).await?;
        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer).await?;

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
            .ok_or_else(|| Error::TransportFailed("no local description after offer".to_string()))?;
        self.signal.send_offer(&local.sdp).await?;

        let answer = self.signal.recv_answer().await?;
        pc.set_remote_description(RTCSessionDescription::answer(answer)?).await?;

        self.start_tunnels(&pc, session).await?;

        if let Some(done) = gather_done {
            let _ = done.await;
        }
        Ok(())
    }

    async fn start_tunnels(&self, pc: &Arc<RTCPeerConnection>, session: &CancellationToken) -> Result<(), Error> {
        for endpoint in self.endpoints.iter().cloned() {
            let dc = pc.create_data_channel(&endpoint.to_string(), None).await?;
            let token = session.child_token();
            tokio::spawn(async move {
                if let Err(error) = run_tunnel(dc, &endpoint, token).await {
                    warn!("egress: tunnel {endpoint} failed: {error}");
                }
            });
        }
        Ok(())
    }
}

async fn run_tunnel(dc: Arc<RTCDataChannel>, endpoint: &Endpoint, token: CancellationToken) -> Result<(), Error> {
    let stream = open_channel_stream(dc).await?;
    let session = MuxSession::client(stream, mux_config());

    let listener = TcpListener::bind(&endpoint.local).await?;
    info!("egress: forwarding {} -> {}", endpoint.local, endpoint.remote);

    serve_listener(session, listener, token).await
}

/// Accepts TCP connections and bridges each one over a fresh mux stream.
/// Accept failures are logged and the loop keeps going; a relay failure kills
/// only its own pair.
pub(crate) async fn serve_listener(session: MuxSession, listener: TcpListener, token: CancellationToken) -> Result<(), Error> {
    loop {
        let conn = tokio::select! {
            _ = token.cancelled() => break,
            _ = session.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, addr)) => {
                    debug!("egress: new connection from {addr}");
                    conn
                }
                Err(error) => {
                    warn!("egress: accept connection error: {error}");
                    continue;
                }
            },
        };

        let stream = match session.open_stream().await {
            Ok(stream) => stream,
            Err(error) => {
                warn!("egress: open stream error: {error}");
                continue;
            }
        };

        tokio::spawn(async move {
            match relay(conn, stream).await {
                Ok((sent, received)) => debug!("egress: connection ended after {sent} bytes out, {received} bytes back"),
                Err(error) => debug!("egress: relay error: {error}"),
            }
        });
    }

    Ok(())
}
