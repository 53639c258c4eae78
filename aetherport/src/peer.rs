//! Thin wrapper around a WebRTC peer connection plus the ICE exchange loops.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use webrtc::{
    api::{setting_engine::SettingEngine, APIBuilder},
    ice_transport::{ice_candidate::RTCIceCandidateInit, ice_server::RTCIceServer},
    peer_connection::{configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState, RTCPeerConnection},
};

use crate::{signal::Signal, Error};

pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun:stun.l.google.com:19302", "stun:stun1.l.google.com:19302"];

/// A WebRTC peer connection configured for detached data channels.
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
}

impl PeerTransport {
    /// Builds a peer connection using the given ICE servers, falling back to
    /// public STUN when none are configured.
    pub async fn new(ice_servers: &[String]) -> Result<PeerTransport, Error> {
        let mut setting_engine = SettingEngine::default();
        setting_engine.detach_data_channels();
        let api = APIBuilder::new().with_setting_engine(setting_engine).build();

        let urls = match ice_servers.is_empty() {
            true => DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            false => ice_servers.to_vec(),
        };
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls,
                ..Default::default()
            }],
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await?;
        Ok(PeerTransport { pc: Arc::new(pc) })
    }

    pub fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    /// Streams connection state changes.
    pub fn subscribe_states(&self) -> mpsc::UnboundedReceiver<RTCPeerConnectionState> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pc.on_peer_connection_state_change(Box::new(move |state| {
            let _ = tx.send(state);
            Box::pin(async {})
        }));
        rx
    }

    /// Streams locally gathered ICE candidates as JSON-encoded candidate-init
    /// strings; `None` marks the end of gathering.
    ///
    /// Must be installed before the local description starts gathering.
    pub fn subscribe_candidates(&self) -> mpsc::UnboundedReceiver<Option<String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pc.on_ice_candidate(Box::new(move |candidate| {
            // A malformed candidate is skipped; the end-of-gathering marker
            // always goes through.
            let item = match candidate {
                Some(candidate) => match candidate.to_json().map_err(|e| e.to_string()).and_then(|init| {
                    serde_json::to_string(&init).map_err(|e| e.to_string())
                }) {
                    Ok(json) => Some(Some(json)),
                    Err(error) => {
                        warn!("encoding ICE candidate failed: {error}");
                        None
                    }
                },
                None => Some(None),
            };
            if let Some(item) = item {
                let _ = tx.send(item);
            }
            Box::pin(async {})
        }));
        rx
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.pc.close().await.map_err(Into::into)
    }
}

/// Waits until the peer connection has finished gathering ICE candidates, for
/// signals that cannot trickle.
pub async fn wait_gathering_complete(pc: &Arc<RTCPeerConnection>) {
    let mut done = pc.gathering_complete_promise().await;
    let _ = done.recv().await;
}

/// Runs both directions of a trickled ICE exchange in the background.
///
/// Outgoing candidates from `candidates` are pushed through the signal until
/// gathering completes, which fires the returned receiver. Incoming candidates
/// are applied to the peer as they arrive; candidates received before the
/// remote description is set are buffered and flushed afterwards. The incoming
/// loop ends when the signal closes or the token is cancelled.
pub fn spawn_trickle_ice<S>(
    pc: Arc<RTCPeerConnection>,
    mut candidates: mpsc::UnboundedReceiver<Option<String>>,
    signal: Arc<S>,
    token: CancellationToken,
) -> oneshot::Receiver<()>
where
    S: Signal + 'static,
{
    let (done_tx, done_rx) = oneshot::channel();

    let out_signal = Arc::clone(&signal);
    let out_token = token.clone();
    tokio::spawn(async move {
        loop {
            let candidate = tokio::select! {
                _ = out_token.cancelled() => break,
                candidate = candidates.recv() => match candidate {
                    Some(Some(candidate)) => candidate,
                    // End of gathering, or the peer connection went away.
                    Some(None) | None => break,
                },
            };

            if let Err(error) = out_signal.send_candidate(&candidate).await {
                warn!("send ICE candidate failed: {error}");
            }
        }
        let _ = done_tx.send(());
    });

    tokio::spawn(async move {
        let mut pending: Vec<String> = Vec::new();
        loop {
            let candidate = tokio::select! {
                _ = token.cancelled() => break,
                candidate = signal.recv_candidate() => match candidate {
                    Ok(candidate) => candidate,
                    Err(_) => break,
                },
            };

            pending.push(candidate);
            if pc.remote_description().await.is_none() {
                continue;
            }
            for candidate in pending.drain(..) {
                add_candidate(&pc, &candidate).await;
            }
        }
    });

    done_rx
}

async fn add_candidate(pc: &Arc<RTCPeerConnection>, candidate: &str) {
    let init: RTCIceCandidateInit = match serde_json::from_str(candidate) {
        Ok(init) => init,
        Err(error) => {
            warn!("received malformed ICE candidate: {error}");
            return;
        }
    };

    match pc.add_ice_candidate(init).await {
        Ok(()) => debug!("added remote ICE candidate"),
        Err(error) => warn!("add ICE candidate failed: {error}"),
    }
}
