//! The tunnel data plane: an egress holding local listeners and an ingress
//! dialing the remote services, bridged by labelled data channels each
//! carrying a multiplexer session.

mod egress;
mod ingress;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

pub use egress::EgressProxy;
pub use ingress::IngressProxy;

use aetherport_mux::Config as MuxConfig;
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::{peer_connection_state::RTCPeerConnectionState, RTCPeerConnection};

use crate::{peer::PeerTransport, Error};

/// How long the SDP/ICE phase may take before the session is abandoned.
pub const DEFAULT_SIGNAL_TIMEOUT: Duration = Duration::from_secs(60);

fn mux_config() -> MuxConfig {
    MuxConfig::default()
}

/// Watches the peer connection state: failure and disconnection tear the
/// connection down, and the closed state ends the session.
fn spawn_state_watcher(peer: &PeerTransport, session: CancellationToken, failed: Arc<AtomicBool>) {
    let mut states = peer.subscribe_states();
    let pc = Arc::clone(peer.connection());

    tokio::spawn(async move {
        while let Some(state) = states.recv().await {
            match state {
                RTCPeerConnectionState::Failed => {
                    failed.store(true, Ordering::SeqCst);
                    let _ = pc.close().await;
                }
                RTCPeerConnectionState::Disconnected => {
                    let _ = pc.close().await;
                }
                RTCPeerConnectionState::Closed => break,
                _ => {}
            }
        }
        session.cancel();
    });
}

/// Creates the placeholder data channel whose only purpose is to make the SDP
/// advertise an SCTP transport; it closes itself the moment it opens.
async fn create_dummy_channel(pc: &Arc<RTCPeerConnection>) -> Result<(), Error> {
    let dc = pc.create_data_channel("", None).await?;

    let on_open_dc = Arc::clone(&dc);
    dc.on_open(Box::new(move || {
        let dc = Arc::clone(&on_open_dc);
        Box::pin(async move {
            let _ = dc.close().await;
        })
    }));

    let on_error_dc = Arc::clone(&dc);
    dc.on_error(Box::new(move |_| {
        let dc = Arc::clone(&on_error_dc);
        Box::pin(async move {
            let _ = dc.close().await;
        })
    }));

    Ok(())
}

#[cfg(test)]
mod tests {
    use aetherport_mux::{Config as MuxConfig, Session};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };
    use tokio_util::sync::CancellationToken;

    // End to end over an in-memory transport: the egress side accepts TCP
    // connections and opens mux streams, the ingress side dials the target
    // service, and bytes cross verbatim in both directions.
    #[tokio::test]
    async fn bytes_cross_an_egress_ingress_pair_verbatim() {
        let (egress_conn, ingress_conn) = tokio::io::duplex(1024 * 1024);
        let egress_session = Session::client(egress_conn, MuxConfig::default());
        let ingress_session = Session::server(ingress_conn, MuxConfig::default());

        // The "remote service" the ingress dials.
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();

        // The egress's local listener.
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();

        let token = CancellationToken::new();
        tokio::spawn(super::egress::serve_listener(egress_session, local, token.child_token()));
        tokio::spawn(super::ingress::serve_streams(
            ingress_session,
            target_addr.to_string(),
            token.child_token(),
        ));

        let mut client = TcpStream::connect(local_addr).await.unwrap();
        let (mut service, _) = target.accept().await.unwrap();

        client.write_all(b"knock knock").await.unwrap();
        let mut buf = [0u8; 11];
        service.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"knock knock");

        service.write_all(b"who is there").await.unwrap();
        let mut buf = [0u8; 12];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"who is there");

        // Closing the dialing side propagates all the way to the service.
        client.shutdown().await.unwrap();
        drop(client);
        let mut rest = Vec::new();
        service.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        token.cancel();
    }

    #[tokio::test]
    async fn concurrent_connections_ride_one_session() {
        let (egress_conn, ingress_conn) = tokio::io::duplex(1024 * 1024);
        let egress_session = Session::client(egress_conn, MuxConfig::default());
        let ingress_session = Session::server(ingress_conn, MuxConfig::default());

        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        let local = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_addr = local.local_addr().unwrap();

        let token = CancellationToken::new();
        tokio::spawn(super::egress::serve_listener(egress_session, local, token.child_token()));
        tokio::spawn(super::ingress::serve_streams(
            ingress_session,
            target_addr.to_string(),
            token.child_token(),
        ));

        // The echo service.
        tokio::spawn(async move {
            loop {
                let (mut conn, _) = match target.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let (mut read, mut write) = conn.split();
                    let _ = read.read_to_end(&mut buf).await;
                    let _ = write.write_all(&buf).await;
                });
            }
        });

        let mut tasks = Vec::new();
        for i in 0..4u8 {
            tasks.push(tokio::spawn(async move {
                let mut client = TcpStream::connect(local_addr).await.unwrap();
                let payload = vec![i; 1000];
                client.write_all(&payload).await.unwrap();
                client.shutdown().await.unwrap();

                let mut echoed = Vec::new();
                client.read_to_end(&mut echoed).await.unwrap();
                assert_eq!(echoed, payload);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        token.cancel();
    }
}
