use std::{future::Future, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{messenger::Messenger, signal::Signal, Error};

const TYPE_OFFER: &str = "OFFER";
const TYPE_ANSWER: &str = "ANSWER";
const TYPE_ICE_CANDIDATE: &str = "ICE_CANDIDATE";

#[derive(Debug, Serialize, Deserialize)]
struct SignalMessage {
    #[serde(rename = "type")]
    kind: String,
    data: String,
}

/// Signalling over a [`Messenger`], usually the encrypted channel to the peer.
///
/// A single read loop deserializes incoming JSON records and dispatches them
/// into one queue per message type; `recv_*` callers block on the matching
/// queue. Closing stops the loop and closes the underlying messenger, which
/// unblocks every waiting caller.
pub struct SignalMessenger<M: Messenger> {
    inner: Arc<M>,
    offer_rx: Mutex<mpsc::Receiver<String>>,
    answer_rx: Mutex<mpsc::Receiver<String>>,
    candidate_rx: Mutex<mpsc::Receiver<String>>,
    token: CancellationToken,
}

impl<M: Messenger + 'static> SignalMessenger<M> {
    pub fn new(inner: M) -> Self {
        let inner = Arc::new(inner);
        let (offer_tx, offer_rx) = mpsc::channel(8);
        let (answer_tx, answer_rx) = mpsc::channel(8);
        let (candidate_tx, candidate_rx) = mpsc::channel(8);
        let token = CancellationToken::new();

        tokio::spawn(read_loop(
            Arc::clone(&inner),
            offer_tx,
            answer_tx,
            candidate_tx,
            token.clone(),
        ));

        Self {
            inner,
            offer_rx: Mutex::new(offer_rx),
            answer_rx: Mutex::new(answer_rx),
            candidate_rx: Mutex::new(candidate_rx),
            token,
        }
    }

    async fn send_message(&self, kind: &str, data: String) -> Result<(), Error> {
        let msg = SignalMessage {
            kind: kind.to_string(),
            data,
        };
        let b = serde_json::to_vec(&msg).map_err(|error| Error::Signal(error.to_string()))?;
        self.inner.send(&b).await
    }
}

async fn read_loop<M: Messenger>(
    inner: Arc<M>,
    offer_tx: mpsc::Sender<String>,
    answer_tx: mpsc::Sender<String>,
    candidate_tx: mpsc::Sender<String>,
    token: CancellationToken,
) {
    loop {
        let b = tokio::select! {
            _ = token.cancelled() => break,
            b = inner.recv() => match b {
                Ok(b) => b,
                Err(error) => {
                    debug!("signal read loop ended: {error}");
                    break;
                }
            },
        };

        let msg: SignalMessage = match serde_json::from_slice(&b) {
            Ok(msg) => msg,
            Err(_) => {
                warn!("signal: received unknown message: {}", String::from_utf8_lossy(&b));
                continue;
            }
        };

        let queue = match msg.kind.as_str() {
            TYPE_OFFER => &offer_tx,
            TYPE_ANSWER => &answer_tx,
            TYPE_ICE_CANDIDATE => &candidate_tx,
            other => {
                warn!("signal: received unknown message type: {other}");
                continue;
            }
        };

        tokio::select! {
            _ = token.cancelled() => break,
            sent = queue.send(msg.data) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
}

async fn recv_queue(queue: &Mutex<mpsc::Receiver<String>>) -> Result<String, Error> {
    queue.lock().await.recv().await.ok_or(Error::StreamClosed)
}

impl<M: Messenger + 'static> Signal for SignalMessenger<M> {
    fn send_offer(&self, offer: &str) -> impl Future<Output = Result<(), Error>> + Send {
        self.send_message(TYPE_OFFER, offer.to_string())
    }

    fn recv_offer(&self) -> impl Future<Output = Result<String, Error>> + Send {
        recv_queue(&self.offer_rx)
    }

    fn send_answer(&self, answer: &str) -> impl Future<Output = Result<(), Error>> + Send {
        self.send_message(TYPE_ANSWER, answer.to_string())
    }

    fn recv_answer(&self) -> impl Future<Output = Result<String, Error>> + Send {
        recv_queue(&self.answer_rx)
    }

    fn supports_trickle(&self) -> bool {
        true
    }

    fn send_candidate(&self, candidate: &str) -> impl Future<Output = Result<(), Error>> + Send {
        self.send_message(TYPE_ICE_CANDIDATE, candidate.to_string())
    }

    fn recv_candidate(&self) -> impl Future<Output = Result<String, Error>> + Send {
        recv_queue(&self.candidate_rx)
    }

    fn close(&self) -> impl Future<Output = Result<(), Error>> + Send {
        self.token.cancel();
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::SignalMessenger;
    use crate::{
        messenger::{ChunkedMessenger, Messenger},
        signal::Signal,
    };

    fn pair() -> (
        SignalMessenger<ChunkedMessenger<tokio::io::DuplexStream>>,
        SignalMessenger<ChunkedMessenger<tokio::io::DuplexStream>>,
    ) {
        let (near, far) = tokio::io::duplex(64 * 1024);
        (
            SignalMessenger::new(ChunkedMessenger::new(near)),
            SignalMessenger::new(ChunkedMessenger::new(far)),
        )
    }

    #[tokio::test]
    async fn offer_answer_and_candidates_are_dispatched_by_type() {
        let (egress, ingress) = pair();

        egress.send_offer("v=0 offer").await.unwrap();
        egress.send_candidate("{\"candidate\":\"one\"}").await.unwrap();
        egress.send_candidate("{\"candidate\":\"two\"}").await.unwrap();

        // Candidates may arrive before the offer is consumed and vice versa.
        assert_eq!(ingress.recv_candidate().await.unwrap(), "{\"candidate\":\"one\"}");
        assert_eq!(ingress.recv_offer().await.unwrap(), "v=0 offer");
        assert_eq!(ingress.recv_candidate().await.unwrap(), "{\"candidate\":\"two\"}");

        ingress.send_answer("v=0 answer").await.unwrap();
        assert_eq!(egress.recv_answer().await.unwrap(), "v=0 answer");
    }

    #[tokio::test]
    async fn unknown_messages_are_skipped() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let raw = ChunkedMessenger::new(near);
        let ingress = SignalMessenger::new(ChunkedMessenger::new(far));

        raw.send(b"not json at all").await.unwrap();
        raw.send(b"{\"type\":\"MYSTERY\",\"data\":\"x\"}").await.unwrap();
        raw.send(b"{\"type\":\"OFFER\",\"data\":\"the offer\"}").await.unwrap();

        assert_eq!(ingress.recv_offer().await.unwrap(), "the offer");
    }

    #[tokio::test]
    async fn close_unblocks_waiting_receivers() {
        let (egress, ingress) = pair();

        let waiter = tokio::spawn(async move { ingress.recv_offer().await });
        egress.close().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), waiter)
            .await
            .expect("recv_offer should unblock on close")
            .unwrap();
        assert!(result.is_err());
    }
}
