//! Sidecar read pump: routes responses and forwards pushes.

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use credlink_protocol::constants::{WS_MAX_MESSAGE_SIZE, WS_PONG_WAIT};
use credlink_protocol::envelope::Message;

use crate::client::PendingMap;

/// Reads frames until the socket ends, the pong deadline passes, or the
/// token is cancelled.
///
/// Every inbound frame resets the deadline. When the pump returns,
/// `push_tx` is dropped, which is how the provider learns the socket is
/// gone.
pub(crate) async fn read_pump<S>(
    mut read: S,
    pending: PendingMap,
    push_tx: mpsc::Sender<Message>,
    write_tx: mpsc::Sender<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::sleep(WS_PONG_WAIT);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            () = &mut deadline => {
                warn!("sidecar silent past pong deadline, closing");
                break;
            }

            frame = read.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        warn!("bridge read error: {e}");
                        break;
                    }
                    None => {
                        debug!("sidecar stream ended");
                        break;
                    }
                };
                deadline.as_mut().reset(tokio::time::Instant::now() + WS_PONG_WAIT);

                match frame {
                    tungstenite::Message::Text(text) => {
                        route_text(&text, &pending, &push_tx).await;
                    }
                    tungstenite::Message::Ping(data) => {
                        let _ = write_tx.try_send(tungstenite::Message::Pong(data));
                    }
                    tungstenite::Message::Close(_) => {
                        debug!("sidecar sent close frame");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    cancel.cancel();
}

async fn route_text(text: &str, pending: &PendingMap, push_tx: &mpsc::Sender<Message>) {
    if text.len() > WS_MAX_MESSAGE_SIZE {
        warn!("sidecar message too large ({} bytes), dropping", text.len());
        return;
    }

    let msg: Message = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("failed to parse sidecar message: {e}");
            return;
        }
    };
    trace!(msg_type = ?msg.msg_type, id = %msg.id, "sidecar message");

    let waiter = pending.lock().await.remove(&msg.id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(msg);
        }
        None => {
            if push_tx.send(msg).await.is_err() {
                debug!("push receiver gone, dropping sidecar event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use futures_util::stream;
    use tokio::sync::{Mutex, oneshot};

    use credlink_protocol::MessageType;
    use credlink_protocol::messages::QrEvent;

    use super::*;

    fn text(msg: &Message) -> tungstenite::Message {
        tungstenite::Message::Text(serde_json::to_string(msg).unwrap().into())
    }

    #[tokio::test]
    async fn response_goes_to_waiter() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert("req-1".into(), tx);
        let (push_tx, mut push_rx) = mpsc::channel(4);

        let msg = Message::new::<()>("req-1", MessageType::LinkBegun, None).unwrap();
        route_text(&serde_json::to_string(&msg).unwrap(), &pending, &push_tx).await;

        assert_eq!(rx.await.unwrap().msg_type, MessageType::LinkBegun);
        assert!(pending.lock().await.is_empty());
        assert!(push_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsolicited_message_is_a_push() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, mut push_rx) = mpsc::channel(4);

        let qr = QrEvent {
            value: "ABC123".into(),
        };
        let msg = Message::new("push-1", MessageType::Qr, Some(&qr)).unwrap();
        route_text(&serde_json::to_string(&msg).unwrap(), &pending, &push_tx).await;

        let pushed = push_rx.recv().await.unwrap();
        assert_eq!(pushed.msg_type, MessageType::Qr);
        let parsed: QrEvent = pushed.parse_payload().unwrap().unwrap();
        assert_eq!(parsed.value, "ABC123");
    }

    #[tokio::test]
    async fn malformed_and_oversized_are_dropped() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, mut push_rx) = mpsc::channel(4);
        route_text("not json {{", &pending, &push_tx).await;
        route_text(&"x".repeat(WS_MAX_MESSAGE_SIZE + 1), &pending, &push_tx).await;
        assert!(push_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stream_end_drops_push_sender() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, mut push_rx) = mpsc::channel(4);
        let (write_tx, _write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let msg = Message::new::<()>("p", MessageType::Qr, None).unwrap();
        let frames = stream::iter(vec![Ok(text(&msg))]);
        read_pump(frames, pending, push_tx, write_tx, cancel.clone()).await;

        assert!(push_rx.recv().await.is_some());
        assert!(push_rx.recv().await.is_none());
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_trips_pong_deadline() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, mut push_rx) = mpsc::channel(4);
        let (write_tx, _write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let silent = stream::pending::<Result<tungstenite::Message, tungstenite::Error>>();
        let started = tokio::time::Instant::now();
        read_pump(silent, pending, push_tx, write_tx, cancel).await;

        assert!(started.elapsed() >= WS_PONG_WAIT);
        assert!(push_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn answers_ping_with_pong() {
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (push_tx, _push_rx) = mpsc::channel(4);
        let (write_tx, mut write_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let frames = stream::iter(vec![Ok(tungstenite::Message::Ping(b"hi".to_vec().into()))]);
        read_pump(frames, pending, push_tx, write_tx, cancel).await;

        let pong = write_rx.recv().await.unwrap();
        assert_eq!(pong, tungstenite::Message::Pong(b"hi".to_vec().into()));
    }
}
