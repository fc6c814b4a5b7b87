//! Sidecar write pump: outbound frames plus keep-alive pings.

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use credlink_protocol::constants::WS_PING_PERIOD;

pub(crate) async fn write_pump<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<tungstenite::Message>,
    cancel: CancellationToken,
) where
    S: Sink<tungstenite::Message, Error = tungstenite::Error> + Unpin,
{
    let mut ping_interval = tokio::time::interval(WS_PING_PERIOD);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            msg = rx.recv() => {
                let Some(frame) = msg else { break };
                let closing = matches!(frame, tungstenite::Message::Close(_));
                if let Err(e) = sink.send(frame).await {
                    error!("bridge write error: {e}");
                    return;
                }
                if closing {
                    return;
                }
            }

            _ = ping_interval.tick() => {
                trace!("pinging sidecar");
                if let Err(e) = sink.send(tungstenite::Message::Ping(Vec::new().into())).await {
                    error!("bridge ping error: {e}");
                    return;
                }
            }
        }
    }

    let _ = sink.send(tungstenite::Message::Close(None)).await;
}
