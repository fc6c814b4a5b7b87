//! Bridge provider against an in-process fake sidecar.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use credlink_pairing::{
    CloseReason, LinkProvider, LinkProviderFactory, MemorySessionStore, ProviderEvent, SessionId, SessionStore,
};
use credlink_protocol::messages::{
    ConnectionPhase, ConnectionUpdateEvent, CredsUpdateEvent, DeliveryReceiptResponse,
    LinkBeginRequest, LinkBegunResponse, OutboundContent, QrEvent, SendMessageRequest,
};
use credlink_protocol::{CredentialArtifact, CredentialValue, Message, MessageType};
use credlink_provider_bridge::{BridgeConfig, BridgeProviderFactory};

/// What the fake sidecar saw.
#[derive(Debug)]
enum Seen {
    Begin(LinkBeginRequest),
    Send(SendMessageRequest),
    Close,
}

/// Accepts one connection, answers requests, and pushes whatever the test
/// feeds through `push_rx`. Dropping the push sender drops the socket.
async fn fake_sidecar() -> (
    String,
    mpsc::UnboundedSender<Message>,
    mpsc::UnboundedReceiver<Seen>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Message>();
    let (seen_tx, seen_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        loop {
            tokio::select! {
                push = push_rx.recv() => {
                    let Some(push) = push else { break };
                    let json = serde_json::to_string(&push).unwrap();
                    ws.send(tungstenite::Message::Text(json.into())).await.unwrap();
                }
                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(tungstenite::Message::Text(text))) => text,
                        Some(Ok(_)) => continue,
                        _ => break,
                    };
                    let msg: Message = serde_json::from_str(&text).unwrap();
                    let reply = match msg.msg_type {
                        MessageType::LinkBegin => {
                            let req: LinkBeginRequest = msg.parse_payload().unwrap().unwrap();
                            let registered = req.credentials.is_some();
                            seen_tx.send(Seen::Begin(req)).unwrap();
                            let resp = LinkBegunResponse {
                                registered,
                                code: Some("ABCD1234".into()),
                                required_fields: vec!["noiseKey".into(), "me".into()],
                            };
                            msg.reply(MessageType::LinkBegun, Some(&resp)).unwrap()
                        }
                        MessageType::SendMessage => {
                            let req: SendMessageRequest = msg.parse_payload().unwrap().unwrap();
                            seen_tx.send(Seen::Send(req)).unwrap();
                            let resp = DeliveryReceiptResponse { message_id: "wamid-1".into() };
                            msg.reply(MessageType::DeliveryReceipt, Some(&resp)).unwrap()
                        }
                        MessageType::LinkClose => {
                            seen_tx.send(Seen::Close).unwrap();
                            continue;
                        }
                        _ => msg.reply_error(501, "not implemented"),
                    };
                    let json = serde_json::to_string(&reply).unwrap();
                    ws.send(tungstenite::Message::Text(json.into())).await.unwrap();
                }
            }
        }
    });

    (url, push_tx, seen_rx)
}

fn push<T: serde::Serialize>(msg_type: MessageType, payload: &T) -> Message {
    Message::request(msg_type, Some(payload)).unwrap()
}

async fn next_event(events: &mut credlink_pairing::ProviderEvents) -> ProviderEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("event timed out")
        .expect("event stream ended")
        .expect("event error")
}

#[tokio::test]
async fn full_attempt_over_websocket() {
    let (url, push_tx, mut seen) = fake_sidecar().await;
    let store = Arc::new(MemorySessionStore::new());
    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let id = SessionId::from("lineage-1");

    let mut conn = factory.connect(&id, store.clone()).await.unwrap();
    let code = conn.provider.begin_link(Some("15550001111")).await.unwrap();
    assert_eq!(code.as_deref(), Some("ABCD1234"));
    assert_eq!(conn.provider.required_fields(), vec!["noiseKey", "me"]);
    let Some(Seen::Begin(begin)) = seen.recv().await else {
        panic!("expected link_begin");
    };
    assert_eq!(begin.session_id, "lineage-1");
    assert_eq!(begin.number.as_deref(), Some("15550001111"));
    assert!(begin.credentials.is_none());

    push_tx
        .send(push(MessageType::Qr, &QrEvent { value: "ABC123".into() }))
        .unwrap();
    assert_eq!(next_event(&mut conn.events).await, ProviderEvent::Qr("ABC123".into()));

    let mut creds = std::collections::BTreeMap::new();
    creds.insert("noiseKey".to_string(), CredentialValue::Bytes(vec![0, 1, 255]));
    creds.insert("me".to_string(), "15550001111@link".into());
    push_tx
        .send(push(MessageType::CredsUpdate, &CredsUpdateEvent { credentials: creds }))
        .unwrap();
    push_tx
        .send(push(
            MessageType::ConnectionUpdate,
            &ConnectionUpdateEvent {
                connection: ConnectionPhase::Open,
                identity: Some("15550001111@link".into()),
                reason: None,
                status_code: None,
            },
        ))
        .unwrap();
    assert_eq!(
        next_event(&mut conn.events).await,
        ProviderEvent::Open {
            identity: "15550001111@link".into()
        }
    );
    // Pushes are handled in order, so the update is already staged.
    let staged = CredentialArtifact::from_document(&store.load(&id).unwrap().unwrap()).unwrap();
    assert_eq!(staged.fields["noiseKey"], CredentialValue::Bytes(vec![0, 1, 255]));

    let receipt = conn
        .provider
        .send(
            "15550001111@link",
            OutboundContent::Text {
                text: "pong".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.message_id, "wamid-1");
    let Some(Seen::Send(sent)) = seen.recv().await else {
        panic!("expected send_message");
    };
    assert_eq!(sent.target, "15550001111@link");

    push_tx
        .send(push(
            MessageType::ConnectionUpdate,
            &ConnectionUpdateEvent {
                connection: ConnectionPhase::Close,
                identity: None,
                reason: None,
                status_code: Some(401),
            },
        ))
        .unwrap();
    assert_eq!(
        next_event(&mut conn.events).await,
        ProviderEvent::Close(CloseReason::LoggedOut)
    );

    conn.provider.close().await;
    assert!(matches!(seen.recv().await, Some(Seen::Close)));
}

#[tokio::test]
async fn dropped_socket_is_connection_lost() {
    let (url, push_tx, _seen) = fake_sidecar().await;
    let store = Arc::new(MemorySessionStore::new());
    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let id = SessionId::from("lineage-2");

    let mut conn = factory.connect(&id, store).await.unwrap();
    drop(push_tx);
    assert_eq!(
        next_event(&mut conn.events).await,
        ProviderEvent::Close(CloseReason::ConnectionLost)
    );
}

#[tokio::test]
async fn staged_credentials_are_offered_on_begin() {
    let (url, _push_tx, mut seen) = fake_sidecar().await;
    let store = Arc::new(MemorySessionStore::new());
    let id = SessionId::from("lineage-3");
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("me".to_string(), CredentialValue::from("15550001111@link"));
    store
        .save(&id, &CredentialArtifact::new(fields).to_document().unwrap())
        .unwrap();

    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let conn = factory.connect(&id, store).await.unwrap();
    // A registered account gets no code even when one is asked for.
    assert_eq!(conn.provider.begin_link(Some("15550001111")).await.unwrap(), None);

    let Some(Seen::Begin(begin)) = seen.recv().await else {
        panic!("expected link_begin");
    };
    assert!(begin.credentials.unwrap().contains_key("me"));
}

#[tokio::test]
async fn unreachable_sidecar_fails_construction() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    drop(listener);

    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let store = Arc::new(MemorySessionStore::new());
    let err = factory
        .connect(&SessionId::from("x"), store)
        .await
        .err()
        .expect("connect should fail");
    assert!(matches!(err, credlink_pairing::ProviderError::Construction(_)));
}

#[tokio::test]
async fn updates_after_delivery_stay_off_disk() {
    let (url, push_tx, _seen) = fake_sidecar().await;
    let store = Arc::new(MemorySessionStore::new());
    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let id = SessionId::from("lineage-4");
    let mut conn = factory.connect(&id, store.clone()).await.unwrap();

    conn.provider.credentials_delivered();
    let mut creds = std::collections::BTreeMap::new();
    creds.insert("noiseKey".to_string(), CredentialValue::Bytes(vec![4, 2]));
    push_tx
        .send(push(MessageType::CredsUpdate, &CredsUpdateEvent { credentials: creds }))
        .unwrap();
    push_tx
        .send(push(MessageType::Qr, &QrEvent { value: "after".into() }))
        .unwrap();

    // The qr is forwarded after the update, so the update was handled.
    assert_eq!(next_event(&mut conn.events).await, ProviderEvent::Qr("after".into()));
    assert!(store.load(&id).unwrap().is_none());
}

#[tokio::test]
async fn open_without_identity_is_dropped() {
    let (url, push_tx, _seen) = fake_sidecar().await;
    let factory = BridgeProviderFactory::new(BridgeConfig::new(url));
    let mut conn = factory
        .connect(&SessionId::from("lineage-5"), Arc::new(MemorySessionStore::new()))
        .await
        .unwrap();

    push_tx
        .send(push(
            MessageType::ConnectionUpdate,
            &ConnectionUpdateEvent {
                connection: ConnectionPhase::Open,
                identity: None,
                reason: None,
                status_code: None,
            },
        ))
        .unwrap();
    push_tx
        .send(push(MessageType::Qr, &QrEvent { value: "next".into() }))
        .unwrap();
    assert_eq!(next_event(&mut conn.events).await, ProviderEvent::Qr("next".into()));
}
