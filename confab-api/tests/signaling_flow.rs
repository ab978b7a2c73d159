use confab_api::registry::SessionRegistry;
use confab_api::signaling::{
    ConnectionHandler, ServerMessage, SignalingRouter, StaticPublishPolicy, StreamMessage,
};
use confab_sfu::{
    ClientId, ConsumerId, LocalBackend, MediaEngine, ProducerId, SfuConfig, TransportId, UserId,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn router_with_backend(
    policy: StaticPublishPolicy,
    max_clients: usize,
) -> (Arc<SignalingRouter>, Arc<LocalBackend>) {
    let backend = Arc::new(LocalBackend::new(Default::default()));
    let engine = MediaEngine::new(backend.clone(), SfuConfig::default());
    let registry = Arc::new(SessionRegistry::new(Arc::clone(&engine), max_clients));
    let router = Arc::new(SignalingRouter::new(registry, engine, Arc::new(policy)));
    (router, backend)
}

fn router_with_policy(policy: StaticPublishPolicy, max_clients: usize) -> Arc<SignalingRouter> {
    router_with_backend(policy, max_clients).0
}

fn open_router() -> Arc<SignalingRouter> {
    router_with_policy(StaticPublishPolicy::open(), 0)
}

struct TestClient {
    id: ClientId,
    rx: mpsc::Receiver<ServerMessage>,
}

impl TestClient {
    fn connect(router: &SignalingRouter, user_id: Option<&str>) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let id = router.connect(user_id.map(UserId::from), tx);
        let mut client = Self { id, rx };
        assert!(matches!(client.drain().as_slice(), [ServerMessage::Connected(_)]));
        client
    }

    fn drain(&mut self) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn send(&mut self, router: &SignalingRouter, frame: Value) -> Vec<ServerMessage> {
        router.handle_text(&self.id, &frame.to_string()).await;
        self.drain()
    }
}

fn opus_rtp_parameters() -> Value {
    json!({
        "codecs": [{
            "mimeType": "audio/opus",
            "payloadType": 111,
            "clockRate": 48000,
            "channels": 2
        }],
        "encodings": [{ "ssrc": 11111111 }]
    })
}

fn opus_capabilities() -> Value {
    json!({
        "codecs": [{
            "kind": "audio",
            "mimeType": "audio/opus",
            "clockRate": 48000,
            "channels": 2
        }]
    })
}

fn dtls_parameters() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF:01" }]
    })
}

fn error_code(messages: &[ServerMessage]) -> Option<String> {
    messages.iter().find_map(|m| match m {
        ServerMessage::Error(e) => Some(e.code.clone()),
        _ => None,
    })
}

async fn join(router: &SignalingRouter, client: &mut TestClient, room: &str, role: &str) {
    let replies = client
        .send(
            router,
            json!({ "type": "joinRoom", "roomId": room, "data": { "role": role } }),
        )
        .await;
    assert!(
        replies
            .iter()
            .any(|m| matches!(m, ServerMessage::RoomJoined(_))),
        "join failed: {replies:?}"
    );
}

/// Create and connect a transport, returning its id
async fn connected_transport(
    router: &SignalingRouter,
    client: &mut TestClient,
    direction: &str,
) -> TransportId {
    let replies = client
        .send(
            router,
            json!({ "type": "createTransport", "data": { "direction": direction } }),
        )
        .await;
    let transport_id = match replies.as_slice() {
        [ServerMessage::TransportCreated(t)] => t.id.clone(),
        other => panic!("unexpected replies: {other:?}"),
    };

    let replies = client
        .send(
            router,
            json!({
                "type": "connectTransport",
                "data": { "transportId": transport_id, "dtlsParameters": dtls_parameters() }
            }),
        )
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::TransportConnected(p)] if p.connected
    ));
    transport_id
}

async fn produce_audio(
    router: &SignalingRouter,
    client: &mut TestClient,
    transport_id: &TransportId,
) -> ProducerId {
    let replies = client
        .send(
            router,
            json!({
                "type": "produce",
                "data": {
                    "transportId": transport_id,
                    "kind": "audio",
                    "rtpParameters": opus_rtp_parameters()
                }
            }),
        )
        .await;
    match replies.as_slice() {
        [ServerMessage::ProduceSuccess(p)] => p.producer_id.clone(),
        other => panic!("unexpected replies: {other:?}"),
    }
}

#[tokio::test]
async fn test_publish_subscribe_round_trip() {
    let router = open_router();
    let mut publisher = TestClient::connect(&router, Some("alice"));
    let mut subscriber = TestClient::connect(&router, Some("bob"));

    join(&router, &mut publisher, "demo", "publisher").await;
    join(&router, &mut subscriber, "demo", "subscriber").await;
    assert!(publisher
        .drain()
        .iter()
        .any(|m| matches!(m, ServerMessage::ClientJoined(info) if info.client_id == subscriber.id)));

    let replies = publisher
        .send(&router, json!({ "type": "getRouterRtpCapabilities" }))
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::RouterRtpCapabilities(p)] if !p.rtp_capabilities.codecs.is_empty()
    ));

    let send_transport = connected_transport(&router, &mut publisher, "publish").await;
    let producer_id = produce_audio(&router, &mut publisher, &send_transport).await;

    // producerInfo goes to the other members only
    assert!(publisher.drain().is_empty());
    let announced = subscriber.drain();
    assert!(matches!(
        announced.as_slice(),
        [ServerMessage::ProducerInfo(info)]
            if info.producer_id == producer_id && info.client_id == publisher.id
    ));

    let recv_transport = connected_transport(&router, &mut subscriber, "subscribe").await;
    let replies = subscriber
        .send(
            &router,
            json!({
                "type": "consume",
                "data": {
                    "transportId": recv_transport,
                    "producerId": producer_id,
                    "rtpCapabilities": opus_capabilities()
                }
            }),
        )
        .await;
    let consumer_id: ConsumerId = match replies.as_slice() {
        [ServerMessage::ConsumeSuccess(c)] => {
            assert!(c.paused);
            assert_eq!(c.producer_id, producer_id);
            c.id.clone()
        }
        other => panic!("unexpected replies: {other:?}"),
    };

    let replies = subscriber
        .send(
            &router,
            json!({ "type": "resumeConsumer", "data": { "consumerId": consumer_id } }),
        )
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::ConsumerResumed(p)] if p.resumed && p.consumer_id == consumer_id
    ));

    router.disconnect(&publisher.id).await;

    let notices = subscriber.drain();
    assert!(notices.iter().any(|m| matches!(
        m,
        ServerMessage::ProducerClosed(p) if p.producer_id == producer_id
    )));
    assert!(notices.iter().any(|m| matches!(
        m,
        ServerMessage::ConsumerClosed(p) if p.consumer_id == consumer_id
    )));
    assert!(notices.iter().any(|m| matches!(
        m,
        ServerMessage::ClientLeft(p) if p.client_id == publisher.id
    )));

    let replies = subscriber
        .send(&router, json!({ "type": "getProducers" }))
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::Producers(p)] if p.producers.is_empty()
    ));
}

#[tokio::test]
async fn test_late_joiner_sees_existing_producers() {
    let router = open_router();
    let mut publisher = TestClient::connect(&router, None);
    join(&router, &mut publisher, "demo", "publisher").await;
    let transport = connected_transport(&router, &mut publisher, "publish").await;
    let producer_id = produce_audio(&router, &mut publisher, &transport).await;

    let mut late = TestClient::connect(&router, None);
    let replies = late
        .send(&router, json!({ "type": "joinRoom", "roomId": "demo" }))
        .await;
    match replies.as_slice() {
        [ServerMessage::RoomJoined(snapshot)] => {
            assert_eq!(snapshot.members.len(), 2);
            assert_eq!(snapshot.publishers, vec![publisher.id.clone()]);
            assert_eq!(snapshot.producers.len(), 1);
            assert_eq!(snapshot.producers[0].producer_id, producer_id);
        }
        other => panic!("unexpected replies: {other:?}"),
    }
}

#[tokio::test]
async fn test_close_producer_notifies_room() {
    let router = open_router();
    let mut publisher = TestClient::connect(&router, None);
    let mut subscriber = TestClient::connect(&router, None);
    join(&router, &mut publisher, "demo", "publisher").await;
    join(&router, &mut subscriber, "demo", "subscriber").await;

    let transport = connected_transport(&router, &mut publisher, "publish").await;
    let producer_id = produce_audio(&router, &mut publisher, &transport).await;
    publisher.drain();
    subscriber.drain();

    let replies = publisher
        .send(
            &router,
            json!({ "type": "closeProducer", "data": { "producerId": producer_id } }),
        )
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::ProducerClosed(p)] if p.producer_id == producer_id
    ));
    assert!(matches!(
        subscriber.drain().as_slice(),
        [ServerMessage::ProducerClosed(p)] if p.producer_id == producer_id
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_create_one_room() {
    let router = open_router();
    let mut clients: Vec<TestClient> = (0..16)
        .map(|_| TestClient::connect(&router, None))
        .collect();

    let mut tasks = Vec::new();
    for client in &clients {
        let router = Arc::clone(&router);
        let client_id = client.id.clone();
        tasks.push(tokio::spawn(async move {
            router
                .handle_text(&client_id, r#"{"type":"joinRoom","roomId":"race"}"#)
                .await;
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(router.engine().room_count(), 1);
    let stats = router.registry().get_stats().await;
    assert_eq!(stats.rooms, 1);
    assert_eq!(stats.members, 16);
    for client in &mut clients {
        assert!(client
            .drain()
            .iter()
            .any(|m| matches!(m, ServerMessage::RoomJoined(_))));
    }
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let router = open_router();
    let mut first = TestClient::connect(&router, None);
    let mut second = TestClient::connect(&router, None);
    join(&router, &mut first, "demo", "subscriber").await;
    join(&router, &mut second, "demo", "subscriber").await;
    second.drain();

    router.disconnect(&first.id).await;
    router.disconnect(&first.id).await;

    let left: Vec<_> = second
        .drain()
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::ClientLeft(_)))
        .collect();
    assert_eq!(left.len(), 1);
    assert!(!router.registry().connections().contains(&first.id));

    router.disconnect(&second.id).await;
    assert_eq!(router.engine().room_count(), 0);
    assert!(!router.registry().room_exists(&"demo".into()).await);
}

#[tokio::test]
async fn test_subscriber_cannot_produce() {
    let router = open_router();
    let mut client = TestClient::connect(&router, None);
    join(&router, &mut client, "demo", "subscriber").await;
    let transport = connected_transport(&router, &mut client, "publish").await;

    let replies = client
        .send(
            &router,
            json!({
                "type": "produce",
                "data": {
                    "transportId": transport,
                    "kind": "audio",
                    "rtpParameters": opus_rtp_parameters()
                }
            }),
        )
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("not_publisher"));
}

#[tokio::test]
async fn test_incompatible_consume_is_rejected() {
    let router = open_router();
    let mut publisher = TestClient::connect(&router, None);
    let mut subscriber = TestClient::connect(&router, None);
    join(&router, &mut publisher, "demo", "publisher").await;
    join(&router, &mut subscriber, "demo", "subscriber").await;

    let send_transport = connected_transport(&router, &mut publisher, "publish").await;
    let producer_id = produce_audio(&router, &mut publisher, &send_transport).await;
    subscriber.drain();

    let recv_transport = connected_transport(&router, &mut subscriber, "subscribe").await;
    let replies = subscriber
        .send(
            &router,
            json!({
                "type": "consume",
                "data": {
                    "transportId": recv_transport,
                    "producerId": producer_id,
                    "rtpCapabilities": {
                        "codecs": [{ "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }]
                    }
                }
            }),
        )
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("cannot_consume"));
}

#[tokio::test]
async fn test_requests_before_join_are_rejected() {
    let router = open_router();
    let mut client = TestClient::connect(&router, None);

    let replies = client
        .send(&router, json!({ "type": "getRouterRtpCapabilities" }))
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("not_in_room"));

    let replies = client.send(&router, json!({ "type": "leaveRoom" })).await;
    assert_eq!(error_code(&replies).as_deref(), Some("not_in_room"));
}

#[tokio::test]
async fn test_publish_denied_by_policy() {
    let policy = StaticPublishPolicy::new(false, [UserId::from("alice")]);
    let router = router_with_policy(policy, 0);

    let mut mallory = TestClient::connect(&router, Some("mallory"));
    let replies = mallory
        .send(
            &router,
            json!({ "type": "joinRoom", "roomId": "demo", "data": { "role": "publisher" } }),
        )
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("publish_denied"));
    assert!(!router.registry().room_exists(&"demo".into()).await);

    let mut alice = TestClient::connect(&router, Some("alice"));
    join(&router, &mut alice, "demo", "publisher").await;
}

#[tokio::test]
async fn test_denied_join_does_not_bind_identity() {
    let policy = StaticPublishPolicy::new(false, [UserId::from("alice")]);
    let router = router_with_policy(policy, 0);
    let mut client = TestClient::connect(&router, None);

    let replies = client
        .send(
            &router,
            json!({
                "type": "joinRoom",
                "roomId": "demo",
                "userId": "mallory",
                "data": { "role": "publisher" }
            }),
        )
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("publish_denied"));
    let handle = router.registry().connections().get(&client.id).unwrap();
    assert_eq!(handle.user_id, None);

    let replies = client
        .send(
            &router,
            json!({
                "type": "joinRoom",
                "roomId": "demo",
                "userId": "alice",
                "data": { "role": "publisher" }
            }),
        )
        .await;
    match replies.as_slice() {
        [ServerMessage::RoomJoined(snapshot)] => {
            assert_eq!(snapshot.members[0].user_id, Some(UserId::from("alice")));
        }
        other => panic!("unexpected replies: {other:?}"),
    }
    let handle = router.registry().connections().get(&client.id).unwrap();
    assert_eq!(handle.user_id, Some(UserId::from("alice")));
}

#[tokio::test]
async fn test_backend_transport_failure_reaches_room() {
    let (router, backend) = router_with_backend(StaticPublishPolicy::open(), 0);
    let pump = router.spawn_media_event_pump();
    let mut publisher = TestClient::connect(&router, None);
    let mut subscriber = TestClient::connect(&router, None);
    join(&router, &mut publisher, "demo", "publisher").await;
    join(&router, &mut subscriber, "demo", "subscriber").await;

    let send_transport = connected_transport(&router, &mut publisher, "publish").await;
    let producer_id = produce_audio(&router, &mut publisher, &send_transport).await;
    let recv_transport = connected_transport(&router, &mut subscriber, "subscribe").await;
    subscriber.drain();
    let replies = subscriber
        .send(
            &router,
            json!({
                "type": "consume",
                "data": {
                    "transportId": recv_transport,
                    "producerId": producer_id,
                    "rtpCapabilities": opus_capabilities()
                }
            }),
        )
        .await;
    let consumer_id = match replies.as_slice() {
        [ServerMessage::ConsumeSuccess(c)] => c.id.clone(),
        other => panic!("unexpected replies: {other:?}"),
    };
    publisher.drain();

    // Nobody asked for this close; only the event pump can report it
    backend.fail_transport(&send_transport);

    let mut producer_closed = false;
    let mut consumer_closed = false;
    while !(producer_closed && consumer_closed) {
        let message = tokio::time::timeout(Duration::from_secs(1), subscriber.rx.recv())
            .await
            .expect("teardown not delivered")
            .unwrap();
        match message {
            ServerMessage::ProducerClosed(p) if p.producer_id == producer_id => {
                producer_closed = true;
            }
            ServerMessage::ConsumerClosed(p) if p.consumer_id == consumer_id => {
                consumer_closed = true;
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    let notice = tokio::time::timeout(Duration::from_secs(1), publisher.rx.recv())
        .await
        .expect("owner not notified")
        .unwrap();
    assert!(matches!(
        notice,
        ServerMessage::ProducerClosed(p) if p.producer_id == producer_id
    ));

    let replies = subscriber
        .send(&router, json!({ "type": "getProducers" }))
        .await;
    assert!(matches!(
        replies.as_slice(),
        [ServerMessage::Producers(p)] if p.producers.is_empty()
    ));
    pump.abort();
}

#[tokio::test]
async fn test_room_capacity() {
    let router = router_with_policy(StaticPublishPolicy::open(), 1);
    let mut first = TestClient::connect(&router, None);
    let mut second = TestClient::connect(&router, None);
    join(&router, &mut first, "small", "subscriber").await;

    let replies = second
        .send(&router, json!({ "type": "joinRoom", "roomId": "small" }))
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("room_full"));
}

#[tokio::test]
async fn test_relay_between_room_members() {
    let router = open_router();
    let mut a = TestClient::connect(&router, None);
    let mut b = TestClient::connect(&router, None);
    let mut outsider = TestClient::connect(&router, None);
    join(&router, &mut a, "demo", "subscriber").await;
    join(&router, &mut b, "demo", "subscriber").await;
    join(&router, &mut outsider, "elsewhere", "subscriber").await;

    let replies = a
        .send(
            &router,
            json!({ "type": "relaySdp", "targetId": b.id, "data": { "type": "offer", "sdp": "v=0" } }),
        )
        .await;
    assert!(replies.is_empty());
    assert!(matches!(
        b.drain().as_slice(),
        [ServerMessage::Sdp(p)] if p.from_id == a.id
    ));

    let replies = a
        .send(
            &router,
            json!({ "type": "relayIceCandidate", "targetId": outsider.id, "data": { "candidate": "x" } }),
        )
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("target_not_in_room"));
    assert!(outsider.drain().is_empty());
}

#[tokio::test]
async fn test_protocol_errors_keep_connection_usable() {
    let router = open_router();
    let mut client = TestClient::connect(&router, None);

    router.handle_text(&client.id, "not json").await;
    assert_eq!(error_code(&client.drain()).as_deref(), Some("invalid_message"));

    let replies = client.send(&router, json!({ "type": "dance" })).await;
    match replies.as_slice() {
        [ServerMessage::Error(e)] => {
            assert_eq!(e.code, "unknown_type");
            assert_eq!(e.request.as_deref(), Some("dance"));
        }
        other => panic!("unexpected replies: {other:?}"),
    }

    let replies = client
        .send(&router, json!({ "type": "createTransport", "data": {} }))
        .await;
    assert_eq!(error_code(&replies).as_deref(), Some("invalid_message"));

    join(&router, &mut client, "demo", "subscriber").await;
}

/// Feeds scripted frames, then reports the peer as gone
struct ScriptedStream {
    frames: VecDeque<String>,
}

#[async_trait::async_trait]
impl StreamMessage for ScriptedStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        self.frames.pop_front().map(Ok)
    }

    fn is_alive(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_connection_handler_processes_in_order_and_cleans_up() {
    let router = open_router();
    let mut client = TestClient::connect(&router, None);

    let mut stream = ScriptedStream {
        frames: VecDeque::from([
            "{broken".to_string(),
            json!({ "type": "joinRoom", "roomId": "demo" }).to_string(),
            json!({ "type": "getProducers" }).to_string(),
        ]),
    };
    let handler = ConnectionHandler::new(
        Arc::clone(&router),
        client.id.clone(),
        Duration::from_secs(30),
    );
    handler.run(&mut stream).await;

    let kinds: Vec<&str> = client.drain().iter().map(ServerMessage::kind).collect();
    assert_eq!(kinds, vec!["error", "roomJoined", "producers"]);
    assert!(!router.registry().connections().contains(&client.id));
    assert_eq!(router.engine().room_count(), 0);
}
