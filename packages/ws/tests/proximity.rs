use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use proximity_config::{PointOfInterest, Position, RoomConfig, RoomRegistry};
use proximity_media::simulator::SimulatedMediaEngine;
use proximity_ws::{
    ProximityState, WebsocketContext,
    models::{
        Ack, DrinkPayload, JoinPayload, LeavePayload, OutboundPayload, PositionEvent,
        ServerEvent, UpdatePayload,
    },
    process_message,
    queue::{ConnectionQueue, ConnectionQueueHandle},
    topics::{Topic, TopicHub, WebsocketSendError, WebsocketSender},
};
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle};

struct Harness {
    state: Arc<ProximityState>,
    hub: Arc<TopicHub>,
    engine: SimulatedMediaEngine,
}

impl Harness {
    fn new() -> Self {
        let engine = SimulatedMediaEngine::default();
        let rooms = RoomRegistry::new(vec![
            RoomConfig::default(),
            RoomConfig {
                id: "garden".to_string(),
                starting_position: Position::new(500, 500),
                drink: Some(PointOfInterest {
                    pos: Position::new(500, 500),
                    radius: 100,
                }),
                ..RoomConfig::default()
            },
        ]);

        Self {
            state: Arc::new(ProximityState::new(rooms, Arc::new(engine.clone()))),
            hub: Arc::new(TopicHub::new()),
            engine,
        }
    }

    fn context(&self, id: &str, room: &str) -> WebsocketContext {
        WebsocketContext {
            connection_id: id.to_string(),
            room: self.state.rooms.get(room).unwrap(),
        }
    }

    fn open(&self, id: &str, room: &str) -> TestClient {
        self.open_with(id, room, self.hub.clone())
    }

    /// Opens a connection whose handlers send through `sender`.
    fn open_with(&self, id: &str, room: &str, sender: Arc<dyn WebsocketSender>) -> TestClient {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub.attach(id, tx);

        let context = self.context(id, room);
        let queue = ConnectionQueue::new(self.state.clone(), sender, context);
        let handle = queue.handle();

        TestClient {
            rx,
            queue: handle,
            task: queue.start(),
        }
    }

    async fn joined(&self, id: &str, room: &str, name: &str) -> TestClient {
        let mut client = self.open(id, room);
        client.send(&format!("connect,{name}"));
        client.recv().await;
        client.recv().await;
        client
    }
}

struct TestClient {
    rx: mpsc::UnboundedReceiver<String>,
    queue: ConnectionQueueHandle,
    task: JoinHandle<()>,
}

impl TestClient {
    fn send(&self, message: &str) {
        self.queue.enqueue(message).unwrap();
    }

    async fn recv(&mut self) -> String {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Everything received until the server answers a ping.
    async fn drain(&mut self) -> Vec<String> {
        self.send("ping");
        let mut messages = vec![];
        loop {
            let message = self.recv().await;
            if message == "pong" {
                return messages;
            }
            messages.push(message);
        }
    }

    async fn request(&mut self, request: &str) -> Ack {
        self.send(request);
        loop {
            if let Some(ack) = Ack::parse(&self.recv().await) {
                return ack;
            }
        }
    }

    async fn close(self) -> mpsc::UnboundedReceiver<String> {
        self.queue.close().unwrap();
        self.task.await.unwrap();
        self.rx
    }
}

fn event(message: &str) -> ServerEvent {
    ServerEvent::parse(message).unwrap()
}

/// Forwards to the hub, except that answering `ping` panics.
struct PanicOnPong {
    hub: Arc<TopicHub>,
}

#[async_trait]
impl WebsocketSender for PanicOnPong {
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        if data == "pong" {
            panic!("pong to {connection_id} went missing");
        }
        self.hub.send(connection_id, data).await
    }

    async fn publish(&self, topic: &Topic, data: &str) -> Result<(), WebsocketSendError> {
        self.hub.publish(topic, data).await
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        topic: &Topic,
    ) -> Result<(), WebsocketSendError> {
        self.hub.subscribe(connection_id, topic).await
    }

    async fn unsubscribe_all(&self, connection_id: &str) -> Result<(), WebsocketSendError> {
        self.hub.unsubscribe_all(connection_id).await
    }
}

/// Forwards to the hub. Right after delivering a `players` snapshot it
/// starts `adder` adding a screen share and yields before returning, the
/// way a sender with real network writes would.
struct AddWhileSnapshotting {
    hub: Arc<TopicHub>,
    state: Arc<ProximityState>,
    adder: WebsocketContext,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl WebsocketSender for AddWhileSnapshotting {
    async fn send(&self, connection_id: &str, data: &str) -> Result<(), WebsocketSendError> {
        let snapshot = data.starts_with(r#"{"players""#);
        if snapshot {
            let state = self.state.clone();
            let hub = self.hub.clone();
            let adder = self.adder.clone();
            *self.task.lock().unwrap() = Some(tokio::spawn(async move {
                process_message(&state, hub.as_ref(), &adder, "add,screen")
                    .await
                    .unwrap();
            }));
        }

        self.hub.send(connection_id, data).await?;

        if snapshot {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
        }

        Ok(())
    }

    async fn publish(&self, topic: &Topic, data: &str) -> Result<(), WebsocketSendError> {
        self.hub.publish(topic, data).await
    }

    async fn subscribe(
        &self,
        connection_id: &str,
        topic: &Topic,
    ) -> Result<(), WebsocketSendError> {
        self.hub.subscribe(connection_id, topic).await
    }

    async fn unsubscribe_all(&self, connection_id: &str) -> Result<(), WebsocketSendError> {
        self.hub.unsubscribe_all(connection_id).await
    }
}

#[test_log::test(tokio::test)]
async fn second_joiner_is_spread_out_and_sees_the_first() {
    let harness = Harness::new();

    let mut a = harness.open("a1", "main");
    a.send("connect,Alice");
    assert_eq!(a.recv().await, r#"{"id":"a1","pos":{"x":100,"y":100}}"#);
    assert_eq!(a.recv().await, r#"{"players":[]}"#);

    let mut b = harness.open("b1", "main");
    b.send("connect,Bob");
    assert_eq!(b.recv().await, r#"{"id":"b1","pos":{"x":250,"y":100}}"#);
    let ServerEvent::Payload(OutboundPayload::Players(players)) = event(&b.recv().await) else {
        panic!("expected a players snapshot");
    };
    assert_eq!(players.len(), 1);
    assert_eq!(players[0].id, "a1");
    assert_eq!(players[0].pos, Position::new(100, 100));

    assert_eq!(
        a.drain().await.iter().map(|m| event(m)).collect::<Vec<_>>(),
        vec![ServerEvent::Payload(OutboundPayload::Join(JoinPayload {
            id: "b1".to_string(),
            name: "Bob".to_string(),
            pos: Position::new(250, 100),
        }))]
    );
    assert!(b.drain().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn avatar_moves_reach_every_subscriber_including_the_mover() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;
    a.drain().await;

    b.send("pos,,120,130");

    let expected = vec!["b1,,120,130".to_string()];
    assert_eq!(b.drain().await, expected);
    assert_eq!(a.drain().await, expected);
    assert_eq!(
        harness.state.registry.get("b1").unwrap().snapshot().unwrap().pos,
        Position::new(120, 130)
    );
}

#[test_log::test(tokio::test)]
async fn updates_carry_presentation_fields_only() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;
    a.drain().await;

    a.send("update,Alice, the Great,false,true,true");

    let expected = ServerEvent::Payload(OutboundPayload::Update(UpdatePayload {
        id: "a1".to_string(),
        name: "Alice, the Great".to_string(),
        audio_enabled: false,
        video_enabled: true,
        broadcast: true,
    }));
    assert_eq!(event(&b.drain().await[0]), expected);
    assert_eq!(event(&a.drain().await[0]), expected);
}

#[test_log::test(tokio::test)]
async fn scene_objects_can_be_added_moved_and_removed() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;
    a.drain().await;

    a.send("add,chair");
    a.send("pos,chair,10,20");
    a.send("remove,chair");
    a.send("pos,chair,30,40");

    assert_eq!(
        b.drain().await,
        vec![
            r#"{"add":{"id":"a1","objectId":"chair","pos":{"x":100,"y":100}}}"#.to_string(),
            "a1,chair,10,20".to_string(),
            r#"{"remove":{"id":"a1","objectId":"chair"}}"#.to_string(),
        ]
    );
}

#[test_log::test(tokio::test)]
async fn commands_before_connect_are_dropped() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.open("b1", "main");

    b.send("pos,,1,1");
    b.send("update,Bob,true,true,false");
    b.send("bogus");

    assert!(b.drain().await.is_empty());
    assert!(a.drain().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn repeated_connect_is_ignored() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;
    a.drain().await;

    b.send("connect,Bobby");

    assert!(b.drain().await.is_empty());
    assert!(a.drain().await.is_empty());
    assert_eq!(harness.state.registry.joined_count("main"), 2);
}

#[test_log::test(tokio::test)]
async fn rooms_do_not_see_each_other() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;

    let mut g = harness.open("g1", "garden");
    g.send("connect,Gina");
    assert_eq!(g.recv().await, r#"{"id":"g1","pos":{"x":500,"y":500}}"#);
    assert_eq!(g.recv().await, r#"{"players":[]}"#);
    g.send("pos,,510,510");

    assert_eq!(g.drain().await, vec!["g1,,510,510".to_string()]);
    assert!(a.drain().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn drinks_are_only_served_in_range() {
    let harness = Harness::new();
    let mut g = harness.joined("g1", "garden", "Gina").await;
    let mut a = harness.joined("a1", "main", "Alice").await;

    g.send("drink,coffee");
    assert_eq!(
        event(&g.drain().await[0]),
        ServerEvent::Payload(OutboundPayload::Drink(DrinkPayload {
            id: "g1".to_string(),
            drink_id: "coffee".to_string(),
        }))
    );

    g.send("pos,,1500,1500");
    g.send("drink,tea");
    assert_eq!(g.drain().await, vec!["g1,,1500,1500".to_string()]);

    a.send("drink,coffee");
    assert!(a.drain().await.is_empty());
}

#[test_log::test(tokio::test)]
async fn drinks_are_refused_at_the_ends_of_the_coordinate_range() {
    let harness = Harness::new();
    let mut g = harness.joined("g1", "garden", "Gina").await;

    g.send("pos,,-2147483648,0");
    g.send("drink,tea");
    g.send("pos,,2147483647,-2147483648");
    g.send("drink,tea");

    assert_eq!(
        g.drain().await,
        vec![
            "g1,,-2147483648,0".to_string(),
            "g1,,2147483647,-2147483648".to_string(),
        ]
    );
    assert!(harness.state.registry.get("g1").is_some());
}

#[test_log::test(tokio::test)]
async fn a_panicking_handler_still_tears_the_connection_down() {
    let harness = Harness::new();
    let mut b = harness.joined("b1", "main", "Bob").await;

    let mut a = harness.open_with(
        "a1",
        "main",
        Arc::new(PanicOnPong {
            hub: harness.hub.clone(),
        }),
    );
    a.send("connect,Alice");
    a.recv().await;
    a.recv().await;
    assert_eq!(b.drain().await.len(), 1);

    negotiate(&mut a, "Producer").await;
    assert_eq!(harness.engine.open_transport_count(), 1);

    a.send("ping");
    a.send("pos,,5,5");
    a.close().await;

    assert_eq!(
        b.drain().await,
        vec![
            "a1,,5,5".to_string(),
            r#"{"leave":{"id":"a1"}}"#.to_string(),
        ]
    );
    assert!(harness.state.registry.get("a1").is_none());
    assert_eq!(harness.engine.open_transport_count(), 0);
}

#[test_log::test(tokio::test)]
async fn scene_changes_during_a_join_reach_the_joiner() {
    let harness = Harness::new();
    let _a = harness.joined("a1", "main", "Alice").await;

    let sender = Arc::new(AddWhileSnapshotting {
        hub: harness.hub.clone(),
        state: harness.state.clone(),
        adder: harness.context("a1", "main"),
        task: Mutex::new(None),
    });
    let mut b = harness.open_with("b1", "main", sender.clone());
    b.send("connect,Bob");
    b.recv().await;
    let ServerEvent::Payload(OutboundPayload::Players(players)) = event(&b.recv().await) else {
        panic!("expected a players snapshot");
    };
    assert!(players[0].objects.is_empty());

    let task = sender.task.lock().unwrap().take().unwrap();
    task.await.unwrap();

    let messages = b.drain().await;
    assert!(
        messages.iter().any(|message| matches!(
            event(message),
            ServerEvent::Payload(OutboundPayload::Add(add))
                if add.id == "a1" && add.object_id == "screen"
        )),
        "b1 never heard of a1's screen: {messages:?}"
    );
}

#[test_log::test(tokio::test)]
async fn other_connections_are_served_while_a_media_call_is_suspended() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;
    assert_eq!(a.drain().await.len(), 1);
    assert!(
        a.request("getRouterRtpCapabilities,1")
            .await
            .payload
            .is_some()
    );

    harness.engine.set_latency(Duration::from_millis(200));
    a.send(r#"createProducerTransport,2,{"forceTcp":false}"#);
    a.send(r#"produce,3,{"kind":"audio","rtpParameters":{"codecs":[]}}"#);

    b.send("pos,,7,7");
    assert_eq!(b.recv().await, "b1,,7,7");
    assert_eq!(harness.engine.open_transport_count(), 0);

    assert_eq!(a.recv().await, "b1,,7,7");
    let created = Ack::parse(&a.recv().await).unwrap();
    assert_eq!(created.request_id, 2);
    assert!(created.payload.is_some());

    let produced = Ack::parse(&a.recv().await).unwrap();
    assert_eq!(produced.request_id, 3);
    assert!(produced.payload.is_some());
    assert_eq!(harness.engine.open_producer_count(), 1);
}

#[test_log::test(tokio::test)]
async fn leave_is_published_after_every_queued_message() {
    let harness = Harness::new();
    let a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;

    for i in 0..50 {
        a.send(&format!("pos,,{i},{i}"));
    }
    a.close().await;

    let messages = b.drain().await;
    assert_eq!(messages.len(), 51);
    for (i, message) in messages.iter().take(50).enumerate() {
        let i = i32::try_from(i).unwrap();
        assert_eq!(
            event(message),
            ServerEvent::Position(PositionEvent {
                id: "a1".to_string(),
                object_id: None,
                pos: Position::new(i, i),
            })
        );
    }
    assert_eq!(
        event(&messages[50]),
        ServerEvent::Payload(OutboundPayload::Leave(LeavePayload {
            id: "a1".to_string(),
        }))
    );
    assert!(harness.state.registry.get("a1").is_none());
}

#[test_log::test(tokio::test)]
async fn malformed_requests_still_get_an_ack() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;

    assert_eq!(a.request("produce,7").await, Ack::new(7, None));
    assert_eq!(a.request("consume,8,not json").await, Ack::new(8, None));
    assert_eq!(
        a.request(r#"connectProducerTransport,9,{"dtlsParameters":{}}"#)
            .await,
        Ack::new(9, None)
    );
}

async fn negotiate(client: &mut TestClient, lane: &str) -> (Value, String) {
    let caps = client.request("getRouterRtpCapabilities,1").await;
    let caps = caps.payload.unwrap();

    let transport = client
        .request(&format!(r#"create{lane}Transport,2,{{"forceTcp":false}}"#))
        .await;
    let transport: Value = serde_json::from_str(&transport.payload.unwrap()).unwrap();
    let transport_id = transport["id"].as_str().unwrap().to_string();

    let connected = client
        .request(&format!(
            r#"connect{lane}Transport,3,{{"transportId":"{transport_id}","dtlsParameters":{{"role":"client"}}}}"#
        ))
        .await;
    assert_eq!(connected.payload.as_deref(), Some("{}"));

    (serde_json::from_str(&caps).unwrap(), transport_id)
}

#[test_log::test(tokio::test)]
async fn peers_consume_each_other_until_one_leaves() {
    let harness = Harness::new();
    let mut a = harness.joined("a1", "main", "Alice").await;
    let mut b = harness.joined("b1", "main", "Bob").await;

    negotiate(&mut a, "Producer").await;
    let producer_id = a
        .request(r#"produce,4,{"kind":"audio","rtpParameters":{"codecs":[]}}"#)
        .await
        .payload
        .unwrap();

    let (caps, _) = negotiate(&mut b, "Consumer").await;
    let consume = json!({ "userId": "a1", "producerKind": "audio", "rtpCapabilities": caps });
    let consumer = b.request(&format!("consume,5,{consume}")).await;
    let consumer: Value = serde_json::from_str(&consumer.payload.unwrap()).unwrap();
    assert_eq!(consumer["producerId"], producer_id);
    assert_eq!(consumer["kind"], "audio");
    assert_eq!(harness.engine.open_consumer_count(), 1);

    assert_eq!(b.request(r#"pause,6,"a1""#).await.payload.as_deref(), Some("{}"));
    assert_eq!(b.request("resume,7,a1").await.payload.as_deref(), Some("{}"));

    a.close().await;
    assert_eq!(
        b.drain().await,
        vec![r#"{"leave":{"id":"a1"}}"#.to_string()]
    );
    assert_eq!(harness.engine.open_consumer_count(), 0);
    assert_eq!(harness.engine.open_producer_count(), 0);

    assert_eq!(
        b.request(&format!("consume,8,{consume}")).await,
        Ack::new(8, None)
    );
}
