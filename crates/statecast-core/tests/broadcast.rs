//! State broadcasting end to end: bindable changes reach real clients.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use statecast_core::{keys, Bindable, BoundBroadcaster, ManualBroadcaster, Multiplexer};
use statecast_protocol::{codec, BroadcastEnvelope, Message};
use statecast_transport::{serve, Connection, ConnectionHandler, TransportClient, TransportServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Observer {
    envelopes: Mutex<Vec<BroadcastEnvelope>>,
}

impl Observer {
    fn received(&self) -> Vec<(String, Value)> {
        self.envelopes
            .lock()
            .iter()
            .map(|e| (e.type_key.clone(), e.data.clone()))
            .collect()
    }

    fn len(&self) -> usize {
        self.envelopes.lock().len()
    }
}

#[async_trait]
impl ConnectionHandler for Observer {
    async fn on_message(&self, _connection: &Connection, message: Message) {
        let envelope: BroadcastEnvelope = codec::decode(&message).unwrap();
        self.envelopes.lock().push(envelope);
    }
}

async fn start(mux: &Multiplexer) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, mux.router("/state")));
    format!("ws://{addr}/state")
}

async fn observe(url: &str, mux: &Multiplexer, expected_connections: usize) -> (Arc<Observer>, Connection) {
    let observer = Arc::new(Observer::default());
    let connection = TransportClient::new(url)
        .connect(observer.clone())
        .await
        .unwrap();
    eventually(|| mux.connection_count() == expected_connections).await;
    (observer, connection)
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_beatmap_change_reaches_both_clients() {
    let mux = Multiplexer::new(TransportServer::default());
    let beatmap = Bindable::with_value(json!({ "id": 5 }));
    let _broadcaster = BoundBroadcaster::identity(&mux, keys::GAME_BEATMAP, beatmap.clone()).unwrap();
    let url = start(&mux).await;

    let (first, _c1) = observe(&url, &mux, 1).await;
    let (second, _c2) = observe(&url, &mux, 2).await;

    beatmap.set(json!({ "id": 7 }));

    let expected = (keys::GAME_BEATMAP.to_string(), json!({ "id": 7 }));
    eventually(|| first.received().last() == Some(&expected)).await;
    eventually(|| second.received().last() == Some(&expected)).await;

    // Each client first caught up with the value current at attach time.
    assert_eq!(
        first.received()[0],
        (keys::GAME_BEATMAP.to_string(), json!({ "id": 5 }))
    );
}

#[tokio::test]
async fn test_attach_replays_one_message_per_stream_with_a_value() {
    let mux = Multiplexer::new(TransportServer::default());
    let combo = Bindable::with_value(12);
    let score: Bindable<u64> = Bindable::new();
    let _combo = BoundBroadcaster::identity(&mux, keys::PLAY_COMBO, combo).unwrap();
    let _score = BoundBroadcaster::identity(&mux, keys::PLAY_SCORE, score.clone()).unwrap();
    let url = start(&mux).await;

    let (observer, _c) = observe(&url, &mux, 1).await;
    eventually(|| observer.len() == 1).await;
    assert_eq!(
        observer.received(),
        vec![(keys::PLAY_COMBO.to_string(), json!(12))]
    );

    // A stream without a value stays silent until its first change.
    score.set(1_000);
    eventually(|| observer.len() == 2).await;
    assert_eq!(
        observer.received()[1],
        (keys::PLAY_SCORE.to_string(), json!(1_000))
    );
}

#[tokio::test]
async fn test_rapid_changes_end_on_final_value_in_order() {
    let mux = Multiplexer::new(TransportServer::default());
    let accuracy = Bindable::with_value(0u32);
    let _broadcaster =
        BoundBroadcaster::identity(&mux, keys::PLAY_ACCURACY, accuracy.clone()).unwrap();
    let url = start(&mux).await;
    let (observer, _c) = observe(&url, &mux, 1).await;

    for value in 1..=100u32 {
        accuracy.set(value);
    }

    eventually(|| observer.received().last().map(|(_, v)| v.clone()) == Some(json!(100))).await;

    let values: Vec<u64> = observer
        .received()
        .iter()
        .map(|(_, v)| v.as_u64().unwrap())
        .collect();
    assert!(
        values.windows(2).all(|pair| pair[0] <= pair[1]),
        "stale value after a newer one: {values:?}"
    );
}

#[tokio::test]
async fn test_unregistered_broadcaster_is_not_replayed() {
    let mux = Multiplexer::new(TransportServer::default());
    let ruleset = Bindable::with_value("osu".to_string());
    let broadcaster = BoundBroadcaster::identity(&mux, keys::GAME_RULESET, ruleset.clone()).unwrap();
    let input = ManualBroadcaster::register(&mux, keys::PLAY_INPUT).unwrap();
    input.broadcast("K1").unwrap();
    let url = start(&mux).await;

    broadcaster.shutdown();
    ruleset.set("taiko".to_string());

    let (observer, _c) = observe(&url, &mux, 1).await;
    eventually(|| observer.len() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        observer.received(),
        vec![(keys::PLAY_INPUT.to_string(), json!("K1"))]
    );
}

#[tokio::test]
async fn test_manual_broadcast_reaches_open_connections() {
    let mux = Multiplexer::new(TransportServer::default());
    let url = start(&mux).await;
    let (observer, _c) = observe(&url, &mux, 1).await;

    assert_eq!(mux.broadcast(keys::PLAY_HEALTH, &0.75).unwrap(), 1);
    eventually(|| observer.len() == 1).await;
    assert_eq!(
        observer.received(),
        vec![(keys::PLAY_HEALTH.to_string(), json!(0.75))]
    );
}
