//! Broadcaster protocol tests
//!
//! Drives sessions the way the WebSocket transport does and checks what
//! lands in each connection's outbound queue.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use price_index::backpressure::{ConnectionQueue, DropPolicy};
use price_index::broadcaster::Broadcaster;
use price_index::config::BroadcastConfig;
use price_index::events::ChannelEvent;
use price_index::session::{Session, SessionControl};
use types::ids::CardId;

struct Client {
    session: Session,
    queue: Arc<ConnectionQueue>,
}

impl Client {
    fn connect(broadcaster: &Arc<Broadcaster>) -> Self {
        let (id, queue) = broadcaster.connect();
        let session = Session::new(id, Arc::clone(broadcaster), None, Duration::from_secs(1));
        Self { session, queue }
    }

    async fn send(&self, line: &str) -> SessionControl {
        self.session.handle_text(line).await
    }

    async fn subscribe(&self, channel: &str) {
        let line = json!({"action": "subscribe", "channel": channel}).to_string();
        assert_eq!(self.send(&line).await, SessionControl::Continue);
    }

    /// Everything queued so far.
    async fn received(&self) -> Vec<Value> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        self.queue
            .next_batch(1000)
            .await
            .unwrap_or_default()
            .iter()
            .map(|m| serde_json::from_str(&m.payload).unwrap())
            .collect()
    }
}

fn broadcaster(config: BroadcastConfig) -> Arc<Broadcaster> {
    Arc::new(Broadcaster::new(config))
}

#[tokio::test]
async fn test_publish_reaches_only_exact_channel() {
    let b = broadcaster(BroadcastConfig::default());
    let on_123 = Client::connect(&b);
    let on_124 = Client::connect(&b);
    let on_market = Client::connect(&b);
    on_123.subscribe("card:123").await;
    on_124.subscribe("card:124").await;
    on_market.subscribe("market").await;
    for client in [&on_123, &on_124, &on_market] {
        client.received().await;
    }

    let report = b.publish(&ChannelEvent::card_prices_updated(CardId::new(123), 4, "tcgplayer"));
    assert_eq!(report.delivered, 1);

    let got = on_123.received().await;
    assert_eq!(got.len(), 1);
    assert_eq!(got[0]["type"], "card_prices_updated");
    assert_eq!(got[0]["data"]["card_id"], 123);
    assert!(on_124.received().await.is_empty());
    assert!(on_market.received().await.is_empty());
}

#[tokio::test]
async fn test_anonymous_alerts_refused_but_market_allowed() {
    let b = broadcaster(BroadcastConfig::default());
    let client = Client::connect(&b);

    assert_eq!(
        client.send(r#"{"action":"subscribe","channel":"alerts"}"#).await,
        SessionControl::Continue
    );
    client.subscribe("market").await;

    let got = client.received().await;
    assert_eq!(got[0], json!({"type": "error", "message": "Authentication required"}));
    assert_eq!(got[1], json!({"type": "subscribed", "channel": "market"}));
    assert_eq!(b.subscription_counts().get("market"), Some(&1));
    assert_eq!(b.subscription_counts().get("alerts"), None);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
    let b = broadcaster(BroadcastConfig::default());
    let client = Client::connect(&b);
    client.subscribe("card:9").await;

    for _ in 0..2 {
        assert_eq!(
            client.send(r#"{"action":"unsubscribe","channel":"card:9"}"#).await,
            SessionControl::Continue
        );
    }
    assert_eq!(
        client.send(r#"{"action":"unsubscribe","channel":"card:10"}"#).await,
        SessionControl::Continue
    );
    let got = client.received().await;
    assert!(got.iter().all(|m| m["type"] != "error"));
    assert!(b.subscription_counts().is_empty());
}

#[tokio::test]
async fn test_slow_consumer_is_dropped_alone() {
    let b = broadcaster(BroadcastConfig {
        queue_capacity: 3,
        drop_policy: DropPolicy::Disconnect,
        ..BroadcastConfig::default()
    });
    let slow = Client::connect(&b);
    let fast = Client::connect(&b);
    slow.subscribe("market").await;
    fast.subscribe("market").await;
    fast.received().await;

    let mut delivered_to_fast = 0;
    for _ in 0..5 {
        let summary = price_index::events::BatchSummary {
            source: "tcgplayer".to_string(),
            count: 1,
            ..Default::default()
        };
        b.publish(&ChannelEvent::prices_updated(&summary));
        delivered_to_fast += fast.received().await.len();
    }

    assert_eq!(delivered_to_fast, 5);
    assert!(slow.queue.is_closed());
    assert_eq!(b.connection_count(), 1);
    assert_eq!(b.subscription_counts().get("market"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_are_swept() {
    let b = broadcaster(BroadcastConfig {
        heartbeat_timeout_secs: 30,
        ..BroadcastConfig::default()
    });
    let idle = Client::connect(&b);
    let chatty = Client::connect(&b);
    idle.subscribe("market").await;
    chatty.subscribe("market").await;

    tokio::time::advance(Duration::from_secs(20)).await;
    assert_eq!(chatty.send(r#"{"action":"ping"}"#).await, SessionControl::Continue);
    tokio::time::advance(Duration::from_secs(20)).await;

    let removed = b.sweep_idle(tokio::time::Instant::now());
    assert_eq!(removed, vec![idle.session.id()]);
    assert_eq!(b.subscription_counts().get("market"), Some(&1));
    assert!(idle.queue.is_closed());
}
