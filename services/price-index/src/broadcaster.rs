//! Real-time Broadcaster
//!
//! Subscription registry keyed by exact channel name, plus per-connection
//! outbound queues. Publishing never waits on a consumer: it enqueues into
//! each subscriber's bounded queue and moves on.
//!
//! Lock order is connection entry, then channel entry. `publish` never
//! holds both.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::ids::CardId;

use crate::auth::{authorize, Denial, Principal};
use crate::backpressure::{BackpressureAction, ConnectionQueue, OutboundMessage};
use crate::config::BroadcastConfig;
use crate::error::BroadcastError;
use crate::events::ChannelEvent;

pub type ConnectionId = u64;

/// Channels available for subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Market-wide batch summaries: `market`
    Market,
    /// Updates for one card: `card:{id}`
    Card(CardId),
    /// Protected alert stream: `alerts`
    Alerts,
    /// Protected per-user alerts: `alerts:user:{id}`
    UserAlerts(String),
}

impl Channel {
    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["market"] => Some(Channel::Market),
            ["card", id] => id.parse::<CardId>().ok().map(Channel::Card),
            ["alerts"] => Some(Channel::Alerts),
            ["alerts", "user", user] if !user.is_empty() => Some(Channel::UserAlerts(user.to_string())),
            _ => None,
        }
    }

    pub fn to_channel_string(&self) -> String {
        match self {
            Channel::Market => "market".to_string(),
            Channel::Card(id) => format!("card:{}", id),
            Channel::Alerts => "alerts".to_string(),
            Channel::UserAlerts(user) => format!("alerts:user:{}", user),
        }
    }

    /// Protected channels require a prior `auth` on the connection.
    pub fn is_protected(&self) -> bool {
        matches!(self, Channel::Alerts | Channel::UserAlerts(_))
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_channel_string())
    }
}

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Connecting,
    Authenticating,
    /// Open, holding zero or more channels.
    Subscribed,
    Closed,
}

/// Why a subscribe request was refused. The connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("Authentication required")]
    AuthenticationRequired,

    #[error("Not authorized for channel {0}")]
    Forbidden(String),

    #[error("Unknown channel: {0}")]
    InvalidChannel(String),

    #[error("Max subscriptions ({0}) reached")]
    TooManySubscriptions(usize),

    #[error("Connection not found")]
    UnknownConnection,
}

/// Tracks per-connection state.
#[derive(Debug)]
pub struct ConnectionState {
    pub id: ConnectionId,
    pub phase: ConnectionPhase,
    pub subscriptions: BTreeSet<String>,
    pub principal: Option<Principal>,
    /// Last inbound message of any kind.
    pub last_activity: Instant,
    pub queue: Arc<ConnectionQueue>,
}

/// Outcome of one publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub channel: String,
    pub delivered: usize,
    /// Connections dropped because their queue overflowed.
    pub disconnected: Vec<ConnectionId>,
}

#[derive(Debug, Default)]
pub struct BroadcastStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub overflow_disconnects: AtomicU64,
    pub idle_disconnects: AtomicU64,
}

pub struct Broadcaster {
    connections: DashMap<ConnectionId, ConnectionState>,
    channels: DashMap<String, HashSet<ConnectionId>>,
    next_id: AtomicU64,
    config: BroadcastConfig,
    stats: BroadcastStats,
}

impl Broadcaster {
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
            stats: BroadcastStats::default(),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.config
    }

    pub fn stats(&self) -> &BroadcastStats {
        &self.stats
    }

    /// Register a connection in `Connecting` and return its outbound queue.
    pub fn connect(&self) -> (ConnectionId, Arc<ConnectionQueue>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(ConnectionQueue::new(
            self.config.queue_capacity,
            self.config.drop_policy,
        ));
        self.connections.insert(
            id,
            ConnectionState {
                id,
                phase: ConnectionPhase::Connecting,
                subscriptions: BTreeSet::new(),
                principal: None,
                last_activity: Instant::now(),
                queue: queue.clone(),
            },
        );
        debug!(connection_id = id, "Connection registered");
        (id, queue)
    }

    /// Transport is up; the connection may now subscribe.
    pub fn open(&self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            if conn.phase == ConnectionPhase::Connecting {
                conn.phase = ConnectionPhase::Subscribed;
            }
        }
    }

    pub fn begin_auth(&self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.phase = ConnectionPhase::Authenticating;
        }
    }

    /// Finish an auth attempt. A failed attempt leaves any earlier principal
    /// in place.
    pub fn complete_auth(&self, id: ConnectionId, principal: Option<Principal>) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            if principal.is_some() {
                conn.principal = principal;
            }
            conn.phase = ConnectionPhase::Subscribed;
        }
    }

    pub fn phase(&self, id: ConnectionId) -> ConnectionPhase {
        self.connections
            .get(&id)
            .map(|c| c.phase)
            .unwrap_or(ConnectionPhase::Closed)
    }

    pub fn subscribe(&self, id: ConnectionId, channel_name: &str) -> Result<Channel, SubscribeError> {
        let channel =
            Channel::parse(channel_name).ok_or_else(|| SubscribeError::InvalidChannel(channel_name.to_string()))?;

        let mut conn = self
            .connections
            .get_mut(&id)
            .ok_or(SubscribeError::UnknownConnection)?;

        authorize(&channel, conn.principal.as_ref()).map_err(|denial| match denial {
            Denial::AuthenticationRequired => SubscribeError::AuthenticationRequired,
            Denial::Forbidden => SubscribeError::Forbidden(channel.to_channel_string()),
        })?;

        let name = channel.to_channel_string();
        if conn.subscriptions.contains(&name) {
            return Ok(channel);
        }
        let max = self.config.max_subscriptions_per_connection;
        if conn.subscriptions.len() >= max {
            return Err(SubscribeError::TooManySubscriptions(max));
        }

        conn.subscriptions.insert(name.clone());
        self.channels.entry(name.clone()).or_default().insert(id);
        debug!(connection_id = id, channel = %name, "Subscribed");
        Ok(channel)
    }

    /// Idempotent. Returns whether the connection held the channel.
    pub fn unsubscribe(&self, id: ConnectionId, channel_name: &str) -> bool {
        let removed = match self.connections.get_mut(&id) {
            Some(mut conn) => conn.subscriptions.remove(channel_name),
            None => false,
        };
        if removed {
            self.remove_from_channel(channel_name, id);
            debug!(connection_id = id, channel = channel_name, "Unsubscribed");
        }
        removed
    }

    fn remove_from_channel(&self, channel_name: &str, id: ConnectionId) {
        if let Some(mut members) = self.channels.get_mut(channel_name) {
            members.remove(&id);
        }
        self.channels.remove_if(channel_name, |_, members| members.is_empty());
    }

    /// Deliver `event` to every subscriber of exactly `event.channel`.
    pub fn publish(&self, event: &ChannelEvent) -> PublishReport {
        let subscribers: Vec<ConnectionId> = self
            .channels
            .get(&event.channel)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();

        let mut report = PublishReport {
            channel: event.channel.clone(),
            ..PublishReport::default()
        };
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if subscribers.is_empty() {
            return report;
        }

        let frame: Arc<str> = Arc::from(event.to_frame());
        for id in subscribers {
            let Some(queue) = self.connections.get(&id).map(|c| c.queue.clone()) else {
                continue;
            };
            match queue.enqueue(OutboundMessage::new(frame.clone())) {
                Ok(()) => report.delivered += 1,
                Err(BackpressureAction::DisconnectClient) => {
                    let err = BroadcastError::QueueOverflow {
                        connection_id: id,
                        capacity: queue.capacity(),
                    };
                    warn!(connection_id = id, channel = %event.channel, error = %err, "Backpressure: disconnecting lagging connection");
                    report.disconnected.push(id);
                }
                Err(BackpressureAction::Closed) => {}
            }
        }

        for id in &report.disconnected {
            self.stats.overflow_disconnects.fetch_add(1, Ordering::Relaxed);
            self.disconnect(*id);
        }
        self.stats
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        debug!(
            channel = %event.channel,
            event_type = %event.event_type,
            delivered = report.delivered,
            disconnected = report.disconnected.len(),
            "Event published"
        );
        report
    }

    /// Queue a direct reply to one connection.
    pub fn send_to(&self, id: ConnectionId, frame: String) -> Result<(), BroadcastError> {
        let queue = self
            .connections
            .get(&id)
            .map(|c| c.queue.clone())
            .ok_or(BroadcastError::ConnectionClosed(id))?;
        match queue.enqueue(OutboundMessage::new(Arc::from(frame))) {
            Ok(()) => Ok(()),
            Err(BackpressureAction::Closed) => Err(BroadcastError::ConnectionClosed(id)),
            Err(BackpressureAction::DisconnectClient) => {
                self.stats.overflow_disconnects.fetch_add(1, Ordering::Relaxed);
                self.disconnect(id);
                Err(BroadcastError::QueueOverflow {
                    connection_id: id,
                    capacity: queue.capacity(),
                })
            }
        }
    }

    /// Record client activity at `now`.
    pub fn touch(&self, id: ConnectionId, now: Instant) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.last_activity = now;
        }
    }

    /// Remove a connection and every registry entry it owns. Idempotent.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return false;
        };
        conn.queue.close();
        for name in &conn.subscriptions {
            self.remove_from_channel(name, id);
        }
        debug!(connection_id = id, channels = conn.subscriptions.len(), "Connection removed");
        true
    }

    /// Disconnect every connection idle longer than the heartbeat timeout.
    pub fn sweep_idle(&self, now: Instant) -> Vec<ConnectionId> {
        let timeout = self.config.heartbeat_timeout();
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|c| now.saturating_duration_since(c.last_activity) > timeout)
            .map(|c| c.id)
            .collect();
        for id in &stale {
            self.stats.idle_disconnects.fetch_add(1, Ordering::Relaxed);
            self.disconnect(*id);
        }
        if !stale.is_empty() {
            info!(count = stale.len(), "Idle connections removed");
        }
        stale
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn subscriptions_of(&self, id: ConnectionId) -> Vec<String> {
        self.connections
            .get(&id)
            .map(|c| c.subscriptions.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Active subscribers per channel, sorted by channel name.
    pub fn subscription_counts(&self) -> BTreeMap<String, usize> {
        self.channels
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    /// Disconnect everyone, used at shutdown.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|c| c.id).collect();
        for id in &ids {
            self.disconnect(*id);
        }
        ids.len()
    }
}
