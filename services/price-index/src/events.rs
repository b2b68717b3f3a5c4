//! Channel events and the client/server subscription protocol
//!
//! `ChannelEvent` is what ingestion publishes. `ClientMessage` and
//! `ServerMessage` are the tagged unions exchanged with subscribers, one JSON
//! object per line. Unknown `action` tags are rejected with an `error`
//! response, never ignored.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use types::ids::{CardId, MarketplaceId};
use uuid::Uuid;

/// Event type published on `market` after an ingestion batch commits.
pub const PRICES_UPDATED: &str = "prices_updated";
/// Event type published on `card:{id}` for each card touched by a batch.
pub const CARD_PRICES_UPDATED: &str = "card_prices_updated";

/// An event forwarded to every subscriber of exactly one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Unique event identifier (UUID v7)
    pub event_id: Uuid,
    pub channel: String,
    pub event_type: String,
    pub payload: Value,
    pub emitted_at: DateTime<Utc>,
}

impl ChannelEvent {
    pub fn new(channel: impl Into<String>, event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            channel: channel.into(),
            event_type: event_type.into(),
            payload,
            emitted_at: Utc::now(),
        }
    }

    /// Summary of one committed ingestion batch, published on `market`.
    pub fn prices_updated(summary: &BatchSummary) -> Self {
        Self::new(
            "market",
            PRICES_UPDATED,
            json!({
                "source": summary.source,
                "count": summary.count,
                "marketplaces": summary.marketplaces,
                "cards": summary.cards.len(),
            }),
        )
    }

    pub fn card_prices_updated(card_id: CardId, count: usize, source: &str) -> Self {
        Self::new(
            format!("card:{}", card_id),
            CARD_PRICES_UPDATED,
            json!({
                "card_id": card_id,
                "count": count,
                "source": source,
            }),
        )
    }

    /// Wire frame: `{"type":<event_type>,"channel":..,"data":{..},"timestamp":..}`.
    pub fn to_frame(&self) -> String {
        json!({
            "type": self.event_type,
            "channel": self.channel,
            "data": self.payload,
            "timestamp": self.emitted_at,
        })
        .to_string()
    }
}

/// What a committed batch changed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub source: String,
    /// Rows newly stored by the batch.
    pub count: usize,
    pub marketplaces: BTreeSet<MarketplaceId>,
    pub cards: BTreeSet<CardId>,
}

/// Client → server messages, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Extra fields are accepted and ignored.
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Ping,
    Auth { token: String },
}

/// Server → client control messages, tagged by `type`.
///
/// Channel events use `ChannelEvent::to_frame` since their tag is dynamic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Authenticated,
    Pong,
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_frame(&self) -> String {
        // Serializing a plain enum of strings cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","message":"internal"}"#.to_string())
    }
}

/// Why a line could not be turned into a `ClientMessage`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Missing action")]
    MissingAction,

    #[error("Unknown action: {0}")]
    UnknownAction(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),
}

const KNOWN_ACTIONS: &[&str] = &["subscribe", "unsubscribe", "ping", "auth"];

/// Parse one protocol line.
pub fn parse_client_message(line: &str) -> Result<ClientMessage, ProtocolError> {
    let value: Value = serde_json::from_str(line).map_err(|_| ProtocolError::InvalidJson)?;
    let action = match value.get("action") {
        Some(Value::String(action)) => action.clone(),
        Some(_) | None => return Err(ProtocolError::MissingAction),
    };
    if !KNOWN_ACTIONS.contains(&action.as_str()) {
        return Err(ProtocolError::UnknownAction(action));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage(e.to_string()))
}
