//! Per-connection protocol handling
//!
//! Transport-agnostic: the WebSocket handler feeds inbound text here and
//! drains the connection's queue for outbound frames. Every reply goes
//! through the same queue as channel events, so ordering per connection is
//! preserved.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::broadcaster::{Broadcaster, ConnectionId};
use crate::error::AuthError;
use crate::events::{parse_client_message, ClientMessage, ServerMessage};

/// What the transport should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionControl {
    Continue,
    /// Protocol-fatal condition; close the connection.
    Close,
}

pub struct Session {
    id: ConnectionId,
    broadcaster: Arc<Broadcaster>,
    authenticator: Option<Arc<dyn Authenticator>>,
    auth_timeout: Duration,
}

impl Session {
    pub fn new(
        id: ConnectionId,
        broadcaster: Arc<Broadcaster>,
        authenticator: Option<Arc<dyn Authenticator>>,
        auth_timeout: Duration,
    ) -> Self {
        broadcaster.open(id);
        Self {
            id,
            broadcaster,
            authenticator,
            auth_timeout,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Handle one inbound text frame, which may hold several
    /// newline-delimited messages.
    pub async fn handle_text(&self, text: &str) -> SessionControl {
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if self.handle_line(line).await == SessionControl::Close {
                return SessionControl::Close;
            }
        }
        SessionControl::Continue
    }

    /// Any inbound traffic (including transport-level pings) counts as
    /// activity for the idle sweeper.
    pub fn touch(&self) {
        self.broadcaster.touch(self.id, Instant::now());
    }

    async fn handle_line(&self, line: &str) -> SessionControl {
        self.touch();
        let message = match parse_client_message(line) {
            Ok(message) => message,
            Err(e) => {
                debug!(connection_id = self.id, error = %e, "Malformed client message");
                return self.reply(ServerMessage::error(e.to_string()));
            }
        };

        match message {
            ClientMessage::Subscribe { channel } => match self.broadcaster.subscribe(self.id, &channel) {
                Ok(channel) => self.reply(ServerMessage::Subscribed {
                    channel: channel.to_channel_string(),
                }),
                Err(e) => self.reply(ServerMessage::error(e.to_string())),
            },
            ClientMessage::Unsubscribe { channel } => {
                self.broadcaster.unsubscribe(self.id, &channel);
                self.reply(ServerMessage::Unsubscribed { channel })
            }
            ClientMessage::Ping => self.reply(ServerMessage::Pong),
            ClientMessage::Auth { token } => self.authenticate(&token).await,
        }
    }

    async fn authenticate(&self, token: &str) -> SessionControl {
        let Some(authenticator) = &self.authenticator else {
            return self.reply(ServerMessage::error(AuthError::NotConfigured.to_string()));
        };

        self.broadcaster.begin_auth(self.id);
        match tokio::time::timeout(self.auth_timeout, authenticator.authenticate(token)).await {
            Ok(Ok(principal)) => {
                debug!(connection_id = self.id, subject = %principal.subject, "Connection authenticated");
                self.broadcaster.complete_auth(self.id, Some(principal));
                self.reply(ServerMessage::Authenticated)
            }
            Ok(Err(e)) => {
                self.broadcaster.complete_auth(self.id, None);
                self.reply(ServerMessage::error(format!("Authentication failed: {}", e)))
            }
            Err(_) => {
                warn!(
                    connection_id = self.id,
                    timeout_ms = self.auth_timeout.as_millis() as u64,
                    "Auth handshake timed out, closing connection"
                );
                self.reply(ServerMessage::error(AuthError::Timeout.to_string()));
                SessionControl::Close
            }
        }
    }

    fn reply(&self, message: ServerMessage) -> SessionControl {
        match self.broadcaster.send_to(self.id, message.to_frame()) {
            Ok(()) => SessionControl::Continue,
            Err(e) => {
                debug!(connection_id = self.id, error = %e, "Reply not queued, closing");
                SessionControl::Close
            }
        }
    }

    /// Unconditional registry cleanup.
    pub fn close(&self) {
        self.broadcaster.disconnect(self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.broadcaster.disconnect(self.id);
    }
}
