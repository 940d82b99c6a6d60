//! Best-effort fan-out of race events to connected participants
//!
//! Delivery is at-most-once and non-blocking: a missing or closed channel is
//! a silent drop, never an application error. Messages for one recipient are
//! queued in production order on that connection's FIFO channel; no ordering
//! is guaranteed across different recipients.

use log::warn;
use shared::ServerMessage;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::connection_manager::ConnectionRegistry;
use crate::race::{Audience, RaceEvent, UserId};

#[derive(Clone)]
pub struct Dispatcher {
    connections: Arc<RwLock<ConnectionRegistry>>,
}

impl Dispatcher {
    pub fn new(connections: Arc<RwLock<ConnectionRegistry>>) -> Self {
        Self { connections }
    }

    /// Queues a message for one identity. Drops silently when the identity
    /// has no live channel or its writer task already hung up.
    pub async fn send_to(&self, user_id: &str, message: &ServerMessage) {
        let sender = match self.connections.read().await.sender_for(user_id) {
            Some(sender) => sender,
            None => return,
        };
        match serde_json::to_string(message) {
            Ok(text) => {
                let _ = sender.send(Message::Text(text));
            }
            Err(e) => warn!("Failed to encode outbound message: {}", e),
        }
    }

    /// Fans a message out to a roster snapshot, skipping `excluding`.
    pub async fn broadcast(
        &self,
        recipients: &[UserId],
        message: &ServerMessage,
        excluding: Option<&str>,
    ) {
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode broadcast message: {}", e);
                return;
            }
        };

        let connections = self.connections.read().await;
        for user_id in recipients {
            if Some(user_id.as_str()) == excluding {
                continue;
            }
            if let Some(sender) = connections.sender_for(user_id) {
                let _ = sender.send(Message::Text(text.clone()));
            }
        }
    }

    /// Delivers a batch of session events against one roster snapshot,
    /// preserving production order per recipient.
    pub async fn dispatch(&self, recipients: &[UserId], events: Vec<RaceEvent>) {
        for event in events {
            match &event.audience {
                Audience::All => self.broadcast(recipients, &event.message, None).await,
                Audience::AllExcept(user_id) => {
                    self.broadcast(recipients, &event.message, Some(user_id)).await
                }
                Audience::One(user_id) => self.send_to(user_id, &event.message).await,
            }
        }
    }
}
