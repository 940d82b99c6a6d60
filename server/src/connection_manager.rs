//! Live connection management for the race coordinator
//!
//! This module maps verified identities to their outbound message channel:
//! - Registration of authenticated connections (last connection wins)
//! - Unregistration on disconnect
//! - Channel lookup for the broadcast dispatcher
//!
//! Unauthenticated connections are never registered here; they keep only the
//! ping/pong capability handled directly by the connection task. Race logic
//! never owns a channel: a missing entry just means undeliverable.

use log::info;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::race::UserId;

/// Outbound queue handle for one connection. Sends are non-blocking; a
/// closed receiver makes them fail, which callers treat as a silent drop.
pub type OutboundSender = mpsc::UnboundedSender<Message>;

/// Maps each verified identity to its single live outbound channel.
///
/// An identity may only be addressed through one channel at a time, so a
/// re-connect replaces the previous registration. The registry is owned by
/// the coordinator instance, never a module-level singleton, so multiple
/// coordinators can coexist in tests.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: HashMap<UserId, OutboundSender>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Associates a verified identity with its outbound channel.
    ///
    /// Overwrites any prior channel for that identity: the previous
    /// connection's queue is dropped and its writer task winds down on its
    /// own. Returns true when an older registration was replaced.
    pub fn register(&mut self, user_id: &str, sender: OutboundSender) -> bool {
        let replaced = self
            .connections
            .insert(user_id.to_string(), sender)
            .is_some();
        if replaced {
            info!("User {} reconnected, replacing previous channel", user_id);
        } else {
            info!("User {} connected", user_id);
        }
        replaced
    }

    /// Removes the association for an identity. Returns true if a channel
    /// was registered. Cascading race cleanup happens in the coordinator.
    pub fn unregister(&mut self, user_id: &str) -> bool {
        if self.connections.remove(user_id).is_some() {
            info!("User {} disconnected", user_id);
            true
        } else {
            false
        }
    }

    /// Channel for a given identity, if currently connected.
    pub fn sender_for(&self, user_id: &str) -> Option<OutboundSender> {
        self.connections.get(user_id).cloned()
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Identities with a live channel right now.
    pub fn user_ids(&self) -> Vec<UserId> {
        self.connections.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
