//! Registry of active race sessions
//!
//! The registry owns every live `RaceSession`, keyed by race id. The outer
//! `RwLock` only guards the map's insert/remove/lookup; each session sits
//! behind its own `tokio::sync::Mutex`, which serializes every mutation of
//! that race (join/leave/position/finish) while distinct races proceed in
//! parallel.

use log::info;
use shared::{RaceSnapshot, RaceStatus};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::race::RaceSession;

/// A race session plus its serialization guard.
pub type SharedSession = Arc<Mutex<RaceSession>>;

#[derive(Default)]
pub struct RaceRegistry {
    races: RwLock<HashMap<String, SharedSession>>,
}

impl RaceRegistry {
    pub fn new() -> Self {
        Self {
            races: RwLock::new(HashMap::new()),
        }
    }

    /// Adds a session and returns its shared handle.
    pub async fn insert(&self, session: RaceSession) -> SharedSession {
        let race_id = session.id.clone();
        let handle = Arc::new(Mutex::new(session));
        self.races
            .write()
            .await
            .insert(race_id, Arc::clone(&handle));
        handle
    }

    /// Handle for a race, if it is still registered. Finished races remain
    /// queryable until the retention window expires.
    pub async fn get(&self, race_id: &str) -> Option<SharedSession> {
        self.races.read().await.get(race_id).cloned()
    }

    /// Removes a race. Removed races are never resurrected.
    pub async fn remove(&self, race_id: &str) -> bool {
        let removed = self.races.write().await.remove(race_id).is_some();
        if removed {
            info!("Race {} removed from registry", race_id);
        }
        removed
    }

    pub async fn race_ids(&self) -> Vec<String> {
        self.races.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.races.read().await.len()
    }

    /// Snapshots of races that have not reached a terminal state.
    pub async fn active_snapshots(&self) -> Vec<RaceSnapshot> {
        let handles: Vec<SharedSession> = self.races.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            let race = handle.lock().await;
            if matches!(race.status, RaceStatus::Waiting | RaceStatus::Active) {
                snapshots.push(race.snapshot());
            }
        }
        snapshots
    }

    /// Snapshot of a single race, if registered.
    pub async fn snapshot(&self, race_id: &str) -> Option<RaceSnapshot> {
        let handle = self.get(race_id).await?;
        let race = handle.lock().await;
        Some(race.snapshot())
    }

    /// Current roster size of a race, if registered.
    pub async fn participant_count(&self, race_id: &str) -> Option<usize> {
        let handle = self.get(race_id).await?;
        let race = handle.lock().await;
        Some(race.participants.len())
    }
}
