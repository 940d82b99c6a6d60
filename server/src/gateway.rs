//! External persistence gateway interface
//!
//! The durable schema is owned elsewhere; the core only issues two calls and
//! never reads the result back into live state. All calls are fired from
//! spawned tasks: a failed or slow write is logged and must never roll back
//! or delay an in-memory transition.

use async_trait::async_trait;
use log::debug;
use shared::{RaceSnapshot, RaceStatus};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("persistence gateway rejected the write: {0}")]
    WriteFailed(String),
}

#[async_trait]
pub trait RaceStore: Send + Sync {
    /// Requests a durable record for a newly created race.
    async fn create_record(&self, race: &RaceSnapshot) -> Result<(), StoreError>;

    /// Requests a durable status update for a race that ended.
    async fn update_record(
        &self,
        race_id: &str,
        status: RaceStatus,
        end_time: Option<u64>,
    ) -> Result<(), StoreError>;
}

/// Gateway stub for local runs: acknowledges every write.
pub struct NoopStore;

#[async_trait]
impl RaceStore for NoopStore {
    async fn create_record(&self, race: &RaceSnapshot) -> Result<(), StoreError> {
        debug!("create_record({})", race.id);
        Ok(())
    }

    async fn update_record(
        &self,
        race_id: &str,
        status: RaceStatus,
        end_time: Option<u64>,
    ) -> Result<(), StoreError> {
        debug!("update_record({}, {:?}, {:?})", race_id, status, end_time);
        Ok(())
    }
}
