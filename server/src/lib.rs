//! # Race Coordination Server Library
//!
//! This library implements the real-time core that manages live multiplayer
//! races: it tracks participant positions, detects checkpoint and lap
//! progress geometrically, computes live standings, and streams every state
//! change to connected participants with low latency.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Race State
//! Each race is a server-owned state machine (WAITING -> ACTIVE -> FINISHED,
//! WAITING -> CANCELLED). Clients only ever see snapshots and events; every
//! decision about roster membership, checkpoint progress, lap times, ranks
//! and final standings is made here.
//!
//! ### Connection Management
//! Verified identities are mapped to a single live outbound channel (the
//! last connection wins). Closing a connection synchronously unwinds the
//! identity's race memberships. Unauthenticated connections are accepted in
//! a degraded ping/pong-only mode.
//!
//! ### Event Broadcasting
//! Session operations produce events that are fanned out best-effort and
//! at-most-once to the race's current roster. An unreachable participant is
//! never an error; delivery order is guaranteed per recipient only.
//!
//! ## Architecture Design
//!
//! Work is triggered by inbound messages or by the lifecycle scheduler's
//! periodic tick; there is no per-race background task. Every mutation of
//! one race is serialized behind that race's own mutex, while distinct
//! races proceed fully in parallel. Outbound sends and persistence-gateway
//! writes never block race processing; a failed durable write is logged and
//! the in-memory transition stands.
//!
//! ## Module Organization
//!
//! - [`race`]: the per-race state machine, roster and checkpoint/lap
//!   detection
//! - [`registry`]: the set of active races and their serialization guards
//! - [`connection_manager`]: identity -> live channel registry
//! - [`broadcast`]: best-effort fan-out of session events
//! - [`scheduler`]: scheduled-start promotion/cancellation and retention
//!   pruning
//! - [`network`]: the WebSocket coordinator and programmatic surface
//! - [`auth`] / [`gateway`]: interfaces to the external identity issuer and
//!   persistence gateway
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::auth::LocalIssuer;
//! use server::gateway::NoopStore;
//! use server::network::{RaceServer, ServerConfig};
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = RaceServer::new(
//!         Arc::new(LocalIssuer),
//!         Arc::new(NoopStore),
//!         ServerConfig::default(),
//!     );
//!
//!     let listener = TcpListener::bind("127.0.0.1:8080").await?;
//!     server.serve(listener).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod broadcast;
pub mod connection_manager;
pub mod gateway;
pub mod network;
pub mod race;
pub mod registry;
pub mod scheduler;
pub mod utils;
