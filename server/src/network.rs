//! Coordinator: the public-facing surface of the race core
//!
//! Accepts WebSocket connections, authenticates bearer credentials through
//! the external identity issuer, routes client messages into race sessions
//! and fans the resulting events out through the dispatcher. Registries are
//! owned by the constructed server instance, so multiple coordinators can
//! coexist in one process.
//!
//! Locking discipline: registry lookups clone the session handle and drop
//! the map guard, then the per-race mutex is held only for the mutation
//! itself; dispatching happens after it is released.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{
    ClientMessage, PositionReport, RaceSnapshot, RaceStatus, ServerMessage, DEFAULT_RETENTION_MS,
    DEFAULT_START_DELAY_MS, DEFAULT_TICK_INTERVAL_MS,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::auth::{Identity, IdentityIssuer};
use crate::broadcast::Dispatcher;
use crate::connection_manager::{ConnectionRegistry, OutboundSender};
use crate::gateway::RaceStore;
use crate::race::{RaceError, RaceSession, RaceSpec};
use crate::registry::RaceRegistry;
use crate::scheduler;
use crate::utils::now_ms;

/// Tunables for one coordinator instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub start_delay_ms: u64,
    pub retention_ms: u64,
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            start_delay_ms: DEFAULT_START_DELAY_MS,
            retention_ms: DEFAULT_RETENTION_MS,
            tick_interval: Duration::from_millis(DEFAULT_TICK_INTERVAL_MS),
        }
    }
}

/// Top-level coordinator owning the race and connection registries.
pub struct RaceServer {
    registry: Arc<RaceRegistry>,
    connections: Arc<RwLock<ConnectionRegistry>>,
    dispatcher: Dispatcher,
    issuer: Arc<dyn IdentityIssuer>,
    store: Arc<dyn RaceStore>,
    config: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl RaceServer {
    pub fn new(
        issuer: Arc<dyn IdentityIssuer>,
        store: Arc<dyn RaceStore>,
        config: ServerConfig,
    ) -> Arc<Self> {
        let connections = Arc::new(RwLock::new(ConnectionRegistry::new()));
        let (shutdown_tx, _) = watch::channel(false);

        Arc::new(Self {
            registry: Arc::new(RaceRegistry::new()),
            dispatcher: Dispatcher::new(Arc::clone(&connections)),
            connections,
            issuer,
            store,
            config,
            shutdown_tx,
        })
    }

    /// Runs the scheduler and serves connections until `shutdown()`.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error>> {
        info!("Race coordinator listening on {}", listener.local_addr()?);

        let scheduler_handle = scheduler::spawn(
            Arc::clone(&self.registry),
            self.dispatcher.clone(),
            self.config.tick_interval,
            self.config.retention_ms,
            self.shutdown_tx.subscribe(),
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream, addr).await {
                                    debug!("Connection {} closed: {}", addr, e);
                                }
                            });
                        }
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        let _ = scheduler_handle.await;
        info!("Race coordinator stopped");
        Ok(())
    }

    /// Upgrades one TCP stream, performs the credential handshake and pumps
    /// messages until the peer goes away. A failure here only affects this
    /// connection.
    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let mut token: Option<String> = None;
        let callback = |request: &Request, response: Response| {
            token = extract_token(request);
            Ok(response)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        // single writer task per connection; the queue gives each recipient
        // in-order delivery without ever blocking race logic
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let identity = match token {
            Some(token) => match self.issuer.verify(&token).await {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("Rejected credential from {}: {}", addr, e);
                    let _ = tx.send(encode(&ServerMessage::Error {
                        message: format!("authorization failed: {}", e),
                    }));
                    let _ = tx.send(Message::Close(None));
                    drop(tx);
                    let _ = writer.await;
                    return Ok(());
                }
            },
            None => {
                info!("Unauthenticated connection from {} (ping/pong only)", addr);
                None
            }
        };

        if let Some(identity) = &identity {
            self.connections
                .write()
                .await
                .register(&identity.user_id, tx.clone());
        }

        let _ = tx.send(encode(&ServerMessage::Connected {
            user_id: identity.as_ref().map(|i| i.user_id.clone()),
        }));

        while let Some(frame) = ws_read.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(_) => break,
            };
            match frame {
                Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => self.handle_message(identity.as_ref(), message, &tx).await,
                    Err(e) => {
                        // malformed input is logged and never disturbs
                        // other participants; the connection stays open
                        warn!("Malformed message from {}: {}", addr, e);
                    }
                },
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_) => {}
            }
        }

        if let Some(identity) = &identity {
            self.handle_disconnect(&identity.user_id, &tx).await;
        }
        drop(tx);
        let _ = writer.await;
        Ok(())
    }

    /// Routes one parsed client message. Privileged actions require a
    /// verified identity; domain errors go back to the sender only.
    async fn handle_message(
        &self,
        identity: Option<&Identity>,
        message: ClientMessage,
        tx: &OutboundSender,
    ) {
        let message = match message {
            ClientMessage::Ping { data } => {
                let _ = tx.send(encode(&ServerMessage::Pong { data }));
                return;
            }
            privileged => privileged,
        };

        let identity = match identity {
            Some(identity) => identity,
            None => {
                let _ = tx.send(encode(&ServerMessage::Error {
                    message: "authentication required".to_string(),
                }));
                return;
            }
        };

        let result = match message {
            ClientMessage::JoinRace { race_id, vehicle_id } => {
                self.join_race(identity, &race_id, &vehicle_id).await
            }
            ClientMessage::LeaveRace { race_id } => self.leave_race(identity, &race_id).await,
            ClientMessage::PositionUpdate { race_id, position } => {
                self.position_update(identity, &race_id, position).await
            }
            ClientMessage::ReadyToStart { race_id } => self.ready_to_start(identity, &race_id).await,
            ClientMessage::FinishRace { race_id } => self.finish_race(identity, &race_id).await,
            ClientMessage::Ping { .. } => Ok(()),
        };

        if let Err(e) = result {
            let _ = tx.send(encode(&ServerMessage::Error {
                message: e.to_string(),
            }));
        }
    }

    async fn join_race(
        &self,
        identity: &Identity,
        race_id: &str,
        vehicle_id: &str,
    ) -> Result<(), RaceError> {
        let handle = self
            .registry
            .get(race_id)
            .await
            .ok_or(RaceError::RaceNotFound)?;

        let (events, recipients) = {
            let mut race = handle.lock().await;
            let events = race.join(
                &identity.user_id,
                &identity.display_name,
                vehicle_id,
                now_ms(),
            )?;
            (events, race.participant_ids())
        };

        self.dispatcher.dispatch(&recipients, events).await;
        Ok(())
    }

    async fn leave_race(&self, identity: &Identity, race_id: &str) -> Result<(), RaceError> {
        let handle = self
            .registry
            .get(race_id)
            .await
            .ok_or(RaceError::RaceNotFound)?;

        let (events, recipients, status) = {
            let mut race = handle.lock().await;
            let events = race.leave(&identity.user_id)?;
            (events, race.participant_ids(), race.status)
        };

        self.dispatcher.dispatch(&recipients, events).await;
        if status == RaceStatus::Cancelled {
            self.registry.remove(race_id).await;
        }
        Ok(())
    }

    async fn position_update(
        &self,
        identity: &Identity,
        race_id: &str,
        report: PositionReport,
    ) -> Result<(), RaceError> {
        let handle = self
            .registry
            .get(race_id)
            .await
            .ok_or(RaceError::RaceNotFound)?;
        let now = now_ms();

        let (events, recipients, finished, end_time) = {
            let mut race = handle.lock().await;
            let status_before = race.status;
            let events = race.apply_position(&identity.user_id, report.at(now), now)?;
            let finished =
                status_before != RaceStatus::Finished && race.status == RaceStatus::Finished;
            (events, race.participant_ids(), finished, race.end_time)
        };

        self.dispatcher.dispatch(&recipients, events).await;
        if finished {
            self.persist_final_state(race_id, end_time);
        }
        Ok(())
    }

    async fn ready_to_start(&self, identity: &Identity, race_id: &str) -> Result<(), RaceError> {
        let handle = self
            .registry
            .get(race_id)
            .await
            .ok_or(RaceError::RaceNotFound)?;

        let (events, recipients) = {
            let race = handle.lock().await;
            let events = race.mark_ready(&identity.user_id)?;
            (events, race.participant_ids())
        };

        self.dispatcher.dispatch(&recipients, events).await;
        Ok(())
    }

    async fn finish_race(&self, identity: &Identity, race_id: &str) -> Result<(), RaceError> {
        let handle = self
            .registry
            .get(race_id)
            .await
            .ok_or(RaceError::RaceNotFound)?;
        let now = now_ms();

        let (events, recipients, finished, end_time) = {
            let mut race = handle.lock().await;
            let status_before = race.status;
            let events = race.finish_participant(&identity.user_id, now)?;
            let finished =
                status_before != RaceStatus::Finished && race.status == RaceStatus::Finished;
            (events, race.participant_ids(), finished, race.end_time)
        };

        self.dispatcher.dispatch(&recipients, events).await;
        if finished {
            self.persist_final_state(race_id, end_time);
        }
        Ok(())
    }

    /// Closing a connection synchronously unwinds its race memberships:
    /// the identity leaves every race it belongs to, with the usual
    /// cancellation cascade for a host leaving a WAITING race.
    async fn handle_disconnect(&self, user_id: &str, tx: &OutboundSender) {
        {
            let mut connections = self.connections.write().await;
            match connections.sender_for(user_id) {
                // only drop the registration this connection owns; a newer
                // connection may have replaced it already (last wins)
                Some(current) if current.same_channel(tx) => {
                    connections.unregister(user_id);
                }
                _ => return,
            }
        }

        for race_id in self.registry.race_ids().await {
            let handle = match self.registry.get(&race_id).await {
                Some(handle) => handle,
                None => continue,
            };

            let outcome = {
                let mut race = handle.lock().await;
                if race.contains(user_id) {
                    let events = race.leave(user_id).unwrap_or_default();
                    Some((events, race.participant_ids(), race.status))
                } else {
                    None
                }
            };

            if let Some((events, recipients, status)) = outcome {
                self.dispatcher.dispatch(&recipients, events).await;
                if status == RaceStatus::Cancelled {
                    self.registry.remove(&race_id).await;
                }
            }
        }
    }

    /// Fire-and-forget durable update for a race that just finished.
    fn persist_final_state(&self, race_id: &str, end_time: Option<u64>) {
        let store = Arc::clone(&self.store);
        let race_id = race_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = store
                .update_record(&race_id, RaceStatus::Finished, end_time)
                .await
            {
                error!("Failed to persist final state of race {}: {}", race_id, e);
            }
        });
    }

    /// Creates a race in WAITING on behalf of a host identity and requests
    /// a durable record for it.
    pub async fn create_race(&self, host_id: &str, spec: RaceSpec) -> String {
        let race_id = Uuid::new_v4().to_string();
        let session = RaceSession::new(
            &race_id,
            host_id,
            spec,
            now_ms(),
            self.config.start_delay_ms,
        );
        let snapshot = session.snapshot();
        self.registry.insert(session).await;

        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.create_record(&snapshot).await {
                error!("Failed to persist new race {}: {}", snapshot.id, e);
            }
        });

        race_id
    }

    /// Snapshots of every race that has not reached a terminal state.
    pub async fn active_races(&self) -> Vec<RaceSnapshot> {
        self.registry.active_snapshots().await
    }

    /// Snapshot of one race; finished races remain visible through the
    /// retention window.
    pub async fn race(&self, race_id: &str) -> Option<RaceSnapshot> {
        self.registry.snapshot(race_id).await
    }

    pub async fn participant_count(&self, race_id: &str) -> Option<usize> {
        self.registry.participant_count(race_id).await
    }

    /// Stops the scheduler and closes every live connection cleanly.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        let _ = self.shutdown_tx.send(true);

        let mut connections = self.connections.write().await;
        for user_id in connections.user_ids() {
            if let Some(sender) = connections.sender_for(&user_id) {
                let _ = sender.send(Message::Close(None));
            }
            connections.unregister(&user_id);
        }
    }
}

/// Bearer credential from the upgrade request: `Authorization: Bearer ...`
/// wins, a `token` query parameter is the fallback for browser clients.
fn extract_token(request: &Request) -> Option<String> {
    if let Some(value) = request.headers().get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }

    request.uri().query().and_then(|query| {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("token=").map(|token| token.to_string()))
    })
}

fn encode(message: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalIssuer;
    use crate::gateway::{NoopStore, StoreError};
    use async_trait::async_trait;
    use shared::{Checkpoint, RaceSettings, Route};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec() -> RaceSpec {
        RaceSpec {
            name: "midnight sprint".to_string(),
            route: Route {
                checkpoints: vec![Checkpoint {
                    latitude: 45.0,
                    longitude: 7.0,
                    radius_m: 10.0,
                }],
                total_distance_m: 1_000.0,
                laps: 1,
            },
            settings: RaceSettings::default(),
        }
    }

    fn identity(user_id: &str) -> Identity {
        Identity {
            user_id: user_id.to_string(),
            display_name: user_id.to_string(),
            role: crate::auth::Role::Player,
        }
    }

    fn server() -> Arc<RaceServer> {
        RaceServer::new(
            Arc::new(LocalIssuer),
            Arc::new(NoopStore),
            ServerConfig::default(),
        )
    }

    struct CountingStore {
        creates: AtomicUsize,
        updates: AtomicUsize,
    }

    #[async_trait]
    impl RaceStore for CountingStore {
        async fn create_record(&self, _race: &RaceSnapshot) -> Result<(), StoreError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn update_record(
            &self,
            _race_id: &str,
            _status: RaceStatus,
            _end_time: Option<u64>,
        ) -> Result<(), StoreError> {
            self.updates.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_create_race_is_queryable() {
        let server = server();
        let race_id = server.create_race("host", spec()).await;

        let snapshot = server.race(&race_id).await.unwrap();
        assert_eq!(snapshot.status, RaceStatus::Waiting);
        assert_eq!(snapshot.host_id, "host");
        assert_eq!(server.participant_count(&race_id).await, Some(0));
        assert_eq!(server.active_races().await.len(), 1);
        assert!(server.race("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_create_race_requests_durable_record() {
        let store = Arc::new(CountingStore {
            creates: AtomicUsize::new(0),
            updates: AtomicUsize::new(0),
        });
        let server = RaceServer::new(
            Arc::new(LocalIssuer),
            Arc::clone(&store) as Arc<dyn RaceStore>,
            ServerConfig::default(),
        );

        server.create_race("host", spec()).await;
        // the write is fire-and-forget; give the spawned task a moment
        for _ in 0..50 {
            if store.creates.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.creates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ping_works_without_identity() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        server
            .handle_message(None, ClientMessage::Ping { data: None }, &tx)
            .await;

        let frame = rx.try_recv().unwrap();
        assert!(frame.to_text().unwrap().contains("pong"));
    }

    #[tokio::test]
    async fn test_privileged_message_requires_identity() {
        let server = server();
        let race_id = server.create_race("host", spec()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        server
            .handle_message(
                None,
                ClientMessage::JoinRace {
                    race_id: race_id.clone(),
                    vehicle_id: "veh-1".to_string(),
                },
                &tx,
            )
            .await;

        let frame = rx.try_recv().unwrap();
        assert!(frame.to_text().unwrap().contains("authentication required"));
        assert_eq!(server.participant_count(&race_id).await, Some(0));
    }

    #[tokio::test]
    async fn test_join_unknown_race_reports_error() {
        let server = server();
        let (tx, mut rx) = mpsc::unbounded_channel();

        server
            .handle_message(
                Some(&identity("alice")),
                ClientMessage::JoinRace {
                    race_id: "missing".to_string(),
                    vehicle_id: "veh-1".to_string(),
                },
                &tx,
            )
            .await;

        let frame = rx.try_recv().unwrap();
        assert!(frame.to_text().unwrap().contains("race not found"));
    }

    #[tokio::test]
    async fn test_join_flow_delivers_snapshot() {
        let server = server();
        let race_id = server.create_race("alice", spec()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        server
            .connections
            .write()
            .await
            .register("alice", tx.clone());

        server
            .handle_message(
                Some(&identity("alice")),
                ClientMessage::JoinRace {
                    race_id: race_id.clone(),
                    vehicle_id: "veh-1".to_string(),
                },
                &tx,
            )
            .await;

        let frame = rx.try_recv().unwrap();
        assert!(frame.to_text().unwrap().contains("race_joined"));
        assert_eq!(server.participant_count(&race_id).await, Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_cascades_into_races() {
        let server = server();
        let race_id = server.create_race("host", spec()).await;

        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        {
            let mut connections = server.connections.write().await;
            connections.register("host", host_tx.clone());
            connections.register("alice", alice_tx.clone());
        }

        for (user, tx) in [("host", &host_tx), ("alice", &alice_tx)] {
            server
                .handle_message(
                    Some(&identity(user)),
                    ClientMessage::JoinRace {
                        race_id: race_id.clone(),
                        vehicle_id: "veh-1".to_string(),
                    },
                    tx,
                )
                .await;
        }
        assert_eq!(server.participant_count(&race_id).await, Some(2));
        while alice_rx.try_recv().is_ok() {}

        // host drops while the race is WAITING: leave + cancel cascade
        server.handle_disconnect("host", &host_tx).await;

        assert!(server.race(&race_id).await.is_none());
        let first = alice_rx.try_recv().unwrap();
        let second = alice_rx.try_recv().unwrap();
        assert!(first.to_text().unwrap().contains("participant_left"));
        assert!(second.to_text().unwrap().contains("race_cancelled"));
    }

    #[tokio::test]
    async fn test_stale_disconnect_keeps_newer_connection() {
        let server = server();
        let (old_tx, _old_rx) = mpsc::unbounded_channel();
        let (new_tx, _new_rx) = mpsc::unbounded_channel();

        server
            .connections
            .write()
            .await
            .register("alice", old_tx.clone());
        server.connections.write().await.register("alice", new_tx);

        // the replaced connection's teardown must not evict the new one
        server.handle_disconnect("alice", &old_tx).await;
        assert!(server.connections.read().await.is_connected("alice"));
    }

    #[tokio::test]
    async fn test_token_extraction() {
        let request = Request::builder()
            .uri("ws://localhost/live?token=abc123")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request), Some("abc123".to_string()));

        let request = Request::builder()
            .uri("ws://localhost/live")
            .header("authorization", "Bearer xyz")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request), Some("xyz".to_string()));

        let request = Request::builder()
            .uri("ws://localhost/live")
            .body(())
            .unwrap();
        assert_eq!(extract_token(&request), None);
    }
}
