//! Authoritative state for a single race session
//!
//! Each `RaceSession` owns one race's roster, status machine and route
//! progress. Mutating operations return the events to broadcast so that
//! transport concerns stay out of race logic; the caller is responsible for
//! serializing access (one `tokio::sync::Mutex` per session, see `registry`).

use log::{debug, info};
use shared::{
    ParticipantSnapshot, Position, RaceResultEntry, RaceSettings, RaceSnapshot, RaceStatus, Route,
    ServerMessage,
};
use std::collections::HashMap;
use thiserror::Error;

pub type UserId = String;

/// Domain rule violations surfaced to the offending sender only.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RaceError {
    #[error("race not found")]
    RaceNotFound,
    #[error("race is not joinable")]
    RaceNotJoinable,
    #[error("race is full")]
    RaceFull,
    #[error("already joined this race")]
    AlreadyJoined,
    #[error("not participating in this race")]
    NotParticipating,
}

/// Who an event is addressed to, resolved by the dispatcher against the
/// race's roster at send time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    All,
    AllExcept(UserId),
    One(UserId),
}

/// One broadcastable state change produced by a session operation.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceEvent {
    pub audience: Audience,
    pub message: ServerMessage,
}

impl RaceEvent {
    fn to_all(message: ServerMessage) -> Self {
        Self {
            audience: Audience::All,
            message,
        }
    }

    fn to_all_except(user_id: &str, message: ServerMessage) -> Self {
        Self {
            audience: Audience::AllExcept(user_id.to_string()),
            message,
        }
    }

    fn to_one(user_id: &str, message: ServerMessage) -> Self {
        Self {
            audience: Audience::One(user_id.to_string()),
            message,
        }
    }
}

/// An identity competing in this race.
#[derive(Debug, Clone)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub vehicle_id: String,
    pub position: Option<Position>,
    /// Completed lap durations in milliseconds; always `current_lap` long.
    pub lap_times: Vec<u64>,
    pub current_lap: u32,
    /// Index of the next checkpoint that registers progress. Laps only
    /// advance through sequential traversal, so entering a later
    /// checkpoint's radius out of order does nothing.
    pub next_checkpoint: usize,
    /// Provisional (join order) until `finished`, then final and immutable.
    pub rank: Option<u32>,
    pub finished: bool,
    pub total_time: Option<u64>,
    pub joined_at: u64,
    lap_started_at: Option<u64>,
}

impl Participant {
    fn new(user_id: &str, display_name: &str, vehicle_id: &str, rank: u32, now: u64) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            vehicle_id: vehicle_id.to_string(),
            position: None,
            lap_times: Vec::new(),
            current_lap: 0,
            next_checkpoint: 0,
            rank: Some(rank),
            finished: false,
            total_time: None,
            joined_at: now,
            lap_started_at: None,
        }
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        ParticipantSnapshot {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            vehicle_id: self.vehicle_id.clone(),
            position: self.position,
            current_lap: self.current_lap,
            lap_times: self.lap_times.clone(),
            rank: self.rank,
            finished: self.finished,
            joined_at: self.joined_at,
        }
    }
}

/// Host-provided parameters for a new race.
#[derive(Debug, Clone)]
pub struct RaceSpec {
    pub name: String,
    pub route: Route,
    pub settings: RaceSettings,
}

/// One live race: roster, route progress and the status machine
/// WAITING -> ACTIVE -> FINISHED, WAITING -> CANCELLED.
#[derive(Debug)]
pub struct RaceSession {
    pub id: String,
    pub name: String,
    pub host_id: UserId,
    pub status: RaceStatus,
    /// Epoch milliseconds; the scheduler promotes or cancels once reached.
    pub scheduled_start: u64,
    pub actual_start: Option<u64>,
    pub end_time: Option<u64>,
    pub participants: HashMap<UserId, Participant>,
    pub route: Route,
    pub settings: RaceSettings,
}

impl RaceSession {
    pub fn new(id: &str, host_id: &str, spec: RaceSpec, now: u64, start_delay_ms: u64) -> Self {
        info!(
            "Race {} ({}) created by {}, starts in {}ms",
            id, spec.name, host_id, start_delay_ms
        );
        Self {
            id: id.to_string(),
            name: spec.name,
            host_id: host_id.to_string(),
            status: RaceStatus::Waiting,
            scheduled_start: now + start_delay_ms,
            actual_start: None,
            end_time: None,
            participants: HashMap::new(),
            route: spec.route,
            settings: spec.settings,
        }
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Roster snapshot used by the dispatcher to resolve audiences.
    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> RaceSnapshot {
        let mut participants: Vec<ParticipantSnapshot> =
            self.participants.values().map(Participant::snapshot).collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then(a.user_id.cmp(&b.user_id)));

        RaceSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            host_id: self.host_id.clone(),
            status: self.status,
            scheduled_start: self.scheduled_start,
            actual_start: self.actual_start,
            end_time: self.end_time,
            participants,
            route: self.route.clone(),
            settings: self.settings.clone(),
        }
    }

    /// Adds an identity to the roster. Only valid while WAITING.
    pub fn join(
        &mut self,
        user_id: &str,
        display_name: &str,
        vehicle_id: &str,
        now: u64,
    ) -> Result<Vec<RaceEvent>, RaceError> {
        if self.status != RaceStatus::Waiting {
            return Err(RaceError::RaceNotJoinable);
        }
        if self.participants.len() >= self.settings.max_participants {
            return Err(RaceError::RaceFull);
        }
        if self.participants.contains_key(user_id) {
            return Err(RaceError::AlreadyJoined);
        }

        let provisional_rank = self.participants.len() as u32 + 1;
        let participant = Participant::new(user_id, display_name, vehicle_id, provisional_rank, now);
        let joined = participant.snapshot();
        self.participants.insert(user_id.to_string(), participant);
        info!(
            "User {} joined race {} ({}/{})",
            user_id,
            self.id,
            self.participants.len(),
            self.settings.max_participants
        );

        Ok(vec![
            RaceEvent::to_one(
                user_id,
                ServerMessage::RaceJoined {
                    race: self.snapshot(),
                },
            ),
            RaceEvent::to_all_except(
                user_id,
                ServerMessage::ParticipantJoined {
                    race_id: self.id.clone(),
                    participant: joined,
                },
            ),
        ])
    }

    /// Removes an identity from the roster. Valid while WAITING or ACTIVE;
    /// a no-op on terminal races. The host leaving a WAITING race cancels it.
    pub fn leave(&mut self, user_id: &str) -> Result<Vec<RaceEvent>, RaceError> {
        match self.status {
            RaceStatus::Waiting | RaceStatus::Active => {}
            _ => return Ok(Vec::new()),
        }
        if self.participants.remove(user_id).is_none() {
            return Err(RaceError::NotParticipating);
        }
        info!("User {} left race {}", user_id, self.id);

        let mut events = vec![RaceEvent::to_all(ServerMessage::ParticipantLeft {
            race_id: self.id.clone(),
            user_id: user_id.to_string(),
        })];

        if user_id == self.host_id && self.status == RaceStatus::Waiting {
            events.extend(self.cancel());
        }

        Ok(events)
    }

    /// Purely informational; no state change.
    pub fn mark_ready(&self, user_id: &str) -> Result<Vec<RaceEvent>, RaceError> {
        if !self.participants.contains_key(user_id) {
            return Err(RaceError::NotParticipating);
        }

        Ok(vec![RaceEvent::to_all(ServerMessage::ParticipantReady {
            race_id: self.id.clone(),
            user_id: user_id.to_string(),
        })])
    }

    /// WAITING -> ACTIVE. Any other status leaves the race unchanged.
    pub fn start(&mut self, now: u64) -> Vec<RaceEvent> {
        if self.status != RaceStatus::Waiting {
            return Vec::new();
        }
        self.status = RaceStatus::Active;
        self.actual_start = Some(now);
        for participant in self.participants.values_mut() {
            participant.lap_started_at = Some(now);
        }
        info!(
            "Race {} started with {} participants",
            self.id,
            self.participants.len()
        );

        vec![RaceEvent::to_all(ServerMessage::RaceStarted {
            race_id: self.id.clone(),
            start_time: now,
        })]
    }

    /// Accepts a telemetry sample while ACTIVE and runs checkpoint
    /// detection. Outside ACTIVE the update is dropped without error.
    pub fn apply_position(
        &mut self,
        user_id: &str,
        position: Position,
        now: u64,
    ) -> Result<Vec<RaceEvent>, RaceError> {
        if self.status != RaceStatus::Active {
            return Ok(Vec::new());
        }

        let actual_start = self.actual_start.unwrap_or(self.scheduled_start);
        let total_checkpoints = self.route.checkpoints.len();
        let race_laps = self.route.laps;
        let race_id = self.id.clone();

        let mut lap_event = None;
        let mut lap_finished_race = false;
        {
            let participant = self
                .participants
                .get_mut(user_id)
                .ok_or(RaceError::NotParticipating)?;
            participant.position = Some(position);

            if !participant.finished && total_checkpoints > 0 {
                let idx = participant.next_checkpoint;
                let checkpoint = self.route.checkpoints[idx];
                if checkpoint.contains(position.point()) {
                    if idx + 1 < total_checkpoints {
                        participant.next_checkpoint = idx + 1;
                        debug!(
                            "User {} reached checkpoint {} in race {}",
                            user_id, idx, race_id
                        );
                    } else {
                        // final checkpoint: lap boundary
                        let lap_start = participant.lap_started_at.unwrap_or(actual_start);
                        let lap_time = now.saturating_sub(lap_start);
                        participant.lap_times.push(lap_time);
                        participant.current_lap += 1;
                        participant.lap_started_at = Some(now);
                        participant.next_checkpoint = 0;
                        info!(
                            "User {} completed lap {}/{} in race {} ({}ms)",
                            user_id, participant.current_lap, race_laps, race_id, lap_time
                        );

                        lap_event = Some(RaceEvent::to_all(ServerMessage::LapCompleted {
                            race_id: race_id.clone(),
                            user_id: user_id.to_string(),
                            lap: participant.current_lap,
                            lap_time,
                            total_time: now.saturating_sub(actual_start),
                        }));
                        lap_finished_race = participant.current_lap >= race_laps;
                    }
                }
            }
        }

        let mut events = vec![RaceEvent::to_all_except(
            user_id,
            ServerMessage::PositionUpdate {
                race_id,
                user_id: user_id.to_string(),
                position,
            },
        )];
        if let Some(event) = lap_event {
            events.push(event);
        }
        if lap_finished_race {
            events.extend(self.finish_participant(user_id, now)?);
        }

        Ok(events)
    }

    /// Marks a participant finished with the next free rank. Ends the race
    /// once every participant finished, or as soon as the first one does
    /// (first-past-the-post short-circuit).
    pub fn finish_participant(
        &mut self,
        user_id: &str,
        now: u64,
    ) -> Result<Vec<RaceEvent>, RaceError> {
        if self.status != RaceStatus::Active {
            return Ok(Vec::new());
        }

        let finished_before = self.participants.values().filter(|p| p.finished).count() as u32;
        let actual_start = self.actual_start.unwrap_or(self.scheduled_start);
        let race_id = self.id.clone();

        let participant = self
            .participants
            .get_mut(user_id)
            .ok_or(RaceError::NotParticipating)?;
        if participant.finished {
            // rank and total time are immutable once set
            return Ok(Vec::new());
        }

        let rank = finished_before + 1;
        let total_time = now.saturating_sub(actual_start);
        participant.finished = true;
        participant.rank = Some(rank);
        participant.total_time = Some(total_time);
        info!(
            "User {} finished race {} in position {} ({}ms)",
            user_id, race_id, rank, total_time
        );

        let mut events = vec![RaceEvent::to_all(ServerMessage::ParticipantFinished {
            race_id,
            user_id: user_id.to_string(),
            position: rank,
            total_time,
        })];

        let all_finished = self.participants.values().all(|p| p.finished);
        if all_finished || rank == 1 {
            events.extend(self.end_race(now));
        }

        Ok(events)
    }

    /// ACTIVE -> FINISHED with final ordered standings.
    pub fn end_race(&mut self, now: u64) -> Vec<RaceEvent> {
        if self.status != RaceStatus::Active {
            return Vec::new();
        }
        self.status = RaceStatus::Finished;
        self.end_time = Some(now);
        let total_duration = now.saturating_sub(self.actual_start.unwrap_or(now));
        info!("Race {} finished after {}ms", self.id, total_duration);

        vec![RaceEvent::to_all(ServerMessage::RaceFinished {
            race_id: self.id.clone(),
            results: self.results(),
            total_duration,
        })]
    }

    /// WAITING -> CANCELLED. Any other status leaves the race unchanged.
    pub fn cancel(&mut self) -> Vec<RaceEvent> {
        if self.status != RaceStatus::Waiting {
            return Vec::new();
        }
        self.status = RaceStatus::Cancelled;
        info!("Race {} cancelled", self.id);

        vec![RaceEvent::to_all(ServerMessage::RaceCancelled {
            race_id: self.id.clone(),
        })]
    }

    /// Final standings: finished participants by rank, then unfinished by
    /// lap count descending (join order breaks ties).
    pub fn results(&self) -> Vec<RaceResultEntry> {
        let mut finished: Vec<&Participant> =
            self.participants.values().filter(|p| p.finished).collect();
        finished.sort_by_key(|p| p.rank.unwrap_or(u32::MAX));

        let mut unfinished: Vec<&Participant> =
            self.participants.values().filter(|p| !p.finished).collect();
        unfinished.sort_by(|a, b| {
            b.current_lap
                .cmp(&a.current_lap)
                .then(a.joined_at.cmp(&b.joined_at))
                .then(a.user_id.cmp(&b.user_id))
        });

        finished
            .into_iter()
            .chain(unfinished)
            .map(|p| RaceResultEntry {
                user_id: p.user_id.clone(),
                display_name: p.display_name.clone(),
                rank: if p.finished { p.rank } else { None },
                laps_completed: p.current_lap,
                total_time: p.total_time,
                finished: p.finished,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{Checkpoint, Visibility};

    const NOW: u64 = 1_700_000_000_000;

    fn single_checkpoint_route(laps: u32) -> Route {
        Route {
            checkpoints: vec![Checkpoint {
                latitude: 45.0,
                longitude: 7.0,
                radius_m: 10.0,
            }],
            total_distance_m: 1_000.0,
            laps,
        }
    }

    fn three_checkpoint_route(laps: u32) -> Route {
        Route {
            checkpoints: vec![
                Checkpoint {
                    latitude: 45.0,
                    longitude: 7.0,
                    radius_m: 10.0,
                },
                Checkpoint {
                    latitude: 45.01,
                    longitude: 7.0,
                    radius_m: 10.0,
                },
                Checkpoint {
                    latitude: 45.02,
                    longitude: 7.0,
                    radius_m: 10.0,
                },
            ],
            total_distance_m: 4_000.0,
            laps,
        }
    }

    fn spec(route: Route, max_participants: usize) -> RaceSpec {
        RaceSpec {
            name: "Night Run".to_string(),
            route,
            settings: RaceSettings {
                max_participants,
                allowed_vehicle_classes: Vec::new(),
                visibility: Visibility::Public,
                entry_fee: None,
                prize_pool: None,
            },
        }
    }

    fn position(latitude: f64, longitude: f64) -> Position {
        Position {
            latitude,
            longitude,
            speed: 120.0,
            heading: 0.0,
            timestamp: NOW,
        }
    }

    fn active_session(route: Route, users: &[&str]) -> RaceSession {
        let mut race = RaceSession::new("r1", users[0], spec(route, 8), NOW, 30_000);
        for user in users {
            race.join(user, user, "veh-1", NOW).unwrap();
        }
        race.start(NOW + 1_000);
        race
    }

    #[test]
    fn test_new_race_is_waiting() {
        let race = RaceSession::new("r1", "host", spec(single_checkpoint_route(1), 8), NOW, 30_000);

        assert_eq!(race.status, RaceStatus::Waiting);
        assert_eq!(race.scheduled_start, NOW + 30_000);
        assert!(race.actual_start.is_none());
        assert!(race.participants.is_empty());
    }

    #[test]
    fn test_join_emits_snapshot_and_broadcast() {
        let mut race =
            RaceSession::new("r1", "host", spec(single_checkpoint_route(1), 8), NOW, 30_000);

        let events = race.join("host", "Host", "veh-1", NOW).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].audience, Audience::One("host".to_string()));
        match &events[0].message {
            ServerMessage::RaceJoined { race } => {
                assert_eq!(race.id, "r1");
                assert_eq!(race.participants.len(), 1);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(events[1].audience, Audience::AllExcept("host".to_string()));
        match &events[1].message {
            ServerMessage::ParticipantJoined { participant, .. } => {
                assert_eq!(participant.user_id, "host");
                assert_eq!(participant.rank, Some(1));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_join_enforces_capacity() {
        let mut race =
            RaceSession::new("r1", "a", spec(single_checkpoint_route(1), 2), NOW, 30_000);

        assert!(race.join("a", "A", "veh-1", NOW).is_ok());
        assert!(race.join("b", "B", "veh-1", NOW).is_ok());
        assert_eq!(race.join("c", "C", "veh-1", NOW), Err(RaceError::RaceFull));
        assert_eq!(race.participants.len(), 2);
        assert!(race.participants.len() <= race.settings.max_participants);
    }

    #[test]
    fn test_join_rejects_duplicate_identity() {
        let mut race =
            RaceSession::new("r1", "a", spec(single_checkpoint_route(1), 8), NOW, 30_000);

        race.join("a", "A", "veh-1", NOW).unwrap();
        assert_eq!(
            race.join("a", "A", "veh-2", NOW),
            Err(RaceError::AlreadyJoined)
        );
        assert_eq!(race.participants.len(), 1);
    }

    #[test]
    fn test_join_rejected_after_start() {
        let mut race = active_session(single_checkpoint_route(1), &["a"]);
        assert_eq!(
            race.join("b", "B", "veh-1", NOW),
            Err(RaceError::RaceNotJoinable)
        );
    }

    #[test]
    fn test_leave_emits_participant_left_at_most_once() {
        let mut race =
            RaceSession::new("r1", "a", spec(single_checkpoint_route(1), 8), NOW, 30_000);
        race.join("a", "A", "veh-1", NOW).unwrap();
        race.join("b", "B", "veh-1", NOW).unwrap();

        let events = race.leave("b").unwrap();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].message,
            ServerMessage::ParticipantLeft { .. }
        ));

        // second leave surfaces the domain error and changes nothing
        assert_eq!(race.leave("b"), Err(RaceError::NotParticipating));
        assert_eq!(race.participants.len(), 1);
        assert_eq!(race.status, RaceStatus::Waiting);
    }

    #[test]
    fn test_host_leaving_waiting_race_cancels_it() {
        let mut race =
            RaceSession::new("r1", "host", spec(single_checkpoint_route(1), 8), NOW, 30_000);
        race.join("host", "Host", "veh-1", NOW).unwrap();
        race.join("b", "B", "veh-1", NOW).unwrap();

        let events = race.leave("host").unwrap();
        assert_eq!(race.status, RaceStatus::Cancelled);
        assert!(matches!(
            events[0].message,
            ServerMessage::ParticipantLeft { .. }
        ));
        assert!(matches!(
            events[1].message,
            ServerMessage::RaceCancelled { .. }
        ));
        assert_eq!(events[1].audience, Audience::All);
    }

    #[test]
    fn test_host_leaving_active_race_does_not_cancel() {
        let mut race = active_session(single_checkpoint_route(3), &["host", "b"]);

        let events = race.leave("host").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(race.status, RaceStatus::Active);
    }

    #[test]
    fn test_mark_ready_is_informational() {
        let mut race =
            RaceSession::new("r1", "a", spec(single_checkpoint_route(1), 8), NOW, 30_000);
        race.join("a", "A", "veh-1", NOW).unwrap();

        let status_before = race.status;
        let events = race.mark_ready("a").unwrap();
        assert!(matches!(
            events[0].message,
            ServerMessage::ParticipantReady { .. }
        ));
        assert_eq!(race.status, status_before);

        assert_eq!(race.mark_ready("ghost"), Err(RaceError::NotParticipating));
    }

    #[test]
    fn test_position_update_dropped_outside_active() {
        let mut race =
            RaceSession::new("r1", "a", spec(single_checkpoint_route(1), 8), NOW, 30_000);
        race.join("a", "A", "veh-1", NOW).unwrap();

        let events = race.apply_position("a", position(45.0, 7.0), NOW).unwrap();
        assert!(events.is_empty());
        assert!(race.participants["a"].position.is_none());
        assert_eq!(race.participants["a"].current_lap, 0);
    }

    #[test]
    fn test_position_broadcast_excludes_sender() {
        let mut race = active_session(three_checkpoint_route(2), &["a", "b"]);

        let events = race
            .apply_position("a", position(40.0, 3.0), NOW + 2_000)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].audience, Audience::AllExcept("a".to_string()));
        assert!(matches!(
            events[0].message,
            ServerMessage::PositionUpdate { .. }
        ));
        assert!(race.participants["a"].position.is_some());
    }

    #[test]
    fn test_checkpoints_register_in_sequence_only() {
        let mut race = active_session(three_checkpoint_route(2), &["a"]);

        // jumping straight into the final checkpoint's radius must not
        // complete a lap while earlier checkpoints are outstanding
        let events = race
            .apply_position("a", position(45.02, 7.0), NOW + 2_000)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(race.participants["a"].current_lap, 0);
        assert_eq!(race.participants["a"].next_checkpoint, 0);

        // sequential traversal advances one checkpoint per update
        race.apply_position("a", position(45.0, 7.0), NOW + 3_000)
            .unwrap();
        assert_eq!(race.participants["a"].next_checkpoint, 1);
        race.apply_position("a", position(45.01, 7.0), NOW + 4_000)
            .unwrap();
        assert_eq!(race.participants["a"].next_checkpoint, 2);

        let events = race
            .apply_position("a", position(45.02, 7.0), NOW + 5_000)
            .unwrap();
        assert_eq!(race.participants["a"].current_lap, 1);
        assert_eq!(race.participants["a"].next_checkpoint, 0);
        assert!(events
            .iter()
            .any(|e| matches!(e.message, ServerMessage::LapCompleted { .. })));
    }

    #[test]
    fn test_single_checkpoint_final_lap_finishes_race() {
        let mut race = active_session(single_checkpoint_route(1), &["a"]);

        // landing exactly on the finish line coordinates
        let events = race
            .apply_position("a", position(45.0, 7.0), NOW + 61_000)
            .unwrap();

        let kinds: Vec<&ServerMessage> = events.iter().map(|e| &e.message).collect();
        assert!(matches!(kinds[0], ServerMessage::PositionUpdate { .. }));
        match kinds[1] {
            ServerMessage::LapCompleted { lap, lap_time, .. } => {
                assert_eq!(*lap, 1);
                assert_eq!(*lap_time, 60_000);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        match kinds[2] {
            ServerMessage::ParticipantFinished { position, .. } => assert_eq!(*position, 1),
            other => panic!("Unexpected message: {:?}", other),
        }
        // exactly one finisher ends the race immediately
        match kinds[3] {
            ServerMessage::RaceFinished { results, .. } => {
                assert_eq!(results.len(), 1);
                assert_eq!(results[0].rank, Some(1));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(race.status, RaceStatus::Finished);
        assert!(race.end_time.is_some());
    }

    #[test]
    fn test_lap_times_track_lap_count() {
        let mut race = active_session(single_checkpoint_route(3), &["a", "b"]);

        race.apply_position("a", position(45.0, 7.0), NOW + 61_000)
            .unwrap();
        let p = &race.participants["a"];
        assert_eq!(p.current_lap, 1);
        assert_eq!(p.lap_times.len() as u32, p.current_lap);

        race.apply_position("a", position(45.0, 7.0), NOW + 130_000)
            .unwrap();
        let p = &race.participants["a"];
        assert_eq!(p.current_lap, 2);
        assert_eq!(p.lap_times, vec![60_000, 69_000]);
        assert!(!p.finished);
        assert_eq!(race.status, RaceStatus::Active);
    }

    #[test]
    fn test_finished_rank_and_total_time_are_immutable() {
        let mut race = active_session(single_checkpoint_route(1), &["a", "b"]);

        race.finish_participant("a", NOW + 50_000).unwrap();
        let rank = race.participants["a"].rank;
        let total = race.participants["a"].total_time;

        let events = race.finish_participant("a", NOW + 90_000).unwrap();
        assert!(events.is_empty());
        assert_eq!(race.participants["a"].rank, rank);
        assert_eq!(race.participants["a"].total_time, total);
    }

    #[test]
    fn test_status_transitions_are_monotonic() {
        let mut race = active_session(single_checkpoint_route(1), &["a"]);

        // ACTIVE cannot be cancelled or restarted
        assert!(race.cancel().is_empty());
        assert_eq!(race.status, RaceStatus::Active);
        assert!(race.start(NOW + 5_000).is_empty());

        race.finish_participant("a", NOW + 50_000).unwrap();
        assert_eq!(race.status, RaceStatus::Finished);

        // FINISHED is terminal
        assert!(race.start(NOW + 60_000).is_empty());
        assert!(race.cancel().is_empty());
        assert!(race.end_race(NOW + 60_000).is_empty());
        assert_eq!(race.status, RaceStatus::Finished);
    }

    #[test]
    fn test_results_order_finished_then_by_laps() {
        let mut race = active_session(single_checkpoint_route(5), &["a", "b", "c"]);

        // b completes two laps, c one, a none
        race.apply_position("b", position(45.0, 7.0), NOW + 10_000)
            .unwrap();
        race.apply_position("b", position(45.0, 7.0), NOW + 20_000)
            .unwrap();
        race.apply_position("c", position(45.0, 7.0), NOW + 30_000)
            .unwrap();

        race.finish_participant("c", NOW + 40_000).unwrap();
        let results = race.results();

        assert_eq!(results[0].user_id, "c");
        assert_eq!(results[0].rank, Some(1));
        assert!(results[0].finished);
        assert_eq!(results[1].user_id, "b");
        assert_eq!(results[1].laps_completed, 2);
        assert!(results[1].rank.is_none());
        assert_eq!(results[2].user_id, "a");
    }

    #[test]
    fn test_finish_assigns_sequential_ranks() {
        let mut race = active_session(single_checkpoint_route(1), &["a", "b", "c"]);

        // suppress the first-finisher short-circuit by finishing manually
        // through end_race-free path: finish all in one tick order
        race.finish_participant("b", NOW + 40_000).unwrap();
        assert_eq!(race.participants["b"].rank, Some(1));
        // race already finished via first-past-the-post; later finishes are
        // dropped by the terminal status guard
        let events = race.finish_participant("a", NOW + 41_000).unwrap();
        assert!(events.is_empty());
        assert!(!race.participants["a"].finished);
    }
}
