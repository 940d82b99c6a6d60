use serde::{Deserialize, Serialize};

/// Earth mean radius in meters, used by the great-circle distance.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Delay between race creation and its scheduled start.
pub const DEFAULT_START_DELAY_MS: u64 = 30_000;
/// How long a finished race stays queryable before registry removal.
pub const DEFAULT_RETENTION_MS: u64 = 60_000;
/// Lifecycle scheduler tick interval.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// A latitude/longitude pair in degrees.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// Great-circle distance between two points in meters (haversine formula).
///
/// Satisfies `haversine_m(a, a) == 0` and symmetry within floating-point
/// tolerance.
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat_a = a.latitude.to_radians();
    let lat_b = b.latitude.to_radians();
    let d_lat = (b.latitude - a.latitude).to_radians();
    let d_lon = (b.longitude - a.longitude).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// A participant's last reported telemetry sample.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    /// Speed in km/h as reported by the client.
    pub speed: f64,
    /// Heading in degrees, 0 = north.
    pub heading: f64,
    /// Server-side receive time, epoch milliseconds.
    pub timestamp: u64,
}

impl Position {
    pub fn point(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }
}

/// Raw position fields as clients send them; the server stamps the time.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub lat: f64,
    pub lon: f64,
    pub speed: f64,
    pub heading: f64,
}

impl PositionReport {
    pub fn at(&self, timestamp: u64) -> Position {
        Position {
            latitude: self.lat,
            longitude: self.lon,
            speed: self.speed,
            heading: self.heading,
            timestamp,
        }
    }
}

/// A geofenced circular region on the route that registers progress.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
}

impl Checkpoint {
    pub fn center(&self) -> GeoPoint {
        GeoPoint {
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Whether the given point lies inside this checkpoint's radius.
    pub fn contains(&self, point: GeoPoint) -> bool {
        haversine_m(self.center(), point) <= self.radius_m
    }
}

/// Ordered checkpoint sequence; a lap ends at the final checkpoint.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub checkpoints: Vec<Checkpoint>,
    pub total_distance_m: f64,
    pub laps: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceSettings {
    pub max_participants: usize,
    pub allowed_vehicle_classes: Vec<String>,
    pub visibility: Visibility,
    pub entry_fee: Option<u64>,
    pub prize_pool: Option<u64>,
}

impl Default for RaceSettings {
    fn default() -> Self {
        Self {
            max_participants: 8,
            allowed_vehicle_classes: Vec::new(),
            visibility: Visibility::Public,
            entry_fee: None,
            prize_pool: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Waiting,
    Active,
    Finished,
    Cancelled,
}

/// Read-only view of one participant, safe to hand to any client.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    pub user_id: String,
    pub display_name: String,
    pub vehicle_id: String,
    pub position: Option<Position>,
    pub current_lap: u32,
    pub lap_times: Vec<u64>,
    pub rank: Option<u32>,
    pub finished: bool,
    pub joined_at: u64,
}

/// Read-only view of one race session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceSnapshot {
    pub id: String,
    pub name: String,
    pub host_id: String,
    pub status: RaceStatus,
    pub scheduled_start: u64,
    pub actual_start: Option<u64>,
    pub end_time: Option<u64>,
    pub participants: Vec<ParticipantSnapshot>,
    pub route: Route,
    pub settings: RaceSettings,
}

/// One line of the final standings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RaceResultEntry {
    pub user_id: String,
    pub display_name: String,
    pub rank: Option<u32>,
    pub laps_completed: u32,
    pub total_time: Option<u64>,
    pub finished: bool,
}

/// Messages clients send to the coordinator.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinRace {
        race_id: String,
        vehicle_id: String,
    },
    LeaveRace {
        race_id: String,
    },
    PositionUpdate {
        race_id: String,
        position: PositionReport,
    },
    ReadyToStart {
        race_id: String,
    },
    FinishRace {
        race_id: String,
    },
    Ping {
        data: Option<serde_json::Value>,
    },
}

/// Messages the coordinator sends to clients.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        user_id: Option<String>,
    },
    Pong {
        data: Option<serde_json::Value>,
    },
    Error {
        message: String,
    },
    RaceJoined {
        race: RaceSnapshot,
    },
    ParticipantJoined {
        race_id: String,
        participant: ParticipantSnapshot,
    },
    ParticipantLeft {
        race_id: String,
        user_id: String,
    },
    ParticipantReady {
        race_id: String,
        user_id: String,
    },
    PositionUpdate {
        race_id: String,
        user_id: String,
        position: Position,
    },
    LapCompleted {
        race_id: String,
        user_id: String,
        lap: u32,
        lap_time: u64,
        total_time: u64,
    },
    ParticipantFinished {
        race_id: String,
        user_id: String,
        /// Final standing of this participant (1 = winner).
        position: u32,
        total_time: u64,
    },
    RaceFinished {
        race_id: String,
        results: Vec<RaceResultEntry>,
        total_duration: u64,
    },
    RaceStarted {
        race_id: String,
        start_time: u64,
    },
    RaceCancelled {
        race_id: String,
    },
}
