use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PIECE_COUNT: usize = 32;
pub const SP_MESSAGE_MAX_CHARS: usize = 800;
pub const EMPTY_THEME_COLOR: &str = "rgba(255,255,255,1)";

/// Every piece on the board, in board order. Names are fixed for the lifetime
/// of the server and are the only valid `piece_name` values on the wire.
pub const PIECE_NAMES: [&str; PIECE_COUNT] = [
    "Black_00_chariot_left",
    "Black_01_horse_left",
    "Black_02_elephant_left",
    "Black_03_advisor_left",
    "Black_04_general",
    "Black_05_advisor_right",
    "Black_06_elephant_right",
    "Black_07_horse_right",
    "Black_08_chariot_right",
    "Black_09_cannon_left",
    "Black_10_cannon_right",
    "Black_11_soldier_1",
    "Black_12_soldier_2",
    "Black_13_soldier_3",
    "Black_14_soldier_4",
    "Black_15_soldier_5",
    "Red_16_soldier_1",
    "Red_17_soldier_2",
    "Red_18_soldier_3",
    "Red_19_soldier_4",
    "Red_20_soldier_5",
    "Red_21_cannon_left",
    "Red_22_cannon_right",
    "Red_23_chariot_left",
    "Red_24_horse_left",
    "Red_25_elephant_left",
    "Red_26_advisor_left",
    "Red_27_general",
    "Red_28_advisor_right",
    "Red_29_elephant_right",
    "Red_30_horse_right",
    "Red_31_chariot_right",
];

/// Inbound and outbound envelope `type` values.
pub mod kind {
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
    pub const GET_PUBLICKEY: &str = "get_publickey";
    pub const PUBLICKEY: &str = "publickey";
    pub const GET_TOKEN_LOGIN: &str = "get_token_login";
    pub const TOKEN_LOGIN: &str = "token_login";
    pub const GET_SERVER_CONFIG: &str = "get_server_config";
    pub const SERVER_CONFIG: &str = "server_config";
    pub const GET_USER_DATA: &str = "get_user_data";
    pub const USER_DATA: &str = "user_data";
    pub const GET_SYNC_CHESS_PIECES: &str = "get_sync_chess_pieces";
    pub const SYNC_CHESS_PIECES: &str = "sync_chess_pieces";
    pub const GET_CAMP_DATA: &str = "get_camp_data";
    pub const CAMP_DATA: &str = "camp_data";
    pub const GET_SELECT_CAMP_RED: &str = "get_select_camp_red";
    pub const SELECT_CAMP_RED: &str = "select_camp_red";
    pub const GET_SELECT_CAMP_BLACK: &str = "get_select_camp_black";
    pub const SELECT_CAMP_BLACK: &str = "select_camp_black";
    pub const GET_RB_HEAD_POSITION_PITCH_YAW: &str = "get_rb_head_position_pitch_yaw";
    pub const RB_HEAD_POSITION_PITCH_YAW: &str = "rb_head_position_pitch_yaw";
    pub const HEART_3: &str = "heart_3";
    pub const GET_STORAGE_JSON: &str = "get_storage_json";
    pub const STORAGE_JSON: &str = "storage_json";
    pub const BROADCAST: &str = "broadcast";
}

/// `class` values carried by `broadcast` envelopes.
pub mod class {
    pub const PICK_UP_CHESS: &str = "pick_up_chess";
    pub const PICK_DOWN_CHESS: &str = "pick_down_chess";
    pub const MOVING_CHESS: &str = "moving_chess";
    pub const HEAD_POSITION_PITCH_YAW: &str = "head_position_pitch_yaw";
    pub const GIVE_UP: &str = "give_up";
    pub const RESET_ALL_CHESS_PIECES: &str = "reset_all_chess_pieces";
    pub const REQUEST_DRAW: &str = "request_draw";
    pub const RESPONSE_DRAW: &str = "response_draw";
    pub const SP_MESSAGE: &str = "sp_message";
    pub const USER_JOIN_GAME: &str = "user_join_game";
    pub const USER_LEFT_GAME: &str = "user_left_game";
}

/// Formats a timestamp as `YYYY-MM-DD HH:MM:SS:mmm`, the envelope time format.
pub fn format_time<Tz>(time: &chrono::DateTime<Tz>) -> String
where
    Tz: chrono::TimeZone,
    Tz::Offset: std::fmt::Display,
{
    time.format("%Y-%m-%d %H:%M:%S:%3f").to_string()
}

/// Current local time in envelope format.
pub fn now_time() -> String {
    format_time(&chrono::Local::now())
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("undecodable envelope: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("unknown broadcast class '{0}'")]
    UnknownClass(String),
    #[error("malformed payload for '{0}'")]
    MalformedPayload(String),
}

/// Uniform wire unit exchanged in both directions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub class: String,
    #[serde(default)]
    pub conveyor: String,
    #[serde(default)]
    pub time: String,
    #[serde(default)]
    pub data: Value,
}

impl Envelope {
    /// Server-originated envelope with empty class and conveyor.
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            class: String::new(),
            conveyor: String::new(),
            time: now_time(),
            data,
        }
    }

    /// Envelope whose data is the serialized form of `payload`.
    pub fn with_payload<T: Serialize>(kind: &str, payload: &T) -> Self {
        Self::new(kind, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    pub fn broadcast(class: &str, conveyor: &str, data: Value) -> Self {
        Self {
            kind: kind::BROADCAST.to_string(),
            class: class.to_string(),
            conveyor: conveyor.to_string(),
            time: now_time(),
            data,
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes `data` into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone())
            .map_err(|_| ProtocolError::MalformedPayload(self.kind.clone()))
    }

    pub fn is_keepalive(&self) -> bool {
        self.kind == kind::PING
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coord3D {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Coord3D {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Camp {
    Red,
    Black,
}

impl Camp {
    pub fn other(self) -> Camp {
        match self {
            Camp::Red => Camp::Black,
            Camp::Black => Camp::Red,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Camp::Red => "red",
            Camp::Black => "black",
        }
    }

    /// Reply type for a seat claim on this camp.
    pub fn select_reply_kind(self) -> &'static str {
        match self {
            Camp::Red => kind::SELECT_CAMP_RED,
            Camp::Black => kind::SELECT_CAMP_BLACK,
        }
    }
}

// Inbound payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecePlacement {
    pub piece_name: String,
    pub position: Coord3D,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceTrajectory {
    pub piece_name: String,
    pub trajectory: Vec<Coord3D>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadPose {
    pub position: Coord3D,
    pub pitch: f64,
    pub yaw: f64,
    #[serde(default)]
    pub camp: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpMessage {
    pub text: String,
}

/// Relayed or state-changing actions carried by a `broadcast` envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastAction {
    PickUp(PiecePlacement),
    PutDown(PiecePlacement),
    Moving(PieceTrajectory),
    HeadPose(HeadPose),
    GiveUp,
    ResetAll,
    RequestDraw,
    ResponseDraw(bool),
    SpMessage(String),
}

/// A decoded inbound request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    GetPublicKey,
    TokenLogin { user_id: String, user_token: String },
    GetServerConfig,
    GetUserData,
    GetSyncChessPieces,
    GetCampData,
    SelectCamp(Camp),
    GetRbHeadPose,
    Heart,
    GetCounters,
    Broadcast(BroadcastAction),
}

impl Request {
    pub fn parse(envelope: &Envelope) -> Result<Request, ProtocolError> {
        let request = match envelope.kind.as_str() {
            kind::PING => Request::Ping,
            kind::GET_PUBLICKEY => Request::GetPublicKey,
            kind::GET_TOKEN_LOGIN => Request::TokenLogin {
                user_id: field_string(&envelope.data, "user_id"),
                user_token: field_string(&envelope.data, "user_token"),
            },
            kind::GET_SERVER_CONFIG => Request::GetServerConfig,
            kind::GET_USER_DATA => Request::GetUserData,
            kind::GET_SYNC_CHESS_PIECES => Request::GetSyncChessPieces,
            kind::GET_CAMP_DATA => Request::GetCampData,
            kind::GET_SELECT_CAMP_RED => Request::SelectCamp(Camp::Red),
            kind::GET_SELECT_CAMP_BLACK => Request::SelectCamp(Camp::Black),
            kind::GET_RB_HEAD_POSITION_PITCH_YAW => Request::GetRbHeadPose,
            kind::HEART_3 => Request::Heart,
            kind::GET_STORAGE_JSON => Request::GetCounters,
            kind::BROADCAST => Request::Broadcast(parse_broadcast(envelope)?),
            other => return Err(ProtocolError::UnknownType(other.to_string())),
        };
        Ok(request)
    }
}

fn parse_broadcast(envelope: &Envelope) -> Result<BroadcastAction, ProtocolError> {
    let action = match envelope.class.as_str() {
        class::PICK_UP_CHESS => BroadcastAction::PickUp(envelope.payload()?),
        class::PICK_DOWN_CHESS => BroadcastAction::PutDown(envelope.payload()?),
        class::MOVING_CHESS => BroadcastAction::Moving(envelope.payload()?),
        class::HEAD_POSITION_PITCH_YAW => BroadcastAction::HeadPose(envelope.payload()?),
        class::GIVE_UP => BroadcastAction::GiveUp,
        class::RESET_ALL_CHESS_PIECES => BroadcastAction::ResetAll,
        class::REQUEST_DRAW => BroadcastAction::RequestDraw,
        class::RESPONSE_DRAW => BroadcastAction::ResponseDraw(envelope.payload()?),
        class::SP_MESSAGE => {
            let message: SpMessage = envelope.payload()?;
            BroadcastAction::SpMessage(message.text.chars().take(SP_MESSAGE_MAX_CHARS).collect())
        }
        other => return Err(ProtocolError::UnknownClass(other.to_string())),
    };
    Ok(action)
}

/// Reads a field that clients send either as a string or as a number.
fn field_string(data: &Value, field: &str) -> String {
    match data.get(field) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

// Outbound payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PieceSync {
    pub piece_name: String,
    pub position: Coord3D,
    pub is_picked: bool,
    pub picked_by: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChessPieces {
    pub pieces: Vec<PieceSync>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampSeat {
    pub email: String,
    pub name: String,
    pub id: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampData {
    pub red: CampSeat,
    pub black: CampSeat,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeatHeadPose {
    pub conveyor: String,
    pub position: Coord3D,
    pub pitch: f64,
    pub yaw: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RbHeadPose {
    pub red: SeatHeadPose,
    pub black: SeatHeadPose,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfigData {
    pub version: String,
    pub anonymous_login: bool,
    pub key: String,
    pub url: String,
    pub name: String,
    pub online_number: u64,
    pub max_online: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserData {
    pub id: i64,
    pub anonymous_user: bool,
    pub email: String,
    pub name: String,
    pub theme_color: String,
}

impl UserData {
    /// Placeholder returned to sessions that have not logged in.
    pub fn unauthenticated() -> Self {
        Self {
            id: 0,
            anonymous_user: true,
            email: String::new(),
            name: String::new(),
            theme_color: EMPTY_THEME_COLOR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterData {
    pub visit_count: u64,
    pub heart_count: u64,
    pub online_count: u64,
}

/// Identity string attached to everything a user sends: `name&email`.
pub fn conveyor_of(name: &str, email: &str) -> String {
    format!("{}&{}", name, email)
}
