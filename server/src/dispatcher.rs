//! Command dispatch over the shared hall state.
//!
//! The [`Dispatcher`] is the single owner of the session table, piece
//! registry, seat arbitrator, telemetry store and counters. Every handler runs
//! to completion without suspending and returns the effects it wants performed
//! as a list of [`Outbound`] values. The network layer executes them after the
//! state change is complete, so a broadcast always describes a consistent
//! state.

use crate::auth::{AuthError, UserProfile};
use crate::client_manager::{ClientId, SessionManager};
use crate::config::{ServerConfig, ServerInfo};
use crate::counters::CounterStore;
use crate::pieces::{PieceRegistry, ReleasedPiece};
use crate::seats::{SeatArbitrator, SeatRejection};
use crate::telemetry::{TelemetryEntry, TelemetryStore};
use log::{debug, info, warn};
use serde_json::{json, Value};
use shared::{
    class, kind, BroadcastAction, Camp, CampData, CampSeat, CounterData, Envelope, PieceSync,
    RbHeadPose, Request, ServerConfigData, SyncChessPieces, UserData,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// An effect requested by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Deliver to a single client.
    Send { to: ClientId, envelope: Envelope },
    /// Deliver to every live client except `exclude`.
    Broadcast {
        envelope: Envelope,
        exclude: Option<ClientId>,
    },
    /// Start a token exchange with the account service.
    Authenticate {
        client_id: ClientId,
        user_id: String,
        user_token: String,
    },
    /// Persist the counters now.
    Persist(CounterData),
}

const LOGIN_OK: &str = "ok";
const LOGIN_NO: &str = "no";

pub struct Dispatcher {
    info: ServerInfo,
    piece_hold_timeout: Option<Duration>,
    sessions: SessionManager,
    pieces: PieceRegistry,
    seats: SeatArbitrator,
    telemetry: TelemetryStore,
    counters: CounterStore,
}

impl Dispatcher {
    pub fn new(config: &ServerConfig, counters: CounterStore) -> Self {
        Self {
            info: config.info.clone(),
            piece_hold_timeout: config.piece_hold_timeout,
            sessions: SessionManager::new(config.max_connections),
            pieces: PieceRegistry::new(),
            seats: SeatArbitrator::new(),
            telemetry: TelemetryStore::new(),
            counters,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn pieces(&self) -> &PieceRegistry {
        &self.pieces
    }

    pub fn seats(&self) -> &SeatArbitrator {
        &self.seats
    }

    pub fn telemetry(&self) -> &TelemetryStore {
        &self.telemetry
    }

    pub fn counters(&self) -> &CounterStore {
        &self.counters
    }

    /// Registers a new connection. Returns `None` when the server is full.
    pub fn connect(&mut self, client_id: ClientId, addr: SocketAddr) -> Option<Vec<Outbound>> {
        if !self.sessions.add_session(client_id, addr) {
            warn!("Refusing connection {} from {}: server full", client_id, addr);
            return None;
        }
        Some(vec![self.public_key_reply(client_id)])
    }

    pub fn handle_envelope(
        &mut self,
        client_id: ClientId,
        envelope: Envelope,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(session) = self.sessions.get_mut(client_id) else {
            debug!("Dropping '{}' from unknown client {}", envelope.kind, client_id);
            return Vec::new();
        };

        if !envelope.is_keepalive() && session.record_instruction() {
            self.counters.record_visit();
            debug!(
                "Client {} counted as visit (total {})",
                client_id,
                self.counters.visits()
            );
        }

        let request = match Request::parse(&envelope) {
            Ok(request) => request,
            Err(e) => {
                debug!("Dropping message from client {}: {}", client_id, e);
                return Vec::new();
            }
        };

        match request {
            Request::Ping => vec![send(client_id, Envelope::new(kind::PONG, empty()))],
            Request::GetPublicKey => vec![self.public_key_reply(client_id)],
            Request::TokenLogin {
                user_id,
                user_token,
            } => self.begin_login(client_id, user_id, user_token),
            Request::GetServerConfig => {
                vec![send(client_id, Envelope::with_payload(kind::SERVER_CONFIG, &self.server_config()))]
            }
            Request::GetUserData => {
                let data = self
                    .sessions
                    .get(client_id)
                    .and_then(|s| s.identity.as_ref())
                    .map(UserProfile::user_data)
                    .unwrap_or_else(UserData::unauthenticated);
                vec![send(client_id, Envelope::with_payload(kind::USER_DATA, &data))]
            }
            Request::GetSyncChessPieces => vec![send(
                client_id,
                Envelope::with_payload(kind::SYNC_CHESS_PIECES, &self.piece_sync()),
            )],
            Request::GetCampData => vec![send(client_id, self.camp_data_envelope())],
            Request::SelectCamp(camp) => self.select_camp(client_id, camp),
            Request::GetRbHeadPose => vec![send(
                client_id,
                Envelope::with_payload(kind::RB_HEAD_POSITION_PITCH_YAW, &self.rb_head_pose()),
            )],
            Request::Heart => self.heart(client_id),
            Request::GetCounters => vec![send(
                client_id,
                Envelope::with_payload(kind::STORAGE_JSON, &self.counters.snapshot()),
            )],
            Request::Broadcast(action) => self.broadcast(client_id, &envelope, action, now),
        }
    }

    fn begin_login(
        &mut self,
        client_id: ClientId,
        user_id: String,
        user_token: String,
    ) -> Vec<Outbound> {
        let already_logged_in = self
            .sessions
            .get(client_id)
            .map(|s| s.logged_in)
            .unwrap_or(false);

        if already_logged_in {
            return vec![login_reply(client_id, LOGIN_OK)];
        }
        if user_id.is_empty() || user_token.is_empty() {
            debug!("Client {} sent token login without credentials", client_id);
            return vec![login_reply(client_id, LOGIN_NO)];
        }

        vec![Outbound::Authenticate {
            client_id,
            user_id,
            user_token,
        }]
    }

    /// Applies the outcome of a token exchange started by `get_token_login`.
    pub fn complete_login(
        &mut self,
        client_id: ClientId,
        result: Result<UserProfile, AuthError>,
    ) -> Vec<Outbound> {
        let online = self.counters.online();
        let max_online = self.info.max_online;
        let Some(session) = self.sessions.get_mut(client_id) else {
            debug!("Discarding login result for departed client {}", client_id);
            return Vec::new();
        };

        let profile = match result {
            Ok(profile) => profile,
            Err(e) => {
                info!("Token login failed for client {}: {}", client_id, e);
                return vec![login_reply(client_id, LOGIN_NO)];
            }
        };

        if session.logged_in {
            return vec![login_reply(client_id, LOGIN_OK)];
        }
        if online >= max_online {
            warn!(
                "Rejecting login for client {}: {} of {} online",
                client_id, online, max_online
            );
            return vec![login_reply(client_id, LOGIN_NO)];
        }

        let conveyor = profile.conveyor();
        info!("Client {} logged in as {}", client_id, conveyor);
        session.identity = Some(profile);
        session.logged_in = true;
        self.counters.login();

        vec![
            login_reply(client_id, LOGIN_OK),
            Outbound::Persist(self.counters.snapshot()),
            Outbound::Broadcast {
                envelope: Envelope::broadcast(class::USER_JOIN_GAME, &conveyor, empty()),
                exclude: Some(client_id),
            },
        ]
    }

    fn select_camp(&mut self, client_id: ClientId, camp: Camp) -> Vec<Outbound> {
        let authenticated = self
            .sessions
            .get(client_id)
            .map(|s| s.is_authenticated())
            .unwrap_or(false);
        if !authenticated {
            debug!("Client {} tried to sit at {} before logging in", client_id, camp.as_str());
            return vec![seat_reply(client_id, camp, false)];
        }

        let sessions = &self.sessions;
        match self.seats.claim(client_id, camp, |id| sessions.contains(id)) {
            Ok(claim) => {
                if let Some(stale) = claim.evicted {
                    warn!("Evicted departed client {} from {} seat", stale, camp.as_str());
                }
                if let Some(session) = self.sessions.get_mut(client_id) {
                    session.chosen_camp = Some(camp);
                }
                match claim.vacated {
                    Some(previous) => info!(
                        "Client {} switched from {} to {}",
                        client_id,
                        previous.as_str(),
                        camp.as_str()
                    ),
                    None => info!("Client {} took the {} seat", client_id, camp.as_str()),
                }
                vec![
                    seat_reply(client_id, camp, true),
                    Outbound::Broadcast {
                        envelope: self.camp_data_envelope(),
                        exclude: None,
                    },
                ]
            }
            Err(e) => {
                debug!("Client {} lost seat claim: {}", client_id, e);
                let SeatRejection::Occupied { vacated, .. } = e;
                let mut effects = vec![seat_reply(client_id, camp, false)];
                if let Some(previous) = vacated {
                    info!("Client {} left the {} seat", client_id, previous.as_str());
                    if let Some(session) = self.sessions.get_mut(client_id) {
                        session.chosen_camp = None;
                    }
                    effects.push(Outbound::Broadcast {
                        envelope: self.camp_data_envelope(),
                        exclude: None,
                    });
                }
                effects
            }
        }
    }

    fn heart(&mut self, client_id: ClientId) -> Vec<Outbound> {
        let Some(session) = self.sessions.get_mut(client_id) else {
            return Vec::new();
        };
        if !session.is_authenticated() || session.heart_sent {
            return Vec::new();
        }
        session.heart_sent = true;
        self.counters.record_heart();
        vec![Outbound::Persist(self.counters.snapshot())]
    }

    fn broadcast(
        &mut self,
        client_id: ClientId,
        envelope: &Envelope,
        action: BroadcastAction,
        now: Instant,
    ) -> Vec<Outbound> {
        let Some(conveyor) = self.sessions.get(client_id).and_then(|s| s.conveyor()) else {
            debug!(
                "Dropping '{}' broadcast from unauthenticated client {}",
                envelope.class, client_id
            );
            return Vec::new();
        };

        let data = match action {
            BroadcastAction::PickUp(placement) => {
                if let Err(e) =
                    self.pieces
                        .pick_up(&placement.piece_name, client_id, placement.position, now)
                {
                    debug!("Client {} pick up rejected: {}", client_id, e);
                    return Vec::new();
                }
                to_value(&placement)
            }
            BroadcastAction::Moving(trajectory) => {
                if let Err(e) = self.pieces.move_along(
                    &trajectory.piece_name,
                    client_id,
                    &trajectory.trajectory,
                    now,
                ) {
                    debug!("Client {} move rejected: {}", client_id, e);
                    return Vec::new();
                }
                to_value(&trajectory)
            }
            BroadcastAction::PutDown(placement) => {
                if let Err(e) =
                    self.pieces
                        .put_down(&placement.piece_name, client_id, placement.position)
                {
                    debug!("Client {} put down rejected: {}", client_id, e);
                    return Vec::new();
                }
                to_value(&placement)
            }
            BroadcastAction::HeadPose(pose) => {
                self.telemetry.report(&conveyor, TelemetryEntry::from(&pose));
                to_value(&pose)
            }
            BroadcastAction::ResetAll => {
                info!("Client {} reset all pieces", client_id);
                self.pieces.reset_all();
                return vec![Outbound::Broadcast {
                    envelope: relay(envelope, &conveyor, empty()),
                    exclude: None,
                }];
            }
            BroadcastAction::GiveUp | BroadcastAction::RequestDraw => empty(),
            BroadcastAction::ResponseDraw(accepted) => Value::Bool(accepted),
            BroadcastAction::SpMessage(text) => json!({ "text": text }),
        };

        vec![Outbound::Broadcast {
            envelope: relay(envelope, &conveyor, data),
            exclude: Some(client_id),
        }]
    }

    /// Runs the full cleanup cascade for a closed connection.
    ///
    /// Safe to call more than once and for sessions that never logged in.
    pub fn disconnect(&mut self, client_id: ClientId) -> Vec<Outbound> {
        let Some(session) = self.sessions.get(client_id) else {
            return Vec::new();
        };
        let conveyor = session.conveyor();
        let logged_in = session.logged_in;
        let sender = conveyor.clone().unwrap_or_default();
        let mut out = Vec::new();

        for released in self.pieces.release_all_held_by(client_id) {
            out.push(Outbound::Broadcast {
                envelope: put_down_envelope(&released, &sender),
                exclude: Some(client_id),
            });
        }

        if let Some(camp) = self.seats.vacate(client_id) {
            info!("Client {} left the {} seat", client_id, camp.as_str());
            out.push(Outbound::Broadcast {
                envelope: self.camp_data_envelope(),
                exclude: Some(client_id),
            });
        }

        if let Some(conveyor) = &conveyor {
            if !self.sessions.conveyor_in_use(conveyor, client_id) {
                self.telemetry.remove(conveyor);
            }
        }

        if logged_in {
            self.counters.logout();
            out.push(Outbound::Persist(self.counters.snapshot()));
        }

        if let Some(conveyor) = &conveyor {
            out.push(Outbound::Broadcast {
                envelope: Envelope::broadcast(class::USER_LEFT_GAME, conveyor, empty()),
                exclude: Some(client_id),
            });
        }

        self.sessions.remove_session(client_id);
        out
    }

    /// Releases pieces held without activity past the configured timeout.
    pub fn sweep(&mut self, now: Instant) -> Vec<Outbound> {
        let Some(timeout) = self.piece_hold_timeout else {
            return Vec::new();
        };

        self.pieces
            .release_stale(now, timeout)
            .into_iter()
            .map(|released| {
                info!(
                    "Releasing {} held by client {} after {:?} idle",
                    released.name, released.holder, timeout
                );
                let sender = self
                    .sessions
                    .get(released.holder)
                    .and_then(|s| s.conveyor())
                    .unwrap_or_default();
                Outbound::Broadcast {
                    envelope: put_down_envelope(&released, &sender),
                    exclude: None,
                }
            })
            .collect()
    }

    fn public_key_reply(&self, client_id: ClientId) -> Outbound {
        send(
            client_id,
            Envelope::new(kind::PUBLICKEY, Value::String(self.info.public_key.clone())),
        )
    }

    fn server_config(&self) -> ServerConfigData {
        ServerConfigData {
            version: self.info.version.clone(),
            anonymous_login: self.info.anonymous_login,
            key: self.info.key.clone(),
            url: self.info.url.clone(),
            name: self.info.name.clone(),
            online_number: self.counters.online(),
            max_online: self.info.max_online,
        }
    }

    fn conveyor_of(&self, client_id: ClientId) -> Option<String> {
        self.sessions.get(client_id).and_then(|s| s.conveyor())
    }

    pub fn piece_sync(&self) -> SyncChessPieces {
        SyncChessPieces {
            pieces: self
                .pieces
                .iter()
                .map(|piece| PieceSync {
                    piece_name: piece.name().to_string(),
                    position: piece.position(),
                    is_picked: piece.is_locked(),
                    picked_by: piece
                        .holder()
                        .and_then(|holder| self.conveyor_of(holder))
                        .unwrap_or_default(),
                })
                .collect(),
        }
    }

    fn camp_seat(&self, camp: Camp) -> CampSeat {
        self.seats
            .occupant(camp)
            .and_then(|id| self.sessions.get(id))
            .and_then(|s| s.identity.as_ref())
            .map(|identity| CampSeat {
                email: identity.email.clone(),
                name: identity.name.clone(),
                id: identity.id,
            })
            .unwrap_or_default()
    }

    pub fn camp_data(&self) -> CampData {
        CampData {
            red: self.camp_seat(Camp::Red),
            black: self.camp_seat(Camp::Black),
        }
    }

    fn camp_data_envelope(&self) -> Envelope {
        Envelope::with_payload(kind::CAMP_DATA, &self.camp_data())
    }

    pub fn rb_head_pose(&self) -> RbHeadPose {
        let seat_conveyor = |camp| self.seats.occupant(camp).and_then(|id| self.conveyor_of(id));
        RbHeadPose {
            red: self.telemetry.seat_pose(seat_conveyor(Camp::Red).as_deref()),
            black: self.telemetry.seat_pose(seat_conveyor(Camp::Black).as_deref()),
        }
    }
}

fn empty() -> Value {
    Value::String(String::new())
}

fn to_value<T: serde::Serialize>(payload: &T) -> Value {
    serde_json::to_value(payload).unwrap_or(Value::Null)
}

fn send(to: ClientId, envelope: Envelope) -> Outbound {
    Outbound::Send { to, envelope }
}

fn login_reply(client_id: ClientId, status: &str) -> Outbound {
    send(
        client_id,
        Envelope::new(kind::TOKEN_LOGIN, Value::String(status.to_string())),
    )
}

fn seat_reply(client_id: ClientId, camp: Camp, granted: bool) -> Outbound {
    send(client_id, Envelope::new(camp.select_reply_kind(), Value::Bool(granted)))
}

/// Re-stamps a client broadcast with the sender's verified conveyor.
fn relay(incoming: &Envelope, conveyor: &str, data: Value) -> Envelope {
    Envelope {
        kind: kind::BROADCAST.to_string(),
        class: incoming.class.clone(),
        conveyor: conveyor.to_string(),
        time: incoming.time.clone(),
        data,
    }
}

fn put_down_envelope(released: &ReleasedPiece, conveyor: &str) -> Envelope {
    Envelope::broadcast(
        class::PICK_DOWN_CHESS,
        conveyor,
        json!({ "piece_name": released.name, "position": released.position }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::Coord3D;

    const GENERAL: &str = "Red_27_general";

    fn addr() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn dispatcher() -> Dispatcher {
        let mut config = ServerConfig::default();
        config.info.public_key = "PEM".to_string();
        Dispatcher::new(&config, CounterStore::new())
    }

    fn profile(id: i64, name: &str) -> UserProfile {
        UserProfile {
            id,
            name: name.to_string(),
            email: format!("{}@example.com", name),
            theme_color: String::new(),
            is_anonymous: false,
        }
    }

    fn request(kind: &str, class: &str, data: Value) -> Envelope {
        Envelope {
            kind: kind.to_string(),
            class: class.to_string(),
            conveyor: "spoofed&nobody".to_string(),
            time: "2025-01-01 00:00:00:000".to_string(),
            data,
        }
    }

    fn connect_logged_in(d: &mut Dispatcher, id: ClientId, name: &str) {
        d.connect(id, addr()).unwrap();
        d.complete_login(id, Ok(profile(id as i64, name)));
    }

    fn pick_up(d: &mut Dispatcher, id: ClientId, piece: &str) -> Vec<Outbound> {
        d.handle_envelope(
            id,
            request(
                kind::BROADCAST,
                class::PICK_UP_CHESS,
                json!({"piece_name": piece, "position": {"x": 0.0, "y": 0.0, "z": 0.0}}),
            ),
            Instant::now(),
        )
    }

    fn replies_to(out: &[Outbound], id: ClientId) -> Vec<&Envelope> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Send { to, envelope } if *to == id => Some(envelope),
                _ => None,
            })
            .collect()
    }

    fn broadcasts(out: &[Outbound]) -> Vec<(&Envelope, Option<ClientId>)> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Broadcast { envelope, exclude } => Some((envelope, *exclude)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_connect_sends_public_key() {
        let mut d = dispatcher();
        let out = d.connect(1, addr()).unwrap();
        let replies = replies_to(&out, 1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind, kind::PUBLICKEY);
        assert_eq!(replies[0].data, json!("PEM"));
    }

    #[test]
    fn test_connect_beyond_capacity() {
        let mut config = ServerConfig::default();
        config.max_connections = 1;
        let mut d = Dispatcher::new(&config, CounterStore::new());
        assert!(d.connect(1, addr()).is_some());
        assert!(d.connect(2, addr()).is_none());
    }

    #[test]
    fn test_ping_gets_pong_and_is_not_counted() {
        let mut d = dispatcher();
        d.connect(1, addr());
        for _ in 0..5 {
            let out = d.handle_envelope(1, request(kind::PING, "", empty()), Instant::now());
            assert_eq!(replies_to(&out, 1)[0].kind, kind::PONG);
        }
        assert_eq!(d.sessions().get(1).unwrap().instruction_count, 0);
        assert_eq!(d.counters().visits(), 0);
    }

    #[test]
    fn test_visit_counted_once_after_three_messages() {
        let mut d = dispatcher();
        d.connect(1, addr());
        for n in 1..=6 {
            d.handle_envelope(1, request(kind::GET_CAMP_DATA, "", empty()), Instant::now());
            let expected = if n >= 3 { 1 } else { 0 };
            assert_eq!(d.counters().visits(), expected);
        }
    }

    #[test]
    fn test_malformed_messages_are_dropped_but_counted() {
        let mut d = dispatcher();
        d.connect(1, addr());
        let out = d.handle_envelope(1, request("get_weather_report", "", empty()), Instant::now());
        assert!(out.is_empty());
        let out = d.handle_envelope(
            1,
            request(kind::BROADCAST, class::PICK_UP_CHESS, json!("garbage")),
            Instant::now(),
        );
        assert!(out.is_empty());
        assert_eq!(d.sessions().get(1).unwrap().instruction_count, 2);
    }

    #[test]
    fn test_token_login_requests_authentication() {
        let mut d = dispatcher();
        d.connect(1, addr());
        let out = d.handle_envelope(
            1,
            request(kind::GET_TOKEN_LOGIN, "", json!({"user_id": 5, "user_token": "tok"})),
            Instant::now(),
        );
        assert_eq!(
            out,
            vec![Outbound::Authenticate {
                client_id: 1,
                user_id: "5".to_string(),
                user_token: "tok".to_string()
            }]
        );
    }

    #[test]
    fn test_token_login_without_credentials_is_refused() {
        let mut d = dispatcher();
        d.connect(1, addr());
        let out = d.handle_envelope(1, request(kind::GET_TOKEN_LOGIN, "", empty()), Instant::now());
        let replies = replies_to(&out, 1);
        assert_eq!(replies[0].kind, kind::TOKEN_LOGIN);
        assert_eq!(replies[0].data, json!("no"));
    }

    #[test]
    fn test_successful_login() {
        let mut d = dispatcher();
        d.connect(1, addr());
        d.connect(2, addr());

        let out = d.complete_login(1, Ok(profile(1, "alice")));

        assert_eq!(replies_to(&out, 1)[0].data, json!("ok"));
        assert!(out.contains(&Outbound::Persist(CounterData {
            visit_count: 0,
            heart_count: 0,
            online_count: 1
        })));
        let joined = broadcasts(&out);
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].0.class, class::USER_JOIN_GAME);
        assert_eq!(joined[0].0.conveyor, "alice&alice@example.com");
        assert_eq!(joined[0].1, Some(1));

        let session = d.sessions().get(1).unwrap();
        assert!(session.logged_in);
        assert!(session.is_authenticated());
        assert_eq!(d.counters().online(), 1);
    }

    #[test]
    fn test_failed_login_leaves_session_untouched() {
        let mut d = dispatcher();
        d.connect(1, addr());

        let out = d.complete_login(1, Err(AuthError::Rejected("bad token".to_string())));

        assert_eq!(out.len(), 1);
        assert_eq!(replies_to(&out, 1)[0].data, json!("no"));
        assert!(!d.sessions().get(1).unwrap().is_authenticated());
        assert_eq!(d.counters().online(), 0);
    }

    #[test]
    fn test_repeat_login_is_not_counted_twice() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");

        let out = d.handle_envelope(
            1,
            request(kind::GET_TOKEN_LOGIN, "", json!({"user_id": 1, "user_token": "t"})),
            Instant::now(),
        );
        assert_eq!(replies_to(&out, 1)[0].data, json!("ok"));

        let out = d.complete_login(1, Ok(profile(1, "alice")));
        assert_eq!(out.len(), 1);
        assert_eq!(d.counters().online(), 1);
    }

    #[test]
    fn test_login_result_for_departed_client_is_discarded() {
        let mut d = dispatcher();
        d.connect(1, addr());
        d.disconnect(1);
        assert!(d.complete_login(1, Ok(profile(1, "alice"))).is_empty());
        assert_eq!(d.counters().online(), 0);
    }

    #[test]
    fn test_login_refused_when_hall_is_full() {
        let mut config = ServerConfig::default();
        config.info.max_online = 1;
        let mut d = Dispatcher::new(&config, CounterStore::new());
        connect_logged_in(&mut d, 1, "alice");
        d.connect(2, addr());

        let out = d.complete_login(2, Ok(profile(2, "bob")));
        assert_eq!(replies_to(&out, 2)[0].data, json!("no"));
        assert!(!d.sessions().get(2).unwrap().logged_in);
    }

    #[test]
    fn test_user_data_placeholder_and_identity() {
        let mut d = dispatcher();
        d.connect(1, addr());
        let out = d.handle_envelope(1, request(kind::GET_USER_DATA, "", empty()), Instant::now());
        assert_eq!(replies_to(&out, 1)[0].data["anonymous_user"], json!(true));
        assert_eq!(replies_to(&out, 1)[0].data["email"], json!(""));

        d.complete_login(1, Ok(profile(1, "alice")));
        let out = d.handle_envelope(1, request(kind::GET_USER_DATA, "", empty()), Instant::now());
        assert_eq!(replies_to(&out, 1)[0].data["email"], json!("alice@example.com"));
        assert_eq!(replies_to(&out, 1)[0].data["id"], json!(1));
    }

    #[test]
    fn test_server_config_reports_online_number() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        let out = d.handle_envelope(1, request(kind::GET_SERVER_CONFIG, "", empty()), Instant::now());
        let data = &replies_to(&out, 1)[0].data;
        assert_eq!(data["online_number"], json!(1));
        assert_eq!(data["max_online"], json!(100));
        assert_eq!(data["key"], json!("cc1"));
    }

    #[test]
    fn test_unauthenticated_session_cannot_act() {
        let mut d = dispatcher();
        d.connect(1, addr());

        assert!(pick_up(&mut d, 1, GENERAL).is_empty());
        assert!(!d.pieces().get(GENERAL).unwrap().is_locked());

        let out = d.handle_envelope(1, request(kind::GET_SELECT_CAMP_RED, "", empty()), Instant::now());
        assert_eq!(replies_to(&out, 1)[0].kind, kind::SELECT_CAMP_RED);
        assert_eq!(replies_to(&out, 1)[0].data, json!(false));
        assert_eq!(d.seats().occupant(Camp::Red), None);
    }

    #[test]
    fn test_pick_up_race_first_wins() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");

        let out = pick_up(&mut d, 1, GENERAL);
        let sent = broadcasts(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.class, class::PICK_UP_CHESS);
        assert_eq!(sent[0].0.conveyor, "alice&alice@example.com");
        assert_eq!(sent[0].1, Some(1));

        let out = pick_up(&mut d, 2, GENERAL);
        assert!(out.is_empty());
        assert_eq!(d.pieces().get(GENERAL).unwrap().holder(), Some(1));
    }

    #[test]
    fn test_moving_and_put_down_by_holder() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");
        pick_up(&mut d, 1, GENERAL);

        let moving = request(
            kind::BROADCAST,
            class::MOVING_CHESS,
            json!({"piece_name": GENERAL, "trajectory": [
                {"x": 0.1, "y": 0.0, "z": 0.0}, {"x": 0.4, "y": 0.2, "z": 0.0}
            ]}),
        );
        let out = d.handle_envelope(2, moving.clone(), Instant::now());
        assert!(out.is_empty());

        let out = d.handle_envelope(1, moving, Instant::now());
        assert_eq!(broadcasts(&out)[0].0.data["trajectory"][1]["x"], json!(0.4));
        assert_eq!(d.pieces().get(GENERAL).unwrap().position(), Coord3D::new(0.4, 0.2, 0.0));

        let put_down = request(
            kind::BROADCAST,
            class::PICK_DOWN_CHESS,
            json!({"piece_name": GENERAL, "position": {"x": 1.0, "y": 0.0, "z": 2.0}}),
        );
        assert!(d.handle_envelope(2, put_down.clone(), Instant::now()).is_empty());
        let out = d.handle_envelope(1, put_down, Instant::now());
        assert_eq!(broadcasts(&out)[0].1, Some(1));
        assert!(!d.pieces().get(GENERAL).unwrap().is_locked());
    }

    #[test]
    fn test_reset_all_reaches_requester_too() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");
        pick_up(&mut d, 2, GENERAL);

        let out = d.handle_envelope(
            1,
            request(kind::BROADCAST, class::RESET_ALL_CHESS_PIECES, empty()),
            Instant::now(),
        );
        let sent = broadcasts(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, None);
        assert_eq!(d.pieces().held_count(), 0);
    }

    #[test]
    fn test_seat_claims() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");

        let out = d.handle_envelope(1, request(kind::GET_SELECT_CAMP_RED, "", empty()), Instant::now());
        assert_eq!(replies_to(&out, 1)[0].data, json!(true));
        let sent = broadcasts(&out);
        assert_eq!(sent[0].0.kind, kind::CAMP_DATA);
        assert_eq!(sent[0].0.data["red"]["name"], json!("alice"));
        assert_eq!(sent[0].1, None);
        assert_eq!(d.sessions().get(1).unwrap().chosen_camp, Some(Camp::Red));

        let out = d.handle_envelope(2, request(kind::GET_SELECT_CAMP_RED, "", empty()), Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(replies_to(&out, 2)[0].data, json!(false));
        assert_eq!(d.seats().occupant(Camp::Red), Some(1));
    }

    #[test]
    fn test_failed_switch_announces_vacated_seat() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");
        d.handle_envelope(1, request(kind::GET_SELECT_CAMP_RED, "", empty()), Instant::now());
        d.handle_envelope(2, request(kind::GET_SELECT_CAMP_BLACK, "", empty()), Instant::now());

        let out = d.handle_envelope(1, request(kind::GET_SELECT_CAMP_BLACK, "", empty()), Instant::now());
        let reply = replies_to(&out, 1);
        assert_eq!(reply[0].kind, kind::SELECT_CAMP_BLACK);
        assert_eq!(reply[0].data, json!(false));

        let sent = broadcasts(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.kind, kind::CAMP_DATA);
        assert_eq!(sent[0].0.data["red"]["email"], json!(""));
        assert_eq!(sent[0].0.data["black"]["name"], json!("bob"));
        assert_eq!(sent[0].1, None);

        assert_eq!(d.seats().occupant(Camp::Red), None);
        assert_eq!(d.sessions().get(1).unwrap().chosen_camp, None);
    }

    #[test]
    fn test_heart_counted_once_per_authenticated_session() {
        let mut d = dispatcher();
        d.connect(1, addr());
        assert!(d.handle_envelope(1, request(kind::HEART_3, "", empty()), Instant::now()).is_empty());
        assert_eq!(d.counters().hearts(), 0);

        d.complete_login(1, Ok(profile(1, "alice")));
        let out = d.handle_envelope(1, request(kind::HEART_3, "", empty()), Instant::now());
        assert!(matches!(out.as_slice(), [Outbound::Persist(data)] if data.heart_count == 1));

        for _ in 0..4 {
            assert!(d.handle_envelope(1, request(kind::HEART_3, "", empty()), Instant::now()).is_empty());
        }
        assert_eq!(d.counters().hearts(), 1);
    }

    #[test]
    fn test_head_pose_updates_telemetry_and_rb_reply() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        d.handle_envelope(1, request(kind::GET_SELECT_CAMP_BLACK, "", empty()), Instant::now());

        let out = d.handle_envelope(
            1,
            request(
                kind::BROADCAST,
                class::HEAD_POSITION_PITCH_YAW,
                json!({"position": {"x": 1.0, "y": 1.7, "z": -2.0}, "pitch": 0.3, "yaw": 1.2, "camp": "black"}),
            ),
            Instant::now(),
        );
        assert_eq!(broadcasts(&out)[0].1, Some(1));
        assert!(d.telemetry().get("alice&alice@example.com").is_some());

        let rb = d.rb_head_pose();
        assert_eq!(rb.black.conveyor, "alice&alice@example.com");
        assert_eq!(rb.black.position, Coord3D::new(1.0, 1.7, -2.0));
        assert_eq!(rb.red.conveyor, "");
    }

    #[test]
    fn test_relays_use_verified_conveyor() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        let out = d.handle_envelope(1, request(kind::BROADCAST, class::GIVE_UP, empty()), Instant::now());
        let sent = broadcasts(&out);
        assert_eq!(sent[0].0.conveyor, "alice&alice@example.com");
        assert_eq!(sent[0].0.time, "2025-01-01 00:00:00:000");
    }

    #[test]
    fn test_disconnect_cascade() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        connect_logged_in(&mut d, 2, "bob");
        pick_up(&mut d, 1, GENERAL);
        pick_up(&mut d, 1, "Red_16_soldier_1");
        d.handle_envelope(1, request(kind::GET_SELECT_CAMP_RED, "", empty()), Instant::now());
        d.handle_envelope(
            1,
            request(
                kind::BROADCAST,
                class::HEAD_POSITION_PITCH_YAW,
                json!({"position": {"x": 0.0, "y": 0.0, "z": 0.0}, "pitch": 0.0, "yaw": 0.0}),
            ),
            Instant::now(),
        );

        let out = d.disconnect(1);

        let sent = broadcasts(&out);
        let classes: Vec<&str> = sent
            .iter()
            .map(|(e, _)| if e.class.is_empty() { e.kind.as_str() } else { e.class.as_str() })
            .collect();
        assert_eq!(
            classes,
            vec![
                class::PICK_DOWN_CHESS,
                class::PICK_DOWN_CHESS,
                kind::CAMP_DATA,
                class::USER_LEFT_GAME
            ]
        );
        assert!(sent.iter().all(|(_, exclude)| *exclude == Some(1)));
        assert_eq!(sent[2].0.data["red"]["email"], json!(""));
        assert!(out.contains(&Outbound::Persist(CounterData {
            visit_count: d.counters().visits(),
            heart_count: 0,
            online_count: 1
        })));

        assert_eq!(d.pieces().held_count(), 0);
        assert_eq!(d.seats().occupant(Camp::Red), None);
        assert!(d.telemetry().is_empty());
        assert!(!d.sessions().contains(1));
        assert_eq!(d.counters().online(), 1);

        assert!(d.disconnect(1).is_empty());
    }

    #[test]
    fn test_disconnect_before_login_is_quiet() {
        let mut d = dispatcher();
        d.connect(1, addr());
        d.connect(2, addr());
        let out = d.disconnect(1);
        assert!(out.is_empty());
        assert_eq!(d.sessions().len(), 1);
        assert_eq!(d.counters().online(), 0);
    }

    #[test]
    fn test_telemetry_kept_while_identity_still_connected() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        d.connect(2, addr());
        d.complete_login(2, Ok(profile(1, "alice")));
        d.handle_envelope(
            1,
            request(
                kind::BROADCAST,
                class::HEAD_POSITION_PITCH_YAW,
                json!({"position": {"x": 0.0, "y": 0.0, "z": 0.0}, "pitch": 0.0, "yaw": 0.0}),
            ),
            Instant::now(),
        );

        d.disconnect(1);
        assert!(d.telemetry().get("alice&alice@example.com").is_some());
        d.disconnect(2);
        assert!(d.telemetry().is_empty());
    }

    #[test]
    fn test_sweep_releases_idle_pieces() {
        let mut config = ServerConfig::default();
        config.piece_hold_timeout = Some(Duration::from_secs(10));
        let mut d = Dispatcher::new(&config, CounterStore::new());
        connect_logged_in(&mut d, 1, "alice");
        pick_up(&mut d, 1, GENERAL);

        assert!(d.sweep(Instant::now()).is_empty());

        let out = d.sweep(Instant::now() + Duration::from_secs(11));
        let sent = broadcasts(&out);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.class, class::PICK_DOWN_CHESS);
        assert_eq!(sent[0].0.data["piece_name"], json!(GENERAL));
        assert_eq!(sent[0].1, None);
        assert!(!d.pieces().get(GENERAL).unwrap().is_locked());
    }

    #[test]
    fn test_sweep_disabled_by_default() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        pick_up(&mut d, 1, GENERAL);
        assert!(d.sweep(Instant::now() + Duration::from_secs(3600)).is_empty());
    }

    #[test]
    fn test_sync_pieces_reports_holder_conveyor() {
        let mut d = dispatcher();
        connect_logged_in(&mut d, 1, "alice");
        pick_up(&mut d, 1, GENERAL);

        let sync = d.piece_sync();
        assert_eq!(sync.pieces.len(), 32);
        let general = sync.pieces.iter().find(|p| p.piece_name == GENERAL).unwrap();
        assert!(general.is_picked);
        assert_eq!(general.picked_by, "alice&alice@example.com");
        let other = sync.pieces.iter().find(|p| p.piece_name != GENERAL).unwrap();
        assert!(!other.is_picked);
        assert_eq!(other.picked_by, "");
    }
}
