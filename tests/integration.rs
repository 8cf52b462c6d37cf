//! Integration tests for the match controller.
//!
//! Drives a learner match from lobby to final scores through an in-memory
//! transport.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use trucker_state::{
    Attach, Card, CardKind, Command, Component, ComponentId, ConnectorType, ContentSource,
    EngineError, EventPayload, GameConfig, GameMode, LobbyError, Outbound, PlayerState, Server,
    ServerError, SessionConfig, SessionError, Transport, TransportError,
};

const U4: [ConnectorType; 4] = [ConnectorType::Universal; 4];

#[derive(Default)]
struct MemoryTransport {
    sent: Mutex<Vec<(String, Outbound)>>,
    closed: Mutex<Vec<String>>,
}

impl MemoryTransport {
    fn close(&self, username: &str) {
        self.closed.lock().unwrap().push(username.to_string());
    }

    fn reopen(&self, username: &str) {
        self.closed.lock().unwrap().retain(|u| u != username);
    }

    fn take(&self, username: &str) -> Vec<Outbound> {
        let mut sent = self.sent.lock().unwrap();
        let (mine, rest): (Vec<_>, Vec<_>) = sent.drain(..).partition(|(u, _)| u == username);
        *sent = rest;
        mine.into_iter().map(|(_, m)| m).collect()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }

    fn is_empty(&self) -> bool {
        self.sent.lock().unwrap().is_empty()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, username: &str, message: &Outbound) -> Result<(), TransportError> {
        if self.closed.lock().unwrap().iter().any(|u| u == username) {
            return Err(TransportError::Closed(username.to_string()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((username.to_string(), message.clone()));
        Ok(())
    }
}

struct Content;

impl ContentSource for Content {
    fn components(&self) -> Vec<Component> {
        (1..=8).map(|id| Component::structural(id, U4)).collect()
    }

    fn cards(&self) -> Vec<Card> {
        vec![Card::new(1, true, CardKind::OpenSpace)]
    }
}

fn server() -> (Server, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::default());
    let server = Server::new(transport.clone(), Arc::new(Content), SessionConfig::default());
    (server, transport)
}

fn learner() -> GameConfig {
    GameConfig::new(GameMode::Learner).with_seed(11)
}

/// Connect alice and bob, gather them in a lobby and start the match.
fn started(server: &Server) -> String {
    let now = Instant::now();
    server.connect("alice", now).unwrap();
    server.connect("bob", now).unwrap();
    let lobby_id = server.create_lobby("alice", learner()).unwrap();
    server.join_lobby("bob", &lobby_id).unwrap();
    server.set_ready("alice", true).unwrap();
    server.set_ready("bob", true).unwrap();
    server.start_match(&lobby_id, Utc::now()).unwrap();
    lobby_id
}

fn payloads(messages: &[Outbound]) -> Vec<&EventPayload> {
    messages
        .iter()
        .filter_map(|m| match m {
            Outbound::Event(event) => Some(&event.payload),
            _ => None,
        })
        .collect()
}

#[test]
fn lobby_flow_starts_match() {
    let (server, transport) = server();
    let now = Instant::now();
    server.connect("alice", now).unwrap();
    server.connect("bob", now).unwrap();

    let lobby_id = server.create_lobby("alice", learner()).unwrap();
    server.join_lobby("bob", &lobby_id).unwrap();

    // Can't start yet - not ready
    assert_eq!(
        server.start_match(&lobby_id, Utc::now()),
        Err(ServerError::Lobby(LobbyError::NotReady))
    );
    server.set_ready("alice", true).unwrap();
    server.set_ready("bob", true).unwrap();
    server.start_match(&lobby_id, Utc::now()).unwrap();
    assert_eq!(server.match_count(), 1);

    // The opening sequence arrives bracketed
    let alice = transport.take("alice");
    assert_eq!(alice.first(), Some(&Outbound::BatchStart));
    assert_eq!(alice.last(), Some(&Outbound::BatchEnd));

    let handle = server.match_of("bob").unwrap();
    handle.with_game(|game| {
        assert_eq!(game.players(), &["alice".to_string(), "bob".to_string()]);
        assert_eq!(game.state("bob").unwrap(), PlayerState::Build);
    });

    // No joining a running match
    server.connect("carol", now).unwrap();
    assert_eq!(
        server.join_lobby("carol", &lobby_id),
        Err(ServerError::Lobby(LobbyError::GameInProgress))
    );
}

#[test]
fn lobby_needs_active_session() {
    let (server, _transport) = server();
    assert_eq!(
        server.create_lobby("ghost", learner()),
        Err(ServerError::Session(SessionError::NotFound(
            "ghost".to_string()
        )))
    );
}

#[test]
fn command_events_reach_every_member() {
    let (server, transport) = server();
    started(&server);
    transport.clear();

    let report = server
        .handle(
            "bob",
            Command::PickComponent {
                component: ComponentId(3),
            },
            Utc::now(),
        )
        .unwrap();
    assert!(report.is_clean());

    let alice = transport.take("alice");
    assert!(payloads(&alice).iter().any(|p| matches!(
        p,
        EventPayload::ComponentPicked { player, component } if player == "bob" && component.id == ComponentId(3)
    )));
    assert!(!transport.take("bob").is_empty());
}

#[test]
fn rejected_command_delivers_nothing() {
    let (server, transport) = server();
    started(&server);
    transport.clear();

    let result = server.handle("alice", Command::DrawCard, Utc::now());
    assert!(matches!(
        result,
        Err(ServerError::Engine(EngineError::IllegalPhase(PlayerState::Build)))
    ));
    assert!(transport.is_empty());

    assert_eq!(
        server.handle("carol", Command::DrawCard, Utc::now()),
        Err(ServerError::NoMatch("carol".to_string()))
    );
}

#[test]
fn dead_session_does_not_block_delivery() {
    let (server, transport) = server();
    started(&server);
    transport.clear();

    server.disconnect("bob", Instant::now()).unwrap();
    transport.close("bob");

    let report = server
        .handle(
            "alice",
            Command::PickComponent {
                component: ComponentId(1),
            },
            Utc::now(),
        )
        .unwrap();
    assert_eq!(report.delivered, vec!["alice".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert!(!transport.take("alice").is_empty());
}

#[test]
fn reconnect_receives_snapshot() {
    let (server, transport) = server();
    let lobby_id = started(&server);
    let start = Instant::now();

    // bob misses heartbeats
    server.heartbeat("alice", start + Duration::from_secs(40)).unwrap();
    let expired = server.expire_stale(start + Duration::from_secs(60));
    assert_eq!(expired, vec!["bob".to_string()]);
    assert!(!server.is_active("bob"));

    // The match keeps going while the session is inactive
    server
        .handle(
            "bob",
            Command::PickComponent {
                component: ComponentId(2),
            },
            Utc::now(),
        )
        .unwrap();

    transport.clear();
    transport.reopen("bob");
    let attach = server.connect("bob", start + Duration::from_secs(70)).unwrap();
    assert_eq!(
        attach,
        Attach::Reattached {
            lobby: Some(lobby_id)
        }
    );

    let bob = transport.take("bob");
    let Some(Outbound::Snapshot(snapshot)) = bob.first() else {
        panic!("expected a snapshot, got {:?}", bob);
    };
    assert!(snapshot.deck.is_empty());
    let ship = snapshot.ships.iter().find(|s| s.owner == "bob").unwrap();
    assert_eq!(ship.hand, Some(ComponentId(2)));
    assert!(transport.take("alice").is_empty());
}

#[test]
fn match_runs_to_the_end() {
    let (server, transport) = server();
    let lobby_id = started(&server);

    for player in ["alice", "bob"] {
        server
            .handle(player, Command::FinishBuilding, Utc::now())
            .unwrap();
    }
    let handle = server.match_of("alice").unwrap();
    let leader = handle.with_game(|game| {
        assert_eq!(game.state("alice").unwrap(), PlayerState::DrawCard);
        game.flight().leader()
    });
    assert_eq!(leader.as_deref(), Some("alice"));

    server.handle("bob", Command::EndFlight, Utc::now()).unwrap();
    transport.clear();
    server.handle("alice", Command::EndFlight, Utc::now()).unwrap();

    let alice = transport.take("alice");
    assert!(payloads(&alice)
        .iter()
        .any(|p| matches!(p, EventPayload::GameEnded { .. })));
    assert_eq!(server.match_count(), 0);
    assert!(server.match_of("alice").is_none());

    // The lobby is free for another round
    server.set_ready("alice", true).unwrap();
    server.set_ready("bob", true).unwrap();
    server.start_match(&lobby_id, Utc::now()).unwrap();
    assert_eq!(server.match_count(), 1);
}

#[test]
fn matches_run_in_parallel() {
    let (server, _transport) = server();
    let now = Instant::now();
    for name in ["a1", "a2", "b1", "b2"] {
        server.connect(name, now).unwrap();
    }
    let first = server.create_lobby("a1", learner()).unwrap();
    server.join_lobby("a2", &first).unwrap();
    let second = server.create_lobby("b1", learner()).unwrap();
    server.join_lobby("b2", &second).unwrap();
    for name in ["a1", "a2", "b1", "b2"] {
        server.set_ready(name, true).unwrap();
    }
    server.start_match(&first, Utc::now()).unwrap();
    server.start_match(&second, Utc::now()).unwrap();

    let server = Arc::new(server);
    let workers: Vec<_> = ["a1", "a2", "b1", "b2"]
        .into_iter()
        .enumerate()
        .map(|(i, name)| {
            let server = Arc::clone(&server);
            thread::spawn(move || {
                server.handle(
                    name,
                    Command::PickComponent {
                        component: ComponentId(i as u32 + 1),
                    },
                    Utc::now(),
                )
            })
        })
        .collect();
    for worker in workers {
        assert!(worker.join().unwrap().is_ok());
    }

    for name in ["a1", "a2", "b1", "b2"] {
        let handle = server.match_of(name).unwrap();
        handle.with_game(|game| assert!(game.ship(name).unwrap().hand().is_some()));
    }
}
