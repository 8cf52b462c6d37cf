//! Delivery of flushed events to the players that may see them.
//!
//! The router knows nothing about sockets: it hands [`Outbound`] messages to
//! a [`Transport`] one recipient at a time. A recipient whose session is gone
//! is skipped and logged, everyone else still gets their copy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::event::{Event, Visibility};
use super::snapshot::GameSnapshot;

/// Message sent to one client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", content = "body", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outbound {
    /// The following events belong together; render after `BatchEnd`
    BatchStart,
    Event(Event),
    BatchEnd,
    Snapshot(Box<GameSnapshot>),
}

impl Outbound {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BatchStart => "batch_start",
            Self::Event(_) => "event",
            Self::BatchEnd => "batch_end",
            Self::Snapshot(_) => "snapshot",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Delivery errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("session of {0} is closed")]
    Closed(String),
    #[error("no session for {0}")]
    Unknown(String),
}

/// Send primitive of the wire layer.
pub trait Transport {
    fn send(&self, username: &str, message: &Outbound) -> Result<(), TransportError>;
}

/// What happened to one routed flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Recipients that received every message meant for them
    pub delivered: Vec<String>,
    pub failed: Vec<(String, TransportError)>,
}

impl DeliveryReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Players that must receive `event`.
pub fn recipients(event: &Event, members: &[String]) -> Vec<String> {
    match &event.visibility {
        Visibility::AllPlayers => members.to_vec(),
        Visibility::OtherPlayers => members
            .iter()
            .filter(|m| event.actor.as_deref() != Some(m.as_str()))
            .cloned()
            .collect(),
        Visibility::PlayerOnly => event.actor.iter().cloned().collect(),
        Visibility::SpecificPlayers(targets) => targets.clone(),
    }
}

/// Route a flushed event sequence.
///
/// When the sequence holds more than one event, each recipient's share is
/// wrapped in a `BatchStart`/`BatchEnd` pair. After the first failed send to
/// a recipient nothing more is sent to them.
pub fn route(events: &[Event], members: &[String], transport: &dyn Transport) -> DeliveryReport {
    let mut report = DeliveryReport::default();
    if events.is_empty() {
        return report;
    }

    // Recipient order: lobby members first, then explicit targets outside it
    let mut order: Vec<String> = Vec::new();
    let mut inbox: BTreeMap<String, Vec<&Event>> = BTreeMap::new();
    for event in events {
        for recipient in recipients(event, members) {
            if !inbox.contains_key(&recipient) {
                order.push(recipient.clone());
            }
            inbox.entry(recipient).or_default().push(event);
        }
    }

    let batched = events.len() > 1;
    for recipient in order {
        let Some(share) = inbox.remove(&recipient) else {
            continue;
        };
        match deliver(transport, &recipient, &share, batched) {
            Ok(()) => report.delivered.push(recipient),
            Err(err) => {
                warn!(recipient = %recipient, error = %err, "dropping events");
                report.failed.push((recipient, err));
            }
        }
    }
    report
}

fn deliver(
    transport: &dyn Transport,
    recipient: &str,
    share: &[&Event],
    batched: bool,
) -> Result<(), TransportError> {
    if batched {
        transport.send(recipient, &Outbound::BatchStart)?;
    }
    for event in share {
        transport.send(recipient, &Outbound::Event((*event).clone()))?;
    }
    if batched {
        transport.send(recipient, &Outbound::BatchEnd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::component::ComponentId;
    use crate::state::event::EventPayload;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, Outbound)>>,
        closed: Vec<String>,
    }

    impl Recorder {
        fn to(&self, username: &str) -> Vec<&'static str> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(u, _)| u == username)
                .map(|(_, m)| m.as_str())
                .collect()
        }
    }

    impl Transport for Recorder {
        fn send(&self, username: &str, message: &Outbound) -> Result<(), TransportError> {
            if self.closed.iter().any(|c| c == username) {
                return Err(TransportError::Closed(username.to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((username.to_string(), message.clone()));
            Ok(())
        }
    }

    fn members() -> Vec<String> {
        vec!["alice".to_string(), "bob".to_string(), "carol".to_string()]
    }

    fn released(actor: &str, visibility: Visibility) -> Event {
        Event::new(
            Some(actor),
            visibility,
            EventPayload::ComponentReleased {
                player: actor.to_string(),
                component: ComponentId(1),
            },
        )
    }

    #[test]
    fn test_recipients_by_visibility() {
        let members = members();
        assert_eq!(
            recipients(&released("alice", Visibility::AllPlayers), &members),
            members
        );
        assert_eq!(
            recipients(&released("alice", Visibility::OtherPlayers), &members),
            vec!["bob", "carol"]
        );
        assert_eq!(
            recipients(&released("alice", Visibility::PlayerOnly), &members),
            vec!["alice"]
        );
        let targets = Visibility::SpecificPlayers(vec!["carol".to_string()]);
        assert_eq!(recipients(&released("alice", targets), &members), vec!["carol"]);
    }

    #[test]
    fn test_system_event_for_player_only_reaches_nobody() {
        let mut event = released("alice", Visibility::PlayerOnly);
        event.actor = None;
        assert!(recipients(&event, &members()).is_empty());
    }

    #[test]
    fn test_single_event_is_not_batched() {
        let transport = Recorder::default();
        let report = route(&[released("alice", Visibility::AllPlayers)], &members(), &transport);
        assert!(report.is_clean());
        assert_eq!(report.delivered, members());
        assert_eq!(transport.to("bob"), vec!["event"]);
    }

    #[test]
    fn test_sequence_is_batched_per_recipient() {
        let transport = Recorder::default();
        let events = vec![
            released("alice", Visibility::PlayerOnly),
            released("alice", Visibility::OtherPlayers),
        ];
        route(&events, &members(), &transport);
        assert_eq!(transport.to("alice"), vec!["batch_start", "event", "batch_end"]);
        assert_eq!(transport.to("carol"), vec!["batch_start", "event", "batch_end"]);
    }

    #[test]
    fn test_closed_session_does_not_block_others() {
        let transport = Recorder {
            closed: vec!["bob".to_string()],
            ..Recorder::default()
        };
        let report = route(&[released("alice", Visibility::AllPlayers)], &members(), &transport);
        assert_eq!(report.delivered, vec!["alice", "carol"]);
        assert_eq!(
            report.failed,
            vec![("bob".to_string(), TransportError::Closed("bob".to_string()))]
        );
        assert_eq!(transport.to("carol"), vec!["event"]);
    }

    #[test]
    fn test_outbound_json_tag() {
        let json = Outbound::BatchStart.to_json();
        assert_eq!(json["message"], "BATCH_START");
    }
}
