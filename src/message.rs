//! Wire vocabulary spoken with relays: one JSON array per text frame.

use crate::error::{Error, Result};
use nostr::{Event, EventId, Filter, Kind, SubscriptionId};
use serde::ser::{Serialize, SerializeSeq, Serializer};
use serde_json::Value;

/// Kind of the privileged join request sent to bootstrap relay access.
/// Never deferred behind authentication and never retried.
pub const AUTH_JOIN: u16 = 28934;

const AUTH_REQUIRED_PREFIX: &str = "auth-required:";

pub fn is_auth_required(detail: &str) -> bool {
    detail.starts_with(AUTH_REQUIRED_PREFIX)
}

pub fn is_join_request(event: &Event) -> bool {
    event.kind == Kind::from(AUTH_JOIN)
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req {
        subscription_id: SubscriptionId,
        filters: Vec<Filter>,
    },
    Close(SubscriptionId),
    Event(Box<Event>),
    Auth(Box<Event>),
}

impl ClientMessage {
    pub fn req(subscription_id: SubscriptionId, filters: Vec<Filter>) -> Self {
        ClientMessage::Req {
            subscription_id,
            filters,
        }
    }

    pub fn event(event: Event) -> Self {
        ClientMessage::Event(Box::new(event))
    }

    pub fn auth(event: Event) -> Self {
        ClientMessage::Auth(Box::new(event))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ClientMessage::Auth(_))
    }

    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            ClientMessage::Req {
                subscription_id, ..
            }
            | ClientMessage::Close(subscription_id) => Some(subscription_id),
            _ => None,
        }
    }

    /// True for AUTH messages and join requests, which must reach the relay
    /// while authentication is still unresolved.
    pub fn bypasses_auth(&self) -> bool {
        match self {
            ClientMessage::Auth(_) => true,
            ClientMessage::Event(event) => is_join_request(event),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let items = parse_array(json)?;
        let tag = message_type(&items)?;

        match tag {
            "REQ" => {
                let subscription_id = subscription_id_at(&items, 1)?;
                let filters = items[2..]
                    .iter()
                    .map(|filter| serde_json::from_value(filter.clone()))
                    .collect::<std::result::Result<Vec<Filter>, _>>()?;
                Ok(ClientMessage::Req {
                    subscription_id,
                    filters,
                })
            }
            "CLOSE" => Ok(ClientMessage::Close(subscription_id_at(&items, 1)?)),
            "EVENT" => Ok(ClientMessage::Event(Box::new(event_at(&items, 1)?))),
            "AUTH" => Ok(ClientMessage::Auth(Box::new(event_at(&items, 1)?))),
            other => Err(Error::protocol(format!("unsupported client message {other}"))),
        }
    }
}

impl Serialize for ClientMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut seq = serializer.serialize_seq(Some(2 + filters.len()))?;
                seq.serialize_element("REQ")?;
                seq.serialize_element(subscription_id)?;
                for filter in filters {
                    seq.serialize_element(filter)?;
                }
                seq.end()
            }
            ClientMessage::Close(subscription_id) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("CLOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            ClientMessage::Event(event) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
            ClientMessage::Auth(event) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event {
        subscription_id: SubscriptionId,
        event: Box<Event>,
    },
    Eose(SubscriptionId),
    Ok {
        event_id: EventId,
        status: bool,
        message: String,
    },
    Closed {
        subscription_id: SubscriptionId,
        message: String,
    },
    Auth {
        challenge: String,
    },
}

impl RelayMessage {
    pub fn subscription_id(&self) -> Option<&SubscriptionId> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose(subscription_id)
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }

    /// Rejections carrying the `auth-required:` prefix.
    pub fn is_auth_required(&self) -> bool {
        match self {
            RelayMessage::Ok {
                status: false,
                message,
                ..
            }
            | RelayMessage::Closed { message, .. } => is_auth_required(message),
            _ => false,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let items = parse_array(json)?;
        let tag = message_type(&items)?;

        match tag {
            "EVENT" => Ok(RelayMessage::Event {
                subscription_id: subscription_id_at(&items, 1)?,
                event: Box::new(event_at(&items, 2)?),
            }),
            "EOSE" => Ok(RelayMessage::Eose(subscription_id_at(&items, 1)?)),
            "OK" => {
                let event_id = str_at(&items, 1)?;
                let event_id = EventId::from_hex(event_id)
                    .map_err(|e| Error::protocol(format!("invalid event id {event_id}: {e}")))?;
                let status = items
                    .get(2)
                    .and_then(Value::as_bool)
                    .ok_or_else(|| Error::protocol("OK without a boolean status"))?;
                Ok(RelayMessage::Ok {
                    event_id,
                    status,
                    message: optional_str_at(&items, 3),
                })
            }
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: subscription_id_at(&items, 1)?,
                message: optional_str_at(&items, 2),
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: str_at(&items, 1)?.to_string(),
            }),
            other => Err(Error::protocol(format!("unsupported relay message {other}"))),
        }
    }
}

impl Serialize for RelayMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("EVENT")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(event.as_ref())?;
                seq.end()
            }
            RelayMessage::Eose(subscription_id) => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("EOSE")?;
                seq.serialize_element(subscription_id)?;
                seq.end()
            }
            RelayMessage::Ok {
                event_id,
                status,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(4))?;
                seq.serialize_element("OK")?;
                seq.serialize_element(&event_id.to_hex())?;
                seq.serialize_element(status)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element("CLOSED")?;
                seq.serialize_element(subscription_id)?;
                seq.serialize_element(message)?;
                seq.end()
            }
            RelayMessage::Auth { challenge } => {
                let mut seq = serializer.serialize_seq(Some(2))?;
                seq.serialize_element("AUTH")?;
                seq.serialize_element(challenge)?;
                seq.end()
            }
        }
    }
}

fn parse_array(json: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(json)? {
        Value::Array(items) => Ok(items),
        _ => Err(Error::protocol("expected a JSON array")),
    }
}

fn message_type(items: &[Value]) -> Result<&str> {
    items
        .first()
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol("missing message type"))
}

fn str_at(items: &[Value], index: usize) -> Result<&str> {
    items
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::protocol(format!("expected a string at position {index}")))
}

fn optional_str_at(items: &[Value], index: usize) -> String {
    items
        .get(index)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn subscription_id_at(items: &[Value], index: usize) -> Result<SubscriptionId> {
    str_at(items, index).map(SubscriptionId::new)
}

fn event_at(items: &[Value], index: usize) -> Result<Event> {
    let value = items
        .get(index)
        .ok_or_else(|| Error::protocol(format!("expected an event at position {index}")))?;
    Ok(serde_json::from_value(value.clone())?)
}
