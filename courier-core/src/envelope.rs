//! Named payload envelopes: commands, queries and events.

use crate::error::BusError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a query name to derive its response topic.
pub const RESPONSE_SUFFIX: &str = "_response";

/// The role an envelope plays on a bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    Command,
    Query,
    Event,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::Command => "command",
            EnvelopeKind::Query => "query",
            EnvelopeKind::Event => "event",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common view over [`Command`], [`Query`] and [`Event`].
///
/// `from_parts` lets transport code rebuild a typed envelope from a topic
/// name and a decoded payload. The payload type is a type parameter of the
/// bus, so there is no runtime type assertion on the receiving side.
pub trait Envelope: Send + Sync + 'static {
    /// Payload carried by the envelope
    type Payload: Send + Sync + 'static;

    /// Role of the envelope
    const KIND: EnvelopeKind;

    /// Build an envelope from its name and payload.
    fn from_parts(name: String, payload: Self::Payload) -> Self;

    /// Dispatch key and transport topic.
    fn name(&self) -> &str;

    /// Borrow the payload.
    fn payload(&self) -> &Self::Payload;

    /// Consume the envelope, returning the payload.
    fn into_payload(self) -> Self::Payload;
}

macro_rules! envelope {
    ($(#[$meta:meta])* $ty:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $ty<T> {
            name: String,
            payload: T,
        }

        impl<T> $ty<T> {
            /// Create a new envelope.
            pub fn new(name: impl Into<String>, payload: T) -> Self {
                Self {
                    name: name.into(),
                    payload,
                }
            }

            pub fn name(&self) -> &str {
                &self.name
            }

            pub fn payload(&self) -> &T {
                &self.payload
            }

            pub fn into_payload(self) -> T {
                self.payload
            }
        }

        impl<T: Send + Sync + 'static> Envelope for $ty<T> {
            type Payload = T;
            const KIND: EnvelopeKind = $kind;

            fn from_parts(name: String, payload: T) -> Self {
                Self { name, payload }
            }

            fn name(&self) -> &str {
                &self.name
            }

            fn payload(&self) -> &T {
                &self.payload
            }

            fn into_payload(self) -> T {
                self.payload
            }
        }
    };
}

envelope!(
    /// A write intent handled by exactly one handler.
    Command,
    EnvelopeKind::Command
);

envelope!(
    /// A read request answered by exactly one handler.
    Query,
    EnvelopeKind::Query
);

envelope!(
    /// A notification delivered to zero or more handlers.
    Event,
    EnvelopeKind::Event
);

/// Check that a name can serve as a dispatch key and a transport topic.
///
/// Names must be non-empty and made of printable ASCII without whitespace.
pub fn validate_name(name: &str) -> Result<(), BusError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(BusError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Topic on which replies to the query `name` are published.
pub fn response_topic(name: &str) -> String {
    format!("{name}{RESPONSE_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reserve {
        passenger: String,
        seat: u32,
    }

    #[test]
    fn envelope_accessors() {
        let command = Command::new(
            "ReserveTicket",
            Reserve {
                passenger: "John Doe".into(),
                seat: 12,
            },
        );
        assert_eq!(command.name(), "ReserveTicket");
        assert_eq!(command.payload().seat, 12);
        assert_eq!(<Command<Reserve> as Envelope>::KIND, EnvelopeKind::Command);
        assert_eq!(command.into_payload().passenger, "John Doe");
    }

    #[test]
    fn from_parts_rebuilds_the_same_envelope() {
        let original = Event::new("TicketBooked", "John Doe".to_string());
        let rebuilt = <Event<String> as Envelope>::from_parts(
            original.name().to_string(),
            original.payload().clone(),
        );
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("ReserveTicket").is_ok());
        assert!(validate_name("orders.created-v1").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("caf\u{e9}").is_err());
    }

    #[test]
    fn response_topic_appends_suffix() {
        assert_eq!(response_topic("FindTicket"), "FindTicket_response");
        assert_eq!(EnvelopeKind::Event.to_string(), "event");
    }
}
