//! JSON encoding of envelopes and query replies on the wire.

use courier_core::{BusError, Envelope, HandlerError, Message, ERROR_HEADER};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Wrap a payload into a fresh wire message.
pub fn encode<T: Serialize>(payload: &T) -> Result<Message, BusError> {
    Ok(Message::json(payload)?)
}

/// Rebuild a typed envelope from its topic name and a wire message.
///
/// The payload type comes from the bus, so a payload that does not match is
/// a decode error here rather than a failed runtime cast further down.
pub fn decode<E>(name: &str, message: &Message) -> Result<E, BusError>
where
    E: Envelope,
    E::Payload: DeserializeOwned,
{
    let payload = message.decode()?;
    Ok(E::from_parts(name.to_string(), payload))
}

/// Build the reply to `request` from a query handler's outcome.
pub fn reply<R: Serialize>(request: &Message, outcome: &Result<R, HandlerError>) -> Result<Message, BusError> {
    let reply = match outcome {
        Ok(result) => encode(result)?,
        Err(err) => Message::new(Vec::new()).with_header(ERROR_HEADER, err.to_string()),
    };
    Ok(reply.with_correlation_id(request.id.clone()))
}

/// Turn a reply back into the query result.
pub fn read_reply<R: DeserializeOwned>(reply: &Message) -> Result<R, BusError> {
    if let Some(error) = reply.header(ERROR_HEADER) {
        return Err(BusError::Handler(HandlerError::Remote(error.to_string())));
    }
    Ok(reply.decode()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{Command, Query};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Reserve {
        passenger: String,
        seat: u32,
    }

    #[test]
    fn envelope_survives_the_wire() {
        let payload = Reserve {
            passenger: "John Doe".into(),
            seat: 12,
        };
        let message = encode(&payload).unwrap();
        let command: Command<Reserve> = decode("ReserveTicket", &message).unwrap();

        assert_eq!(command.name(), "ReserveTicket");
        assert_eq!(command.payload(), &payload);
    }

    #[test]
    fn mismatched_payload_is_a_serialization_error() {
        let message = encode(&"not a reservation").unwrap();
        let err = decode::<Command<Reserve>>("ReserveTicket", &message).unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn replies_carry_the_request_id() {
        let request = encode(&Query::new("FindTicket", "John Doe").into_payload()).unwrap();

        let ok = reply(&request, &Ok::<_, HandlerError>(vec![12u32])).unwrap();
        assert_eq!(ok.correlation_id.as_deref(), Some(request.id.as_str()));
        assert_eq!(read_reply::<Vec<u32>>(&ok).unwrap(), vec![12]);

        let failed = reply::<Vec<u32>>(&request, &Err(HandlerError::NotFound("John Doe".into()))).unwrap();
        let err = read_reply::<Vec<u32>>(&failed).unwrap_err();
        assert!(matches!(err, BusError::Handler(HandlerError::Remote(ref m)) if m.contains("John Doe")));
    }
}
