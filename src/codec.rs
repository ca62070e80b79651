//! # Wire Protocol Encoding and Decoding
//!
//! Clients talk JSON over a WebSocket. Every frame is an object with a
//! `type` field.
//!
//! ## Client → Server
//!
//! ```text
//! {"type":"ping"}
//! {"type":"get_viewer_count"}
//! {"type":"increment","country_code":"US","country_name":"United States","user_id":"u1"}
//! {"type":"increment","operation":"multiply","multiply_amount":5,
//!  "payment_intent_id":"pi_1","user_id":"u1"}
//! {"type":"close","reason":"Page navigation/unload"}
//! ```
//!
//! A multiply travels as an increment-shaped frame with an `operation`
//! discriminator, which is what deployed clients send.
//!
//! ## Server → Client
//!
//! ```text
//! {"type":"count","count":"1000000000000000000000","operation":"increment"}
//! {"type":"viewer_count","count":12}
//! {"type":"pong"}
//! {"type":"error","count":"payment rejected: ..."}
//! {"type":"rate_limited","count":"you can only multiply once per day, try again in 3h 12m"}
//! ```
//!
//! Counter values are always decimal strings: they outgrow every JSON number
//! type. Error text rides in the `count` field because clients read it from
//! there.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    Attribution, BigCount, CounterChange, CountryCode, Delta, Operation, PaymentIntentId, UserId,
};

/// An encoded outbound frame, shared between every session it is queued on.
pub type Frame = Arc<str>;

// =============================================================================
// Client Messages
// =============================================================================

/// A decoded, validated inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Ping,
    GetViewerCount,
    Operation(Operation),
    Close { reason: Option<String> },
}

/// Loose shape of every client frame. Validation happens in
/// [`decode_client_message`] so errors can name the missing field.
#[derive(Debug, Deserialize)]
struct RawClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    multiply_amount: Option<u64>,
    #[serde(default)]
    payment_intent_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    country_code: Option<String>,
    #[serde(default)]
    country_name: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Treats `""` like an absent field; browsers send empty strings for
/// signed-out users.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// Decodes and validates one inbound text frame.
///
/// # Errors
///
/// [`Error::MalformedMessage`] for invalid JSON, an unknown `type` or
/// `operation`, or a multiply missing `multiply_amount` /
/// `payment_intent_id`. A multiply without `user_id` decodes fine; the
/// processor rejects it as `Unauthorized`.
pub fn decode_client_message(text: &str) -> Result<ClientMessage> {
    let raw: RawClientMessage =
        serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))?;

    match raw.kind.as_str() {
        "ping" => Ok(ClientMessage::Ping),
        "get_viewer_count" => Ok(ClientMessage::GetViewerCount),
        "close" => Ok(ClientMessage::Close { reason: raw.reason }),
        "increment" => {
            let attribution = Attribution {
                user_id: non_empty(raw.user_id).map(UserId::new),
                country_code: non_empty(raw.country_code).map(CountryCode::new),
                country_name: non_empty(raw.country_name),
            };

            match raw.operation.as_deref() {
                None | Some("increment") => Ok(ClientMessage::Operation(Operation::Increment {
                    attribution,
                })),
                Some("multiply") => {
                    let multiply_amount = raw.multiply_amount.ok_or_else(|| {
                        Error::MalformedMessage("multiply requires multiply_amount".to_string())
                    })?;
                    Delta::Multiply(multiply_amount).validate()?;

                    let payment_intent_id = non_empty(raw.payment_intent_id).ok_or_else(|| {
                        Error::MalformedMessage("multiply requires payment_intent_id".to_string())
                    })?;

                    Ok(ClientMessage::Operation(Operation::Multiply {
                        attribution,
                        multiply_amount,
                        payment_intent_id: PaymentIntentId::new(payment_intent_id),
                    }))
                }
                Some(other) => Err(Error::MalformedMessage(format!(
                    "unknown operation '{other}'"
                ))),
            }
        }
        other => Err(Error::MalformedMessage(format!(
            "unknown message type '{other}'"
        ))),
    }
}

/// Encodes a client frame in the shape [`decode_client_message`] accepts.
pub fn encode_client_message(message: &ClientMessage) -> String {
    let value = match message {
        ClientMessage::Ping => serde_json::json!({ "type": "ping" }),
        ClientMessage::GetViewerCount => serde_json::json!({ "type": "get_viewer_count" }),
        ClientMessage::Close { reason } => serde_json::json!({ "type": "close", "reason": reason }),
        ClientMessage::Operation(op) => {
            let attribution = op.attribution();
            let mut value = serde_json::json!({
                "type": "increment",
                "user_id": attribution.user_id,
                "country_code": attribution.country_code,
                "country_name": attribution.country_name,
            });
            if let Operation::Multiply {
                multiply_amount,
                payment_intent_id,
                ..
            } = op
            {
                value["operation"] = "multiply".into();
                value["multiply_amount"] = (*multiply_amount).into();
                value["payment_intent_id"] = payment_intent_id.as_str().into();
            }
            value
        }
    };
    value.to_string()
}

// =============================================================================
// Server Messages
// =============================================================================

/// Which operation produced a `count` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Increment,
    Multiply,
}

/// An outbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Current counter value. Broadcast on every apply; also the first frame
    /// of every connection (without `operation`).
    Count {
        count: BigCount,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        operation: Option<OperationKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        multiply_amount: Option<u64>,
    },
    ViewerCount {
        count: u64,
    },
    Pong,
    Error {
        count: String,
    },
    RateLimited {
        count: String,
    },
}

impl ServerMessage {
    /// The broadcast frame for an applied change.
    pub fn from_change(change: &CounterChange) -> Self {
        match change.delta {
            Delta::Add(_) => ServerMessage::Count {
                count: change.value.clone(),
                operation: Some(OperationKind::Increment),
                multiply_amount: None,
            },
            Delta::Multiply(n) => ServerMessage::Count {
                count: change.value.clone(),
                operation: Some(OperationKind::Multiply),
                multiply_amount: Some(n),
            },
        }
    }

    /// A bare `count` frame used to resynchronize a (re)connecting client.
    pub fn resync(value: &BigCount) -> Self {
        ServerMessage::Count {
            count: value.clone(),
            operation: None,
            multiply_amount: None,
        }
    }

    /// Serializes the message into a shareable frame.
    pub fn encode(&self) -> Result<Frame> {
        serde_json::to_string(self)
            .map(Frame::from)
            .map_err(|e| Error::Schema(format!("failed to encode frame: {e}")))
    }
}

/// Decodes an outbound frame (used by the client).
pub fn decode_server_message(text: &str) -> Result<ServerMessage> {
    serde_json::from_str(text).map_err(|e| Error::MalformedMessage(e.to_string()))
}

// =============================================================================
// Time
// =============================================================================

/// Returns the current time in milliseconds since Unix epoch.
pub fn current_time_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogPos;

    #[test]
    fn test_decode_keepalive_frames() {
        assert_eq!(decode_client_message(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
        assert_eq!(
            decode_client_message(r#"{"type":"get_viewer_count"}"#).unwrap(),
            ClientMessage::GetViewerCount
        );
        assert_eq!(
            decode_client_message(r#"{"type":"close","reason":"Component unmounting"}"#).unwrap(),
            ClientMessage::Close {
                reason: Some("Component unmounting".to_string())
            }
        );
    }

    #[test]
    fn test_decode_increment_from_browser() {
        // Shape sent by the web client, including fields the engine ignores.
        let msg = decode_client_message(
            r#"{"type":"increment","country_code":"SE","country_name":"Sweden",
                "user_id":"","amount":1,"operation":"increment",
                "multiply_amount":null,"payment_intent_id":null}"#,
        )
        .unwrap();

        match msg {
            ClientMessage::Operation(Operation::Increment { attribution }) => {
                assert_eq!(attribution.user_id, None);
                assert_eq!(attribution.country_code, Some(CountryCode::new("SE")));
                assert_eq!(attribution.country_name.as_deref(), Some("Sweden"));
            }
            other => panic!("expected increment, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_multiply() {
        let msg = decode_client_message(
            r#"{"type":"increment","operation":"multiply","multiply_amount":5,
                "payment_intent_id":"pi_1","user_id":"user-1"}"#,
        )
        .unwrap();

        assert_eq!(
            msg,
            ClientMessage::Operation(Operation::Multiply {
                attribution: Attribution::user("user-1"),
                multiply_amount: 5,
                payment_intent_id: PaymentIntentId::new("pi_1"),
            })
        );
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        for text in [
            "not json",
            r#"{"count":1}"#,
            r#"{"type":"decrement"}"#,
            r#"{"type":"increment","operation":"divide"}"#,
            r#"{"type":"increment","operation":"multiply","payment_intent_id":"pi"}"#,
            r#"{"type":"increment","operation":"multiply","multiply_amount":5}"#,
            r#"{"type":"increment","operation":"multiply","multiply_amount":1,"payment_intent_id":"pi"}"#,
            r#"{"type":"increment","operation":"multiply","multiply_amount":-3,"payment_intent_id":"pi"}"#,
        ] {
            let err = decode_client_message(text).unwrap_err();
            assert!(
                matches!(err, Error::MalformedMessage(_)),
                "expected malformed for {text}, got {err:?}"
            );
        }
    }

    #[test]
    fn test_client_message_encoding_is_accepted_by_decoder() {
        let op = ClientMessage::Operation(Operation::Multiply {
            attribution: Attribution::user("u").with_country("US", Some("United States".into())),
            multiply_amount: 10,
            payment_intent_id: PaymentIntentId::new("pi_9"),
        });
        assert_eq!(decode_client_message(&encode_client_message(&op)).unwrap(), op);
    }

    #[test]
    fn test_count_frame_shape() {
        let change = CounterChange {
            pos: LogPos::from_raw(7),
            value: BigCount::parse("1000000000000000000000").unwrap(),
            delta: Delta::Add(1),
            user_id: None,
            country_code: None,
            timestamp_ms: 0,
        };
        let frame = ServerMessage::from_change(&change).encode().unwrap();
        assert_eq!(
            &*frame,
            r#"{"type":"count","count":"1000000000000000000000","operation":"increment"}"#
        );

        let multiply = CounterChange {
            delta: Delta::Multiply(5),
            ..change
        };
        let frame = ServerMessage::from_change(&multiply).encode().unwrap();
        assert_eq!(
            &*frame,
            r#"{"type":"count","count":"1000000000000000000000","operation":"multiply","multiply_amount":5}"#
        );
    }

    #[test]
    fn test_other_frame_shapes() {
        assert_eq!(&*ServerMessage::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
        assert_eq!(
            &*ServerMessage::ViewerCount { count: 3 }.encode().unwrap(),
            r#"{"type":"viewer_count","count":3}"#
        );
        assert_eq!(
            &*ServerMessage::resync(&BigCount::from(42)).encode().unwrap(),
            r#"{"type":"count","count":"42"}"#
        );
    }

    #[test]
    fn test_decode_server_message() {
        let msg = decode_server_message(r#"{"type":"rate_limited","count":"slow down"}"#).unwrap();
        assert_eq!(
            msg,
            ServerMessage::RateLimited {
                count: "slow down".to_string()
            }
        );
    }
}
