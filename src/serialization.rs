//! JSON encoding of outbound commands and decoding of inbound frames.
//!
//! Encoders write straight into a caller-provided slot buffer and fail with
//! [`RpcError::MessageTooLarge`] instead of growing it.

use serde::Serialize;
use serde_json::Value;

use crate::constants::{
    CMD_CLOSE_JOIN_REQUEST, CMD_SEND_JOIN_INVITE, CMD_SET_ACTIVITY, CMD_SUBSCRIBE, RPC_VERSION,
};
use crate::error::{Result, RpcError};

/// Presence shown by the host for this application.
///
/// Empty strings and zero values are left out of the encoded activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RichPresence {
    pub state: String,
    pub details: String,
    /// Unix seconds.
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub large_image_key: String,
    pub large_image_text: String,
    pub small_image_key: String,
    pub small_image_text: String,
    pub party_id: String,
    pub party_size: i32,
    pub party_max: i32,
    pub match_secret: String,
    pub join_secret: String,
    pub spectate_secret: String,
    pub instance: bool,
}

/// Answer to a join request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    No,
    Yes,
    Ignore,
}

fn non_empty(text: &str) -> Option<&str> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn non_zero(value: i64) -> Option<i64> {
    (value != 0).then_some(value)
}

#[derive(Serialize)]
struct Timestamps {
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end: Option<i64>,
}

#[derive(Serialize)]
struct Assets<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    large_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    large_text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_image: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    small_text: Option<&'a str>,
}

#[derive(Serialize)]
struct Party<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<[i32; 2]>,
}

#[derive(Serialize)]
struct Secrets<'a> {
    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    match_secret: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    join: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    spectate: Option<&'a str>,
}

#[derive(Serialize)]
struct Activity<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamps: Option<Timestamps>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assets: Option<Assets<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    party: Option<Party<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secrets: Option<Secrets<'a>>,
    instance: bool,
}

impl<'a> From<&'a RichPresence> for Activity<'a> {
    fn from(p: &'a RichPresence) -> Self {
        let timestamps = Timestamps {
            start: non_zero(p.start_timestamp),
            end: non_zero(p.end_timestamp),
        };
        let assets = Assets {
            large_image: non_empty(&p.large_image_key),
            large_text: non_empty(&p.large_image_text),
            small_image: non_empty(&p.small_image_key),
            small_text: non_empty(&p.small_image_text),
        };
        let party = Party {
            id: non_empty(&p.party_id),
            size: (p.party_size != 0 || p.party_max != 0).then_some([p.party_size, p.party_max]),
        };
        let secrets = Secrets {
            match_secret: non_empty(&p.match_secret),
            join: non_empty(&p.join_secret),
            spectate: non_empty(&p.spectate_secret),
        };

        Activity {
            state: non_empty(&p.state),
            details: non_empty(&p.details),
            timestamps: (timestamps.start.is_some() || timestamps.end.is_some())
                .then_some(timestamps),
            assets: (assets.large_image.is_some()
                || assets.large_text.is_some()
                || assets.small_image.is_some()
                || assets.small_text.is_some())
            .then_some(assets),
            party: (party.id.is_some() || party.size.is_some()).then_some(party),
            secrets: (secrets.match_secret.is_some()
                || secrets.join.is_some()
                || secrets.spectate.is_some())
            .then_some(secrets),
            instance: p.instance,
        }
    }
}

#[derive(Serialize)]
struct Handshake<'a> {
    v: u32,
    client_id: &'a str,
}

#[derive(Serialize)]
struct Subscribe<'a> {
    nonce: String,
    cmd: &'static str,
    evt: &'a str,
}

#[derive(Serialize)]
struct PresenceArgs<'a> {
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    activity: Option<Activity<'a>>,
}

#[derive(Serialize)]
struct UserArgs<'a> {
    user_id: &'a str,
}

#[derive(Serialize)]
struct Command<A> {
    nonce: String,
    cmd: &'static str,
    args: A,
}

fn write_into<T: Serialize>(buffer: &mut [u8], value: &T) -> Result<usize> {
    let capacity = buffer.len();
    let mut cursor = &mut buffer[..];
    match serde_json::to_writer(&mut cursor, value) {
        Ok(()) => Ok(capacity - cursor.len()),
        Err(err) if err.is_io() => Err(RpcError::MessageTooLarge { max: capacity }),
        Err(err) => Err(RpcError::Encode(err.to_string())),
    }
}

pub fn write_handshake(buffer: &mut [u8], application_id: &str) -> Result<usize> {
    write_into(
        buffer,
        &Handshake {
            v: RPC_VERSION,
            client_id: application_id,
        },
    )
}

pub fn write_subscribe(buffer: &mut [u8], nonce: u32, event: &str) -> Result<usize> {
    write_into(
        buffer,
        &Subscribe {
            nonce: nonce.to_string(),
            cmd: CMD_SUBSCRIBE,
            evt: event,
        },
    )
}

/// `None` clears the presence.
pub fn write_rich_presence(
    buffer: &mut [u8],
    nonce: u32,
    pid: u32,
    presence: Option<&RichPresence>,
) -> Result<usize> {
    write_into(
        buffer,
        &Command {
            nonce: nonce.to_string(),
            cmd: CMD_SET_ACTIVITY,
            args: PresenceArgs {
                pid,
                activity: presence.map(Activity::from),
            },
        },
    )
}

/// [`Reply::Ignore`] has no wire form; callers must not enqueue it.
pub fn write_join_reply(buffer: &mut [u8], nonce: u32, user_id: &str, reply: Reply) -> Result<usize> {
    let cmd = match reply {
        Reply::Yes => CMD_SEND_JOIN_INVITE,
        Reply::No | Reply::Ignore => CMD_CLOSE_JOIN_REQUEST,
    };
    write_into(
        buffer,
        &Command {
            nonce: nonce.to_string(),
            cmd,
            args: UserArgs { user_id },
        },
    )
}

/// The handful of fields the client looks at in an inbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundMessage {
    pub cmd: Option<String>,
    pub evt: Option<String>,
    pub nonce: Option<String>,
    pub data: Value,
}

impl InboundMessage {
    /// `None` for bytes that are not a JSON document.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Value>(bytes).ok().map(Self::from)
    }

    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }

    pub fn data_i32(&self, key: &str) -> Option<i32> {
        self.data
            .get(key)
            .and_then(Value::as_i64)
            .and_then(|v| i32::try_from(v).ok())
    }
}

fn string_member(value: &mut Value, key: &str) -> Option<String> {
    match value.get_mut(key).map(Value::take) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

impl From<Value> for InboundMessage {
    fn from(mut value: Value) -> Self {
        InboundMessage {
            cmd: string_member(&mut value, "cmd"),
            evt: string_member(&mut value, "evt"),
            nonce: string_member(&mut value, "nonce"),
            data: value.get_mut("data").map(Value::take).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_MESSAGE_SIZE;
    use serde_json::json;

    fn encoded(write: impl FnOnce(&mut [u8]) -> Result<usize>) -> Value {
        let mut buffer = vec![0u8; MAX_MESSAGE_SIZE];
        let len = write(&mut buffer).unwrap();
        serde_json::from_slice(&buffer[..len]).unwrap()
    }

    #[test]
    fn handshake_carries_version_and_client_id() {
        let doc = encoded(|b| write_handshake(b, "1234"));
        assert_eq!(doc, json!({"v": 1, "client_id": "1234"}));
    }

    #[test]
    fn subscribe_uses_string_nonce() {
        let doc = encoded(|b| write_subscribe(b, 7, "JOIN_GAME"));
        assert_eq!(doc, json!({"nonce": "7", "cmd": "SUBSCRIBE", "evt": "JOIN_GAME"}));
    }

    #[test]
    fn presence_omits_empty_groups() {
        let presence = RichPresence {
            state: "In a match".into(),
            start_timestamp: 1_500_000_000,
            party_size: 2,
            party_max: 4,
            join_secret: "j".into(),
            ..Default::default()
        };
        let doc = encoded(|b| write_rich_presence(b, 3, 99, Some(&presence)));
        assert_eq!(
            doc,
            json!({
                "nonce": "3",
                "cmd": "SET_ACTIVITY",
                "args": {
                    "pid": 99,
                    "activity": {
                        "state": "In a match",
                        "timestamps": {"start": 1_500_000_000i64},
                        "party": {"size": [2, 4]},
                        "secrets": {"join": "j"},
                        "instance": false
                    }
                }
            })
        );
    }

    #[test]
    fn clear_presence_has_no_activity() {
        let doc = encoded(|b| write_rich_presence(b, 1, 5, None));
        assert_eq!(doc, json!({"nonce": "1", "cmd": "SET_ACTIVITY", "args": {"pid": 5}}));
    }

    #[test]
    fn join_reply_commands() {
        let yes = encoded(|b| write_join_reply(b, 2, "u1", Reply::Yes));
        assert_eq!(yes["cmd"], "SEND_ACTIVITY_JOIN_INVITE");
        assert_eq!(yes["args"]["user_id"], "u1");
        let no = encoded(|b| write_join_reply(b, 3, "u1", Reply::No));
        assert_eq!(no["cmd"], "CLOSE_ACTIVITY_JOIN_REQUEST");
    }

    #[test]
    fn oversized_document_is_rejected() {
        let presence = RichPresence {
            details: "d".repeat(64),
            ..Default::default()
        };
        let mut small = [0u8; 32];
        assert_eq!(
            write_rich_presence(&mut small, 1, 1, Some(&presence)),
            Err(RpcError::MessageTooLarge { max: 32 })
        );
    }

    #[test]
    fn inbound_ignores_non_string_fields() {
        let msg = InboundMessage::from(json!({"evt": 5, "nonce": null, "cmd": "DISPATCH"}));
        assert_eq!(msg.evt, None);
        assert_eq!(msg.nonce, None);
        assert_eq!(msg.cmd.as_deref(), Some("DISPATCH"));
        assert_eq!(msg.data, Value::Null);
    }

    #[test]
    fn inbound_data_accessors() {
        let msg = InboundMessage::parse(
            br#"{"evt":"ERROR","nonce":"5","data":{"code":4000,"message":"oops"}}"#,
        )
        .unwrap();
        assert_eq!(msg.data_i32("code"), Some(4000));
        assert_eq!(msg.data_str("message"), Some("oops"));
        assert!(InboundMessage::parse(b"{not json").is_none());
    }
}
