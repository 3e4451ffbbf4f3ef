//! Realtime envelope parsing and normalization into typed deltas.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use shared::{
    domain::{ChannelId, MessageId, UserId},
    protocol::{
        Message, MessageCreatedPayload, MessageDeletedPayload, MessageEditedPayload, MessagePatch,
        MessageReactedPayload, MessageRetractedPayload, MessageSavedPayload, Reaction,
    },
};
use tracing::{debug, warn};

pub const MESSAGE_CREATED: &str = "message_created";
pub const MESSAGE_EDITED: &str = "message_edited";
pub const MESSAGE_DELETED: &str = "message_deleted";
pub const MESSAGE_REACTED: &str = "message_reacted";
pub const MESSAGE_SAVED: &str = "message_saved";
pub const MESSAGE_RETRACTED: &str = "raven_message_retracted";
pub const CHANNEL_LIST_UPDATED: &str = "channel_list_updated";

/// One realtime event as received: the event name and its untyped payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl RawEnvelope {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(RawEnvelope),
    Ping { reply: &'static str },
    Ignored,
}

const ENGINE_IO_PING: &str = "2";
const ENGINE_IO_PONG: &str = "3";
const SOCKET_IO_EVENT_PREFIX: &str = "42";

/// Parses a text frame: socket.io `42["event", {...}]`, engine.io ping, or a
/// plain `{"event": ..., "data": ...}` JSON object.
pub fn parse_frame(text: &str) -> Frame {
    let text = text.trim();
    if text == ENGINE_IO_PING {
        return Frame::Ping {
            reply: ENGINE_IO_PONG,
        };
    }

    if let Some(rest) = text.strip_prefix(SOCKET_IO_EVENT_PREFIX) {
        // Namespaced events look like `42/ns,["event", ...]`.
        let rest = match rest.strip_prefix('/') {
            Some(namespaced) => namespaced.split_once(',').map(|(_, body)| body).unwrap_or(""),
            None => rest,
        };
        return match serde_json::from_str::<Vec<Value>>(rest) {
            Ok(parts) => match parts.as_slice() {
                [Value::String(event), data, ..] => {
                    Frame::Event(RawEnvelope::new(event.clone(), data.clone()))
                }
                [Value::String(event)] => Frame::Event(RawEnvelope::new(event.clone(), Value::Null)),
                _ => {
                    warn!("realtime: socket.io event frame without event name");
                    Frame::Ignored
                }
            },
            Err(err) => {
                warn!("realtime: unparsable socket.io event frame: {err}");
                Frame::Ignored
            }
        };
    }

    if text.starts_with('{') {
        return match serde_json::from_str::<RawEnvelope>(text) {
            Ok(envelope) => Frame::Event(envelope),
            Err(err) => {
                warn!("realtime: unparsable json envelope: {err}");
                Frame::Ignored
            }
        };
    }

    debug!(frame = text, "realtime: ignoring control frame");
    Frame::Ignored
}

#[derive(Debug, Clone, PartialEq)]
pub enum RealtimeDelta {
    MessageCreated {
        channel_id: ChannelId,
        message: Box<Message>,
    },
    MessageEdited {
        channel_id: Option<ChannelId>,
        message_id: MessageId,
        patch: MessagePatch,
    },
    MessageDeleted {
        channel_id: Option<ChannelId>,
        message_id: MessageId,
    },
    MessageReacted {
        channel_id: Option<ChannelId>,
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    MessageSaved {
        channel_id: Option<ChannelId>,
        message_id: MessageId,
        liked_by: Vec<UserId>,
    },
    MessageRetracted {
        channel_id: Option<ChannelId>,
        message_id: MessageId,
        is_last_message: bool,
    },
    ChannelListUpdated,
}

impl RealtimeDelta {
    pub fn channel_id(&self) -> Option<&ChannelId> {
        match self {
            Self::MessageCreated { channel_id, .. } => Some(channel_id),
            Self::MessageEdited { channel_id, .. }
            | Self::MessageDeleted { channel_id, .. }
            | Self::MessageReacted { channel_id, .. }
            | Self::MessageSaved { channel_id, .. }
            | Self::MessageRetracted { channel_id, .. } => channel_id.as_ref(),
            Self::ChannelListUpdated => None,
        }
    }

    pub fn message_id(&self) -> Option<&MessageId> {
        match self {
            Self::MessageCreated { message, .. } => Some(&message.name),
            Self::MessageEdited { message_id, .. }
            | Self::MessageDeleted { message_id, .. }
            | Self::MessageReacted { message_id, .. }
            | Self::MessageSaved { message_id, .. }
            | Self::MessageRetracted { message_id, .. } => Some(message_id),
            Self::ChannelListUpdated => None,
        }
    }
}

/// Normalizes an envelope. Unknown events and malformed payloads yield `None`
/// after logging; this never panics.
pub fn decode(envelope: &RawEnvelope) -> Option<RealtimeDelta> {
    match envelope.event.as_str() {
        MESSAGE_CREATED => payload::<MessageCreatedPayload>(envelope).and_then(|p| {
            if p.message_details.channel_id != p.channel_id {
                warn!(
                    event = MESSAGE_CREATED,
                    channel_id = %p.channel_id,
                    message_channel_id = %p.message_details.channel_id,
                    "realtime: dropping envelope with mismatched channel"
                );
                return None;
            }
            Some(RealtimeDelta::MessageCreated {
                channel_id: p.channel_id,
                message: Box::new(p.message_details),
            })
        }),
        MESSAGE_EDITED => {
            payload::<MessageEditedPayload>(envelope).map(|p| RealtimeDelta::MessageEdited {
                channel_id: p.channel_id,
                message_id: p.message_id,
                patch: p.message_details,
            })
        }
        MESSAGE_DELETED => {
            payload::<MessageDeletedPayload>(envelope).map(|p| RealtimeDelta::MessageDeleted {
                channel_id: p.channel_id,
                message_id: p.message_id,
            })
        }
        MESSAGE_REACTED => {
            payload::<MessageReactedPayload>(envelope).map(|p| RealtimeDelta::MessageReacted {
                channel_id: p.channel_id,
                message_id: p.message_id,
                reactions: p.reactions,
            })
        }
        MESSAGE_SAVED => {
            payload::<MessageSavedPayload>(envelope).map(|p| RealtimeDelta::MessageSaved {
                channel_id: p.channel_id,
                message_id: p.message_id,
                liked_by: p.liked_by,
            })
        }
        MESSAGE_RETRACTED => {
            payload::<MessageRetractedPayload>(envelope).map(|p| RealtimeDelta::MessageRetracted {
                channel_id: p.channel_id,
                message_id: p.message_id,
                is_last_message: p.is_last_message,
            })
        }
        CHANNEL_LIST_UPDATED => Some(RealtimeDelta::ChannelListUpdated),
        other => {
            debug!(event = other, "realtime: ignoring unhandled event");
            None
        }
    }
}

fn payload<T: DeserializeOwned>(envelope: &RawEnvelope) -> Option<T> {
    match T::deserialize(&envelope.data) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!(
                event = envelope.event.as_str(),
                "realtime: dropping malformed envelope: {err}"
            );
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/decoder_tests.rs"]
mod tests;
