use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::domain::{
    ChannelId, ChannelType, MemberType, MentionId, MessageId, MessageType, UserId,
};

/// Fields a partial message update may never overwrite: identity and sort key.
const RESERVED_MESSAGE_FIELDS: &[&str] = &["name", "channel_id", "creation", "owner"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub reaction: String,
    #[serde(default)]
    pub users: Vec<UserId>,
    #[serde(default)]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: MessageId,
    pub channel_id: ChannelId,
    #[serde(with = "timestamp")]
    pub creation: DateTime<Utc>,
    pub owner: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_edited: bool,
    #[serde(default, deserialize_with = "wire::reactions")]
    pub message_reactions: Vec<Reaction>,
    #[serde(default, alias = "_liked_by", deserialize_with = "wire::user_list")]
    pub liked_by: Vec<UserId>,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_retracted: bool,
    /// Server fields the client does not model; kept so merges stay shallow.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// Shallow-merges `patch` into the message. Returns whether any field changed.
    pub fn merge(&mut self, patch: MessagePatch) -> bool {
        let mut changed = false;
        if let Some(text) = patch.text {
            changed |= replace_if_different(&mut self.text, Some(text));
        }
        if let Some(content) = patch.content {
            changed |= replace_if_different(&mut self.content, Some(content));
        }
        if let Some(message_type) = patch.message_type {
            changed |= replace_if_different(&mut self.message_type, message_type);
        }
        if let Some(file) = patch.file {
            changed |= replace_if_different(&mut self.file, Some(file));
        }
        if let Some(is_edited) = patch.is_edited {
            changed |= replace_if_different(&mut self.is_edited, is_edited);
        }
        if let Some(reactions) = patch.message_reactions {
            changed |= replace_if_different(&mut self.message_reactions, reactions);
        }
        if let Some(liked_by) = patch.liked_by {
            changed |= replace_if_different(&mut self.liked_by, liked_by);
        }
        if let Some(is_retracted) = patch.is_retracted {
            changed |= replace_if_different(&mut self.is_retracted, is_retracted);
        }
        for (key, value) in patch.extra {
            if RESERVED_MESSAGE_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if self.extra.get(&key) != Some(&value) {
                self.extra.insert(key, value);
                changed = true;
            }
        }
        changed
    }

    /// Text shown in previews: plain content when present, raw text otherwise.
    pub fn display_text(&self) -> &str {
        self.content
            .as_deref()
            .or(self.text.as_deref())
            .unwrap_or_default()
    }
}

fn replace_if_different<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}

/// Partial message fields carried by `message_edited`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, deserialize_with = "wire::optional_flag")]
    pub is_edited: Option<bool>,
    #[serde(default, deserialize_with = "wire::optional_reactions")]
    pub message_reactions: Option<Vec<Reaction>>,
    #[serde(default, alias = "_liked_by", deserialize_with = "wire::optional_user_list")]
    pub liked_by: Option<Vec<UserId>>,
    #[serde(default, deserialize_with = "wire::optional_flag")]
    pub is_retracted: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastMessageSummary {
    pub message_id: MessageId,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<UserId>,
    #[serde(default)]
    pub message_type: MessageType,
}

impl LastMessageSummary {
    pub fn from_message(message: &Message) -> Self {
        Self {
            message_id: message.name.clone(),
            content: message.display_text().to_string(),
            owner: Some(message.owner.clone()),
            message_type: message.message_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelListItem {
    pub name: ChannelId,
    pub channel_name: String,
    #[serde(rename = "type", default)]
    pub channel_type: ChannelType,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_archived: bool,
    #[serde(default, with = "timestamp::option")]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "wire::summary")]
    pub last_message_details: Option<LastMessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, deserialize_with = "wire::flag")]
    pub pinned: bool,
    #[serde(default, deserialize_with = "wire::flag")]
    pub starred: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DmChannelListItem {
    pub name: ChannelId,
    pub peer_user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_archived: bool,
    #[serde(default, with = "timestamp::option")]
    pub last_message_timestamp: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "wire::summary")]
    pub last_message_details: Option<LastMessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, deserialize_with = "wire::flag")]
    pub pinned: bool,
    #[serde(default, deserialize_with = "wire::flag")]
    pub starred: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelListResponse {
    #[serde(default)]
    pub channels: Vec<ChannelListItem>,
    #[serde(default)]
    pub dm_channels: Vec<DmChannelListItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreadCount {
    pub name: ChannelId,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagePage {
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, deserialize_with = "wire::optional_flag")]
    pub has_old_messages: Option<bool>,
    #[serde(default, deserialize_with = "wire::optional_flag")]
    pub has_new_messages: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub name: MentionId,
    pub message_id: MessageId,
    pub channel_id: ChannelId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(with = "timestamp")]
    pub creation: DateTime<Utc>,
    pub owner: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_read: bool,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub name: UserId,
    #[serde(default)]
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_image: Option<String>,
    #[serde(rename = "type", default)]
    pub member_type: MemberType,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_admin: bool,
}

pub type ChannelMembersResponse = HashMap<UserId, Member>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageCreatedPayload {
    pub channel_id: ChannelId,
    pub message_details: Message,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEditedPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    pub message_details: MessagePatch,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageDeletedPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageReactedPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(deserialize_with = "wire::reactions")]
    pub reactions: Vec<Reaction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSavedPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(deserialize_with = "wire::user_list")]
    pub liked_by: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRetractedPayload {
    pub message_id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ChannelId>,
    #[serde(default, deserialize_with = "wire::flag")]
    pub is_last_message: bool,
}

/// Timestamps as the framework writes them (`2024-05-01 09:30:00.123456`,
/// implicitly UTC), with RFC 3339 accepted on input.
pub mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";
    const INPUT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
            return Some(parsed.with_timezone(&Utc));
        }
        INPUT_FORMATS
            .iter()
            .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
            .map(|naive| naive.and_utc())
    }

    pub fn format(value: &DateTime<Utc>) -> String {
        value.naive_utc().format(FORMAT).to_string()
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}")))
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{de, Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(value) => serializer.serialize_str(&super::format(value)),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                None => Ok(None),
                Some(raw) if raw.trim().is_empty() => Ok(None),
                Some(raw) => super::parse(&raw)
                    .map(Some)
                    .ok_or_else(|| de::Error::custom(format!("invalid timestamp: {raw}"))),
            }
        }
    }
}

/// Lenient decoders for the framework's loosely typed fields: 0/1 flags and
/// JSON documents stored as strings.
mod wire {
    use super::*;
    use serde::de::{self, DeserializeOwned};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum FlagWire {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    impl FlagWire {
        fn into_bool<E: de::Error>(self) -> Result<bool, E> {
            match self {
                Self::Bool(value) => Ok(value),
                Self::Int(value) => Ok(value != 0),
                Self::Text(value) => match value.as_str() {
                    "1" | "true" => Ok(true),
                    "0" | "false" | "" => Ok(false),
                    other => Err(E::custom(format!("invalid flag: {other}"))),
                },
            }
        }
    }

    pub fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Option::<FlagWire>::deserialize(deserializer)? {
            Some(raw) => raw.into_bool(),
            None => Ok(false),
        }
    }

    pub fn optional_flag<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<bool>, D::Error> {
        Option::<FlagWire>::deserialize(deserializer)?
            .map(FlagWire::into_bool)
            .transpose()
    }

    /// Either the value itself or a string holding its JSON encoding.
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum MaybeEncoded<T> {
        Encoded(String),
        Plain(T),
    }

    fn decode_maybe_encoded<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: DeserializeOwned,
    {
        match Option::<MaybeEncoded<T>>::deserialize(deserializer)? {
            None => Ok(None),
            Some(MaybeEncoded::Plain(value)) => Ok(Some(value)),
            Some(MaybeEncoded::Encoded(raw)) if raw.trim().is_empty() => Ok(None),
            Some(MaybeEncoded::Encoded(raw)) => serde_json::from_str::<Option<T>>(&raw)
                .map_err(|err| de::Error::custom(format!("invalid encoded field: {err}"))),
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ReactionsWire {
        List(Vec<Reaction>),
        Map(BTreeMap<String, Reaction>),
    }

    impl From<ReactionsWire> for Vec<Reaction> {
        fn from(value: ReactionsWire) -> Self {
            match value {
                ReactionsWire::List(list) => list,
                ReactionsWire::Map(map) => map.into_values().collect(),
            }
        }
    }

    pub fn reactions<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Reaction>, D::Error> {
        Ok(decode_maybe_encoded::<D, ReactionsWire>(deserializer)?
            .map(Vec::from)
            .unwrap_or_default())
    }

    pub fn optional_reactions<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<Reaction>>, D::Error> {
        Ok(decode_maybe_encoded::<D, ReactionsWire>(deserializer)?.map(Vec::from))
    }

    pub fn user_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<UserId>, D::Error> {
        Ok(decode_maybe_encoded::<D, Vec<UserId>>(deserializer)?.unwrap_or_default())
    }

    pub fn optional_user_list<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<UserId>>, D::Error> {
        decode_maybe_encoded::<D, Vec<UserId>>(deserializer)
    }

    pub fn summary<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<LastMessageSummary>, D::Error> {
        decode_maybe_encoded::<D, LastMessageSummary>(deserializer)
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
