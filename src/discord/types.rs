//! Discord wire types for the slice of the v10 API this bot touches.
//!
//! Snowflake ids travel as decimal strings on the wire but are `u64` here so
//! ordering (creation order) is a plain integer compare.

use serde::{Deserialize, Serialize};

/// Serde adapter for string-encoded snowflake ids.
pub mod id_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional string-encoded snowflake ids.
pub mod opt_id_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Option<u64>, serializer: S) -> Result<S::Ok, S::Error> {
        match id {
            Some(id) => serializer.serialize_some(&id.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<u64>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

// Message kinds the bot reacts to.
pub const MESSAGE_KIND_DEFAULT: u8 = 0;
pub const MESSAGE_KIND_REPLY: u8 = 19;

/// Flag bit set on a message that has a thread attached.
pub const MESSAGE_FLAG_HAS_THREAD: u64 = 1 << 5;

// Channel kinds.
pub const CHANNEL_GUILD_TEXT: u8 = 0;
pub const CHANNEL_DM: u8 = 1;
pub const CHANNEL_GUILD_PUBLIC_THREAD: u8 = 11;
pub const CHANNEL_GUILD_PRIVATE_THREAD: u8 = 12;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(with = "id_string")]
    pub id: u64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub bot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(with = "id_string")]
    pub id: u64,
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageReference {
    #[serde(default, with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<u64>,
}

/// A message as delivered by the gateway or the REST API. Update events can
/// be partial, hence the defaulted fields and the optional author.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(with = "id_string")]
    pub id: u64,
    #[serde(with = "id_string")]
    pub channel_id: u64,
    #[serde(default, with = "opt_id_string", skip_serializing_if = "Option::is_none")]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub author: Option<User>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub mentions: Vec<User>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default, rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub flags: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_reference: Option<MessageReference>,
}

impl Message {
    /// True if a thread hangs off this message; replies then go into the
    /// thread channel, whose id equals this message's id.
    pub fn has_thread(&self) -> bool {
        self.flags & MESSAGE_FLAG_HAS_THREAD != 0
    }

    /// True if `user_id` appears in the resolved mention list.
    pub fn mentions_user(&self, user_id: u64) -> bool {
        self.mentions.iter().any(|m| m.id == user_id)
    }
}

/// Payload of a `MESSAGE_DELETE` dispatch; only the ids survive deletion.
#[derive(Debug, Clone, Deserialize)]
pub struct DeletedMessage {
    #[serde(with = "id_string")]
    pub id: u64,
    #[serde(with = "id_string")]
    pub channel_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    #[serde(with = "id_string")]
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnavailableGuild {
    #[serde(with = "id_string")]
    pub id: u64,
}

/// Payload of the `READY` dispatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub user: User,
    #[serde(default)]
    pub guilds: Vec<UnavailableGuild>,
}

/// A file to upload alongside a message.
#[derive(Debug, Clone)]
pub struct FileUpload {
    pub name: String,
    pub bytes: Vec<u8>,
}
