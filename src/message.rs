use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Separator between an entity name and its tribe in a message `id`.
pub const ADDRESS_SEPARATOR: char = '@';

/// Message carried by every command on the bus
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default)]
    pub cmd: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub orc_name: String,
    #[serde(default)]
    pub is_nested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_router: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forwarding: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    /// Build a fresh message for `cmd`, stamped with the current time.
    pub fn new(cmd: impl Into<String>, data: Value) -> Self {
        Self {
            cmd: cmd.into(),
            data,
            timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_orc_name(mut self, orc_name: impl Into<String>) -> Self {
        self.orc_name = orc_name.into();
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn nested(mut self) -> Self {
        self.is_nested = true;
        self
    }

    /// Tribe addressed by this message, if its id carries one.
    pub fn tribe(&self) -> Option<&str> {
        self.id.as_deref().and_then(tribe_of)
    }
}

/// Frame delivered by the command socket: a command name plus its message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub cmd: String,
    pub msg: Message,
}

impl Envelope {
    pub fn new(cmd: impl Into<String>, msg: Message) -> Self {
        Self {
            cmd: cmd.into(),
            msg,
        }
    }
}

/// Extract the tribe from an `name@tribe` id.
pub fn tribe_of(id: &str) -> Option<&str> {
    id.rsplit_once(ADDRESS_SEPARATOR)
        .map(|(_, tribe)| tribe)
        .filter(|tribe| !tribe.is_empty())
}

/// Parse one inbound command frame
pub fn parse_envelope(payload: &[u8]) -> Result<Envelope, serde_json::Error> {
    serde_json::from_slice(payload)
}
