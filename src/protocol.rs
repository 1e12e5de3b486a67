use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Result;

/// Session correlation header
pub const HEADER_SESSION_ID: &str = "X-ProxyManager-SessionId";
/// Strictly increasing per-connection request counter, echoed by the server
pub const HEADER_REQUEST_INDEX: &str = "X-ProxyManager-RequestIndex";
/// Base64 SHA-256 of the body
pub const HEADER_DIGEST: &str = "X-ProxyManager-Digest";

/// Outbound special values are sent as strings wrapped in these markers
pub const SERVER_OBJECTS_PREFIX: &str = "[__QOOXDOO_SERVER_OBJECTS__[";
pub const SERVER_OBJECTS_SUFFIX: &str = "]]";

/// Target of a `call`: an object id, or a class name for static methods
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CallTarget {
    Object(i64),
    Class(String),
}

/// Commands sent from the client, one JSON object each, keyed by `cmd`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum OutboundCommand {
    #[serde(rename_all = "camelCase")]
    Bootstrap { async_id: u64 },
    #[serde(rename_all = "camelCase")]
    Call {
        server_id: CallTarget,
        method_name: String,
        async_id: u64,
        parameters: Vec<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Set {
        server_id: i64,
        property_name: String,
        value: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    EditArray {
        server_id: i64,
        property_name: String,
        #[serde(rename = "type")]
        kind: String,
        removed: Vec<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        added: Option<Vec<serde_json::Value>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        array: Option<Vec<serde_json::Value>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        put: Option<serde_json::Map<String, serde_json::Value>>,
    },
    #[serde(rename_all = "camelCase")]
    Listen { server_id: i64, event_name: String },
    #[serde(rename_all = "camelCase")]
    Unlisten { server_id: i64, event_name: String },
    #[serde(rename_all = "camelCase")]
    Dispose { server_ids: Vec<i64> },
    #[serde(rename_all = "camelCase")]
    New {
        class_name: String,
        client_id: i64,
        properties: serde_json::Map<String, serde_json::Value>,
    },
    Poll,
    #[serde(rename_all = "camelCase")]
    Expire { server_id: i64, property_name: String },
}

impl OutboundCommand {
    /// `edit-array` for a wrapped list; `array` is the full current content
    pub fn edit_list(
        server_id: i64,
        property_name: impl Into<String>,
        removed: Vec<serde_json::Value>,
        added: Vec<serde_json::Value>,
        array: Vec<serde_json::Value>,
    ) -> Self {
        OutboundCommand::EditArray {
            server_id,
            property_name: property_name.into(),
            kind: "update".to_string(),
            removed,
            added: Some(added),
            array: Some(array),
            put: None,
        }
    }

    /// `edit-array` for a wrapped map; `put` is keyed by entry position
    pub fn edit_map(
        server_id: i64,
        property_name: impl Into<String>,
        removed: Vec<serde_json::Value>,
        put: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        OutboundCommand::EditArray {
            server_id,
            property_name: property_name.into(),
            kind: "update".to_string(),
            removed,
            added: None,
            array: None,
            put: Some(put),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutboundCommand::Bootstrap { .. } => "bootstrap",
            OutboundCommand::Call { .. } => "call",
            OutboundCommand::Set { .. } => "set",
            OutboundCommand::EditArray { .. } => "edit-array",
            OutboundCommand::Listen { .. } => "listen",
            OutboundCommand::Unlisten { .. } => "unlisten",
            OutboundCommand::Dispose { .. } => "dispose",
            OutboundCommand::New { .. } => "new",
            OutboundCommand::Poll => "poll",
            OutboundCommand::Expire { .. } => "expire",
        }
    }

    /// Async id carried by `call` and `bootstrap`
    pub fn async_id(&self) -> Option<u64> {
        match self {
            OutboundCommand::Call { async_id, .. } | OutboundCommand::Bootstrap { async_id } => Some(*async_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InboundKind {
    Bootstrap,
    Return,
    Exception,
    #[serde(rename = "mapClientId")]
    MapClientId,
    Restore,
    Set,
    Expire,
    EditArray,
    Define,
    Fire,
    LoadType,
    #[serde(other)]
    Unknown,
}

/// One command of a response, applied in the order the server listed it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundCommand {
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default)]
    pub object: serde_json::Value,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl InboundCommand {
    /// Parses `data` into the typed payload of this command
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapData {
    #[serde(default)]
    pub async_id: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub bootstrap: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnData {
    pub async_id: u64,
    #[serde(default)]
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionData {
    #[serde(default)]
    pub exception_class: Option<String>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub async_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MapClientIdData {
    pub client_id: i64,
    pub server_id: i64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreData {
    #[serde(default)]
    pub old_value: serde_json::Value,
    #[serde(default)]
    pub exception_class: Option<String>,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MapEntryData {
    #[serde(default)]
    pub key: serde_json::Value,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct EditArrayData {
    pub removed: Vec<serde_json::Value>,
    pub added: Vec<serde_json::Value>,
    pub put: Vec<MapEntryData>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> From<OneOrMany<T>> for Vec<T> {
    fn from(value: OneOrMany<T>) -> Self {
        match value {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

/// Edit-array payloads arrive as a list of deltas, occasionally as a single one.
pub fn parse_edit_array_data(data: &serde_json::Value) -> Result<Vec<EditArrayData>> {
    if data.is_null() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany<EditArrayData> = OneOrMany::deserialize(data)?;
    Ok(parsed.into())
}

pub fn encode_request_body(commands: &[OutboundCommand]) -> Result<String> {
    serde_json::to_string(commands).map_err(|e| crate::Error::Encode(e.to_string()))
}

/// An empty body is a valid response with no commands.
pub fn decode_response_body(content: &str) -> Result<Vec<InboundCommand>> {
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: OneOrMany<InboundCommand> = serde_json::from_str(content)?;
    Ok(parsed.into())
}

pub fn digest(body: &str) -> String {
    general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()))
}

pub fn verify_digest(body: &str, expected: &str) -> bool {
    digest(body) == expected.trim()
}

/// Header list with case-insensitive lookup. Names keep the case they were
/// inserted with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `name`, replacing any existing value regardless of case
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| n.eq_ignore_ascii_case(&name)) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.0.iter().position(|(n, _)| n.eq_ignore_ascii_case(name))?;
        Some(self.0.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}
