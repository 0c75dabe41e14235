use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::net::SocketAddrV4;
use time::OffsetDateTime;

use crate::session::SessionError;

/// Status document a server returns to a Server List Ping.
///
/// Besides the vanilla fields this also keeps the flags and mod-loader metadata that
/// popular server modifications add to the response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    #[serde(default)]
    pub version: VersionInfo,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub players: Option<PlayersInfo>,
    #[serde(default, deserialize_with = "deserialize_description")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favicon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enforces_secure_chat: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previews_chat: Option<bool>,

    // No Chat Reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prevents_chat_reports: Option<bool>,
    // Forge 1.13+
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forge_data: Option<ForgeData>,
    // Forge before 1.13
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modinfo: Option<ModInfo>,
    // NeoForge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_modded: Option<bool>,
    // Better Compatibility Checker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modpack_data: Option<ModpackData>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub protocol: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayersInfo {
    #[serde(default)]
    pub max: i64,
    #[serde(default)]
    pub online: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample: Option<Vec<SamplePlayer>>,
}

/// One entry of the player sample. Both fields are kept as sent; the id is
/// validated by the classifier rather than at parse time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct SamplePlayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ForgeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fml_network_version: Option<i64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct ModInfo {
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModpackData {
    #[serde(rename = "projectID", default)]
    pub project_id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Accepts either a plain string or a chat component (`text` plus nested `extra`).
fn deserialize_description<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let mut out = String::new();
    flatten_chat(&value, &mut out);
    Ok(out)
}

fn flatten_chat(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => out.push_str(s),
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                out.push_str(text);
            }
            if let Some(Value::Array(extra)) = map.get("extra") {
                for part in extra {
                    flatten_chat(part, out);
                }
            }
        }
        Value::Array(parts) => {
            for part in parts {
                flatten_chat(part, out);
            }
        }
        _ => {}
    }
}

/// Whether a server authenticates players against the central account service.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OnlineMode {
    Online,
    Offline,
    #[default]
    Unknown,
}

impl OnlineMode {
    /// Fold in one piece of evidence. Online is sticky; offline only replaces unknown.
    pub fn merge(self, evidence: OnlineMode) -> OnlineMode {
        match (self, evidence) {
            (OnlineMode::Online, _) | (_, OnlineMode::Online) => OnlineMode::Online,
            (OnlineMode::Unknown, OnlineMode::Offline) => OnlineMode::Offline,
            (current, _) => current,
        }
    }
}

/// A status response after classification; the record handed to persistence.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedResult {
    #[serde(flatten)]
    pub status: ServerStatus,
    pub addr: SocketAddrV4,
    #[serde(with = "time::serde::timestamp")]
    pub time: OffsetDateTime,
    /// Takes precedence over `is_online_mode` when set.
    pub is_fake_sample: bool,
    pub is_online_mode: OnlineMode,
}

/// A failed probe that was not filtered out as expected noise.
#[derive(Debug)]
pub struct ScanError {
    pub addr: SocketAddrV4,
    pub error: SessionError,
}
