use crate::types::{GuildId, NodeStats, PlayerSnapshot};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Track end reason that means another track took over the slot
pub const REASON_REPLACED: &str = "REPLACED";

/// Directive sent to a node
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum OutgoingMessage {
    #[serde(rename_all = "camelCase")]
    VoiceUpdate {
        guild_id: String,
        session_id: String,
        event: Value,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        guild_id: String,
        track: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        start_time: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        end_time: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Stop { guild_id: String },
    #[serde(rename_all = "camelCase")]
    Pause { guild_id: String, pause: bool },
    #[serde(rename_all = "camelCase")]
    Seek { guild_id: String, position: i64 },
    #[serde(rename_all = "camelCase")]
    Volume { guild_id: String, volume: u16 },
    #[serde(rename_all = "camelCase")]
    Destroy { guild_id: String },
}

impl OutgoingMessage {
    /// Operation name as it appears on the wire
    pub fn op(&self) -> &'static str {
        match self {
            OutgoingMessage::VoiceUpdate { .. } => "voiceUpdate",
            OutgoingMessage::Play { .. } => "play",
            OutgoingMessage::Stop { .. } => "stop",
            OutgoingMessage::Pause { .. } => "pause",
            OutgoingMessage::Seek { .. } => "seek",
            OutgoingMessage::Volume { .. } => "volume",
            OutgoingMessage::Destroy { .. } => "destroy",
        }
    }
}

/// Playback event reported by a node for one guild
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackEvent {
    #[serde(skip)]
    pub guild_id: GuildId,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub exception: Option<Value>,
    #[serde(default)]
    pub threshold_ms: Option<u64>,
}

/// Known track event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEventKind {
    TrackEnd,
    TrackException,
    TrackStuck,
    Unknown,
}

impl TrackEvent {
    pub fn kind(&self) -> TrackEventKind {
        match self.event_type.as_str() {
            "TrackEndEvent" => TrackEventKind::TrackEnd,
            "TrackExceptionEvent" => TrackEventKind::TrackException,
            "TrackStuckEvent" => TrackEventKind::TrackStuck,
            _ => TrackEventKind::Unknown,
        }
    }

    /// Whether the track ended because another one replaced it
    pub fn is_replaced(&self) -> bool {
        self.reason.as_deref() == Some(REASON_REPLACED)
    }
}

/// Message received from a node
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Stats(NodeStats),
    PlayerUpdate {
        guild_id: GuildId,
        state: PlayerSnapshot,
    },
    Event(TrackEvent),
}

impl IncomingMessage {
    /// Decode a parsed frame.
    ///
    /// Returns `None` for frames without a recognizable `op`, frames of a
    /// guild-scoped op without a usable `guildId`, and malformed bodies.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value.get("op").and_then(|v| v.as_str())? {
            "stats" => serde_json::from_value(value.clone())
                .ok()
                .map(IncomingMessage::Stats),
            "playerUpdate" => {
                let guild_id = guild_id_of(value)?;
                let state = value
                    .get("state")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                Some(IncomingMessage::PlayerUpdate { guild_id, state })
            }
            "event" => {
                let guild_id = guild_id_of(value)?;
                let mut event: TrackEvent = serde_json::from_value(value.clone()).ok()?;
                event.guild_id = guild_id;
                Some(IncomingMessage::Event(event))
            }
            _ => None,
        }
    }
}

/// Extract `guildId`, which nodes send as a string but may send as a number
pub fn guild_id_of(value: &Value) -> Option<GuildId> {
    match value.get("guildId")? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
