use crate::error::Result;
use crate::types::{ChannelId, GuildId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Voice state update sent to the gateway (opcode 4)
///
/// `channel_id: None` leaves the current voice channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceStateUpdate {
    pub guild_id: GuildId,
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

impl VoiceStateUpdate {
    pub fn join(guild_id: GuildId, channel_id: ChannelId, self_mute: bool, self_deaf: bool) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_mute,
            self_deaf,
        }
    }

    pub fn leave(guild_id: GuildId) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }

    /// Gateway payload for this update
    pub fn to_payload(&self) -> Value {
        serde_json::json!({
            "op": 4,
            "d": {
                "guild_id": self.guild_id.to_string(),
                "channel_id": self.channel_id.map(|id| id.to_string()),
                "self_mute": self.self_mute,
                "self_deaf": self.self_deaf,
            }
        })
    }
}

/// What the gateway knows about a channel, from the bot's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceChannelInfo {
    /// Whether the channel is a voice channel at all
    pub is_voice: bool,
    pub can_connect: bool,
    pub can_speak: bool,
}

/// Voice session data correlated with a guild player
#[derive(Debug, Clone, PartialEq)]
pub struct SessionUpdate {
    pub guild_id: GuildId,
    pub session_id: String,
    /// Raw voice server update payload forwarded to the node
    pub event: Value,
}

/// Real-time gateway client, as consumed by the player manager
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Send a voice state update for a guild
    async fn send_voice_state_update(&self, update: VoiceStateUpdate) -> Result<()>;

    /// Look up a channel in a guild; `None` if either does not exist
    async fn voice_channel(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Option<VoiceChannelInfo>>;

    /// The bot's current voice session id in a guild, if any
    async fn voice_session_id(&self, guild_id: GuildId) -> Option<String>;
}
