use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Guild identifier
pub type GuildId = u64;

/// Voice channel identifier
pub type ChannelId = u64;

/// User identifier
pub type UserId = u64;

/// Connection settings for a single audio node
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Host name; also the key of the node in the registry
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub region: Option<String>,

    /// Shared secret sent in the `Authorization` header
    #[serde(default = "default_password")]
    pub password: String,

    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,

    /// Arm the reconnect timer as soon as the node is registered
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
}

impl NodeConfig {
    /// Create a config for `host` with every other field defaulted
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            region: None,
            password: default_password(),
            reconnect_interval_ms: default_reconnect_interval_ms(),
            auto_reconnect: true,
        }
    }

    /// WebSocket address of the node
    pub fn address(&self) -> String {
        format!("ws://{}:{}", self.host, self.port)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }
}

fn default_port() -> u16 {
    2333
}

fn default_password() -> String {
    "youshallnotpass".to_string()
}

fn default_reconnect_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

/// Manager-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// How long an unmatched session update is kept for a late join.
    /// Zero disables buffering.
    #[serde(default = "default_session_buffer_ttl_ms")]
    pub session_buffer_ttl_ms: u64,
}

impl ManagerConfig {
    pub fn session_buffer_ttl(&self) -> Duration {
        Duration::from_millis(self.session_buffer_ttl_ms)
    }
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            session_buffer_ttl_ms: default_session_buffer_ttl_ms(),
        }
    }
}

fn default_session_buffer_ttl_ms() -> u64 {
    10_000
}

/// Metadata of a resolved track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    #[serde(rename = "identifier")]
    pub id: String,
    pub title: String,
    pub author: String,
    #[serde(rename = "length")]
    pub duration_ms: u64,
    #[serde(default)]
    pub uri: Option<String>,
}

/// A track waiting in (or heading) a guild queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub requester_id: UserId,
    /// Replay this entry instead of advancing past it
    pub looping: bool,
    /// Opaque encoded track handle issued by the node
    pub track: String,
    pub info: TrackInfo,
}

impl QueueEntry {
    pub fn new(requester_id: UserId, track: impl Into<String>, info: TrackInfo) -> Self {
        Self {
            requester_id,
            looping: false,
            track: track.into(),
            info,
        }
    }
}

/// Node load snapshot reported by `stats` messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStats {
    #[serde(default)]
    pub players: u32,
    #[serde(default)]
    pub playing_players: u32,
    #[serde(default)]
    pub uptime: u64,
    #[serde(default)]
    pub memory: MemoryStats,
    #[serde(default)]
    pub cpu: CpuStats,
    #[serde(default)]
    pub frame_stats: Option<FrameStats>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    #[serde(default)]
    pub free: u64,
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub allocated: u64,
    #[serde(default)]
    pub reservable: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuStats {
    #[serde(default)]
    pub cores: u32,
    #[serde(default)]
    pub system_load: f64,
    #[serde(default)]
    pub lavalink_load: f64,
}

/// Audio frame counters over the last minute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameStats {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub nulled: i64,
    #[serde(default)]
    pub deficit: i64,
}

impl NodeStats {
    /// Load score used for node selection; lower is better
    ///
    /// Saturates at `i64::MAX` for absurd reports instead of overflowing.
    pub fn penalty(&self) -> i64 {
        let player_penalty = i64::from(self.playing_players);
        // Float to int casts saturate, so only the integer sums need care
        let cpu_penalty = (1.05f64.powf(100.0 * self.cpu.system_load) * 10.0 - 10.0) as i64;

        let frame_penalty = match &self.frame_stats {
            Some(frames) => {
                let deficit = (1.03f64.powf(500.0 * (frames.deficit as f64 / 3000.0)) * 600.0 - 600.0) as i64;
                let nulled = (1.03f64.powf(500.0 * (frames.nulled as f64 / 3000.0)) * 300.0 - 300.0) as i64;
                deficit.saturating_add(nulled.saturating_mul(2))
            }
            None => 0,
        };

        player_penalty
            .saturating_add(cpu_penalty)
            .saturating_add(frame_penalty)
    }
}

/// Playback state merged from `playerUpdate` messages
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerSnapshot {
    /// Node-side unix time of the update, in milliseconds
    #[serde(default)]
    pub time: Option<i64>,
    /// Track position in milliseconds
    #[serde(default)]
    pub position: Option<i64>,
    #[serde(default)]
    pub connected: Option<bool>,
    #[serde(default)]
    pub volume: Option<u16>,
}

impl PlayerSnapshot {
    /// Overwrite the fields present in `update`, keeping the rest
    pub fn merge(&mut self, update: PlayerSnapshot) {
        if update.time.is_some() {
            self.time = update.time;
        }
        if update.position.is_some() {
            self.position = update.position;
        }
        if update.connected.is_some() {
            self.connected = update.connected;
        }
        if update.volume.is_some() {
            self.volume = update.volume;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_defaults_fill_missing_fields() {
        let config: NodeConfig = serde_json::from_str(r#"{"host": "audio-1"}"#).unwrap();

        assert_eq!(config.port, 2333);
        assert_eq!(config.password, "youshallnotpass");
        assert_eq!(config.reconnect_interval(), Duration::from_secs(5));
        assert!(config.auto_reconnect);
        assert_eq!(config.address(), "ws://audio-1:2333");
    }

    #[test]
    fn snapshot_merge_keeps_absent_fields() {
        let mut snapshot = PlayerSnapshot {
            time: Some(1),
            position: Some(500),
            connected: Some(true),
            volume: Some(80),
        };

        snapshot.merge(PlayerSnapshot {
            position: Some(1500),
            ..Default::default()
        });

        assert_eq!(snapshot.time, Some(1));
        assert_eq!(snapshot.position, Some(1500));
        assert_eq!(snapshot.volume, Some(80));
    }

    #[test]
    fn idle_node_has_lower_penalty_than_busy_node() {
        let idle = NodeStats::default();
        let busy = NodeStats {
            playing_players: 40,
            cpu: CpuStats {
                cores: 4,
                system_load: 0.8,
                lavalink_load: 0.5,
            },
            ..Default::default()
        };

        assert!(idle.penalty() < busy.penalty());
    }

    #[test]
    fn garbage_stats_saturate_the_penalty() {
        let nulled: NodeStats =
            serde_json::from_str(r#"{"playingPlayers": 5, "frameStats": {"nulled": 1000000}}"#).unwrap();
        let overloaded: NodeStats =
            serde_json::from_str(r#"{"cpu": {"systemLoad": 1e12}, "frameStats": {"deficit": 9000000}}"#)
                .unwrap();

        assert_eq!(nulled.penalty(), i64::MAX);
        assert_eq!(overloaded.penalty(), i64::MAX);
        assert!(NodeStats::default().penalty() < nulled.penalty());
    }
}
