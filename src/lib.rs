//! Rust library for orchestrating Lavalink audio nodes and per-guild players
//!
//! This library keeps persistent WebSocket connections to one or more
//! Lavalink nodes and drives a player per guild on top of them. It supports:
//!
//! - Node connections with identity headers and periodic reconnect
//! - Load-based node selection from cached stats reports
//! - Per-guild players: play, stop, pause, seek, volume, queue bookkeeping
//! - Two-phase voice joins correlated with gateway session updates
//! - Typed signal subscriptions for node lifecycle and player events
//!
//! Decoding, streaming, the gateway protocol, and track search stay outside:
//! the gateway is consumed through the [`Gateway`] trait and track search
//! through [`TrackSearch`].
//!
//! # Quick Start
//!
//! ```no_run
//! use lavaplay::{ClientContext, ClientIdentity, Gateway, JoinOptions, ManagerConfig,
//!     NodeConfig, PlayerEvent, PlayerManager};
//! use std::sync::Arc;
//!
//! # async fn run(gateway: Arc<dyn Gateway>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = PlayerManager::new(
//!     ClientContext {
//!         identity: ClientIdentity { user_id: 1234, shard_count: 1 },
//!         gateway,
//!     },
//!     ManagerConfig::default(),
//! );
//!
//! manager.create_node(NodeConfig::new("localhost")).await?;
//!
//! // Request to join; audio flows once the gateway's voice server update
//! // is passed to `handle_voice_server_update`
//! let player = manager.join(JoinOptions::new("localhost", 1, 2).deafen(true)).await?;
//! let mut events = player.subscribe();
//!
//! player.play("QAAAjQIAJVJpY2sg")?;
//!
//! while let Ok(event) = events.recv().await {
//!     if let PlayerEvent::End(_) = event {
//!         break;
//!     }
//! }
//!
//! manager.leave(1).await;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! - **Manager**: guild → player map, node registry, session correlation
//! - **Player**: per-guild playback state machine and queue
//! - **Registry**: node connections keyed by host
//! - **Connection**: WebSocket lifecycle, send ordering, reconnect timer
//! - **Protocol**: JSON messages exchanged with nodes
//! - **Types**: configuration and domain data

mod connection;
mod error;
mod gateway;
mod manager;
mod player;
mod protocol;
mod registry;
mod search;
mod subscription;
mod types;

// Public exports
pub use connection::{ClientIdentity, ConnectionStatus, NodeConnection};
pub use error::{LinkError, Result};
pub use gateway::{Gateway, SessionUpdate, VoiceChannelInfo, VoiceStateUpdate};
pub use manager::{ClientContext, JoinOptions, PlayerManager};
pub use player::{GuildPlayer, PlayOptions, PlayerState, PlayerStatus, DEFAULT_VOLUME, MAX_VOLUME, SAFE_VOLUME};
pub use protocol::{IncomingMessage, OutgoingMessage, TrackEvent, TrackEventKind};
pub use registry::NodeRegistry;
pub use search::{LoadedTrack, TrackSearch};
pub use subscription::{NodeReceiver, NodeSignal, PlayerEvent, PlayerReceiver, SignalReceiver};
pub use types::{
    ChannelId, CpuStats, FrameStats, GuildId, ManagerConfig, MemoryStats, NodeConfig, NodeStats,
    PlayerSnapshot, QueueEntry, TrackInfo, UserId,
};
