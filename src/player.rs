use crate::connection::NodeConnection;
use crate::error::{LinkError, Result};
use crate::protocol::{OutgoingMessage, TrackEvent, TrackEventKind};
use crate::subscription::{PlayerEvent, PlayerReceiver, SignalReceiver};
use crate::types::{ChannelId, GuildId, PlayerSnapshot, QueueEntry};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;
use tokio::sync::broadcast;

/// Default player volume, in percent
pub const DEFAULT_VOLUME: u16 = 100;

/// Volume ceiling without the `force` override
pub const SAFE_VOLUME: u16 = 100;

/// Hard volume ceiling
pub const MAX_VOLUME: u16 = 1000;

const EVENT_CAPACITY: usize = 64;

/// Coarse lifecycle state derived from the player flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Playing,
    Paused,
    Destroyed,
}

/// Optional bounds for [`GuildPlayer::play_with`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PlayOptions {
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
}

/// Player state snapshot
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,

    // Play order; the head is the only entry eligible for playback
    pub queue: Vec<QueueEntry>,

    pub current_track: Option<String>,
    pub playing: bool,
    pub paused: bool,
    pub volume: u16,
    pub started_at: Option<SystemTime>,

    // Last state reported by the node
    pub snapshot: PlayerSnapshot,

    pub destroyed: bool,
}

struct PlayerInner {
    state: Mutex<PlayerState>,
    events: Mutex<Option<broadcast::Sender<PlayerEvent>>>,
}

/// Playback controller for one guild
///
/// A `GuildPlayer` is bound to one voice channel and one node connection.
/// Cloning yields another handle to the same player. Directives are sent
/// through the bound node; if it is not open they fail with
/// [`LinkError::NodeUnavailable`] and, except for `stop` and `destroy`,
/// leave the local state untouched.
#[derive(Clone)]
pub struct GuildPlayer {
    node: NodeConnection,
    inner: Arc<PlayerInner>,
}

impl GuildPlayer {
    pub(crate) fn new(guild_id: GuildId, channel_id: ChannelId, node: NodeConnection) -> Self {
        Self {
            node,
            inner: Arc::new(PlayerInner {
                state: Mutex::new(PlayerState {
                    guild_id,
                    channel_id,
                    queue: Vec::new(),
                    current_track: None,
                    playing: false,
                    paused: false,
                    volume: DEFAULT_VOLUME,
                    started_at: None,
                    snapshot: PlayerSnapshot::default(),
                    destroyed: false,
                }),
                events: Mutex::new(None),
            }),
        }
    }

    pub fn guild_id(&self) -> GuildId {
        self.lock_state().guild_id
    }

    pub fn channel_id(&self) -> ChannelId {
        self.lock_state().channel_id
    }

    /// Host of the bound node
    pub fn node_host(&self) -> &str {
        self.node.host()
    }

    pub fn node(&self) -> &NodeConnection {
        &self.node
    }

    pub fn current_track(&self) -> Option<String> {
        self.lock_state().current_track.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.lock_state().playing
    }

    pub fn is_paused(&self) -> bool {
        self.lock_state().paused
    }

    pub fn volume(&self) -> u16 {
        self.lock_state().volume
    }

    pub fn started_at(&self) -> Option<SystemTime> {
        self.lock_state().started_at
    }

    /// Last playback state reported by the node
    pub fn last_update(&self) -> PlayerSnapshot {
        self.lock_state().snapshot.clone()
    }

    /// Get a consistent copy of the whole player state
    pub fn state_snapshot(&self) -> PlayerState {
        self.lock_state().clone()
    }

    pub fn status(&self) -> PlayerStatus {
        let state = self.lock_state();
        if state.destroyed {
            PlayerStatus::Destroyed
        } else if state.current_track.is_none() {
            PlayerStatus::Idle
        } else if state.paused {
            PlayerStatus::Paused
        } else {
            PlayerStatus::Playing
        }
    }

    /// Whether two handles refer to the same player
    pub fn ptr_eq(&self, other: &GuildPlayer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ========== Events ==========

    /// Subscribe to domain events of this player
    pub fn subscribe(&self) -> PlayerReceiver {
        let mut events = self.lock_events();
        let tx = events.get_or_insert_with(|| broadcast::channel(EVENT_CAPACITY).0);
        SignalReceiver::new(tx.subscribe())
    }

    pub fn has_listeners(&self) -> bool {
        self.lock_events()
            .as_ref()
            .is_some_and(|tx| tx.receiver_count() > 0)
    }

    /// Close every receiver obtained from [`subscribe`](Self::subscribe)
    pub fn remove_listeners(&self) {
        self.lock_events().take();
    }

    // ========== Voice ==========

    /// Hand the voice session to the node so it can start streaming
    pub fn connect(&self, session_id: &str, event: serde_json::Value) -> Result<()> {
        let guild_id = self.ensure_alive()?;

        self.dispatch(OutgoingMessage::VoiceUpdate {
            guild_id: guild_id.to_string(),
            session_id: session_id.to_string(),
            event,
        })
    }

    // ========== Playback ==========

    /// Play a track, replacing the current one
    pub fn play(&self, track: &str) -> Result<()> {
        self.play_with(track, PlayOptions::default())
    }

    /// Play a track between optional start and end positions
    pub fn play_with(&self, track: &str, options: PlayOptions) -> Result<()> {
        if track.trim().is_empty() {
            return Err(LinkError::InvalidArgument("track token must not be empty".to_string()));
        }
        let guild_id = self.ensure_alive()?;

        self.dispatch(OutgoingMessage::Play {
            guild_id: guild_id.to_string(),
            track: track.to_string(),
            start_time: options.start_time_ms,
            end_time: options.end_time_ms,
        })?;

        let mut state = self.lock_state();
        state.current_track = Some(track.to_string());
        state.playing = true;
        state.started_at = Some(SystemTime::now());
        Ok(())
    }

    /// Stop the current track
    ///
    /// The local state is cleared even if the node could not be reached.
    pub fn stop(&self) -> Result<()> {
        let guild_id = self.ensure_alive()?;

        let sent = self.dispatch(OutgoingMessage::Stop {
            guild_id: guild_id.to_string(),
        });

        let mut state = self.lock_state();
        state.current_track = None;
        state.playing = false;
        sent
    }

    /// Stop playback and tell listeners why the player went away
    ///
    /// `Disconnect` is emitted even if the stop could not reach the node.
    pub fn disconnect(&self, reason: &str) -> Result<()> {
        self.ensure_alive()?;

        let stopped = self.stop();
        self.emit(PlayerEvent::Disconnect(reason.to_string()));
        stopped
    }

    /// Pause (`true`) or resume (`false`) playback
    pub fn pause(&self, pause: bool) -> Result<()> {
        let guild_id = self.ensure_alive()?;

        self.dispatch(OutgoingMessage::Pause {
            guild_id: guild_id.to_string(),
            pause,
        })?;

        let mut state = self.lock_state();
        state.paused = pause;
        state.playing = !pause;
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.pause(false)
    }

    /// Stop the current track; the node's end event advances the queue
    pub fn skip(&self) -> Result<()> {
        self.stop()
    }

    /// Seek the current track to `position_ms`
    pub fn seek(&self, position_ms: i64) -> Result<()> {
        if position_ms < 0 {
            return Err(LinkError::InvalidArgument(format!(
                "seek position must not be negative, got {}",
                position_ms
            )));
        }
        let guild_id = self.ensure_alive()?;

        self.dispatch(OutgoingMessage::Seek {
            guild_id: guild_id.to_string(),
            position: position_ms,
        })
    }

    /// Set the volume in percent
    ///
    /// Values above 100 require `force`; 1000 is the hard ceiling.
    pub fn set_volume(&self, volume: i64, force: bool) -> Result<()> {
        if !(0..=i64::from(MAX_VOLUME)).contains(&volume) {
            return Err(LinkError::InvalidArgument(format!(
                "volume must be between 0 and {}, got {}",
                MAX_VOLUME, volume
            )));
        }
        if volume > i64::from(SAFE_VOLUME) && !force {
            return Err(LinkError::PolicyViolation(format!(
                "volume {} is above {} and needs force",
                volume, SAFE_VOLUME
            )));
        }
        let guild_id = self.ensure_alive()?;
        let volume = volume as u16;

        self.dispatch(OutgoingMessage::Volume {
            guild_id: guild_id.to_string(),
            volume,
        })?;

        self.lock_state().volume = volume;
        Ok(())
    }

    /// Tell the node to drop this player; the handle is unusable afterwards
    pub fn destroy(&self) -> Result<()> {
        let guild_id = self.ensure_alive()?;

        let sent = self.dispatch(OutgoingMessage::Destroy {
            guild_id: guild_id.to_string(),
        });

        let mut state = self.lock_state();
        state.destroyed = true;
        state.current_track = None;
        state.playing = false;
        state.paused = false;
        tracing::debug!("Destroyed player for guild {}", guild_id);
        sent
    }

    // ========== Node events ==========

    /// Translate a node event into a domain event
    pub fn handle_node_event(&self, event: TrackEvent) {
        if self.lock_state().destroyed {
            tracing::debug!("Ignoring {} for destroyed player", event.event_type);
            return;
        }

        match event.kind() {
            TrackEventKind::TrackEnd => {
                if !event.is_replaced() {
                    let mut state = self.lock_state();
                    state.current_track = None;
                    state.playing = false;
                }
                self.emit(PlayerEvent::End(event));
            }
            TrackEventKind::TrackException => {
                if self.has_listeners() {
                    self.emit(PlayerEvent::Error(event));
                } else {
                    tracing::debug!(
                        "Dropping track exception for guild {}: no listener",
                        event.guild_id
                    );
                }
            }
            TrackEventKind::TrackStuck => {
                if let Err(e) = self.stop() {
                    tracing::warn!("Failed to stop stuck track for guild {}: {}", event.guild_id, e);
                }
                self.emit(PlayerEvent::End(event));
            }
            TrackEventKind::Unknown => {
                tracing::warn!("Unknown player event: {}", event.event_type);
                self.emit(PlayerEvent::Warning(format!(
                    "Unknown player event: {}",
                    event.event_type
                )));
            }
        }
    }

    /// Merge a `playerUpdate` state into the player
    pub fn apply_update(&self, update: PlayerSnapshot) {
        let mut state = self.lock_state();
        if let Some(volume) = update.volume {
            state.volume = volume.min(MAX_VOLUME);
        }
        state.snapshot.merge(update);
    }

    // ========== Queue ==========

    /// Append an entry; returns its position in the queue
    pub fn enqueue(&self, entry: QueueEntry) -> usize {
        let mut state = self.lock_state();
        state.queue.push(entry);
        state.queue.len() - 1
    }

    pub fn queue(&self) -> Vec<QueueEntry> {
        self.lock_state().queue.clone()
    }

    pub fn queue_len(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// The head of the queue
    pub fn now_playing(&self) -> Option<QueueEntry> {
        self.lock_state().queue.first().cloned()
    }

    /// Drop the head unless it loops; returns the new head
    pub fn advance(&self) -> Option<QueueEntry> {
        let mut state = self.lock_state();
        if state.queue.first().is_some_and(|head| !head.looping) {
            state.queue.remove(0);
        }
        state.queue.first().cloned()
    }

    /// Toggle looping of the entry at `index`
    pub fn set_loop(&self, index: usize, looping: bool) -> Result<()> {
        let mut state = self.lock_state();
        let len = state.queue.len();
        let entry = state.queue.get_mut(index).ok_or_else(|| {
            LinkError::InvalidArgument(format!("queue index {} out of range ({} entries)", index, len))
        })?;
        entry.looping = looping;
        Ok(())
    }

    pub fn clear_queue(&self) {
        self.lock_state().queue.clear();
    }

    fn ensure_alive(&self) -> Result<GuildId> {
        let state = self.lock_state();
        if state.destroyed {
            return Err(LinkError::PlayerDestroyed(state.guild_id));
        }
        Ok(state.guild_id)
    }

    fn dispatch(&self, message: OutgoingMessage) -> Result<()> {
        if self.node.send(&message) {
            Ok(())
        } else {
            Err(LinkError::NodeUnavailable(self.node.host().to_string()))
        }
    }

    fn emit(&self, event: PlayerEvent) {
        if let Some(tx) = self.lock_events().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PlayerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_events(&self) -> MutexGuard<'_, Option<broadcast::Sender<PlayerEvent>>> {
        self.inner.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
