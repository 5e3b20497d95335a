use crate::connection::{ClientIdentity, NodeConnection};
use crate::error::{LinkError, Result};
use crate::gateway::{Gateway, SessionUpdate, VoiceStateUpdate};
use crate::player::GuildPlayer;
use crate::protocol::IncomingMessage;
use crate::registry::NodeRegistry;
use crate::subscription::NodeSignal;
use crate::types::{ChannelId, GuildId, ManagerConfig, NodeConfig};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Application context handed to the manager at startup
#[derive(Clone)]
pub struct ClientContext {
    pub identity: ClientIdentity,
    pub gateway: Arc<dyn Gateway>,
}

/// Parameters of [`PlayerManager::join`]
#[derive(Debug, Clone)]
pub struct JoinOptions {
    /// Host of the node the player is bound to
    pub host: String,
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub muted: bool,
    pub deafen: bool,
}

impl JoinOptions {
    pub fn new(host: impl Into<String>, guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self {
            host: host.into(),
            guild_id,
            channel_id,
            muted: false,
            deafen: false,
        }
    }

    pub fn muted(mut self, muted: bool) -> Self {
        self.muted = muted;
        self
    }

    pub fn deafen(mut self, deafen: bool) -> Self {
        self.deafen = deafen;
        self
    }
}

/// A session update waiting for its player or for its player's node
struct PendingSession {
    update: SessionUpdate,
    received_at: Instant,
}

/// Joins that have started talking to the gateway but not registered yet
///
/// Concurrent joins for one guild share a token. A leave removes the
/// guild's entry, which cancels every join holding the old token. Entries
/// of joins that failed validation linger until the next join or leave.
#[derive(Default)]
struct PendingJoins {
    next_token: u64,
    in_flight: HashMap<GuildId, u64>,
}

impl PendingJoins {
    fn begin(&mut self, guild_id: GuildId) -> u64 {
        let next_token = &mut self.next_token;
        *self.in_flight.entry(guild_id).or_insert_with(|| {
            *next_token += 1;
            *next_token
        })
    }

    fn is_current(&self, guild_id: GuildId, token: u64) -> bool {
        self.in_flight.get(&guild_id) == Some(&token)
    }
}

// Locks nest in field order: players, joins, pending_sessions
struct ManagerInner {
    context: ClientContext,
    config: ManagerConfig,
    nodes: Mutex<NodeRegistry>,
    players: Mutex<HashMap<GuildId, GuildPlayer>>,
    joins: Mutex<PendingJoins>,
    pending_sessions: Mutex<HashMap<GuildId, PendingSession>>,
}

/// Maps guilds to players and players to nodes
///
/// The manager owns the node registry and the guild → player map, routes
/// node messages to players, and correlates gateway session updates with
/// joins. Joining is two-phase: [`join`](Self::join) returns a usable
/// player immediately, but audio only flows once the gateway's voice server
/// update reaches [`handle_session_update`](Self::handle_session_update).
///
/// Session updates for guilds without a player are kept for
/// `session_buffer_ttl_ms`, so a join that loses the race against its own
/// session update still connects.
#[derive(Clone)]
pub struct PlayerManager {
    inner: Arc<ManagerInner>,
}

impl PlayerManager {
    pub fn new(context: ClientContext, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                context,
                config,
                nodes: Mutex::new(NodeRegistry::new()),
                players: Mutex::new(HashMap::new()),
                joins: Mutex::new(PendingJoins::default()),
                pending_sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    // ========== Nodes ==========

    /// Register a node and connect to it
    ///
    /// A failed first connection is not an error: the node stays registered
    /// and, with `auto_reconnect`, keeps retrying.
    pub async fn create_node(&self, config: NodeConfig) -> Result<NodeConnection> {
        let node = NodeConnection::new(config, self.inner.context.identity.clone());

        {
            let mut nodes = self.lock_nodes();
            if nodes.contains(node.host()) {
                return Err(LinkError::NodeAlreadyExists(node.host().to_string()));
            }
            let listener = self.spawn_listener(&node);
            nodes.insert(node.clone(), Some(listener))?;
        }

        if let Err(e) = node.connect().await {
            tracing::warn!("Initial connection to node {} failed: {}", node.host(), e);
        }

        // The node may have been removed while connecting
        let still_registered = self
            .lock_nodes()
            .get(node.host())
            .is_some_and(|registered| registered.ptr_eq(&node));

        if still_registered && node.config().auto_reconnect {
            node.arm_reconnect();
        }

        Ok(node)
    }

    /// Unregister a node, detach its listener, and close it
    pub fn remove_node(&self, host: &str) -> bool {
        let removed = self.lock_nodes().remove(host);

        match removed {
            Some(node) => {
                node.destroy();
                tracing::info!("Removed node {}", host);
                true
            }
            None => false,
        }
    }

    pub fn node(&self, host: &str) -> Option<NodeConnection> {
        self.lock_nodes().get(host).cloned()
    }

    pub fn node_hosts(&self) -> Vec<String> {
        self.lock_nodes().hosts()
    }

    /// Host of the open node with the lowest load, if any
    pub fn best_node(&self) -> Option<String> {
        self.lock_nodes().best().map(|node| node.host().to_string())
    }

    fn spawn_listener(&self, node: &NodeConnection) -> JoinHandle<()> {
        let mut signals = node.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let host = node.host().to_string();

        tokio::spawn(async move {
            while let Ok(signal) = signals.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = PlayerManager { inner };

                match signal {
                    NodeSignal::Message(message) => manager.route_node_message(&host, &message),
                    NodeSignal::Ready => {
                        tracing::info!("Node {} ready", host);
                        manager.retry_pending_sessions(&host);
                    }
                    NodeSignal::Disconnected { code, reason } => {
                        tracing::warn!("Node {} disconnected ({:?}): {}", host, code, reason);
                    }
                    NodeSignal::Reconnecting => tracing::debug!("Node {} reconnecting", host),
                    NodeSignal::Error(error) => tracing::warn!("Node {} error: {}", host, error),
                }
            }
        })
    }

    // ========== Players ==========

    pub fn get(&self, guild_id: GuildId) -> Option<GuildPlayer> {
        self.lock_players().get(&guild_id).cloned()
    }

    pub fn has_player(&self, guild_id: GuildId) -> bool {
        self.lock_players().contains_key(&guild_id)
    }

    pub fn players(&self) -> Vec<GuildPlayer> {
        self.lock_players().values().cloned().collect()
    }

    pub fn player_count(&self) -> usize {
        self.lock_players().len()
    }

    /// Join a voice channel and return the guild's player
    ///
    /// Returns the existing player unchanged if the guild already has one.
    /// Fails with [`LinkError::JoinCancelled`] if a leave for the guild ran
    /// while the join was waiting on the gateway.
    pub async fn join(&self, options: JoinOptions) -> Result<GuildPlayer> {
        if let Some(player) = self.get(options.guild_id) {
            return Ok(player);
        }

        let node = self
            .node(&options.host)
            .ok_or_else(|| LinkError::NodeNotFound(options.host.clone()))?;
        let token = self.lock_joins().begin(options.guild_id);

        let gateway = &self.inner.context.gateway;
        match gateway.voice_channel(options.guild_id, options.channel_id).await? {
            Some(channel) if channel.is_voice => {
                if !channel.can_connect || !channel.can_speak {
                    return Err(LinkError::PermissionDenied(options.channel_id));
                }
            }
            _ => {
                return Err(LinkError::ChannelNotFound {
                    guild_id: options.guild_id,
                    channel_id: options.channel_id,
                })
            }
        }

        // Never ask the gateway to join after a leave went out
        if !self.lock_joins().is_current(options.guild_id, token) {
            return self
                .get(options.guild_id)
                .ok_or(LinkError::JoinCancelled(options.guild_id));
        }

        gateway
            .send_voice_state_update(VoiceStateUpdate::join(
                options.guild_id,
                options.channel_id,
                options.muted,
                options.deafen,
            ))
            .await?;

        let (player, buffered) = {
            let mut players = self.lock_players();
            // A concurrent join may have registered a player meanwhile
            if let Some(player) = players.get(&options.guild_id) {
                return Ok(player.clone());
            }

            let mut joins = self.lock_joins();
            if !joins.is_current(options.guild_id, token) {
                tracing::debug!("Join for guild {} cancelled by leave", options.guild_id);
                return Err(LinkError::JoinCancelled(options.guild_id));
            }
            joins.in_flight.remove(&options.guild_id);
            drop(joins);

            let player = GuildPlayer::new(options.guild_id, options.channel_id, node);
            players.insert(options.guild_id, player.clone());
            tracing::info!(
                "Created player for guild {} on node {}",
                options.guild_id,
                options.host
            );

            // Taken under the players lock, so a racing session update
            // either was buffered already or will see the player
            (player, self.take_pending_session(options.guild_id))
        };

        if let Some(session) = buffered {
            tracing::debug!("Using buffered session update for guild {}", options.guild_id);
            self.deliver_session(&player, session);
        }

        Ok(player)
    }

    /// Leave the guild's voice channel and tear down its player
    ///
    /// Returns `false` if the guild had no player. A join still in flight
    /// for the guild is cancelled.
    pub async fn leave(&self, guild_id: GuildId) -> bool {
        let player = {
            let mut players = self.lock_players();
            self.lock_joins().in_flight.remove(&guild_id);
            self.lock_pending().remove(&guild_id);
            players.remove(&guild_id)
        };

        if let Some(player) = &player {
            player.remove_listeners();
            // Teardown must finish locally even if the node is unreachable
            if let Err(e) = player.stop() {
                tracing::debug!("Stop during leave of guild {} failed: {}", guild_id, e);
            }
            if let Err(e) = player.destroy() {
                tracing::debug!("Destroy during leave of guild {} failed: {}", guild_id, e);
            }
            tracing::info!("Removed player for guild {}", guild_id);
        }

        if let Err(e) = self
            .inner
            .context
            .gateway
            .send_voice_state_update(VoiceStateUpdate::leave(guild_id))
            .await
        {
            tracing::warn!("Failed to send voice leave for guild {}: {}", guild_id, e);
        }

        player.is_some()
    }

    // ========== Session correlation ==========

    /// Forward a voice session to the guild's player
    ///
    /// A missing player is a normal outcome: the update is buffered for a
    /// late join, or dropped when buffering is disabled.
    ///
    /// If the player's node is down, the update is held the same way and
    /// delivered when the node reports ready again.
    pub fn handle_session_update(&self, update: SessionUpdate) {
        let session = PendingSession {
            update,
            received_at: Instant::now(),
        };

        let player = {
            let players = self.lock_players();
            match players.get(&session.update.guild_id) {
                Some(player) => player.clone(),
                None => {
                    // Buffered under the players lock; see `join`
                    self.buffer_session(session);
                    return;
                }
            }
        };

        self.deliver_session(&player, session);
    }

    /// Handle a raw voice server update from the gateway
    ///
    /// The bot's voice session id is looked up through the gateway and
    /// forwarded together with the payload.
    pub async fn handle_voice_server_update(&self, event: Value) {
        let Some(guild_id) = snowflake(&event, "guild_id") else {
            tracing::debug!("Voice server update without guild_id: {}", event);
            return;
        };

        let Some(session_id) = self.inner.context.gateway.voice_session_id(guild_id).await else {
            tracing::debug!("No voice session for guild {} yet", guild_id);
            return;
        };

        self.handle_session_update(SessionUpdate {
            guild_id,
            session_id,
            event,
        });
    }

    pub fn has_pending_session(&self, guild_id: GuildId) -> bool {
        let ttl = self.inner.config.session_buffer_ttl();
        self.lock_pending()
            .get(&guild_id)
            .is_some_and(|session| session.received_at.elapsed() <= ttl)
    }

    fn take_pending_session(&self, guild_id: GuildId) -> Option<PendingSession> {
        let ttl = self.inner.config.session_buffer_ttl();
        let session = self.lock_pending().remove(&guild_id)?;
        (session.received_at.elapsed() <= ttl).then_some(session)
    }

    fn buffer_session(&self, session: PendingSession) {
        let guild_id = session.update.guild_id;
        let ttl = self.inner.config.session_buffer_ttl();
        if ttl.is_zero() {
            tracing::debug!("Dropping session update for guild {}: buffering disabled", guild_id);
            return;
        }

        let mut pending = self.lock_pending();
        pending.retain(|_, held| held.received_at.elapsed() <= ttl);
        if session.received_at.elapsed() <= ttl {
            tracing::debug!("Buffering session update for guild {}", guild_id);
            pending.insert(guild_id, session);
        }
    }

    /// Send a session to the player's node, holding it if the node is down
    fn deliver_session(&self, player: &GuildPlayer, session: PendingSession) {
        if !self.try_connect(player, session) {
            return;
        }

        // The node may have come back before the session was held
        if player.node().is_open() {
            self.retry_pending_sessions(player.node_host());
        }
    }

    /// Returns whether the session was held for a later retry
    fn try_connect(&self, player: &GuildPlayer, session: PendingSession) -> bool {
        let guild_id = session.update.guild_id;
        match player.connect(&session.update.session_id, session.update.event.clone()) {
            Ok(()) => false,
            Err(LinkError::NodeUnavailable(host)) => {
                tracing::debug!("Node {} is down, holding session update for guild {}", host, guild_id);
                let players = self.lock_players();
                // A leave since the lookup owns the guild now
                if !players.get(&guild_id).is_some_and(|current| current.ptr_eq(player)) {
                    return false;
                }
                self.buffer_session(session);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to connect player for guild {}: {}", guild_id, e);
                false
            }
        }
    }

    /// Deliver held session updates for players bound to `host`
    fn retry_pending_sessions(&self, host: &str) {
        let ready: Vec<(GuildPlayer, PendingSession)> = {
            let players = self.lock_players();
            let mut pending = self.lock_pending();
            let guilds: Vec<GuildId> = pending
                .keys()
                .filter(|guild_id| {
                    players
                        .get(*guild_id)
                        .is_some_and(|player| player.node_host() == host)
                })
                .copied()
                .collect();

            guilds
                .into_iter()
                .filter_map(|guild_id| {
                    let session = pending.remove(&guild_id)?;
                    let player = players.get(&guild_id)?.clone();
                    Some((player, session))
                })
                .collect()
        };

        let ttl = self.inner.config.session_buffer_ttl();
        for (player, session) in ready {
            if session.received_at.elapsed() > ttl {
                continue;
            }
            tracing::debug!("Delivering held session update for guild {}", player.guild_id());
            self.try_connect(&player, session);
        }
    }

    // ========== Routing ==========

    /// Dispatch a message from a node to the owning player
    ///
    /// Messages without a recognizable op or guild, and messages for guilds
    /// without a player, are dropped.
    pub fn route_node_message(&self, host: &str, message: &Value) {
        match IncomingMessage::from_value(message) {
            Some(IncomingMessage::Event(event)) => match self.get(event.guild_id) {
                Some(player) => player.handle_node_event(event),
                None => tracing::debug!(
                    "Dropping {} from {}: no player for guild {}",
                    event.event_type,
                    host,
                    event.guild_id
                ),
            },
            Some(IncomingMessage::PlayerUpdate { guild_id, state }) => {
                if let Some(player) = self.get(guild_id) {
                    player.apply_update(state);
                }
            }
            Some(IncomingMessage::Stats(_)) => {
                tracing::trace!("Stats from {} reached the router", host);
            }
            None => tracing::debug!("Dropping unroutable message from {}: {}", host, message),
        }
    }

    /// Tear down every player and node
    pub async fn shutdown(&self) {
        let guilds: Vec<GuildId> = self.lock_players().keys().copied().collect();
        for guild_id in guilds {
            self.leave(guild_id).await;
        }

        let nodes = self.lock_nodes().drain();
        for node in nodes {
            node.destroy();
        }
        self.lock_joins().in_flight.clear();
        self.lock_pending().clear();
        tracing::info!("Player manager shut down");
    }

    fn lock_nodes(&self) -> MutexGuard<'_, NodeRegistry> {
        self.inner.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_players(&self) -> MutexGuard<'_, HashMap<GuildId, GuildPlayer>> {
        self.inner.players.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_joins(&self) -> MutexGuard<'_, PendingJoins> {
        self.inner.joins.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<GuildId, PendingSession>> {
        self.inner.pending_sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an already-open detached node, returning its outbound frames
    #[cfg(test)]
    pub(crate) fn register_detached(
        &self,
        config: NodeConfig,
    ) -> (NodeConnection, tokio::sync::mpsc::UnboundedReceiver<tokio_tungstenite::tungstenite::Message>) {
        let (node, rx) = NodeConnection::open_detached(config);
        let listener = self.spawn_listener(&node);
        self.lock_nodes()
            .insert(node.clone(), Some(listener))
            .unwrap_or_else(|e| panic!("register_detached: {}", e));
        (node, rx)
    }
}

/// Read a snowflake sent either as a string or a number
fn snowflake(value: &Value, key: &str) -> Option<u64> {
    match value.get(key)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}
