use thiserror::Error;

/// Result type for lavaplay operations
pub type Result<T> = std::result::Result<T, LinkError>;

/// Errors that can occur while orchestrating nodes and players
#[derive(Error, Debug)]
pub enum LinkError {
    /// Malformed input to a public operation
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Valid input that is disallowed without an explicit override
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// No node is registered under the given host
    #[error("No node found at host {0}")]
    NodeNotFound(String),

    /// A node is already registered under the given host
    #[error("Node already registered at host {0}")]
    NodeAlreadyExists(String),

    /// The voice channel does not exist or is not a voice channel
    #[error("Voice channel {channel_id} not found in guild {guild_id}")]
    ChannelNotFound {
        guild_id: u64,
        channel_id: u64,
    },

    /// Missing connect or speak capability on the target channel
    #[error("Missing connect/speak permission in channel {0}")]
    PermissionDenied(u64),

    /// The bound node connection is not open
    #[error("Node {0} is not connected")]
    NodeUnavailable(String),

    /// The player was destroyed and must be discarded
    #[error("Player for guild {0} has been destroyed")]
    PlayerDestroyed(u64),

    /// A leave for the guild ran while the join was in flight
    #[error("Join for guild {0} was cancelled by a leave")]
    JoinCancelled(u64),

    /// The gateway collaborator rejected a command or lookup
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Handshake header could not be encoded
    #[error("Invalid header value: {0}")]
    InvalidHeader(#[from] tokio_tungstenite::tungstenite::http::header::InvalidHeaderValue),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Connection was closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,
}
