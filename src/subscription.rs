use crate::error::{LinkError, Result};
use crate::protocol::TrackEvent;
use serde_json::Value;
use tokio::sync::broadcast;

/// Lifecycle and traffic signal emitted by a node connection
#[derive(Debug, Clone)]
pub enum NodeSignal {
    /// The socket opened
    Ready,

    /// The socket closed or a connect attempt failed
    Disconnected {
        code: Option<u16>,
        reason: String,
    },

    /// A reconnect attempt is about to start
    Reconnecting,

    /// A parsed frame other than a stats report
    Message(Box<Value>),

    /// A send or parse failure; never fatal to the connection
    Error(String),
}

/// Domain event emitted by a guild player
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// The current track ended, got stuck, or was replaced
    End(TrackEvent),

    /// The node reported a playback exception
    Error(TrackEvent),

    /// The node reported an event type this player does not handle
    Warning(String),

    /// [`GuildPlayer::disconnect`](crate::GuildPlayer::disconnect) was called
    Disconnect(String),
}

/// Receiver for node signals
pub type NodeReceiver = SignalReceiver<NodeSignal>;

/// Receiver for player events
pub type PlayerReceiver = SignalReceiver<PlayerEvent>;

/// Typed receiver over a broadcast channel
pub struct SignalReceiver<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> SignalReceiver<T> {
    pub(crate) fn new(rx: broadcast::Receiver<T>) -> Self {
        Self { rx }
    }

    /// Receive the next signal
    ///
    /// Fails with `ConnectionClosed` once the emitter is gone or has dropped
    /// its listeners.
    pub async fn recv(&mut self) -> Result<T> {
        loop {
            match self.rx.recv().await {
                Ok(signal) => return Ok(signal),
                Err(broadcast::error::RecvError::Closed) => return Err(LinkError::ConnectionClosed),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Signal receiver lagged by {} messages", n);
                }
            }
        }
    }

    /// Try to receive a signal without waiting
    ///
    /// Returns `None` if nothing is pending.
    pub fn try_recv(&mut self) -> Result<Option<T>> {
        loop {
            match self.rx.try_recv() {
                Ok(signal) => return Ok(Some(signal)),
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Err(LinkError::ConnectionClosed),
                Err(broadcast::error::TryRecvError::Lagged(n)) => {
                    tracing::warn!("Signal receiver lagged by {} messages", n);
                }
            }
        }
    }
}
