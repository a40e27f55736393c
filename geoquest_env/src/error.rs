//! Error types for the GeoQuest environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// A channel between tasks was closed before delivery
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl EnvError {
    /// Creates a channel-closed error.
    pub fn channel_closed(what: impl Into<String>) -> Self {
        Self::ChannelClosed(what.into())
    }
}
