use reverb_common::FromMessage;

/// Crate-wide result type for channel operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Typed errors raised while joining or leaving channels.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Signature missing or failed verification on an authenticated channel.
    #[error("connection is not authorized to join {channel}")]
    Unauthorized { channel: String },

    /// Presence subscriptions must carry `channel_data`.
    #[error("presence subscription to {channel} is missing channel_data")]
    MissingChannelData { channel: String },

    /// `channel_data` did not parse as an object with a `user_id`.
    #[error("invalid channel_data: {message}")]
    InvalidChannelData { message: String },
}

impl Error {
    #[must_use]
    pub fn unauthorized(channel: impl Into<String>) -> Self {
        Self::Unauthorized {
            channel: channel.into(),
        }
    }

    #[must_use]
    pub fn missing_channel_data(channel: impl Into<String>) -> Self {
        Self::MissingChannelData {
            channel: channel.into(),
        }
    }

    #[must_use]
    pub fn invalid_channel_data(message: impl std::fmt::Display) -> Self {
        Self::InvalidChannelData {
            message: message.to_string(),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::InvalidChannelData { message }
    }
}

reverb_common::impl_context!();
