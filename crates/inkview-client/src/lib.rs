//! Inkview display client
//!
//! Provisions a display device against a remote API and keeps refreshing the
//! image shown on screen, honoring the refresh interval the server asks for.
//!
//! # Features
//!
//! - One-time key exchange with the setup endpoint (skipped when a key is cached)
//! - Display polling with server-driven refresh interval
//! - Start/stop lifecycle that is safe against a timer that already fired
//! - Pluggable transport, input source and presenter for testing without a server

mod api;
mod config;
mod display;
mod inputs;
pub mod mock;
mod poll_loop;
mod presenter;
mod provisioner;
mod transport;

use thiserror::Error;

pub use api::{
    DISPLAY_PATH, DisplayResponse, HEADER_ACCESS_TOKEN, HEADER_ID, HEADER_REFRESH_RATE,
    SETUP_PATH, SetupResponse, endpoint, parse_refresh_rate,
};
pub use config::{CONFIG_DIR, ClientConfig, ConfigFileError, USER_CONFIG_DIR};
pub use display::{DisplayFetcher, DisplayUpdate};
pub use inputs::{ConfigInputs, InputSource};
pub use poll_loop::{CycleError, CycleStage, LoopEvent, LoopPhase, PollLoop};
pub use presenter::{LogPresenter, Presenter};
pub use provisioner::Provisioner;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};

/// Refresh interval used until the server sends one (15 minutes)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

/// Broad classification of a [`ClientError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required local input is missing or malformed
    Config,
    /// The request did not complete with HTTP 200
    Transport,
    /// HTTP 200, but the body reported a failure
    Api,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("HTTP status code ({status}) does not indicate success")]
    Transport { status: u16 },

    #[error("API status code ({status}) does not indicate success")]
    Api { status: i64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Config(_) | ClientError::InvalidUrl(_) => ErrorKind::Config,
            ClientError::Transport { .. } | ClientError::Http(_) => ErrorKind::Transport,
            ClientError::Api { .. } | ClientError::Decode(_) => ErrorKind::Api,
        }
    }
}
