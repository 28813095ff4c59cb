use crate::auth::AuthStatus;
use config::ConfigError;
use snafu::{Backtrace, Snafu};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("Attempted to open a websocket that has not been closed: {url}"))]
    AlreadyOpen { url: String, backtrace: Backtrace },

    #[snafu(display("Invalid relay url {url}: {message}"))]
    InvalidRelayUrl {
        url: String,
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Transport error: {message}"))]
    Transport {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Attempted to authenticate with no challenge"))]
    NoChallenge { backtrace: Backtrace },

    #[snafu(display("Attempted to authenticate when auth is already {status}"))]
    AuthInProgress {
        status: AuthStatus,
        backtrace: Backtrace,
    },

    #[snafu(display("Invalid message received: {message}"))]
    Protocol {
        message: String,
        backtrace: Backtrace,
    },

    #[snafu(display("Configuration error: {source}"))]
    Config {
        source: ConfigError,
        backtrace: Backtrace,
    },
}

impl Error {
    pub fn already_open<S: Into<String>>(url: S) -> Self {
        Error::AlreadyOpen {
            url: url.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn invalid_relay_url(url: impl Into<String>, message: impl ToString) -> Self {
        Error::InvalidRelayUrl {
            url: url.into(),
            message: message.to_string(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Error::Transport {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn no_challenge() -> Self {
        Error::NoChallenge {
            backtrace: Backtrace::capture(),
        }
    }

    pub fn auth_in_progress(status: AuthStatus) -> Self {
        Error::AuthInProgress {
            status,
            backtrace: Backtrace::capture(),
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Error::Protocol {
            message: message.into(),
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(source: ConfigError) -> Self {
        Error::Config {
            source,
            backtrace: Backtrace::capture(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::protocol(error.to_string())
    }
}
