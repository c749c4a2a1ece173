// Crate-wide error type.
//
// Every adapter boundary (SSH, HTTP, SQLite, config) converts into this enum so the
// scheduler and arbiter loops can log-and-continue on a uniform `BrokerError` without
// matching on source-library types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// A SSH or HTTP call failed and the caller may retry at the next tick.
    #[error("transient remote error: {0}")]
    TransientRemote(String),

    /// The remote Xray/WireGuard config was missing an expected shape.
    #[error("remote config invalid: {0}")]
    RemoteConfigInvalid(String),

    /// Client-count ceiling reached on the region-VPN host.
    #[error("server overloaded")]
    ServerOverloaded,

    /// Database-level advisory lock could not be acquired this tick.
    #[error("advisory lock busy: {0}")]
    LockBusy(String),

    /// A required startup configuration value was absent.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// A configuration value failed to parse.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Business-rule rejection (insufficient balance, below minimum, unknown token, ...).
    #[error("{0}")]
    BusinessRule(String),

    /// Referenced row does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("ssh error: {0}")]
    Ssh(String),
}

impl BrokerError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::TransientRemote(msg.into())
    }

    pub fn business<S: Into<String>>(msg: S) -> Self {
        Self::BusinessRule(msg.into())
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        let status = match &self {
            BrokerError::TransientRemote(_) | BrokerError::Ssh(_) | BrokerError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            BrokerError::ServerOverloaded => StatusCode::SERVICE_UNAVAILABLE,
            BrokerError::LockBusy(_) => StatusCode::CONFLICT,
            BrokerError::MissingConfig(_) | BrokerError::InvalidConfig(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            BrokerError::BusinessRule(_) => StatusCode::UNPROCESSABLE_ENTITY,
            BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::RemoteConfigInvalid(_)
            | BrokerError::Database(_)
            | BrokerError::Io(_)
            | BrokerError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(serde_json::json!({
            "error": { "code": status.as_u16(), "message": self.to_string() }
        }));
        (status, body).into_response()
    }
}

impl From<rusqlite::Error> for BrokerError {
    fn from(err: rusqlite::Error) -> Self {
        BrokerError::Database(err.to_string())
    }
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::Io(err.to_string())
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        BrokerError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(err: serde_json::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for BrokerError {
    fn from(err: config::ConfigError) -> Self {
        BrokerError::InvalidConfig(err.to_string())
    }
}

impl From<russh::Error> for BrokerError {
    fn from(err: russh::Error) -> Self {
        BrokerError::Ssh(err.to_string())
    }
}

impl From<regex::Error> for BrokerError {
    fn from(err: regex::Error) -> Self {
        BrokerError::Serialization(err.to_string())
    }
}
