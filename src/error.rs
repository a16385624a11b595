//! Error types for the lanscope agent.

use std::io;

use thiserror::Error;

/// Main error type for lanscope operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("spoof engine error: {0}")]
    Spoof(#[from] SpoofError),

    #[error("query store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("DNS protocol error: {0}")]
    Protocol(#[from] hickory_proto::error::ProtoError),

    #[error("upstream resolution failed: {0}")]
    Upstream(String),

    #[error("capture mode {0} is already active; stop it before starting another")]
    CaptureActive(&'static str),

    #[error("metrics error: {0}")]
    Metrics(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(String),
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no suitable network interface found")]
    NoInterface,

    #[error("failed to open datalink channel: {0}")]
    ChannelOpen(String),

    #[error("unsupported channel type")]
    UnsupportedChannel,

    #[error("failed to send packet: {0}")]
    SendFailed(String),

    #[error("failed to toggle IP forwarding: {0}")]
    IpForward(String),
}

/// ARP redirection engine errors.
///
/// `GatewayUnresolved` is fatal to start. `NoTargets` is a non-fatal decline:
/// the engine has nothing to spoof and performs no side effects. `NotActive`
/// rejects operations that only make sense while the engine runs.
#[derive(Debug, Error)]
pub enum SpoofError {
    #[error("could not resolve gateway MAC for {0} within the timeout")]
    GatewayUnresolved(std::net::Ipv4Addr),

    #[error("no spoof targets discovered; nothing to do")]
    NoTargets,

    #[error("ARP redirection is not active")]
    NotActive,
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
