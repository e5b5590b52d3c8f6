use thiserror::Error;

/// Startup-time configuration problems. Anything in here stops the run before any traffic is
/// generated; tolerant enum parsing never produces one of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{field} must be a positive integer")]
    NotPositive { field: &'static str },

    #[error("{field} has an invalid duration: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("{field} must be longer than zero")]
    ZeroDuration { field: &'static str },

    #[error("invalid base URL {value:?}: {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("no stages left for the {model} model")]
    EmptyStages { model: &'static str },

    #[error("invalid threshold {expr:?}: {reason}")]
    InvalidThreshold { expr: String, reason: String },

    #[error("invalid scenario file: {0}")]
    ScenarioFile(#[from] sonic_rs::Error),

    #[error("scenario file lists no scenarios")]
    NoScenarios,

    #[error("scenario names must be non-empty and unique, got {0:?}")]
    ScenarioName(String),

    #[error("scenario {name:?} has invalid flags: {reason}")]
    ScenarioFlags { name: String, reason: String },
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to encode credential segment: {0}")]
    Encode(#[from] sonic_rs::Error),

    #[error("failed to sign credential: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),

    #[error("credential must have three segments, found {0}")]
    Malformed(usize),

    #[error("credential segment is not valid base64url: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("credential signature does not match")]
    BadSignature,
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to create latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
}
