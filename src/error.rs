//! Error types for the gateway hook pipelines.
//!
//! Every pipeline step returns `Result<_, Error>`; the hook boundary maps the
//! error onto the MQTT reason code surfaced to the peer.

use thiserror::Error;

/// MQTT reason codes surfaced to the peer when a hook denies an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    ClientIdentifierNotValid,
    BadUserNameOrPassword,
    NotAuthorized,
    ImplSpecificError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientIdentifierNotValid => "client_identifier_not_valid",
            Self::BadUserNameOrPassword => "bad_username_or_password",
            Self::NotAuthorized => "not_authorized",
            Self::ImplSpecificError => "impl_specific_error",
        }
    }
}

/// Error type for gateway operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The MQTT Client-ID does not follow the agent grammar.
    #[error("gateway: invalid client identifier: {0}")]
    BadClientId(String),

    /// The password is missing, malformed, or fails JWT verification.
    #[error("gateway: bad credentials: {0}")]
    BadCredentials(String),

    /// The connector is authenticated but not allowed to do this.
    #[error("gateway: not authorized: {0}")]
    NotAuthorized(String),

    /// The payload is not a valid message envelope.
    #[error("gateway: invalid envelope: {0}")]
    BadEnvelope(String),

    /// A message property violates the gateway invariants.
    #[error("gateway: invalid message properties: {0}")]
    BadProperties(String),

    /// A connection or publish constraint was violated.
    #[error("gateway: constraint violated: {0}")]
    Constraint(String),

    /// A dynamic-subscription request could not be processed.
    #[error("gateway: subscription request rejected: {0}")]
    BadDynSubRequest(String),

    /// A required broker call failed.
    #[error("gateway: broker call failed: {0}")]
    Broker(String),
}

impl Error {
    /// Reason code reported to the peer for this error.
    pub fn reason_code(&self) -> ReasonCode {
        match self {
            Self::BadClientId(_) => ReasonCode::ClientIdentifierNotValid,
            Self::BadCredentials(_) => ReasonCode::BadUserNameOrPassword,
            Self::NotAuthorized(_) => ReasonCode::NotAuthorized,
            Self::BadEnvelope(_)
            | Self::BadProperties(_)
            | Self::Constraint(_)
            | Self::BadDynSubRequest(_)
            | Self::Broker(_) => ReasonCode::ImplSpecificError,
        }
    }

    /// Short kind tag for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadClientId(_) => "bad_client_id",
            Self::BadCredentials(_) => "bad_credentials",
            Self::NotAuthorized(_) => "not_authorized",
            Self::BadEnvelope(_) => "bad_envelope",
            Self::BadProperties(_) => "bad_properties",
            Self::Constraint(_) => "constraint",
            Self::BadDynSubRequest(_) => "bad_dynsub_request",
            Self::Broker(_) => "broker",
        }
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
