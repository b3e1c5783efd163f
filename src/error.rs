// src/error.rs

use std::sync::Arc;

use thiserror::Error;

/// The primary error type for the `spid-oidc-rp` library.
#[derive(Debug, Error)]
pub enum OidcFedError {
    /// A JWT, JWK or JSON document could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Errors originating from the `jsonwebtoken` crate.
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// An error occurred during an HTTP request.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// A remote federation artifact could not be retrieved.
    #[error("fetch failed: {0}")]
    FetchFailed(String),

    /// The JWS header references a `kid` that is not in the key set.
    #[error("unknown kid: {0}")]
    UnknownKid(String),

    /// The JWS `alg` is outside the configured allow-list.
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// The key type cannot be used for the requested operation.
    #[error("unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// An entity statement carries no usable `jwks`.
    #[error("missing jwks in the statement for {0}")]
    MissingJwks(String),

    /// An entity configuration violates a structural invariant.
    #[error("invalid entity configuration for {subject}: {reason}")]
    InvalidEntityConfiguration { subject: String, reason: String },

    /// The requested trust anchor is not in the configured allow-list.
    #[error("trust anchor {0} is not among the configured trust anchors")]
    InvalidTrustAnchor(String),

    /// The provider argument was empty.
    #[error("the provider is mandatory")]
    MissingProvider,

    /// The stored trust chain has been administratively disabled.
    #[error("trust chain for {subject} is disabled (modified at {modified_at})")]
    TrustChainDisabled { subject: String, modified_at: i64 },

    /// No verified path from the subject to the trust anchor was found.
    #[error("invalid trust chain: {0}")]
    InvalidTrustChain(String),

    /// The chain is valid but carries no metadata of the requested type.
    #[error("missing metadata: {0}")]
    MissingMetadata(String),

    /// The well-known subject does not match the configured client_id.
    #[error("subject mismatch: got {actual}, expected {expected}")]
    MismatchedSubject { expected: String, actual: String },

    /// The relying party has no (active) federation entity configuration.
    #[error("missing configuration: {0}")]
    MissingConfiguration(String),

    /// A configuration value is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An auth-request record with the same `state` already exists.
    #[error("conflicting state: {0}")]
    ConflictingState(String),

    /// A provided URL could not be parsed.
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The operation exceeded the configured deadline.
    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(String),

    /// A persistence adapter failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Key material could not be generated or converted.
    #[error("key error: {0}")]
    Key(String),
}

impl OidcFedError {
    /// Rebuilds a caller-facing error out of one shared by concurrent
    /// waiters of the same single-flight chain build.
    ///
    /// String-carrying kinds are reconstructed as-is; kinds holding
    /// non-clonable sources collapse into `InvalidTrustChain` with the
    /// rendered message.
    pub(crate) fn from_shared(err: Arc<OidcFedError>) -> OidcFedError {
        match &*err {
            OidcFedError::Parse(s) => OidcFedError::Parse(s.clone()),
            OidcFedError::FetchFailed(s) => OidcFedError::FetchFailed(s.clone()),
            OidcFedError::UnknownKid(s) => OidcFedError::UnknownKid(s.clone()),
            OidcFedError::UnsupportedAlgorithm(s) => {
                OidcFedError::UnsupportedAlgorithm(s.clone())
            }
            OidcFedError::UnsupportedKeyType(s) => OidcFedError::UnsupportedKeyType(s.clone()),
            OidcFedError::MissingJwks(s) => OidcFedError::MissingJwks(s.clone()),
            OidcFedError::InvalidEntityConfiguration { subject, reason } => {
                OidcFedError::InvalidEntityConfiguration {
                    subject: subject.clone(),
                    reason: reason.clone(),
                }
            }
            OidcFedError::InvalidTrustAnchor(s) => OidcFedError::InvalidTrustAnchor(s.clone()),
            OidcFedError::MissingProvider => OidcFedError::MissingProvider,
            OidcFedError::TrustChainDisabled {
                subject,
                modified_at,
            } => OidcFedError::TrustChainDisabled {
                subject: subject.clone(),
                modified_at: *modified_at,
            },
            OidcFedError::InvalidTrustChain(s) => OidcFedError::InvalidTrustChain(s.clone()),
            OidcFedError::MissingMetadata(s) => OidcFedError::MissingMetadata(s.clone()),
            OidcFedError::MismatchedSubject { expected, actual } => {
                OidcFedError::MismatchedSubject {
                    expected: expected.clone(),
                    actual: actual.clone(),
                }
            }
            OidcFedError::MissingConfiguration(s) => {
                OidcFedError::MissingConfiguration(s.clone())
            }
            OidcFedError::InvalidConfiguration(s) => {
                OidcFedError::InvalidConfiguration(s.clone())
            }
            OidcFedError::ConflictingState(s) => OidcFedError::ConflictingState(s.clone()),
            OidcFedError::InvalidUrl(s) => OidcFedError::InvalidUrl(s.clone()),
            OidcFedError::DeadlineExceeded(s) => OidcFedError::DeadlineExceeded(s.clone()),
            OidcFedError::Persistence(s) => OidcFedError::Persistence(s.clone()),
            OidcFedError::Key(s) => OidcFedError::Key(s.clone()),
            other => OidcFedError::InvalidTrustChain(other.to_string()),
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OidcFedError>;
