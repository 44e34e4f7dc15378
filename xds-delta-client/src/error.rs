//! Error types for the delta xDS client.

use thiserror::Error;

/// Error type for the delta xDS client.
#[derive(Debug, Error)]
pub enum Error {
    /// A wire message could not be decoded.
    #[cfg(feature = "codegen-prost")]
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),

    /// A resource failed decoding or validation.
    #[error("validation error: {0}")]
    Validation(String),

    /// A delta response named the same resource more than once.
    #[error("duplicate name {name} found {location}")]
    DuplicateResource {
        /// The repeated resource name.
        name: String,
        /// Where the repetition was found.
        location: &'static str,
    },

    /// A watch callback refused an update.
    #[error("update rejected by watch: {0}")]
    Callback(String),

    /// A resource name could not be parsed.
    #[error("invalid resource name {0:?}")]
    InvalidResourceName(String),

    /// The discovery stream could not be established.
    #[error("discovery stream could not be established")]
    ConnectionFailure,
}

/// Result type alias for delta xDS client operations.
pub type Result<T> = std::result::Result<T, Error>;
