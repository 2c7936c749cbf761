//! Error taxonomy shared across the sync engine.

/// Failure classes produced by transport, parsing, and store layers.
///
/// Transport and HTTP failures surface to the user and end the operation.
/// Parse failures surface too, but mutations applied before the failure stay
/// committed. Store and I/O failures wrap the underlying library errors.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Network-level failure before any HTTP status was obtained.
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-2xx HTTP status outside the 404/410/501/429 contract.
    #[error("HTTP {status} for {endpoint}")]
    Http { status: u16, endpoint: String },

    /// Malformed XML or a response body that violates the protocol.
    #[error("malformed response: {0}")]
    Parse(String),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Salt generation or parameter derivation failed. The request must not
    /// be sent with weaker credentials.
    #[error("authentication failure: {0}")]
    Auth(String),

    /// Keyring or session credential lookup failed.
    #[error("credential lookup failed: {0}")]
    Credentials(String),
}

impl From<quick_xml::Error> for SyncError {
    fn from(err: quick_xml::Error) -> Self {
        SyncError::Parse(err.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for SyncError {
    fn from(err: quick_xml::events::attributes::AttrError) -> Self {
        SyncError::Parse(err.to_string())
    }
}
