/// A page, store list or price history request that did not produce data.
///
/// Carried inside snapshots and shared between coalesced lookups, so it holds
/// rendered messages rather than the underlying error values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("backend responded with status {0}")]
    Status(u16),
    #[error("could not decode response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            FetchError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Request(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(e: serde_json::Error) -> Self {
        FetchError::Decode(e.to_string())
    }
}

/// The push-event connection failed or ended. Always recovered from by
/// reconnecting, never shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("could not connect: {0}")]
    Connect(String),
    #[error("event stream responded with status {0}")]
    Status(u16),
    #[error("event stream broke: {0}")]
    Stream(String),
}

/// A push event whose payload can't be used.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload has no usable id")]
    MissingId,
    #[error("payload is missing `{0}`")]
    MissingField(&'static str),
}
