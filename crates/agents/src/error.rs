use crate::model::ModelResponse;

/// Failures inside a provider adapter.
///
/// These never leave the adapter as `Err`: the public adapter methods turn
/// them into a failed [`ModelResponse`] via the `From` impl below.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Connection, TLS or timeout failure from the HTTP client.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// Non-2xx status; `body` is the raw vendor error body.
    #[error("HTTP {status}: {body}")]
    Api { status: u16, body: String },
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<AdapterError> for ModelResponse {
    fn from(err: AdapterError) -> Self {
        ModelResponse::failure(err.to_string())
    }
}

/// Failures that abort a whole tool batch (and with it the agent run).
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("host execution queue is closed")]
    HostQueueClosed,
    #[error("tool batch was abandoned before every call completed")]
    BatchAbandoned,
}
