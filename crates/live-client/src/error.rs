use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures on the live (WebSocket) side. None of these escape the supervisor's
/// background task; they are logged and funnelled into the reconnect path.
#[derive(Debug, Error)]
pub enum LiveError {
    #[error("invalid channel address: {0}")]
    Address(#[from] url::ParseError),
    #[error("websocket connect failed: {0}")]
    Connect(#[source] Box<tungstenite::Error>),
    #[error("no handshake within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("channel is not open")]
    NotConnected,
    #[error("failed to encode outbound frame: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed inbound frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
    #[error("inbound frame is not valid utf-8")]
    InvalidUtf8,
}

impl From<tungstenite::Error> for LiveError {
    fn from(err: tungstenite::Error) -> Self {
        LiveError::Connect(Box::new(err))
    }
}

pub type LiveResult<T> = Result<T, LiveError>;

/// Failures of request/response calls (chat streaming, history, clear, and the
/// REST collaborators that back reconcilers).
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("api rejected request: code={code} msg={message}")]
    Rejected { code: i64, message: String },
    #[error("no signed-in subject")]
    Unauthenticated,
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
    #[error("response stream failed: {0}")]
    Stream(String),
}

pub type ApiResult<T> = Result<T, ApiError>;
