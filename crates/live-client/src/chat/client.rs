use std::sync::Arc;

use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::history::{parse_history, ChatTurn};
use super::reassembler::{reassemble, ReplyEvent, ReplySink, StreamOutcome};
use crate::error::{ApiError, ApiResult};
use crate::session::SessionSource;

/// Messages longer than this many bytes go in a POST body instead of the query.
pub const LONG_MESSAGE_THRESHOLD: usize = 1024;
/// Notice shown in place of a reply that could not be produced.
pub const FAILURE_NOTICE: &str = "[系统] 服务异常，请稍后再试";
const SUCCESS_CODE: i64 = 200;
const EVENT_STREAM: &str = "text/event-stream";

/// `{code, msg, data}` wrapper used by every JSON endpoint of the judge API.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default = "Option::default")]
    pub data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn into_data(self) -> ApiResult<Option<T>> {
        if self.code == SUCCESS_CODE {
            Ok(self.data)
        } else {
            Err(ApiError::Rejected {
                code: self.code,
                message: self.msg.unwrap_or_default(),
            })
        }
    }
}

/// Client for the AI assistant endpoints.
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    base_url: Url,
    session: Arc<dyn SessionSource>,
}

impl ChatClient {
    pub fn new(base_url: Url, session: Arc<dyn SessionSource>) -> Self {
        Self::with_http(Client::new(), base_url, session)
    }

    pub fn with_http(http: Client, base_url: Url, session: Arc<dyn SessionSource>) -> Self {
        Self {
            http,
            base_url,
            session,
        }
    }

    /// Sends `message` and streams the reply into `sink`.
    ///
    /// Every failure, including a rejected request, is published to the sink
    /// exactly once and returned inside the outcome; nothing is raised twice.
    pub async fn stream_reply<K>(&self, message: &str, sink: &mut K) -> StreamOutcome
    where
        K: ReplySink + ?Sized,
    {
        match self.open_reply(message).await {
            Ok(response) => reassemble(response.bytes_stream(), sink).await,
            Err(error) => {
                warn!(target = "live.chat", error = %error, "chat request failed");
                sink.publish(ReplyEvent::Failed(error.to_string()));
                StreamOutcome::Failed {
                    partial: String::new(),
                    error,
                }
            }
        }
    }

    async fn open_reply(&self, message: &str) -> ApiResult<Response> {
        let url = self.endpoint("ai/chat")?;
        let request = if message.len() > LONG_MESSAGE_THRESHOLD {
            self.http
                .post(url)
                .header(CONTENT_TYPE, "text/plain; charset=utf-8")
                .body(message.to_owned())
        } else {
            self.http.get(url).query(&[("message", message)])
        };
        let request = self.authorize(request.header(ACCEPT, EVENT_STREAM))?;
        debug!(
            target = "live.chat",
            length = message.len(),
            "sending chat message"
        );
        let response = request.send().await?;
        ensure_success(response).await
    }

    /// Discards the server-held conversation.
    pub async fn clear_history(&self) -> ApiResult<()> {
        let url = self.endpoint("ai/clear")?;
        let request = self.authorize(
            self.http
                .post(url)
                .header(CONTENT_TYPE, "application/json"),
        )?;
        let response = ensure_success(request.send().await?).await?;
        let body = response.text().await?;
        if !body.trim().is_empty() {
            if let Ok(envelope) = serde_json::from_str::<ApiEnvelope<serde_json::Value>>(&body) {
                envelope.into_data()?;
            }
        }
        info!(target = "live.chat", "chat history cleared");
        Ok(())
    }

    /// Earlier turns of the conversation, oldest first, without system entries.
    pub async fn load_history(&self) -> ApiResult<Vec<ChatTurn>> {
        let entries: Vec<String> = self.get_json("ai/history").await?.unwrap_or_default();
        let turns = parse_history(&entries);
        debug!(
            target = "live.chat",
            stored = entries.len(),
            turns = turns.len(),
            "chat history loaded"
        );
        Ok(turns)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> ApiResult<Option<T>> {
        let url = self.endpoint(path)?;
        let response = ensure_success(self.authorize(self.http.get(url))?.send().await?).await?;
        response.json::<ApiEnvelope<T>>().await?.into_data()
    }

    fn endpoint(&self, path: &str) -> ApiResult<Url> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: RequestBuilder) -> ApiResult<RequestBuilder> {
        if self.session.current_subject().is_none() {
            return Err(ApiError::Unauthenticated);
        }
        Ok(match self.session.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        })
    }
}

async fn ensure_success(response: Response) -> ApiResult<Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::UnexpectedStatus { status, body })
    }
}
