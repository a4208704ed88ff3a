use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Error as WsError, tungstenite::Message};
use tracing::debug;
use url::Url;

use crate::error::LiveResult;

pub type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Both halves of one established duplex connection.
pub struct FrameConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl FrameConnection {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Message, Error = WsError> + Send + 'static,
        R: Stream<Item = Result<Message, WsError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }
}

/// Opens the underlying connection for a supervisor.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, url: &Url) -> LiveResult<FrameConnection>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &Url) -> LiveResult<FrameConnection> {
        let (ws_stream, _) = connect_async(url.as_str()).await?;
        debug!(target = "live.supervisor", url = %url, "websocket connected");
        let (write, read) = ws_stream.split();
        Ok(FrameConnection::new(write, read))
    }
}

/// Writes queued frames until the queue closes or a close frame has gone out.
pub(crate) async fn pump_outbound(
    mut sink: FrameSink,
    mut outbound: tokio::sync::mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(err) = sink.send(message).await {
            debug!(target = "live.supervisor", error = %err, "outbound write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = sink.close().await;
}
