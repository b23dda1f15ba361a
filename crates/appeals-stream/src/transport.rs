use appeals_core::FrameError;
use futures_util::future::{self, BoxFuture};
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    SendTimeout(Duration),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// One physical connection, already split into its text halves.
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new<S, T>(sink: S, stream: T) -> Self
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        T: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

/// Opens connections for the supervisor. The stream ending means the peer closed.
pub trait Connector: Send + 'static {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, TransportError>>;
}

#[derive(Clone, Debug)]
pub struct WsConnector {
    url: Url,
}

impl WsConnector {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Connection, TransportError>> {
        let url = self.url.clone();
        async move {
            let (ws, _) = connect_async(url.as_str()).await?;
            let (sink, stream) = ws.split();
            let sink = sink.with(|text: String| {
                future::ready(Ok::<_, TransportError>(Message::Text(text)))
            });
            let stream = stream.filter_map(|msg| future::ready(text_frame(msg)));
            Ok(Connection::new(sink, stream))
        }
        .boxed()
    }
}

fn text_frame(
    msg: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<String, TransportError>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(text)),
        Ok(Message::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
        Ok(_) => None,
        Err(err) => Some(Err(err.into())),
    }
}
