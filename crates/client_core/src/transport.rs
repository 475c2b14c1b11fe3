use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

use shared::domain::{ConversationId, MessageId};
use shared::error::{ChannelException, ErrorCode};
use shared::protocol::{LiveFrame, OutboundMessage};

use crate::{LiveChannel, LiveReceiver, LiveSender, MessageApi, SessionProvider};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Websocket transport for the live channel: JSON frames, one connection per
/// `connect` call. Reconnection policy lives in the engine, not here.
pub struct WebSocketLiveChannel {
    server_url: String,
    session: Arc<dyn SessionProvider>,
}

impl WebSocketLiveChannel {
    pub fn new(server_url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    fn websocket_url(&self) -> Result<String> {
        let base = if let Some(rest) = self.server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let user_id = self.session.current_user_id();
        let mut url = format!("{base}/ws?user_id={}", user_id.0);
        if let Some(token) = self.session.auth_token() {
            url.push_str(&format!("&token={token}"));
        }
        Ok(url)
    }
}

#[async_trait]
impl LiveChannel for WebSocketLiveChannel {
    async fn connect(&self) -> Result<(Box<dyn LiveSender>, Box<dyn LiveReceiver>)> {
        let ws_url = self.websocket_url()?;
        let (stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (sink, stream) = stream.split();
        Ok((
            Box::new(WsSender {
                sink: Mutex::new(sink),
            }),
            Box::new(WsReceiver { stream }),
        ))
    }
}

struct WsSender {
    sink: Mutex<SplitSink<WsStream, WsMessage>>,
}

impl WsSender {
    async fn send_frame(&self, frame: &LiveFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|err| {
                anyhow!(ChannelException::new(
                    ErrorCode::TransientNetwork,
                    format!("websocket send failed: {err}"),
                ))
            })
    }
}

#[async_trait]
impl LiveSender for WsSender {
    async fn subscribe(&self, conversation_id: &ConversationId) -> Result<()> {
        self.send_frame(&LiveFrame::new(
            "subscribe",
            serde_json::json!({ "conversation_id": conversation_id.0 }),
        ))
        .await
    }

    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()> {
        self.send_frame(&LiveFrame::new("message", serde_json::to_value(outbound)?))
            .await
    }
}

struct WsReceiver {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl LiveReceiver for WsReceiver {
    async fn next_frame(&mut self) -> Result<Option<LiveFrame>> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<LiveFrame>(&text) {
                    Ok(frame) => return Ok(Some(frame)),
                    Err(err) => {
                        warn!("skipping undecodable live frame: {err}");
                    }
                },
                Ok(WsMessage::Close(_)) => return Ok(None),
                Ok(_) => {
                    debug!("ignoring non-text websocket message");
                }
                Err(err) => {
                    return Err(anyhow!(ChannelException::new(
                        ErrorCode::TransientNetwork,
                        format!("websocket receive failed: {err}"),
                    )));
                }
            }
        }
        Ok(None)
    }
}

/// HTTP fallback transport: poll window fetches, sends, and global
/// retractions.
pub struct HttpMessageApi {
    http: reqwest::Client,
    server_url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpMessageApi {
    pub fn new(server_url: impl Into<String>, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            http: reqwest::Client::new(),
            server_url: server_url.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session.auth_token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl MessageApi for HttpMessageApi {
    async fn poll_messages(
        &self,
        conversation_id: &ConversationId,
        since: DateTime<Utc>,
    ) -> Result<Vec<serde_json::Value>> {
        let response = self
            .authorize(
                self.http
                    .get(format!(
                        "{}/conversations/{}/messages",
                        self.server_url, conversation_id.0
                    ))
                    .query(&[("since", since.to_rfc3339())]),
            )
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        let response = check_status(response)?;
        let payloads: Vec<serde_json::Value> =
            response.json().await.map_err(classify_reqwest_error)?;
        Ok(payloads)
    }

    async fn send_message(&self, outbound: &OutboundMessage) -> Result<()> {
        let response = self
            .authorize(
                self.http
                    .post(format!(
                        "{}/conversations/{}/messages",
                        self.server_url, outbound.conversation_id.0
                    ))
                    .json(outbound),
            )
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        check_status(response)?;
        Ok(())
    }

    async fn delete_message(
        &self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
    ) -> Result<()> {
        let response = self
            .authorize(self.http.delete(format!(
                "{}/conversations/{}/messages/{}",
                self.server_url, conversation_id.0, message_id.0
            )))
            .send()
            .await
            .map_err(classify_reqwest_error)?;
        check_status(response)?;
        Ok(())
    }
}

fn classify_reqwest_error(err: reqwest::Error) -> anyhow::Error {
    anyhow!(ChannelException::new(
        ErrorCode::TransientNetwork,
        format!("http transport failed: {err}"),
    ))
}

fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = match status.as_u16() {
        401 | 403 => ErrorCode::Auth,
        400 | 422 => ErrorCode::Validation,
        // A retract against an already-gone message is an idempotent no-op.
        404 | 409 => ErrorCode::Conflict,
        _ => ErrorCode::TransientNetwork,
    };
    Err(anyhow!(ChannelException::new(
        code,
        format!("server returned {status}"),
    )))
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
