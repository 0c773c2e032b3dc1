//! WebSocket transport for the live conversation protocol

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use super::protocol::{ClientMessage, RealtimeInput, ServerMessage, SetupMessage, ToolResponse};
use super::{
    ChannelEvent, ConversationChannel, ConversationTransport, EventSink, FunctionResponse,
    LiveSetup, MediaChunk,
};
use crate::config::LiveConfig;
use crate::{Error, Result};

/// Frames queued for the writer task
enum Outbound {
    Text(String),
    Close,
}

/// Connects to a live conversation endpoint over WebSocket
pub struct LiveTransport {
    endpoint: Url,
    model: String,
    api_key: Option<SecretString>,
}

impl LiveTransport {
    /// Create a transport from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint is not a valid URL
    pub fn new(config: &LiveConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| Error::Config(format!("invalid live endpoint {}: {e}", config.endpoint)))?;

        if !matches!(endpoint.scheme(), "ws" | "wss") {
            return Err(Error::Config(format!(
                "live endpoint must use ws:// or wss://, got {}",
                endpoint.scheme()
            )));
        }

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            api_key: config
                .api_key
                .as_ref()
                .map(|key| SecretString::from(key.expose_secret().to_owned())),
        })
    }

    /// Endpoint with the API key attached
    fn session_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key.expose_secret());
        }
        url
    }
}

#[async_trait]
impl ConversationTransport for LiveTransport {
    async fn connect(
        &self,
        setup: LiveSetup,
        events: EventSink,
    ) -> Result<Box<dyn ConversationChannel>> {
        tracing::debug!(endpoint = %self.endpoint, model = %self.model, "connecting live channel");

        let (stream, _) = tokio_tungstenite::connect_async(self.session_url().as_str())
            .await
            .map_err(|e| Error::ChannelOpen(e.to_string()))?;
        let (mut write, mut read) = stream.split();

        let handshake = ClientMessage::Setup(SetupMessage::new(&self.model, &setup));
        write
            .send(Message::Text(serde_json::to_string(&handshake)?))
            .await
            .map_err(|e| Error::ChannelOpen(e.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

        let writer = tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                match outbound {
                    Outbound::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            tracing::debug!(error = %e, "live channel write failed");
                            break;
                        }
                    }
                    Outbound::Close => {
                        let _ = write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("ignoring non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "live channel closed by remote");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        events(ChannelEvent::Error(e.to_string()));
                        return;
                    }
                };

                match ServerMessage::parse(&text) {
                    Ok(message) => {
                        for event in message.into_events() {
                            events(event);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "unparseable server message"),
                }
            }
            events(ChannelEvent::Closed);
        });

        tracing::info!(model = %self.model, "live channel connected");

        Ok(Box::new(LiveChannel {
            tx,
            reader: Some(reader),
            writer: Some(writer),
        }))
    }
}

/// Handle to an open live channel
struct LiveChannel {
    tx: mpsc::UnboundedSender<Outbound>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl LiveChannel {
    fn send(&self, message: &ClientMessage) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.tx.send(Outbound::Text(text)).is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "failed to encode client message");
                false
            }
        }
    }
}

impl ConversationChannel for LiveChannel {
    fn send_audio(&self, chunk: MediaChunk) -> bool {
        self.send(&ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![chunk],
        }))
    }

    fn send_tool_response(&self, response: FunctionResponse) -> bool {
        self.send(&ClientMessage::ToolResponse(ToolResponse {
            function_responses: vec![response],
        }))
    }

    fn close(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        // The writer drains the close frame on its own; nothing here waits on the network
        let _ = self.tx.send(Outbound::Close);
        reader.abort();
        drop(self.writer.take());
        tracing::debug!("live channel closed");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}
