//! Streaming recogniser over a JSON WebSocket
//!
//! Each utterance opens a fresh connection. Audio is sent as base64 PCM in
//! `audio` messages, closed by an `end` message, and the server answers with
//! `partial` / `final` transcripts.

use super::{AsrClient, AsrError, RecognitionEvent};
use base64::Engine;
use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Start { sample_rate: u32, encoding: &'static str },
    Audio { data: String },
    End,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Partial { text: String },
    Final { text: String },
    Error { message: String },
}

pub struct WebSocketAsr {
    url: String,
    sample_rate: u32,
    results: UnboundedSender<RecognitionEvent>,

    /// Feeds the writer task of the current connection
    outgoing: Mutex<Option<UnboundedSender<ClientMessage>>>,
}

impl WebSocketAsr {
    pub fn new(url: String, sample_rate: u32, results: UnboundedSender<RecognitionEvent>) -> Self {
        Self {
            url,
            sample_rate,
            results,
            outgoing: Mutex::new(None),
        }
    }

    fn enqueue(&self, msg: ClientMessage) -> Result<(), AsrError> {
        let guard = self.outgoing.lock().map_err(|_| AsrError::Closed)?;
        match guard.as_ref() {
            Some(tx) => tx.send(msg).map_err(|_| AsrError::Closed),
            None => Err(AsrError::Closed),
        }
    }

    async fn open(&self) -> Result<(), AsrError> {
        info!("🔌 Connecting to ASR at {}", self.url);
        let (ws_stream, _resp) = connect_async(self.url.as_str())
            .await
            .map_err(|e| AsrError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let start = serde_json::to_string(&ClientMessage::Start {
            sample_rate: self.sample_rate,
            encoding: "pcm_s16le",
        })?;
        sink.send(Message::Text(start.into())).await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();

        // Writer: the only place messages for this connection are serialized
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let is_end = matches!(msg, ClientMessage::End);
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize ASR message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(json.into())).await {
                    warn!("ASR send failed: {}", e);
                    break;
                }
                if is_end {
                    debug!("📤 End of stream sent to ASR");
                    break;
                }
            }
        });

        // Reader: forward transcripts until the server closes the stream
        let results = self.results.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        debug!("ASR connection closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("ASR connection error: {}", e);
                        let _ = results.send(RecognitionEvent::Error(e.to_string()));
                        break;
                    }
                };

                let event = match serde_json::from_str::<ServerMessage>(text.as_str()) {
                    Ok(ServerMessage::Partial { text }) => RecognitionEvent::Partial(text),
                    Ok(ServerMessage::Final { text }) => {
                        info!("📥 Recognition result: {}", text);
                        RecognitionEvent::Final(text)
                    }
                    Ok(ServerMessage::Error { message }) => RecognitionEvent::Error(message),
                    Err(e) => {
                        warn!("Ignoring unrecognised ASR message: {}", e);
                        continue;
                    }
                };
                let is_final = matches!(event, RecognitionEvent::Final(_));
                if results.send(event).is_err() || is_final {
                    break;
                }
            }
        });

        let mut guard = self.outgoing.lock().map_err(|_| AsrError::Closed)?;
        *guard = Some(tx);
        info!("✅ ASR stream open");
        Ok(())
    }
}

impl AsrClient for WebSocketAsr {
    fn connect(&self) -> BoxFuture<'_, Result<(), AsrError>> {
        Box::pin(self.open())
    }

    fn send_chunk(&self, pcm: Vec<u8>) -> Result<(), AsrError> {
        let data = base64::engine::general_purpose::STANDARD.encode(&pcm);
        self.enqueue(ClientMessage::Audio { data })
    }

    fn send_end_of_stream(&self) -> Result<(), AsrError> {
        let result = self.enqueue(ClientMessage::End);
        if let Ok(mut guard) = self.outgoing.lock() {
            guard.take();
        }
        result
    }
}
