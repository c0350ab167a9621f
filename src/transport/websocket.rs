//! WebSocket transport
//!
//! One tokio task per connection runs the read loop; a second task drains an
//! unbounded queue of outbound text frames into the socket. Both live on the
//! runtime handle given at construction, so the session can be driven from
//! the synchronous control thread.

use crate::transport::protocol::parse_inbound;
use crate::transport::{EventSink, OutboundMessage, Transport, TransportConfig, TransportEvent};
use crate::{Result, VoiceError};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

/// WebSocket connection to the agent
pub struct TransportSession {
    config: TransportConfig,
    runtime: Handle,
    open: Arc<AtomicBool>,
    outbound: Arc<Mutex<Option<UnboundedSender<String>>>>,
    generation: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(config: TransportConfig, runtime: Handle) -> Self {
        Self {
            config,
            runtime,
            open: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            task: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }
}

impl Transport for TransportSession {
    fn connect(&mut self, events: EventSink) -> Result<()> {
        self.close();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let live = Arc::clone(&self.generation);
        let is_current = move || live.load(Ordering::SeqCst) == generation;
        let emit = {
            let is_current = is_current.clone();
            move |event: TransportEvent| {
                if is_current() {
                    events(event);
                }
            }
        };

        let url = self.config.url.clone();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let open = Arc::clone(&self.open);
        let outbound = Arc::clone(&self.outbound);

        info!("Connecting to agent at {}...", url);

        self.task = Some(self.runtime.spawn(async move {
            let ws_stream =
                match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str()))
                    .await
                {
                    Ok(Ok((ws_stream, _))) => ws_stream,
                    Ok(Err(e)) => {
                        warn!("Agent connection error: {}", e);
                        emit(TransportEvent::Disconnected {
                            reason: format!("connection failed: {}", e),
                        });
                        return;
                    }
                    Err(_) => {
                        warn!("Agent connection timed out after {:?}", timeout);
                        emit(TransportEvent::Disconnected {
                            reason: "connection timed out".to_string(),
                        });
                        return;
                    }
                };

            info!("Connected to agent");
            let (mut write, mut read) = ws_stream.split();

            let (out_tx, mut out_rx) = unbounded_channel::<String>();
            *outbound.lock() = Some(out_tx);
            open.store(true, Ordering::SeqCst);
            emit(TransportEvent::ConnectionOpened);

            let writer = tokio::spawn(async move {
                while let Some(text) = out_rx.recv().await {
                    if let Err(e) = write.send(WsMessage::Text(text)).await {
                        warn!("Agent WebSocket write error: {}", e);
                        break;
                    }
                }
                let _ = write.close().await;
            });

            // Read loop
            let reason = loop {
                match read.next().await {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(event) = parse_inbound(&text) {
                            emit(event);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("Agent closed connection");
                        break "closed by server".to_string();
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Agent WebSocket error: {}", e);
                        break e.to_string();
                    }
                    None => break "connection closed".to_string(),
                }
            };

            // Clean up, unless a newer connection owns the slots
            if is_current() {
                open.store(false, Ordering::SeqCst);
                outbound.lock().take();
            }
            writer.abort();
            emit(TransportEvent::Disconnected { reason });
        }));

        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&mut self, message: OutboundMessage) -> Result<()> {
        let text = message.to_json()?;
        let outbound = self.outbound.lock();
        let tx = outbound
            .as_ref()
            .ok_or_else(|| VoiceError::TransportError("not connected".to_string()))?;

        tx.send(text)
            .map_err(|e| VoiceError::TransportError(format!("Failed to queue frame: {}", e)))?;
        debug!("Queued {} frame", message_kind(&message));
        Ok(())
    }

    fn close(&mut self) {
        // Silences every event of the current connection
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);

        // Dropping the sender lets the writer send a close frame
        self.outbound.lock().take();

        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Agent connection closed");
        }
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn message_kind(message: &OutboundMessage) -> &'static str {
    match message {
        OutboundMessage::StartSession => "start_session",
        OutboundMessage::Audio { .. } => "audio",
    }
}
