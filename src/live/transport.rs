//! Duplex transport to the remote conversational endpoint
//! Outbound audio goes through a FIFO channel; inbound traffic comes back as ordered events

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::{ClientMessage, ServerContent, ServerMessage};
use crate::audio::AudioPayload;
use crate::config::LiveConfig;
use crate::error::{LiveError, Result};

/// Everything the remote side can tell us, in arrival order
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Open,
    Message(ServerContent),
    Error(LiveError),
    Close,
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// A live connection owned by one session
pub trait TransportHandle: Send + Sync {
    /// Queue an audio chunk. Never blocks; dropped if the link is not open.
    fn send(&self, payload: AudioPayload);

    /// Tear the link down. Safe from any state, any number of times.
    fn close(&self);

    fn is_open(&self) -> bool;
}

/// Opens live connections
pub trait SessionTransport: Send + Sync {
    /// Start connecting and return at once; `Open` arrives on `events` later
    fn open(&self, config: &LiveConfig, events: EventSender) -> Result<Arc<dyn TransportHandle>>;
}

enum Outbound {
    Audio(AudioPayload),
    Close,
}

#[derive(Default)]
struct LinkState {
    open: AtomicBool,
    closed: AtomicBool,
}

/// WebSocket transport speaking the JSON live protocol
#[derive(Debug, Clone, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

impl SessionTransport for WebSocketTransport {
    fn open(&self, config: &LiveConfig, events: EventSender) -> Result<Arc<dyn TransportHandle>> {
        let url = config.connect_url()?;
        let setup = serde_json::to_string(&ClientMessage::setup(config))
            .map_err(|e| LiveError::TransportOpenFailed(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LiveError::TransportOpenFailed(format!("no async runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(LinkState::default());

        tracing::info!("Opening live session with {}", config.model);
        let task = runtime.spawn(run_connection(url, setup, rx, events, link.clone()));

        Ok(Arc::new(WebSocketHandle {
            outgoing: Mutex::new(Some(tx)),
            link,
            task: Mutex::new(Some(task)),
        }))
    }
}

struct WebSocketHandle {
    outgoing: Mutex<Option<mpsc::UnboundedSender<Outbound>>>,
    link: Arc<LinkState>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportHandle for WebSocketHandle {
    fn send(&self, payload: AudioPayload) {
        if !self.is_open() {
            tracing::trace!("Dropping audio frame: transport not open");
            return;
        }
        if let Some(tx) = self.outgoing.lock().as_ref() {
            let _ = tx.send(Outbound::Audio(payload));
        }
    }

    fn close(&self) {
        if self.link.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let was_open = self.link.open.swap(false, Ordering::SeqCst);
        let outgoing = self.outgoing.lock().take();

        match (was_open, outgoing) {
            (true, Some(tx)) => {
                // Writer sends the close frame and exits; unsent audio is dropped with it
                let _ = tx.send(Outbound::Close);
            }
            _ => {
                if let Some(task) = self.task.lock().take() {
                    task.abort();
                }
            }
        }
        tracing::info!("Live transport closed");
    }

    fn is_open(&self) -> bool {
        self.link.open.load(Ordering::SeqCst) && !self.link.closed.load(Ordering::SeqCst)
    }
}

impl Drop for WebSocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}

fn emit(events: &EventSender, link: &LinkState, event: TransportEvent) {
    if link.closed.load(Ordering::SeqCst) {
        return;
    }
    let _ = events.send(event);
}

async fn run_connection(
    url: String,
    setup: String,
    mut outgoing: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
    link: Arc<LinkState>,
) {
    let ws = match connect_async(url.as_str()).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            tracing::error!("Live connect failed: {}", e);
            emit(&events, &link, TransportEvent::Error(LiveError::TransportOpenFailed(e.to_string())));
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();

    if let Err(e) = sink.send(Message::Text(setup)).await {
        tracing::error!("Failed to send live setup: {}", e);
        emit(&events, &link, TransportEvent::Error(LiveError::TransportOpenFailed(e.to_string())));
        return;
    }

    loop {
        tokio::select! {
            outbound = outgoing.recv() => match outbound {
                Some(Outbound::Audio(payload)) => {
                    let text = match serde_json::to_string(&ClientMessage::audio(payload)) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to serialize audio frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        tracing::error!("Live send failed: {}", e);
                        emit(&events, &link, TransportEvent::Error(LiveError::Transport(e.to_string())));
                        break;
                    }
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.close().await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => dispatch(text.as_bytes(), &link, &events),
                Some(Ok(Message::Binary(bytes))) => dispatch(&bytes, &link, &events),
                Some(Ok(Message::Close(frame))) => {
                    let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                    closed_by_remote(&link, &events, reason);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::error!("Live transport error: {}", e);
                    emit(&events, &link, TransportEvent::Error(LiveError::Transport(e.to_string())));
                    break;
                }
                None => {
                    closed_by_remote(&link, &events, String::new());
                    break;
                }
            },
        }
    }

    link.open.store(false, Ordering::SeqCst);
}

fn closed_by_remote(link: &LinkState, events: &EventSender, reason: String) {
    if link.open.load(Ordering::SeqCst) {
        tracing::info!("Live session closed by server {}", reason);
        emit(events, link, TransportEvent::Close);
    } else {
        tracing::error!("Live session closed before setup completed: {}", reason);
        emit(
            events,
            link,
            TransportEvent::Error(LiveError::TransportOpenFailed(format!(
                "closed before setup completed: {}",
                reason
            ))),
        );
    }
}

/// Turn one inbound JSON frame into events
fn dispatch(raw: &[u8], link: &LinkState, events: &EventSender) {
    if link.closed.load(Ordering::SeqCst) {
        return;
    }

    let message: ServerMessage = match serde_json::from_slice(raw) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("Unparseable server message: {}", e);
            emit(events, link, TransportEvent::Error(LiveError::Decode(e.to_string())));
            return;
        }
    };

    if message.setup_complete.is_some() && !link.open.swap(true, Ordering::SeqCst) {
        tracing::info!("Live session open");
        emit(events, link, TransportEvent::Open);
    }
    if let Some(content) = message.server_content {
        emit(events, link, TransportEvent::Message(content));
    }
}
