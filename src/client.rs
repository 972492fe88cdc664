//! Client-side room session.
//!
//! Owns the local [`Replica`] and a WebSocket connection to the room's
//! session endpoint. Local edits turn into event batches through
//! `apply_local`; remote batches integrate through `apply_remote` and
//! surface to the editor view as [`ClientEvent::TextUpdates`].
//!
//! Liveness is symmetric with the server: every `heartbit{}` is answered
//! with a presence refresh, and a silent socket past twice the heartbeat
//! interval ends the session. There is no automatic reconnect; recovery is
//! a fresh bootstrap.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::crdt::{CrdtError, CrdtEvent, Replica, TextUpdate};
use crate::protocol::{ClientMessage, ProtocolError, RoomSettings, ServerMessage, SitePresence};

/// Events surfaced to the editor view.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Positional changes to apply to the visible text.
    TextUpdates(Vec<TextUpdate>),
    Presence(SitePresence),
    SiteDisconnected(u32),
    /// The server is compacting the room; the session is over and a fresh
    /// bootstrap sees the compacted log.
    CompactionRequired,
    /// Transport failure, heartbeat silence, or corrupted state. The view
    /// goes read-only; recovery is a refresh.
    ConnectionLost,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("edit would grow the document past {limit} characters")]
    LimitExceeded { limit: usize },
    #[error(transparent)]
    Crdt(#[from] CrdtError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("server closed before assigning a site id")]
    Handshake,
    #[error("session is closed")]
    Closed,
}

/// A connected participant.
pub struct RoomClient {
    site_id: u32,
    document_limit: usize,
    replica: Arc<Mutex<Replica>>,
    outbound: mpsc::Sender<ClientMessage>,
    events: Option<mpsc::Receiver<ClientEvent>>,
    presence: Arc<Mutex<Option<SitePresence>>>,
}

impl RoomClient {
    /// Open the session and complete the handshake: the server's first
    /// message assigns our site id. `settings` and `bootstrap` come from
    /// the bootstrap response; the session URL carries the offset already
    /// covered by `bootstrap` so those events are not redelivered.
    pub async fn connect(
        url: &str,
        settings: RoomSettings,
        bootstrap: &[CrdtEvent],
    ) -> Result<Self, ClientError> {
        let primed = Replica::from_events(bootstrap)?;
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let (sink, mut stream) = ws.split();
        let heartbit = Duration::from_secs(settings.heartbit_interval.max(1));
        let deadline = heartbit * 2;

        let site_id = loop {
            let frame = timeout(deadline, stream.next())
                .await
                .map_err(|_| ClientError::Handshake)?;
            match frame {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str())? {
                    ServerMessage::SetSiteId { site_id } => break site_id,
                    other => {
                        log::warn!("expected setSiteId during handshake, got {other:?}");
                        return Err(ClientError::Handshake);
                    }
                },
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::Handshake),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        };
        log::info!("joined as site {site_id}");

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(64);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(256);
        let replica = Arc::new(Mutex::new(primed));
        let presence = Arc::new(Mutex::new(None::<SitePresence>));

        // Writer: encode and forward until the client drops.
        let mut writer_sink = sink;
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Ok(text) = message.encode() else { break };
                if writer_sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = writer_sink.close().await;
        });

        // Reader: integrate remote traffic, watchdog on silence.
        let reader = SessionReader {
            replica: replica.clone(),
            events: event_tx,
            outbound: out_tx.clone(),
            presence: presence.clone(),
        };
        tokio::spawn(async move {
            loop {
                let frame = match timeout(deadline, stream.next()).await {
                    Ok(frame) => frame,
                    Err(_) => {
                        log::warn!("no traffic for {deadline:?}, closing session");
                        break;
                    }
                };
                match frame {
                    Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                        Ok(message) => {
                            if !reader.handle(message).await {
                                break;
                            }
                        }
                        Err(e) => {
                            log::warn!("closing session on malformed message: {e}");
                            break;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("socket error: {e}");
                        break;
                    }
                }
            }
            let _ = reader.events.send(ClientEvent::ConnectionLost).await;
        });

        Ok(Self {
            site_id,
            document_limit: settings.document_limit,
            replica,
            outbound: out_tx,
            events: Some(event_rx),
            presence,
        })
    }

    pub fn site_id(&self) -> u32 {
        self.site_id
    }

    /// Take the event receiver; can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.events.take()
    }

    /// Replace the visible range `[from, to)` with `value` and send the
    /// resulting events. Refused locally when the document would outgrow
    /// the limit; the server is never involved.
    pub async fn edit(&self, from: usize, to: usize, value: &str) -> Result<(), ClientError> {
        let events = {
            let mut replica = self.replica.lock().await;
            if exceeds_limit(
                replica.visible_len(),
                from,
                to,
                value.chars().count(),
                self.document_limit,
            ) {
                return Err(ClientError::LimitExceeded {
                    limit: self.document_limit,
                });
            }
            replica.apply_local(from, to, value, self.site_id)?
        };
        if events.is_empty() {
            return Ok(());
        }
        self.outbound
            .send(ClientMessage::CrdtEvents { events })
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Announce (and remember) our display state. The remembered value is
    /// re-sent on every heartbeat.
    pub async fn set_presence(&self, name: &str, visible: bool) -> Result<(), ClientError> {
        let update = SitePresence {
            site_id: self.site_id,
            name: name.to_string(),
            visible,
        };
        *self.presence.lock().await = Some(update.clone());
        self.outbound
            .send(ClientMessage::SitePresence(update))
            .await
            .map_err(|_| ClientError::Closed)
    }

    pub async fn text(&self) -> String {
        self.replica.lock().await.text()
    }

    pub async fn visible_len(&self) -> usize {
        self.replica.lock().await.visible_len()
    }
}

struct SessionReader {
    replica: Arc<Mutex<Replica>>,
    events: mpsc::Sender<ClientEvent>,
    outbound: mpsc::Sender<ClientMessage>,
    presence: Arc<Mutex<Option<SitePresence>>>,
}

impl SessionReader {
    /// Returns `false` when the session must end.
    async fn handle(&self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::CrdtEvents { events } => {
                let applied = self.replica.lock().await.apply_remote(&events);
                match applied {
                    Ok(updates) => {
                        if !updates.is_empty() {
                            let _ = self.events.send(ClientEvent::TextUpdates(updates)).await;
                        }
                        true
                    }
                    Err(e) => {
                        log::error!("replica corrupted, closing session: {e}");
                        false
                    }
                }
            }
            ServerMessage::SitePresence(presence) => {
                let _ = self.events.send(ClientEvent::Presence(presence)).await;
                true
            }
            ServerMessage::SiteDisconnected { site_id } => {
                let _ = self
                    .events
                    .send(ClientEvent::SiteDisconnected(site_id))
                    .await;
                true
            }
            ServerMessage::Heartbit {} => {
                // Answer with a presence refresh so the server sees inbound
                // traffic inside its own deadline.
                if let Some(presence) = self.presence.lock().await.clone() {
                    let _ = self
                        .outbound
                        .send(ClientMessage::SitePresence(presence))
                        .await;
                }
                true
            }
            ServerMessage::CompactionRequired {} => {
                let _ = self.events.send(ClientEvent::CompactionRequired).await;
                false
            }
            ServerMessage::SetSiteId { site_id } => {
                log::warn!("unexpected setSiteId {site_id} after handshake");
                true
            }
        }
    }
}

fn exceeds_limit(current: usize, from: usize, to: usize, added: usize, limit: usize) -> bool {
    let removed = to.saturating_sub(from).min(current);
    current - removed + added > limit
}
