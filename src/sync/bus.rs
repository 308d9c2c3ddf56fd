//! Per-room event fan-out.
//!
//! Each room owns one `BroadcastBus` backed by a bounded tokio broadcast
//! channel. Events are wrapped in an origin-tagged [`Envelope`]; each
//! [`Subscription`] filters out envelopes not meant for its session, so an
//! originator never receives an echo of its own mutation.

use std::sync::Arc;

use tokio::sync::broadcast;

use super::protocol::Event;
use crate::models::SessionId;

/// Default channel capacity per room.
pub const DEFAULT_CAPACITY: usize = 256;

/// One published event.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub graph_id: String,
    /// Session that caused the event, `None` for server-generated events
    pub origin: Option<SessionId>,
    /// Skip delivery to `origin`
    pub exclude_origin: bool,
    pub event: Event,
}

impl Envelope {
    /// Whether `session` should receive this envelope.
    pub fn is_for(&self, session: SessionId) -> bool {
        !(self.exclude_origin && self.origin == Some(session))
    }
}

/// What a subscriber sees next.
#[derive(Debug)]
pub enum Received {
    Event(Arc<Envelope>),
    /// The subscriber fell behind and this many envelopes were dropped.
    Lagged(u64),
}

/// Publish side of a room's channel.
#[derive(Debug)]
pub struct BroadcastBus {
    graph_id: String,
    tx: broadcast::Sender<Arc<Envelope>>,
}

impl BroadcastBus {
    pub fn new(graph_id: &str, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            graph_id: graph_id.to_string(),
            tx,
        }
    }

    /// Fan out to every member except `origin`.
    pub fn publish(&self, origin: SessionId, event: Event) {
        self.send(Envelope {
            graph_id: self.graph_id.clone(),
            origin: Some(origin),
            exclude_origin: true,
            event,
        });
    }

    /// Fan out to every member, the originator included.
    pub fn publish_all(&self, origin: Option<SessionId>, event: Event) {
        self.send(Envelope {
            graph_id: self.graph_id.clone(),
            origin,
            exclude_origin: false,
            event,
        });
    }

    fn send(&self, envelope: Envelope) {
        let kind = envelope.event.kind();
        // An error only means nobody is listening right now.
        match self.tx.send(Arc::new(envelope)) {
            Ok(receivers) => {
                tracing::trace!(graph_id = %self.graph_id, kind, receivers, "published");
            }
            Err(_) => {
                tracing::trace!(graph_id = %self.graph_id, kind, "published to empty room");
            }
        }
    }

    /// Start receiving envelopes addressed to `session`.
    pub fn subscribe(&self, session: SessionId) -> Subscription {
        Subscription {
            session,
            rx: self.tx.subscribe(),
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Receive side for one session in one room.
#[derive(Debug)]
pub struct Subscription {
    session: SessionId,
    rx: broadcast::Receiver<Arc<Envelope>>,
}

impl Subscription {
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Wait for the next envelope for this session.
    ///
    /// Returns `None` once the room is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) if envelope.is_for(self.session) => {
                    return Some(Received::Event(envelope));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(Received::Lagged(missed));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Received> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) if envelope.is_for(self.session) => {
                    return Some(Received::Event(envelope));
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    return Some(Received::Lagged(missed));
                }
                Err(_) => return None,
            }
        }
    }
}
