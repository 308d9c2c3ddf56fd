//! WebSocket handler speaking the sync protocol.
//!
//! Each connection gets its own [`SessionContext`]. Outgoing messages go
//! through one bounded queue drained by a writer task, so replies and
//! forwarded room events share a single ordered stream per connection.
//! A slow client backs the queue up into its room subscriptions, which
//! then lag and turn into a `resync`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::routes::AppState;
use crate::models::Participant;
use crate::sync::{
    ClientMessage, Mutation, Received, ServerMessage, SessionContext, Subscription, SyncHub,
};

/// Messages buffered per connection before forwarders stop draining rooms.
const OUTBOUND_CAPACITY: usize = 64;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SyncHub>) {
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CAPACITY);

    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to encode server message");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut conn = Connection::new(hub, out_tx);
    tracing::info!(session = %conn.ctx.session_id(), "client connected");
    conn.send(ServerMessage::Welcome {
        session_id: conn.ctx.session_id(),
    })
    .await;

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => conn.handle(message).await,
                Err(e) => {
                    tracing::debug!(session = %conn.ctx.session_id(), error = %e, "unparseable client message");
                    conn.send(ServerMessage::Error {
                        message: format!("invalid message: {}", e),
                    })
                    .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    conn.close().await;
    writer.abort();
}

/// Per-connection protocol state.
struct Connection {
    hub: Arc<SyncHub>,
    ctx: SessionContext,
    out: mpsc::Sender<ServerMessage>,
    /// One event forwarder per joined room
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Connection {
    fn new(hub: Arc<SyncHub>, out: mpsc::Sender<ServerMessage>) -> Self {
        let participant = Participant {
            user_id: "anonymous".to_string(),
            display_name: "anonymous".to_string(),
            color: "#888888".to_string(),
        };
        Self {
            hub,
            ctx: SessionContext::new(participant),
            out,
            forwarders: HashMap::new(),
        }
    }

    /// Queue a reply. Waits while the writer is behind.
    async fn send(&self, message: ServerMessage) {
        if self.out.send(message).await.is_err() {
            tracing::debug!(session = %self.ctx.session_id(), "writer closed; reply dropped");
        }
    }

    async fn ack(&self, graph_id: &str, kind: &str, target: Option<String>) {
        self.send(ServerMessage::Ack {
            graph_id: graph_id.to_string(),
            kind: kind.to_string(),
            target,
        })
        .await;
    }

    async fn reject(&self, graph_id: &str, kind: &str, rejection: crate::sync::Rejection) {
        tracing::debug!(
            session = %self.ctx.session_id(),
            graph_id,
            kind,
            %rejection,
            "request rejected"
        );
        self.send(ServerMessage::Rejected {
            graph_id: Some(graph_id.to_string()),
            kind: kind.to_string(),
            rejection,
        })
        .await;
    }

    async fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Join {
                graph_id,
                user_id,
                display_name,
                color,
            } => self.join(graph_id, user_id, display_name, color).await,
            ClientMessage::Leave { graph_id } => {
                self.stop_forwarder(&graph_id);
                if self.hub.leave(&mut self.ctx, &graph_id).await {
                    self.send(ServerMessage::Left { graph_id }).await;
                } else {
                    self.reject(
                        &graph_id,
                        "leave",
                        crate::sync::Rejection::NotJoined {
                            graph_id: graph_id.clone(),
                        },
                    )
                    .await;
                }
            }
            ClientMessage::Mutate { graph_id, mutation } => {
                let kind = mutation.kind();
                let target = mutation_target(&mutation);
                match self.hub.mutate(&mut self.ctx, &graph_id, mutation).await {
                    Ok(_) => self.ack(&graph_id, kind, target).await,
                    Err(rejection) => self.reject(&graph_id, kind, rejection).await,
                }
            }
            ClientMessage::Lock { graph_id, node_id } => {
                match self.hub.lock(&mut self.ctx, &graph_id, &node_id).await {
                    Ok(_) => self.ack(&graph_id, "lock", Some(node_id)).await,
                    Err(rejection) => self.reject(&graph_id, "lock", rejection).await,
                }
            }
            ClientMessage::Unlock { graph_id, node_id } => {
                match self.hub.unlock(&mut self.ctx, &graph_id, &node_id).await {
                    Ok(_) => self.ack(&graph_id, "unlock", Some(node_id)).await,
                    Err(rejection) => self.reject(&graph_id, "unlock", rejection).await,
                }
            }
            ClientMessage::Cursor { graph_id, position } => {
                if let Err(rejection) = self.hub.cursor(&self.ctx, &graph_id, position).await {
                    self.reject(&graph_id, "cursor", rejection).await;
                }
            }
            ClientMessage::Chat { graph_id, text } => {
                match self.hub.chat(&self.ctx, &graph_id, &text).await {
                    Ok(message) => self.ack(&graph_id, "chat", Some(message.id)).await,
                    Err(rejection) => self.reject(&graph_id, "chat", rejection).await,
                }
            }
            ClientMessage::Layout { graph_id } => match self.hub.request_layout(&graph_id).await {
                Ok(_) => self.ack(&graph_id, "layout", None).await,
                Err(rejection) => self.reject(&graph_id, "layout", rejection).await,
            },
            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    /// Join (or re-join) a room: `joined`, then `snapshot`, then live events.
    async fn join(
        &mut self,
        graph_id: String,
        user_id: String,
        display_name: Option<String>,
        color: String,
    ) {
        if user_id.trim().is_empty() {
            self.reject(
                &graph_id,
                "join",
                crate::sync::Rejection::invalid("user_id must not be empty"),
            )
            .await;
            return;
        }
        self.ctx.set_participant(Participant {
            display_name: display_name.unwrap_or_else(|| user_id.clone()),
            user_id,
            color,
        });

        self.stop_forwarder(&graph_id);
        match self.hub.join(&mut self.ctx, &graph_id).await {
            Ok(joined) => {
                tracing::info!(
                    session = %self.ctx.session_id(),
                    graph_id = %graph_id,
                    members = joined.roster.len(),
                    "session joined"
                );
                self.send(ServerMessage::Joined {
                    graph_id: graph_id.clone(),
                    session_id: self.ctx.session_id(),
                    roster: joined.roster,
                    locks: joined.locks,
                })
                .await;
                self.send(ServerMessage::Snapshot {
                    graph_id: graph_id.clone(),
                    snapshot: Box::new(joined.snapshot),
                })
                .await;
                let forwarder = spawn_forwarder(graph_id.clone(), joined.subscription, self.out.clone());
                self.forwarders.insert(graph_id, forwarder);
            }
            Err(rejection) => self.reject(&graph_id, "join", rejection).await,
        }
    }

    fn stop_forwarder(&mut self, graph_id: &str) {
        if let Some(handle) = self.forwarders.remove(graph_id) {
            handle.abort();
        }
    }

    /// Implicit leave of every room.
    async fn close(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
        self.hub.disconnect(&mut self.ctx).await;
        tracing::info!(session = %self.ctx.session_id(), "client disconnected");
    }
}

/// Node id reported back in the ack of a mutation.
fn mutation_target(mutation: &Mutation) -> Option<String> {
    mutation
        .created_node()
        .or_else(|| mutation.gated_node())
        .map(str::to_string)
}

/// Forward room events to the connection's outgoing queue.
fn spawn_forwarder(
    graph_id: String,
    mut subscription: Subscription,
    out: mpsc::Sender<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(received) = subscription.recv().await {
            let message = match received {
                Received::Event(envelope) => ServerMessage::Event {
                    graph_id: graph_id.clone(),
                    origin: envelope.origin,
                    event: envelope.event.clone(),
                },
                Received::Lagged(missed) => {
                    tracing::warn!(
                        graph_id = %graph_id,
                        session = %subscription.session(),
                        missed,
                        "subscriber lagged; asking for resync"
                    );
                    ServerMessage::Resync {
                        graph_id: graph_id.clone(),
                        missed,
                    }
                }
            };
            if out.send(message).await.is_err() {
                break;
            }
        }
    })
}
