//! WebSocket connection to a sync server with automatic reconnection.
//!
//! [`SyncClient`] joins one graph, keeps a [`Replica`] current, and re-joins
//! after every reconnect or resync so the replica is rebuilt from a fresh
//! snapshot rather than from a possibly incomplete event stream.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, connect_async};

use super::reconciler::{Reconcile, Replica};
use crate::models::{Participant, Position, Presence};
use crate::sync::{ClientMessage, LockInfo, Mutation, Rejection, ServerMessage};
use crate::{Error, Result};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Default reconnection attempts before giving up
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Maximum backoff duration in seconds
pub const MAX_BACKOFF_SECS: u64 = 8;

/// Keepalive ping interval
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Connection state
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Connected and joined
    Connected,
    /// Attempting to reconnect
    Reconnecting {
        attempt: u32,
        next_retry: Option<Instant>,
    },
    /// Gave up after too many failed attempts, or closed by the caller
    Disconnected,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn reconnect_attempt(&self) -> u32 {
        match self {
            ConnectionState::Reconnecting { attempt, .. } => *attempt,
            _ => 0,
        }
    }
}

/// Exponential backoff for a given attempt number
///
/// Attempt 1: 0 seconds (immediate)
/// Attempt 2: 1 second
/// Attempt 3: 2 seconds
/// Attempt 4: 4 seconds
/// Attempt 5+: 8 seconds (max)
pub fn calculate_backoff(attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = attempt - 2;
    let secs = if exponent >= 63 {
        MAX_BACKOFF_SECS
    } else {
        2u64.pow(exponent).min(MAX_BACKOFF_SECS)
    };
    Duration::from_secs(secs)
}

/// Where to connect and who to be.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// WebSocket URL, e.g. `ws://127.0.0.1:3055/ws`
    pub url: String,
    pub graph_id: String,
    pub participant: Participant,
    pub max_attempts: u32,
}

impl ClientOptions {
    pub fn new(url: &str, graph_id: &str, participant: Participant) -> Self {
        Self {
            url: url.to_string(),
            graph_id: graph_id.to_string(),
            participant,
            max_attempts: MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Requests the caller can issue while the client runs.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    Mutate(Mutation),
    Lock(String),
    Unlock(String),
    Cursor(Position),
    Chat(String),
    Layout,
}

/// What the client reports back while it runs.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientUpdate {
    State(ConnectionState),
    /// A fresh snapshot was loaded.
    Synced { nodes: usize, edges: usize },
    /// A room event changed the replica.
    Changed { kind: String },
    /// A request was refused, locally or by the server.
    Rejected { kind: String, reason: String },
}

/// Outcome of one connection.
enum Exit {
    /// The caller dropped its command sender.
    Closed,
    /// The connection failed after a successful join.
    Dropped(Error),
}

/// Long-lived client for one graph.
pub struct SyncClient {
    options: ClientOptions,
    replica: Replica,
    state: ConnectionState,
    updates: mpsc::UnboundedSender<ClientUpdate>,
    /// Roster and locks from `joined`, waiting for the matching snapshot
    pending_join: Option<(Vec<Presence>, Vec<LockInfo>)>,
}

impl SyncClient {
    pub fn new(options: ClientOptions, updates: mpsc::UnboundedSender<ClientUpdate>) -> Self {
        let replica = Replica::new(&options.graph_id);
        Self {
            options,
            replica,
            state: ConnectionState::Reconnecting {
                attempt: 1,
                next_retry: None,
            },
            updates,
            pending_join: None,
        }
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            self.state = state.clone();
            let _ = self.updates.send(ClientUpdate::State(state));
        }
    }

    fn emit(&self, update: ClientUpdate) {
        let _ = self.updates.send(update);
    }

    /// Run until the command sender is dropped or reconnection gives up.
    pub async fn run(&mut self, mut commands: mpsc::UnboundedReceiver<ClientCommand>) -> Result<()> {
        let mut attempt = 1;
        loop {
            let delay = calculate_backoff(attempt);
            self.set_state(ConnectionState::Reconnecting {
                attempt,
                next_retry: Some(Instant::now() + delay),
            });
            tokio::time::sleep(delay).await;

            match self.connect_and_run(&mut commands).await {
                Ok(Exit::Closed) => {
                    tracing::info!(graph_id = %self.options.graph_id, "client closed");
                    self.set_state(ConnectionState::Disconnected);
                    return Ok(());
                }
                Ok(Exit::Dropped(e)) => {
                    tracing::warn!(graph_id = %self.options.graph_id, error = %e, "connection dropped");
                    attempt = 1;
                }
                Err(e) => {
                    tracing::warn!(
                        graph_id = %self.options.graph_id,
                        attempt,
                        error = %e,
                        "connection attempt failed"
                    );
                    attempt += 1;
                    if attempt > self.options.max_attempts {
                        self.set_state(ConnectionState::Disconnected);
                        return Err(Error::Other(format!(
                            "gave up connecting to {} after {} attempts",
                            self.options.url, self.options.max_attempts
                        )));
                    }
                }
            }
        }
    }

    fn join_message(&self) -> ClientMessage {
        let participant = &self.options.participant;
        ClientMessage::Join {
            graph_id: self.options.graph_id.clone(),
            user_id: participant.user_id.clone(),
            display_name: Some(participant.display_name.clone()),
            color: participant.color.clone(),
        }
    }

    /// Connect, join and pump messages.
    ///
    /// Errors before the first snapshot count as failed attempts; once
    /// synced, a failure is reported as [`Exit::Dropped`].
    async fn connect_and_run(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<ClientCommand>,
    ) -> Result<Exit> {
        tracing::debug!(url = %self.options.url, "connecting");
        let (ws_stream, _response) = connect_async(self.options.url.as_str())
            .await
            .map_err(|e| Error::Other(format!("connect to {} failed: {}", self.options.url, e)))?;
        let (mut write, mut read): (
            futures::stream::SplitSink<WsStream, Message>,
            futures::stream::SplitStream<WsStream>,
        ) = ws_stream.split();

        send(&mut write, &self.join_message()).await?;
        self.pending_join = None;

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        let mut synced = false;

        let failure = loop {
            tokio::select! {
                msg = read.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            if let Err(e) = write.send(Message::Pong(data)).await {
                                break Error::Other(format!("WebSocket error: {}", e));
                            }
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            break Error::Other("server closed connection".to_string());
                        }
                        Some(Err(e)) => break Error::Other(format!("WebSocket error: {}", e)),
                        Some(Ok(_)) => continue,
                    };
                    let message = match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(message) => message,
                        Err(e) => {
                            tracing::warn!(error = %e, "unparseable server message");
                            continue;
                        }
                    };
                    if let Some(rejoin) = self.handle_server_message(message, &mut synced) {
                        if let Err(e) = send(&mut write, &rejoin).await {
                            break e;
                        }
                    }
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        let leave = ClientMessage::Leave { graph_id: self.options.graph_id.clone() };
                        let _ = send(&mut write, &leave).await;
                        let _ = write.close().await;
                        return Ok(Exit::Closed);
                    };
                    if let Some(outgoing) = self.prepare_command(command) {
                        if let Err(e) = send(&mut write, &outgoing).await {
                            break e;
                        }
                    }
                }

                _ = ping.tick() => {
                    if let Err(e) = send(&mut write, &ClientMessage::Ping).await {
                        break e;
                    }
                }
            }
        };

        if synced {
            Ok(Exit::Dropped(failure))
        } else {
            Err(failure)
        }
    }

    /// Apply one server message. Returns a join request when the replica
    /// must be rebuilt.
    fn handle_server_message(&mut self, message: ServerMessage, synced: &mut bool) -> Option<ClientMessage> {
        let graph_id = self.options.graph_id.clone();
        match message {
            ServerMessage::Welcome { session_id } => {
                self.replica
                    .set_identity(session_id, &self.options.participant.color);
            }
            ServerMessage::Joined {
                graph_id: joined,
                session_id,
                roster,
                locks,
            } if joined == graph_id => {
                self.replica
                    .set_identity(session_id, &self.options.participant.color);
                self.pending_join = Some((roster, locks));
            }
            ServerMessage::Snapshot {
                graph_id: snap,
                snapshot,
            } if snap == graph_id => {
                let (roster, locks) = self.pending_join.take().unwrap_or_default();
                let nodes = snapshot.nodes.len();
                let edges = snapshot.edges.len();
                self.replica.load_snapshot(*snapshot, roster, locks);
                *synced = true;
                self.set_state(ConnectionState::Connected);
                self.emit(ClientUpdate::Synced { nodes, edges });
            }
            ServerMessage::Event {
                graph_id: room,
                origin,
                event,
            } if room == graph_id => {
                if self.replica.apply_remote(origin, &event) {
                    self.emit(ClientUpdate::Changed {
                        kind: event.kind().to_string(),
                    });
                }
            }
            ServerMessage::Ack { kind, target, .. } => {
                self.replica.on_ack(&kind, target.as_deref());
            }
            ServerMessage::Rejected {
                kind, rejection, ..
            } => {
                self.emit(ClientUpdate::Rejected {
                    kind: kind.clone(),
                    reason: rejection.to_string(),
                });
                if matches!(rejection, Rejection::UnknownGraph { .. }) && kind == "join" {
                    tracing::warn!(graph_id = %graph_id, "server does not know this graph");
                    return None;
                }
                if self.replica.on_rejected(&kind, &rejection) == Reconcile::Resync {
                    return Some(self.join_message());
                }
            }
            ServerMessage::Resync { missed, .. } => {
                tracing::info!(graph_id = %graph_id, missed, "fell behind; re-joining");
                return Some(self.join_message());
            }
            ServerMessage::Error { message } => {
                tracing::warn!(graph_id = %graph_id, error = %message, "server error");
            }
            _ => {}
        }
        None
    }

    /// Turn a caller command into a wire message, applying edits locally.
    fn prepare_command(&mut self, command: ClientCommand) -> Option<ClientMessage> {
        let graph_id = self.options.graph_id.clone();
        let message = match command {
            ClientCommand::Mutate(mutation) => {
                let kind = mutation.kind();
                match self.replica.apply_local(mutation) {
                    Ok(mutation) => ClientMessage::Mutate { graph_id, mutation },
                    Err(e) => {
                        self.emit(ClientUpdate::Rejected {
                            kind: kind.to_string(),
                            reason: e.to_string(),
                        });
                        return None;
                    }
                }
            }
            ClientCommand::Lock(node_id) => {
                if let Err(e) = self.replica.check_lock(&node_id) {
                    self.emit(ClientUpdate::Rejected {
                        kind: "lock".to_string(),
                        reason: e.to_string(),
                    });
                    return None;
                }
                ClientMessage::Lock { graph_id, node_id }
            }
            ClientCommand::Unlock(node_id) => ClientMessage::Unlock { graph_id, node_id },
            ClientCommand::Cursor(position) => ClientMessage::Cursor { graph_id, position },
            ClientCommand::Chat(text) => ClientMessage::Chat { graph_id, text },
            ClientCommand::Layout => ClientMessage::Layout { graph_id },
        };
        Some(message)
    }
}

async fn send(
    write: &mut futures::stream::SplitSink<WsStream, Message>,
    message: &ClientMessage,
) -> Result<()> {
    let json = serde_json::to_string(message)?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| Error::Other(format!("WebSocket send failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionId;
    use crate::sync::Event;
    use crate::test_utils::{node, participant, GRAPH};

    #[test]
    fn test_backoff_attempt_1_immediate() {
        assert_eq!(calculate_backoff(0), Duration::ZERO);
        assert_eq!(calculate_backoff(1), Duration::ZERO);
    }

    #[test]
    fn test_backoff_exponential() {
        assert_eq!(calculate_backoff(2), Duration::from_secs(1));
        assert_eq!(calculate_backoff(3), Duration::from_secs(2));
        assert_eq!(calculate_backoff(4), Duration::from_secs(4));
        assert_eq!(calculate_backoff(5), Duration::from_secs(8));
    }

    #[test]
    fn test_backoff_capped() {
        assert_eq!(calculate_backoff(10), Duration::from_secs(MAX_BACKOFF_SECS));
        assert_eq!(calculate_backoff(u32::MAX), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_connection_state_helpers() {
        assert!(ConnectionState::Connected.is_connected());
        let state = ConnectionState::Reconnecting {
            attempt: 3,
            next_retry: None,
        };
        assert!(!state.is_connected());
        assert_eq!(state.reconnect_attempt(), 3);
        assert_eq!(ConnectionState::Disconnected.reconnect_attempt(), 0);
    }

    fn client() -> (SyncClient, mpsc::UnboundedReceiver<ClientUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let options = ClientOptions::new("ws://127.0.0.1:9/ws", GRAPH, participant("alice"));
        (SyncClient::new(options, tx), rx)
    }

    fn snapshot_message() -> ServerMessage {
        let mut snapshot = crate::models::GraphSnapshot::empty(crate::models::Graph::new(
            GRAPH.to_string(),
            "Test".to_string(),
            "alice".to_string(),
        ));
        snapshot.nodes.push(node("n1", 0.0, 0.0));
        ServerMessage::Snapshot {
            graph_id: GRAPH.to_string(),
            snapshot: Box::new(snapshot),
        }
    }

    #[test]
    fn test_snapshot_marks_synced() {
        let (mut client, mut updates) = client();
        let mut synced = false;
        let me = SessionId::new();
        client.handle_server_message(ServerMessage::Welcome { session_id: me }, &mut synced);
        client.handle_server_message(snapshot_message(), &mut synced);

        assert!(synced);
        assert!(client.state().is_connected());
        assert_eq!(client.replica().session(), Some(me));
        let mut seen = Vec::new();
        while let Ok(update) = updates.try_recv() {
            seen.push(update);
        }
        assert!(seen.contains(&ClientUpdate::Synced { nodes: 1, edges: 0 }));
    }

    #[test]
    fn test_resync_requests_rejoin() {
        let (mut client, _updates) = client();
        let mut synced = true;
        let rejoin = client.handle_server_message(
            ServerMessage::Resync {
                graph_id: GRAPH.to_string(),
                missed: 12,
            },
            &mut synced,
        );
        assert!(matches!(rejoin, Some(ClientMessage::Join { .. })));
    }

    #[test]
    fn test_locked_node_edit_not_sent() {
        let (mut client, mut updates) = client();
        let mut synced = false;
        client.handle_server_message(snapshot_message(), &mut synced);
        let other = SessionId::new();
        client.handle_server_message(
            ServerMessage::Event {
                graph_id: GRAPH.to_string(),
                origin: Some(other),
                event: Event::LockNode {
                    node_id: "n1".to_string(),
                    holder: other,
                    color: "#0f0".to_string(),
                },
            },
            &mut synced,
        );

        let outgoing = client.prepare_command(ClientCommand::Mutate(Mutation::MoveNode {
            node: node("n1", 3.0, 3.0),
        }));
        assert!(outgoing.is_none());
        let mut rejected = false;
        while let Ok(update) = updates.try_recv() {
            rejected |= matches!(update, ClientUpdate::Rejected { .. });
        }
        assert!(rejected);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut options = ClientOptions::new("ws://127.0.0.1:9/ws", GRAPH, participant("alice"));
        options.max_attempts = 1;
        let mut client = SyncClient::new(options, tx);
        let (_commands_tx, commands_rx) = mpsc::unbounded_channel();
        let result = client.run(commands_rx).await;
        assert!(result.is_err());
        assert_eq!(client.state(), &ConnectionState::Disconnected);
    }
}
