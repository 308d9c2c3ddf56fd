//! Integration tests for the HTTP and WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use cograph::agent::EchoAgent;
use cograph::client::{ClientCommand, ClientOptions, ClientUpdate, SyncClient};
use cograph::models::{Graph, Node, Participant, Position};
use cograph::server;
use cograph::storage::{GraphStore, Storage};
use cograph::sync::{
    ClientMessage, Event, HubSettings, Mutation, Rejection, ServerMessage, SyncHub,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

const GRAPH: &str = "g-ws";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running server that stops when dropped.
struct TestServer {
    addr: SocketAddr,
    _shutdown: oneshot::Sender<()>,
}

async fn start() -> TestServer {
    let mut storage = Storage::open_in_memory().unwrap();
    storage
        .create_graph(&Graph::new(GRAPH.to_string(), "WS".to_string(), "alice".to_string()))
        .unwrap();
    let hub = SyncHub::new(
        storage.into_shared(),
        Arc::new(EchoAgent),
        HubSettings {
            layout: None,
            ..HubSettings::default()
        },
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, hub, async move {
        let _ = rx.await;
    }));
    TestServer {
        addr,
        _shutdown: tx,
    }
}

async fn connect(server: &TestServer) -> Ws {
    let (ws, _) = connect_async(format!("ws://{}/ws", server.addr)).await.unwrap();
    ws
}

async fn send(ws: &mut Ws, message: &ClientMessage) {
    let text = serde_json::to_string(message).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
}

async fn recv(ws: &mut Ws) -> ServerMessage {
    let wait = async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {:?}", other),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .expect("timed out waiting for server message")
}

/// Receive until `pick` accepts a message, returning everything skipped too.
async fn recv_until<T>(
    ws: &mut Ws,
    mut pick: impl FnMut(&ServerMessage) -> Option<T>,
) -> (T, Vec<ServerMessage>) {
    let mut skipped = Vec::new();
    loop {
        let message = recv(ws).await;
        if let Some(found) = pick(&message) {
            return (found, skipped);
        }
        skipped.push(message);
    }
}

fn join(user_id: &str) -> ClientMessage {
    ClientMessage::Join {
        graph_id: GRAPH.to_string(),
        user_id: user_id.to_string(),
        display_name: None,
        color: "#336699".to_string(),
    }
}

fn node(id: &str, x: f64, y: f64) -> Node {
    Node::new(
        id.to_string(),
        GRAPH.to_string(),
        "concept".to_string(),
        Position::new(x, y),
    )
}

/// Connect and join, consuming welcome, joined and snapshot.
async fn joined_client(server: &TestServer, user_id: &str) -> Ws {
    let mut ws = connect(server).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Welcome { .. }));
    send(&mut ws, &join(user_id)).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Joined { .. }));
    assert!(matches!(recv(&mut ws).await, ServerMessage::Snapshot { .. }));
    ws
}

#[tokio::test]
async fn test_join_sequence() {
    let server = start().await;
    let mut ws = connect(&server).await;

    let session_id = match recv(&mut ws).await {
        ServerMessage::Welcome { session_id } => session_id,
        other => panic!("expected welcome, got {:?}", other),
    };

    send(&mut ws, &join("alice")).await;
    match recv(&mut ws).await {
        ServerMessage::Joined {
            graph_id,
            session_id: joined_as,
            roster,
            locks,
        } => {
            assert_eq!(graph_id, GRAPH);
            assert_eq!(joined_as, session_id);
            assert_eq!(roster.len(), 1);
            assert_eq!(roster[0].user_id, "alice");
            assert!(locks.is_empty());
        }
        other => panic!("expected joined, got {:?}", other),
    }
    match recv(&mut ws).await {
        ServerMessage::Snapshot { snapshot, .. } => {
            assert_eq!(snapshot.graph.id, GRAPH);
            assert!(snapshot.nodes.is_empty());
        }
        other => panic!("expected snapshot, got {:?}", other),
    }
}

#[tokio::test]
async fn test_mutation_fans_out_without_echo() {
    let server = start().await;
    let mut alice = joined_client(&server, "alice").await;
    let mut bob = joined_client(&server, "bob").await;

    send(
        &mut alice,
        &ClientMessage::Mutate {
            graph_id: GRAPH.to_string(),
            mutation: Mutation::AddNode {
                node: node("n1", 1.0, 2.0),
            },
        },
    )
    .await;

    let (target, _) = recv_until(&mut alice, |m| match m {
        ServerMessage::Ack { kind, target, .. } if kind == "add_node" => Some(target.clone()),
        _ => None,
    })
    .await;
    assert_eq!(target.as_deref(), Some("n1"));

    let (node_id, _) = recv_until(&mut bob, |m| match m {
        ServerMessage::Event {
            event: Event::AddNode { node },
            origin,
            ..
        } => {
            assert!(origin.is_some());
            Some(node.id.clone())
        }
        _ => None,
    })
    .await;
    assert_eq!(node_id, "n1");

    send(&mut alice, &ClientMessage::Ping).await;
    let (_, skipped) = recv_until(&mut alice, |m| matches!(m, ServerMessage::Pong).then_some(())).await;
    assert!(!skipped.iter().any(|m| matches!(
        m,
        ServerMessage::Event {
            event: Event::AddNode { .. },
            ..
        }
    )));
}

#[tokio::test]
async fn test_locked_node_rejected_for_other_session() {
    let server = start().await;
    let mut alice = joined_client(&server, "alice").await;
    let mut bob = joined_client(&server, "bob").await;

    send(
        &mut alice,
        &ClientMessage::Mutate {
            graph_id: GRAPH.to_string(),
            mutation: Mutation::AddNode {
                node: node("n1", 0.0, 0.0),
            },
        },
    )
    .await;
    send(
        &mut alice,
        &ClientMessage::Lock {
            graph_id: GRAPH.to_string(),
            node_id: "n1".to_string(),
        },
    )
    .await;
    recv_until(&mut alice, |m| match m {
        ServerMessage::Ack { kind, .. } if kind == "lock" => Some(()),
        _ => None,
    })
    .await;

    // Bob sees the lock before trying to move.
    recv_until(&mut bob, |m| match m {
        ServerMessage::Event {
            event: Event::LockNode { node_id, .. },
            ..
        } if node_id == "n1" => Some(()),
        _ => None,
    })
    .await;

    send(
        &mut bob,
        &ClientMessage::Mutate {
            graph_id: GRAPH.to_string(),
            mutation: Mutation::MoveNode {
                node: node("n1", 9.0, 9.0),
            },
        },
    )
    .await;
    let (rejection, _) = recv_until(&mut bob, |m| match m {
        ServerMessage::Rejected {
            kind, rejection, ..
        } if kind == "move_node" => Some(rejection.clone()),
        _ => None,
    })
    .await;
    assert!(matches!(rejection, Rejection::LockHeld { ref node_id, .. } if node_id == "n1"));
}

#[tokio::test]
async fn test_join_unknown_graph_rejected() {
    let server = start().await;
    let mut ws = connect(&server).await;
    recv(&mut ws).await;

    send(
        &mut ws,
        &ClientMessage::Join {
            graph_id: "g-missing".to_string(),
            user_id: "alice".to_string(),
            display_name: None,
            color: "#000000".to_string(),
        },
    )
    .await;
    match recv(&mut ws).await {
        ServerMessage::Rejected {
            kind, rejection, ..
        } => {
            assert_eq!(kind, "join");
            assert!(matches!(rejection, Rejection::UnknownGraph { .. }));
        }
        other => panic!("expected rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_garbage_message_reports_error() {
    let server = start().await;
    let mut ws = connect(&server).await;
    recv(&mut ws).await;

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    assert!(matches!(recv(&mut ws).await, ServerMessage::Error { .. }));

    send(&mut ws, &ClientMessage::Ping).await;
    assert!(matches!(recv(&mut ws).await, ServerMessage::Pong));
}

#[tokio::test]
async fn test_rest_create_and_fetch_graph() {
    let server = start().await;
    let base = format!("http://{}", server.addr);
    let client = reqwest::Client::new();

    let health: serde_json::Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let response = client
        .post(format!("{}/api/graphs", base))
        .json(&serde_json::json!({ "title": "From REST", "creator": "carol" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let created: serde_json::Value = response.json().await.unwrap();
    let id = created["graph"]["id"].as_str().unwrap().to_string();

    let fetched: serde_json::Value = client
        .get(format!("{}/api/graphs/{}", base, id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["graph"]["title"], "From REST");

    let missing = client
        .get(format!("{}/api/graphs/g-missing", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sync_client_publishes_local_edits() {
    let server = start().await;
    let mut observer = joined_client(&server, "observer").await;

    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();
    let participant = Participant {
        user_id: "dana".to_string(),
        display_name: "Dana".to_string(),
        color: "#00aa00".to_string(),
    };
    let options = ClientOptions::new(&format!("ws://{}/ws", server.addr), GRAPH, participant);
    let mut client = SyncClient::new(options, updates_tx);
    let task = tokio::spawn(async move {
        let result = client.run(commands_rx).await;
        (client, result)
    });

    let synced = async {
        while let Some(update) = updates_rx.recv().await {
            if matches!(update, ClientUpdate::Synced { .. }) {
                return;
            }
        }
        panic!("client stopped before syncing");
    };
    tokio::time::timeout(Duration::from_secs(10), synced)
        .await
        .expect("client never synced");

    commands_tx
        .send(ClientCommand::Mutate(Mutation::AddNode {
            node: node("c1", 3.0, 4.0),
        }))
        .unwrap();
    recv_until(&mut observer, |m| match m {
        ServerMessage::Event {
            event: Event::AddNode { node },
            ..
        } if node.id == "c1" => Some(()),
        _ => None,
    })
    .await;

    drop(commands_tx);
    let (client, result) = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("client did not stop")
        .unwrap();
    result.unwrap();
    assert_eq!(
        client.replica().node("c1").map(|n| n.position),
        Some(Position::new(3.0, 4.0))
    );
}
