//! Per-graph chat dispatch.
//!
//! Messages for one graph reach the agent strictly in arrival order, one at
//! a time: the next message is dispatched only after the in-flight one is
//! completed, either by the agent's inline reply or by an explicit
//! completion posted later. Graphs never wait on each other.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use super::protocol::{Event, Rejection};
use super::room::RoomRegistry;
use super::session::SessionContext;
use crate::agent::{AgentReply, ChatAgent};
use crate::models::ChatMessage;

/// FIFO with a single in-flight slot.
#[derive(Debug, Default)]
pub struct ChatQueue {
    pending: VecDeque<ChatMessage>,
    in_flight: Option<ChatMessage>,
}

impl ChatQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message. Returns it back if it should be dispatched now.
    pub fn enqueue(&mut self, message: ChatMessage) -> Option<ChatMessage> {
        if self.in_flight.is_none() {
            self.in_flight = Some(message.clone());
            Some(message)
        } else {
            self.pending.push_back(message);
            None
        }
    }

    /// Finish the in-flight message.
    ///
    /// Returns `None` (and changes nothing) if `message_id` is not in flight.
    /// Otherwise returns the message that should be dispatched next, if any.
    pub fn complete(&mut self, message_id: &str) -> Option<Option<ChatMessage>> {
        match &self.in_flight {
            Some(current) if current.id == message_id => {
                self.in_flight = self.pending.pop_front();
                Some(self.in_flight.clone())
            }
            _ => None,
        }
    }

    pub fn in_flight(&self) -> Option<&ChatMessage> {
        self.in_flight.as_ref()
    }

    /// Messages waiting behind the in-flight one.
    pub fn queued(&self) -> usize {
        self.pending.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }
}

/// Routes chat messages to the agent, one graph queue at a time.
pub struct ChatDispatcher {
    queues: Mutex<HashMap<String, ChatQueue>>,
    registry: Arc<RoomRegistry>,
    agent: Arc<dyn ChatAgent>,
}

impl ChatDispatcher {
    pub fn new(registry: Arc<RoomRegistry>, agent: Arc<dyn ChatAgent>) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            registry,
            agent,
        }
    }

    /// Announce a chat message to the room and queue it for the agent.
    pub async fn enqueue(
        self: &Arc<Self>,
        ctx: &SessionContext,
        graph_id: &str,
        text: &str,
    ) -> Result<ChatMessage, Rejection> {
        if text.trim().is_empty() {
            return Err(Rejection::invalid("chat message is empty"));
        }
        let not_joined = || Rejection::NotJoined {
            graph_id: graph_id.to_string(),
        };
        let room = self.registry.room(graph_id).await.ok_or_else(not_joined)?;

        let message = ChatMessage::new(
            graph_id.to_string(),
            ctx.participant().user_id.clone(),
            text.to_string(),
        );
        // Queue, then room, as in `complete`. Both stay held from the
        // broadcast through the enqueue.
        let dispatch_now = {
            let mut queues = self.queues.lock().await;
            let state = room.lock().await;
            if !state.is_member(ctx.session_id()) {
                return Err(not_joined());
            }
            room.bus().publish_all(
                Some(ctx.session_id()),
                Event::Chat {
                    message: message.clone(),
                },
            );

            let queue = queues.entry(graph_id.to_string()).or_default();
            let now = queue.enqueue(message.clone());
            tracing::debug!(
                graph_id,
                message_id = %message.id,
                queued = queue.queued(),
                "chat enqueued"
            );
            now
        };
        if let Some(next) = dispatch_now {
            self.dispatch(next);
        }
        Ok(message)
    }

    fn dispatch(self: &Arc<Self>, message: ChatMessage) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let graph_id = message.graph_id.clone();
            tracing::debug!(graph_id = %graph_id, message_id = %message.id, "chat dispatched");
            match this.agent.send_chat(&graph_id, &message).await {
                Ok(AgentReply::Completed(reply)) => {
                    this.complete(&graph_id, &message.id, Ok(reply)).await;
                }
                Ok(AgentReply::Pending) => {
                    tracing::debug!(graph_id = %graph_id, message_id = %message.id, "awaiting agent completion");
                }
                Err(e) => {
                    tracing::warn!(graph_id = %graph_id, message_id = %message.id, error = %e, "agent failed");
                    this.complete(&graph_id, &message.id, Err(e.to_string())).await;
                }
            }
        });
    }

    /// Complete the in-flight message of a graph and dispatch the next one.
    ///
    /// Returns `false` for a stale completion (wrong id or nothing in flight).
    pub async fn complete(
        self: &Arc<Self>,
        graph_id: &str,
        message_id: &str,
        outcome: std::result::Result<String, String>,
    ) -> bool {
        let next = {
            let mut queues = self.queues.lock().await;
            let Some(queue) = queues.get_mut(graph_id) else {
                tracing::debug!(graph_id, message_id, "stale chat completion ignored");
                return false;
            };
            let Some(next) = queue.complete(message_id) else {
                tracing::debug!(graph_id, message_id, "stale chat completion ignored");
                return false;
            };
            if queue.is_idle() {
                queues.remove(graph_id);
            }

            // Published under the queue lock so completions stay in order.
            if let Some(room) = self.registry.room(graph_id).await {
                let (reply, error) = match outcome {
                    Ok(reply) => (Some(reply), None),
                    Err(error) => (None, Some(error)),
                };
                let _state = room.lock().await;
                room.bus().publish_all(
                    None,
                    Event::ChatComplete {
                        message_id: message_id.to_string(),
                        reply,
                        error,
                    },
                );
            }
            next
        };

        if let Some(next) = next {
            self.dispatch(next);
        }
        true
    }

    /// `(in-flight message id, queued count)` for a graph.
    pub async fn status(&self, graph_id: &str) -> (Option<String>, usize) {
        let queues = self.queues.lock().await;
        match queues.get(graph_id) {
            Some(queue) => (queue.in_flight().map(|m| m.id.clone()), queue.queued()),
            None => (None, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::sync::bus::{Received, Subscription};
    use crate::test_utils::participant;
    use crate::Result;
    use async_trait::async_trait;
    use std::time::Duration;

    fn message(id: &str) -> ChatMessage {
        let mut m = ChatMessage::new("g-1".to_string(), "alice".to_string(), id.to_string());
        m.id = id.to_string();
        m
    }

    /// Agent that records dispatch order and always defers completion.
    #[derive(Default)]
    struct DeferringAgent {
        seen: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatAgent for DeferringAgent {
        async fn send_chat(&self, _graph_id: &str, message: &ChatMessage) -> Result<AgentReply> {
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(message.text.clone());
            }
            Ok(AgentReply::Pending)
        }
    }

    impl DeferringAgent {
        fn seen(&self) -> Vec<String> {
            self.seen.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    async fn next_completion(sub: &mut Subscription) -> Option<String> {
        loop {
            let received = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.ok()??;
            if let Received::Event(envelope) = received {
                if let Event::ChatComplete { reply, .. } = &envelope.event {
                    return reply.clone();
                }
            }
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[test]
    fn test_queue_single_flight_fifo() {
        let mut queue = ChatQueue::new();
        assert_eq!(queue.enqueue(message("m1")).map(|m| m.id), Some("m1".to_string()));
        assert!(queue.enqueue(message("m2")).is_none());
        assert!(queue.enqueue(message("m3")).is_none());
        assert_eq!(queue.queued(), 2);

        // Stale completions change nothing.
        assert!(queue.complete("m2").is_none());
        assert_eq!(queue.in_flight().map(|m| m.id.as_str()), Some("m1"));

        let next = queue.complete("m1").unwrap();
        assert_eq!(next.map(|m| m.id), Some("m2".to_string()));
        let next = queue.complete("m2").unwrap();
        assert_eq!(next.map(|m| m.id), Some("m3".to_string()));
        assert_eq!(queue.complete("m3"), Some(None));
        assert!(queue.is_idle());
        assert!(queue.complete("m3").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_waits_for_completion() {
        let registry = Arc::new(RoomRegistry::default());
        let agent = Arc::new(DeferringAgent::default());
        let dispatcher = Arc::new(ChatDispatcher::new(registry.clone(), agent.clone()));
        let alice = SessionContext::new(participant("alice"));
        let _joined = registry.join(&alice, "g-1").await;

        let first = dispatcher.enqueue(&alice, "g-1", "one").await.unwrap();
        dispatcher.enqueue(&alice, "g-1", "two").await.unwrap();
        dispatcher.enqueue(&alice, "g-1", "three").await.unwrap();
        settle().await;
        assert_eq!(agent.seen(), vec!["one".to_string()]);
        assert_eq!(dispatcher.status("g-1").await, (Some(first.id.clone()), 2));

        assert!(!dispatcher.complete("g-1", "bogus", Ok("x".to_string())).await);
        assert!(dispatcher.complete("g-1", &first.id, Ok("done".to_string())).await);
        settle().await;
        assert_eq!(agent.seen(), vec!["one".to_string(), "two".to_string()]);
        assert!(!dispatcher.complete("g-1", &first.id, Ok("again".to_string())).await);
    }

    #[tokio::test]
    async fn test_inline_replies_complete_in_order() {
        let registry = Arc::new(RoomRegistry::default());
        let dispatcher = Arc::new(ChatDispatcher::new(registry.clone(), Arc::new(EchoAgent)));
        let alice = SessionContext::new(participant("alice"));
        let mut joined = registry.join(&alice, "g-1").await;

        for text in ["a", "b", "c"] {
            dispatcher.enqueue(&alice, "g-1", text).await.unwrap();
        }
        let mut replies = Vec::new();
        for _ in 0..3 {
            replies.push(next_completion(&mut joined.subscription).await);
        }
        assert_eq!(
            replies,
            vec![
                Some("alice: a".to_string()),
                Some("alice: b".to_string()),
                Some("alice: c".to_string())
            ]
        );
        settle().await;
        assert_eq!(dispatcher.status("g-1").await, (None, 0));
    }

    #[tokio::test]
    async fn test_enqueue_requires_membership() {
        let registry = Arc::new(RoomRegistry::default());
        let dispatcher = Arc::new(ChatDispatcher::new(registry, Arc::new(EchoAgent)));
        let alice = SessionContext::new(participant("alice"));
        let result = dispatcher.enqueue(&alice, "g-1", "hi").await;
        assert!(matches!(result, Err(Rejection::NotJoined { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_senders_reach_agent_in_transcript_order() {
        let registry = Arc::new(RoomRegistry::default());
        let agent = Arc::new(DeferringAgent::default());
        let dispatcher = Arc::new(ChatDispatcher::new(registry.clone(), agent.clone()));
        let observer = SessionContext::new(participant("carol"));
        let mut transcript = registry.join(&observer, "g-1").await.subscription;

        let mut senders = Vec::new();
        for user in ["alice", "bob"] {
            let ctx = SessionContext::new(participant(user));
            let joined = registry.join(&ctx, "g-1").await;
            let dispatcher = Arc::clone(&dispatcher);
            senders.push(tokio::spawn(async move {
                let _joined = joined;
                for i in 0..20 {
                    dispatcher
                        .enqueue(&ctx, "g-1", &format!("{}-{}", user, i))
                        .await
                        .unwrap();
                }
            }));
        }
        for sender in senders {
            sender.await.unwrap();
        }

        let mut broadcast_order = Vec::new();
        while let Some(received) = transcript.try_recv() {
            if let Received::Event(envelope) = received {
                if let Event::Chat { message } = &envelope.event {
                    broadcast_order.push(message.id.clone());
                }
            }
        }
        assert_eq!(broadcast_order.len(), 40);

        let mut agent_order = Vec::new();
        while let (Some(id), _) = dispatcher.status("g-1").await {
            assert!(dispatcher.complete("g-1", &id, Ok(String::new())).await);
            agent_order.push(id);
        }
        assert_eq!(agent_order, broadcast_order);
    }
}
