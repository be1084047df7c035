//! Pub/sub broker owning every subscription, token and context table.
//!
//! Connection handlers only reach the tables through [`Broker`] methods. All
//! state sits behind one `RwLock`: fan-out takes the read lock and pushes
//! into per-connection [`OutboundQueue`]s without awaiting, so a slow client
//! never holds up delivery to the others.

use crate::error::{Result, SidekickError};
use crate::queue::OutboundQueue;
use kite_core::{
    matches, ChannelBroadcast, ChannelForward, ConnectionPayload, Params, RelayOutbound, Topic,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Connection ID (unique per client transport)
pub type ConnectionId = u64;

struct ConnectionEntry {
    queue: Arc<OutboundQueue>,
    topics: HashSet<String>,
}

struct PendingEntry {
    payload: ConnectionPayload,
    registered_at: Instant,
}

/// Redeemed token, bound to the connection that redeemed it.
struct UsedToken {
    connection_id: ConnectionId,
    channel: String,
    params: Params,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// topic key → subscribed connections
    topics: HashMap<String, HashSet<ConnectionId>>,
    pending: HashMap<String, PendingEntry>,
    used: HashMap<String, UsedToken>,
    contexts: HashMap<(ConnectionId, String), Value>,
}

impl BrokerState {
    fn add_subscription(&mut self, id: ConnectionId, topic: &str) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.topics.insert(topic.to_string());
            self.topics.entry(topic.to_string()).or_default().insert(id);
        }
    }

    fn remove_subscription(&mut self, id: ConnectionId, topic: &str) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.topics.remove(topic);
        }
        if let Some(subscribers) = self.topics.get_mut(topic) {
            subscribers.remove(&id);
            if subscribers.is_empty() {
                self.topics.remove(topic);
            }
        }
    }

    fn is_expired(entry: &PendingEntry, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| entry.registered_at.elapsed() >= ttl)
    }
}

/// Snapshot of broker counters, served on `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerStats {
    pub connections: usize,
    pub topics: usize,
    pub pending_tokens: usize,
    pub used_tokens: usize,
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

pub struct Broker {
    state: RwLock<BrokerState>,
    next_conn_id: AtomicU64,
    queue_capacity: usize,
    pending_ttl: Option<Duration>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

fn encode(frame: &RelayOutbound) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            error!("Failed to serialize relay frame: {}", e);
            None
        }
    }
}

impl Broker {
    /// `pending_ttl` of `None` keeps unredeemed tokens forever.
    pub fn new(queue_capacity: usize, pending_ttl: Option<Duration>) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(BrokerState::default()),
            next_conn_id: AtomicU64::new(1),
            queue_capacity,
            pending_ttl,
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        })
    }

    fn deliver(&self, queue: &OutboundQueue, frame: String) {
        if queue.push(frame) {
            self.frames_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Queue a frame for one connection.
    pub fn send_to(&self, queue: &OutboundQueue, frame: &RelayOutbound) {
        if let Some(text) = encode(frame) {
            self.deliver(queue, text);
        }
    }

    // ------------------------------------------------------------------------
    // Connection lifecycle
    // ------------------------------------------------------------------------

    pub async fn open_connection(&self) -> (ConnectionId, Arc<OutboundQueue>) {
        let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let queue = Arc::new(OutboundQueue::new(self.queue_capacity));

        let mut state = self.state.write().await;
        state.connections.insert(
            id,
            ConnectionEntry {
                queue: queue.clone(),
                topics: HashSet::new(),
            },
        );
        debug!(
            "Connection {} opened (active={})",
            id,
            state.connections.len()
        );

        (id, queue)
    }

    /// Drop every subscription, context and redeemed token of a connection.
    /// Pending tokens are left alone. Idempotent.
    pub async fn close_connection(&self, id: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(entry) = state.connections.remove(&id) else {
            return;
        };
        entry.queue.close();

        for topic in &entry.topics {
            if let Some(subscribers) = state.topics.get_mut(topic) {
                subscribers.remove(&id);
                if subscribers.is_empty() {
                    state.topics.remove(topic);
                }
            }
        }
        state.contexts.retain(|(owner, _), _| *owner != id);
        state.used.retain(|_, used| used.connection_id != id);

        debug!(
            "Connection {} closed (active={}, dropped={})",
            id,
            state.connections.len(),
            entry.queue.dropped()
        );
    }

    // ------------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------------

    pub async fn register_pending(&self, payload: ConnectionPayload) -> Result<()> {
        let mut state = self.state.write().await;
        if state.pending.contains_key(&payload.token) || state.used.contains_key(&payload.token) {
            return Err(SidekickError::DuplicateToken);
        }
        debug!("Pending connection registered for channel {}", payload.channel);
        state.pending.insert(
            payload.token.clone(),
            PendingEntry {
                payload,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Notify every connection listening on a tag matched by any pattern.
    /// Returns the number of `updated` frames queued.
    pub async fn publish_resources(&self, patterns: &[String]) -> usize {
        let state = self.state.read().await;
        let mut delivered = 0;

        for (key, subscribers) in &state.topics {
            let Some(tag) = Topic::resource_tag(key) else {
                continue;
            };
            if !patterns.iter().any(|pattern| matches(pattern, tag)) {
                continue;
            }
            let Some(frame) = encode(&RelayOutbound::Updated {
                resource: tag.to_string(),
            }) else {
                continue;
            };
            for id in subscribers {
                if let Some(entry) = state.connections.get(id) {
                    self.deliver(&entry.queue, frame.clone());
                    delivered += 1;
                }
            }
        }

        debug!(
            "Resource batch {:?} reached {} listener(s)",
            patterns, delivered
        );
        delivered
    }

    /// Deliver a broadcast to every subscriber of the exact `(channel, params)`
    /// topic. Returns the number of frames queued.
    pub async fn publish_message(&self, broadcast: ChannelBroadcast) -> usize {
        let key = Topic::channel(&broadcast.channel, &broadcast.params).key();
        let state = self.state.read().await;
        let Some(subscribers) = state.topics.get(&key) else {
            debug!("Broadcast on {} has no subscribers", key);
            return 0;
        };

        let Some(frame) = encode(&RelayOutbound::Message {
            channel: broadcast.channel,
            params: broadcast.params,
            data: broadcast.data,
        }) else {
            return 0;
        };

        let mut delivered = 0;
        for id in subscribers {
            if let Some(entry) = state.connections.get(id) {
                self.deliver(&entry.queue, frame.clone());
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove pending tokens older than the TTL. Returns how many were removed.
    pub async fn sweep_expired(&self) -> usize {
        let Some(ttl) = self.pending_ttl else {
            return 0;
        };
        let mut state = self.state.write().await;
        let before = state.pending.len();
        state
            .pending
            .retain(|_, entry| !BrokerState::is_expired(entry, Some(ttl)));
        before - state.pending.len()
    }

    // ------------------------------------------------------------------------
    // Client plane
    // ------------------------------------------------------------------------

    pub async fn listen(&self, id: ConnectionId, resources: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return Err(SidekickError::UnknownConnection(id));
        }
        for tag in resources {
            state.add_subscription(id, &Topic::resource(tag.as_str()).key());
        }
        Ok(())
    }

    pub async fn unlisten(&self, id: ConnectionId, resources: &[String]) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return Err(SidekickError::UnknownConnection(id));
        }
        for tag in resources {
            state.remove_subscription(id, &Topic::resource(tag.as_str()).key());
        }
        Ok(())
    }

    /// Redeem a pending token for `id`. Succeeds at most once per token.
    ///
    /// A connection holds one subscription per topic; a second token for a
    /// topic it is already subscribed to is refused and stays pending.
    pub async fn subscribe(&self, id: ConnectionId, token: &str) -> Result<(String, Params)> {
        let mut state = self.state.write().await;
        if !state.connections.contains_key(&id) {
            return Err(SidekickError::UnknownConnection(id));
        }

        if let Some(entry) = state.pending.get(token) {
            let topic = Topic::channel(&entry.payload.channel, &entry.payload.params).key();
            if state.contexts.contains_key(&(id, topic.clone())) {
                debug!("Connection {} is already subscribed to {}", id, topic);
                return Err(SidekickError::AlreadySubscribed { topic });
            }
        }

        let entry = state
            .pending
            .remove(token)
            .ok_or(SidekickError::InvalidToken)?;
        if BrokerState::is_expired(&entry, self.pending_ttl) {
            debug!("Connection {} presented an expired token", id);
            return Err(SidekickError::InvalidToken);
        }

        let ConnectionPayload {
            channel,
            params,
            context,
            ..
        } = entry.payload;
        let topic = Topic::channel(&channel, &params).key();

        state.add_subscription(id, &topic);
        state.contexts.insert((id, topic.clone()), context);
        state.used.insert(
            token.to_string(),
            UsedToken {
                connection_id: id,
                channel: channel.clone(),
                params: params.clone(),
            },
        );

        debug!("Connection {} subscribed to {}", id, topic);
        Ok((channel, params))
    }

    /// Drop the subscription redeemed with `token`. Repeating it is harmless.
    pub async fn unsubscribe(&self, id: ConnectionId, token: &str) -> Result<(String, Params)> {
        let mut state = self.state.write().await;
        let (channel, params) = match state.used.get(token) {
            Some(used) if used.connection_id == id => (used.channel.clone(), used.params.clone()),
            Some(_) => {
                warn!("Connection {} tried to unsubscribe a foreign token", id);
                return Err(SidekickError::InvalidToken);
            }
            None => return Err(SidekickError::InvalidToken),
        };

        let topic = Topic::channel(&channel, &params).key();
        state.remove_subscription(id, &topic);
        state.contexts.remove(&(id, topic));
        Ok((channel, params))
    }

    /// Authorize a client `send` and attach the connection context.
    ///
    /// A still-pending token uses the pending payload's context without
    /// touching subscription state. A redeemed token must belong to `id`.
    pub async fn resolve_send(
        &self,
        id: ConnectionId,
        token: &str,
        channel: &str,
        params: &Params,
        data: Value,
    ) -> Result<ChannelForward> {
        let state = self.state.read().await;

        if let Some(entry) = state.pending.get(token) {
            if BrokerState::is_expired(entry, self.pending_ttl) {
                return Err(SidekickError::InvalidToken);
            }
            let payload = &entry.payload;
            if payload.channel != channel || payload.params != *params {
                return Err(SidekickError::TokenMismatch {
                    expected: Topic::channel(&payload.channel, &payload.params).key(),
                    requested: Topic::channel(channel, params).key(),
                });
            }
            return Ok(ChannelForward {
                channel: channel.to_string(),
                params: params.clone(),
                data,
                context: payload.context.clone(),
            });
        }

        let used = state.used.get(token).ok_or(SidekickError::InvalidToken)?;
        if used.connection_id != id {
            warn!(
                "Connection {} tried to send with a token owned by connection {}",
                id, used.connection_id
            );
            return Err(SidekickError::InvalidToken);
        }
        if used.channel != channel || used.params != *params {
            return Err(SidekickError::TokenMismatch {
                expected: Topic::channel(&used.channel, &used.params).key(),
                requested: Topic::channel(channel, params).key(),
            });
        }

        let topic = Topic::channel(channel, params).key();
        let context = state
            .contexts
            .get(&(id, topic.clone()))
            .cloned()
            .ok_or(SidekickError::NotSubscribed { topic })?;

        Ok(ChannelForward {
            channel: channel.to_string(),
            params: params.clone(),
            data,
            context,
        })
    }

    pub async fn stats(&self) -> BrokerStats {
        let state = self.state.read().await;
        BrokerStats {
            connections: state.connections.len(),
            topics: state.topics.len(),
            pending_tokens: state.pending.len(),
            used_tokens: state.used.len(),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn payload(token: &str, room: &str) -> ConnectionPayload {
        ConnectionPayload {
            token: token.into(),
            channel: "chat".into(),
            params: params(&[("room", room)]),
            context: json!({"user": token}),
        }
    }

    async fn drain(queue: &OutboundQueue) -> Vec<RelayOutbound> {
        let mut frames = Vec::new();
        while !queue.is_empty() {
            let text = queue.recv().await.unwrap();
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn test_token_redeems_exactly_once() {
        let broker = Broker::new(16, None);
        let (a, _qa) = broker.open_connection().await;
        let (b, _qb) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();

        let (channel, p) = broker.subscribe(a, "t1").await.unwrap();
        assert_eq!(channel, "chat");
        assert_eq!(p, params(&[("room", "1")]));

        assert!(matches!(
            broker.subscribe(a, "t1").await,
            Err(SidekickError::InvalidToken)
        ));
        assert!(matches!(
            broker.subscribe(b, "t1").await,
            Err(SidekickError::InvalidToken)
        ));
        assert!(matches!(
            broker.subscribe(a, "never-issued").await,
            Err(SidekickError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_second_token_for_same_topic_is_refused() {
        let broker = Broker::new(16, None);
        let (id, _q) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();
        broker.register_pending(payload("t2", "1")).await.unwrap();
        broker.subscribe(id, "t1").await.unwrap();

        assert!(matches!(
            broker.subscribe(id, "t2").await,
            Err(SidekickError::AlreadySubscribed { .. })
        ));
        assert_eq!(broker.stats().await.pending_tokens, 1);

        let room = params(&[("room", "1")]);
        let forward = broker
            .resolve_send(id, "t1", "chat", &room, json!(1))
            .await
            .unwrap();
        assert_eq!(forward.context, json!({"user": "t1"}));

        // Once the first subscription ends, the second token redeems normally
        broker.unsubscribe(id, "t1").await.unwrap();
        broker.subscribe(id, "t2").await.unwrap();
        let forward = broker
            .resolve_send(id, "t2", "chat", &room, json!(1))
            .await
            .unwrap();
        assert_eq!(forward.context, json!({"user": "t2"}));
    }

    #[tokio::test]
    async fn test_send_with_stolen_token_is_rejected() {
        let broker = Broker::new(16, None);
        let (owner, _qo) = broker.open_connection().await;
        let (thief, _qt) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();
        broker.subscribe(owner, "t1").await.unwrap();

        let room = params(&[("room", "1")]);
        let forward = broker
            .resolve_send(owner, "t1", "chat", &room, json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(forward.context, json!({"user": "t1"}));

        assert!(matches!(
            broker
                .resolve_send(thief, "t1", "chat", &room, json!({"text": "hi"}))
                .await,
            Err(SidekickError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_send_before_subscribe_uses_pending_context() {
        let broker = Broker::new(16, None);
        let (id, _q) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();

        let forward = broker
            .resolve_send(id, "t1", "chat", &params(&[("room", "1")]), json!(1))
            .await
            .unwrap();
        assert_eq!(forward.context, json!({"user": "t1"}));

        // Still redeemable afterwards
        broker.subscribe(id, "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_must_match_token_channel_and_params() {
        let broker = Broker::new(16, None);
        let (id, _q) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();
        broker.subscribe(id, "t1").await.unwrap();

        let result = broker
            .resolve_send(id, "t1", "chat", &params(&[("room", "2")]), json!(1))
            .await;
        assert!(matches!(result, Err(SidekickError::TokenMismatch { .. })));
    }

    #[tokio::test]
    async fn test_params_isolate_broadcasts() {
        let broker = Broker::new(16, None);
        let (a, qa) = broker.open_connection().await;
        let (b, qb) = broker.open_connection().await;
        broker.register_pending(payload("ta", "1")).await.unwrap();
        broker.register_pending(payload("tb", "2")).await.unwrap();
        broker.subscribe(a, "ta").await.unwrap();
        broker.subscribe(b, "tb").await.unwrap();

        let delivered = broker
            .publish_message(ChannelBroadcast {
                channel: "chat".into(),
                params: params(&[("room", "1")]),
                data: json!("for room 1"),
            })
            .await;
        assert_eq!(delivered, 1);

        assert_eq!(
            drain(&qa).await,
            vec![RelayOutbound::Message {
                channel: "chat".into(),
                params: params(&[("room", "1")]),
                data: json!("for room 1"),
            }]
        );
        assert!(drain(&qb).await.is_empty());
    }

    #[tokio::test]
    async fn test_resource_fanout_uses_matcher() {
        let broker = Broker::new(16, None);
        let (a, qa) = broker.open_connection().await;
        let (b, qb) = broker.open_connection().await;
        broker
            .listen(a, &["todos/user/7".to_string()])
            .await
            .unwrap();
        broker.listen(b, &["todo/8".to_string()]).await.unwrap();

        let delivered = broker
            .publish_resources(&["todos/user/*".to_string(), "todo/7".to_string()])
            .await;
        assert_eq!(delivered, 1);
        assert_eq!(
            drain(&qa).await,
            vec![RelayOutbound::Updated {
                resource: "todos/user/7".into()
            }]
        );
        assert!(drain(&qb).await.is_empty());

        broker
            .unlisten(a, &["todos/user/7".to_string()])
            .await
            .unwrap();
        assert_eq!(broker.publish_resources(&["**".to_string()]).await, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_owner_only_and_idempotent() {
        let broker = Broker::new(16, None);
        let (owner, _qo) = broker.open_connection().await;
        let (other, _qx) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();
        broker.subscribe(owner, "t1").await.unwrap();

        assert!(broker.unsubscribe(other, "t1").await.is_err());
        broker.unsubscribe(owner, "t1").await.unwrap();
        broker.unsubscribe(owner, "t1").await.unwrap();

        assert_eq!(broker.stats().await.topics, 0);
        assert!(matches!(
            broker
                .resolve_send(owner, "t1", "chat", &params(&[("room", "1")]), json!(1))
                .await,
            Err(SidekickError::NotSubscribed { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_releases_everything_but_pending() {
        let broker = Broker::new(16, None);
        let (id, queue) = broker.open_connection().await;
        broker.register_pending(payload("t1", "1")).await.unwrap();
        broker.register_pending(payload("t2", "2")).await.unwrap();
        broker.subscribe(id, "t1").await.unwrap();
        broker.listen(id, &["todo/1".to_string()]).await.unwrap();

        broker.close_connection(id).await;
        broker.close_connection(id).await;

        let stats = broker.stats().await;
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.topics, 0);
        assert_eq!(stats.used_tokens, 0);
        assert_eq!(stats.pending_tokens, 1);
        assert_eq!(queue.recv().await, None);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let broker = Broker::new(16, None);
        broker.register_pending(payload("t1", "1")).await.unwrap();
        assert!(matches!(
            broker.register_pending(payload("t1", "1")).await,
            Err(SidekickError::DuplicateToken)
        ));
    }

    #[tokio::test]
    async fn test_expired_tokens_are_invalid_and_swept() {
        let broker = Broker::new(16, Some(Duration::from_millis(20)));
        let (id, _q) = broker.open_connection().await;
        broker.register_pending(payload("old", "1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        broker.register_pending(payload("fresh", "1")).await.unwrap();

        assert_eq!(broker.sweep_expired().await, 1);
        assert!(matches!(
            broker.subscribe(id, "old").await,
            Err(SidekickError::InvalidToken)
        ));
        broker.subscribe(id, "fresh").await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_client_drops_oldest() {
        let broker = Broker::new(2, None);
        let (id, queue) = broker.open_connection().await;
        broker.listen(id, &["feed".to_string()]).await.unwrap();
        for _ in 0..5 {
            broker.publish_resources(&["feed".to_string()]).await;
        }
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 3);
        assert_eq!(broker.stats().await.frames_dropped, 3);
    }
}
