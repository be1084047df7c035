//! Persistent connection to the sidekick relay.
//!
//! A writer task drains an unbounded frame queue into the socket; a reader
//! task routes relay frames. Resource updates go to the owning client through
//! a channel, channel events go straight to the subscription callbacks.
//! Callbacks run on the reader task and must not block.

use crate::error::{ClientError, Result};
use futures::{SinkExt, StreamExt};
use kite_core::{ChannelError, Params, RelayInbound, RelayOutbound, Topic};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Event delivered to a channel subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Subscribed,
    Message(Value),
    Unsubscribed,
    Error(ChannelError),
}

pub(crate) type ChannelCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;

struct Subscription {
    token: String,
    /// Order in which the subscribe frame was sent.
    seq: u64,
    confirmed: bool,
    callback: ChannelCallback,
}

#[derive(Default)]
struct Subscriptions {
    next_seq: AtomicU64,
    by_topic: Mutex<HashMap<Topic, Subscription>>,
}

impl Subscriptions {
    fn lock(&self) -> MutexGuard<'_, HashMap<Topic, Subscription>> {
        self.by_topic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn deliver(&self, topic: &Topic, event: ChannelEvent) {
        let callback = {
            let mut subs = self.lock();
            if event == ChannelEvent::Unsubscribed {
                subs.remove(topic).map(|sub| sub.callback)
            } else {
                subs.get_mut(topic).map(|sub| {
                    if event == ChannelEvent::Subscribed {
                        sub.confirmed = true;
                    }
                    sub.callback.clone()
                })
            }
        };
        match callback {
            Some(callback) => callback(event),
            None => debug!("Dropping relay event for {} with no subscriber", topic),
        }
    }

    /// Errors without a channel answer the oldest subscribe still waiting
    /// for confirmation. That subscription is dropped.
    fn deliver_detached(&self, error: ChannelError) {
        let failed = {
            let mut subs = self.lock();
            let oldest = subs
                .iter()
                .filter(|(_, sub)| !sub.confirmed)
                .min_by_key(|(_, sub)| sub.seq)
                .map(|(topic, _)| topic.clone());
            oldest.and_then(|topic| subs.remove(&topic))
        };
        match failed {
            Some(sub) => (sub.callback)(ChannelEvent::Error(error)),
            None => warn!("Relay error: {}", error.message),
        }
    }
}

pub(crate) struct RelaySession {
    outbound: Mutex<Option<mpsc::UnboundedSender<RelayInbound>>>,
    subscriptions: Arc<Subscriptions>,
    open: Arc<AtomicBool>,
}

impl RelaySession {
    /// Open the socket and start the reader and writer tasks.
    pub async fn connect(url: &str, updates: mpsc::UnboundedSender<String>) -> Result<Self> {
        let (socket, _) = connect_async(url).await.map_err(|e| ClientError::Relay {
            message: format!("failed to connect to {}: {}", url, e),
        })?;
        let (mut sink, mut stream) = socket.split();
        let (outbound, mut frames) = mpsc::unbounded_channel::<RelayInbound>();
        let open = Arc::new(AtomicBool::new(true));
        let subscriptions = Arc::new(Subscriptions::default());

        tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode relay frame: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        {
            let open = open.clone();
            let subscriptions = subscriptions.clone();
            tokio::spawn(async move {
                while let Some(message) = stream.next().await {
                    match message {
                        Ok(Message::Text(text)) => route(&text, &subscriptions, &updates),
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Relay connection error: {}", e);
                            break;
                        }
                    }
                }
                open.store(false, Ordering::SeqCst);
                debug!("Relay connection closed");
            });
        }

        debug!("Connected to relay at {}", url);
        Ok(Self {
            outbound: Mutex::new(Some(outbound)),
            subscriptions,
            open,
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .outbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .as_ref()
                .is_some_and(|tx| !tx.is_closed())
    }

    pub fn send(&self, frame: RelayInbound) -> Result<()> {
        let outbound = self.outbound.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = outbound.as_ref().ok_or_else(|| ClientError::Relay {
            message: "relay session closed".to_string(),
        })?;
        tx.send(frame).map_err(|_| ClientError::Relay {
            message: "relay session closed".to_string(),
        })
    }

    /// Subscribe with a connection token. A repeat with the same token for
    /// the same topic is a no-op and returns `false`.
    pub fn subscribe(
        &self,
        channel: &str,
        params: &Params,
        token: &str,
        callback: ChannelCallback,
    ) -> Result<bool> {
        let topic = Topic::channel(channel, params);
        {
            let mut subs = self.subscriptions.lock();
            if subs.get(&topic).is_some_and(|sub| sub.token == token) {
                return Ok(false);
            }
            let seq = self.subscriptions.next_seq.fetch_add(1, Ordering::SeqCst);
            subs.insert(
                topic,
                Subscription {
                    token: token.to_string(),
                    seq,
                    confirmed: false,
                    callback,
                },
            );
        }
        self.send(RelayInbound::Subscribe {
            token: token.to_string(),
        })?;
        Ok(true)
    }

    /// Ask the relay to end a subscription. The entry is dropped when the
    /// relay confirms.
    pub fn unsubscribe(&self, channel: &str, params: &Params, token: &str) -> Result<()> {
        let topic = Topic::channel(channel, params);
        let owned = self
            .subscriptions
            .lock()
            .get(&topic)
            .is_some_and(|sub| sub.token == token);
        if !owned {
            return Ok(());
        }
        self.send(RelayInbound::Unsubscribe {
            token: token.to_string(),
        })
    }

    /// Stop accepting frames. The writer flushes what is queued, then closes
    /// the socket.
    pub fn close(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.open.store(false, Ordering::SeqCst);
    }
}

fn route(text: &str, subscriptions: &Subscriptions, updates: &mpsc::UnboundedSender<String>) {
    let frame: RelayOutbound = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring malformed relay frame: {}", e);
            return;
        }
    };

    match frame {
        RelayOutbound::Updated { resource } => {
            let _ = updates.send(resource);
        }
        RelayOutbound::Listening { resources } | RelayOutbound::Unlistening { resources } => {
            debug!("Relay acknowledged {} resource(s)", resources.len());
        }
        RelayOutbound::Subscribed { channel, params } => {
            subscriptions.deliver(&Topic::channel(channel, &params), ChannelEvent::Subscribed)
        }
        RelayOutbound::Unsubscribed { channel, params } => {
            subscriptions.deliver(&Topic::channel(channel, &params), ChannelEvent::Unsubscribed)
        }
        RelayOutbound::Message {
            channel,
            params,
            data,
        } => subscriptions.deliver(&Topic::channel(channel, &params), ChannelEvent::Message(data)),
        RelayOutbound::Error { error } => {
            if error.channel.is_empty() {
                subscriptions.deliver_detached(error);
            } else {
                let topic = Topic::channel(error.channel.clone(), &error.params);
                subscriptions.deliver(&topic, ChannelEvent::Error(error));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_core::Fault;

    fn recorder() -> (ChannelCallback, Arc<Mutex<Vec<ChannelEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: ChannelCallback = Arc::new(move |event| sink.lock().unwrap().push(event));
        (callback, events)
    }

    fn room(id: &str) -> Params {
        let mut params = Params::new();
        params.insert("room".into(), id.into());
        params
    }

    fn insert(subs: &Subscriptions, params: &Params, token: &str, callback: ChannelCallback) {
        let seq = subs.next_seq.fetch_add(1, Ordering::SeqCst);
        subs.lock().insert(
            Topic::channel("chat", params),
            Subscription {
                token: token.into(),
                seq,
                confirmed: false,
                callback,
            },
        );
    }

    fn frame(value: serde_json::Value) -> String {
        value.to_string()
    }

    #[test]
    fn test_messages_reach_matching_subscriber() {
        let subs = Subscriptions::default();
        let (one, one_events) = recorder();
        let (two, two_events) = recorder();
        insert(&subs, &room("1"), "t1", one);
        insert(&subs, &room("2"), "t2", two);
        let (updates, _rx) = mpsc::unbounded_channel();

        route(
            &frame(serde_json::json!({
                "type": "message", "channel": "chat", "params": {"room": "1"}, "data": "hi"
            })),
            &subs,
            &updates,
        );

        assert_eq!(
            *one_events.lock().unwrap(),
            vec![ChannelEvent::Message(serde_json::json!("hi"))]
        );
        assert!(two_events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_detached_error_fails_oldest_pending_subscribe() {
        let subs = Subscriptions::default();
        let (first, first_events) = recorder();
        let (second, second_events) = recorder();
        insert(&subs, &room("1"), "t1", first);
        insert(&subs, &room("2"), "t2", second);
        let (updates, _rx) = mpsc::unbounded_channel();

        let error = ChannelError::detached(Fault::Sidekick, "Invalid or already-used token");
        route(
            &serde_json::to_string(&RelayOutbound::Error { error: error.clone() }).unwrap(),
            &subs,
            &updates,
        );

        assert_eq!(*first_events.lock().unwrap(), vec![ChannelEvent::Error(error)]);
        assert!(second_events.lock().unwrap().is_empty());
        assert_eq!(subs.lock().len(), 1);
    }

    #[test]
    fn test_unsubscribed_removes_subscription() {
        let subs = Subscriptions::default();
        let (callback, events) = recorder();
        insert(&subs, &room("1"), "t1", callback);
        let (updates, _rx) = mpsc::unbounded_channel();

        for kind in ["subscribed", "unsubscribed"] {
            route(
                &frame(serde_json::json!({"type": kind, "channel": "chat", "params": {"room": "1"}})),
                &subs,
                &updates,
            );
        }

        assert_eq!(
            *events.lock().unwrap(),
            vec![ChannelEvent::Subscribed, ChannelEvent::Unsubscribed]
        );
        assert!(subs.lock().is_empty());
    }

    #[tokio::test]
    async fn test_updates_are_forwarded() {
        let subs = Subscriptions::default();
        let (updates, mut rx) = mpsc::unbounded_channel();
        route(
            &frame(serde_json::json!({"type": "updated", "resource": "todo/1"})),
            &subs,
            &updates,
        );
        assert_eq!(rx.recv().await.as_deref(), Some("todo/1"));
    }
}
