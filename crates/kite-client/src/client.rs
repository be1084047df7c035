//! Procedure calls, live queries and channel connections.
//!
//! Every call returns a value; server errors come back as [`ClientError`]s.
//! Listeners hold the resource tags of their last call and are refreshed
//! when a local mutation or a relay `updated` frame matches one of them.

use crate::error::{ClientError, Result};
use crate::listeners::{ListenerId, ListenerTable, Refresh};
use crate::session::{ChannelEvent, RelaySession};
use futures::future::join_all;
use futures::FutureExt;
use kite_core::{
    ConnectRequest, ConnectResponse, ConnectResult, NetworkConfig, Params, ProcedureRequest,
    ProcedureResponse, RelayInbound,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the procedure server, e.g. `http://127.0.0.1:8080`.
    pub server_url: String,
    /// WebSocket URL of the relay, e.g. `ws://127.0.0.1:7890/ws`.
    pub sidekick_url: Option<String>,
    pub timeout: Duration,
    /// Sent with every HTTP request; the server derives its context from them.
    pub headers: Vec<(String, String)>,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            sidekick_url: None,
            timeout: NetworkConfig::REQUEST_TIMEOUT,
            headers: Vec::new(),
        }
    }

    pub fn with_sidekick(mut self, url: impl Into<String>) -> Self {
        self.sidekick_url = Some(url.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Successful call result.
#[derive(Debug, Clone, PartialEq)]
pub struct Output<O> {
    pub data: O,
    pub resources: Vec<String>,
}

struct Inner {
    http: reqwest::Client,
    config: ClientConfig,
    listeners: Mutex<ListenerTable>,
    session: tokio::sync::Mutex<Option<Arc<RelaySession>>>,
}

/// Handle to a procedure server and, optionally, its relay. Cheap to clone.
#[derive(Clone)]
pub struct KiteClient {
    inner: Arc<Inner>,
}

impl fmt::Debug for KiteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KiteClient")
            .field("server_url", &self.inner.config.server_url)
            .field("sidekick_url", &self.inner.config.sidekick_url)
            .finish()
    }
}

impl KiteClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()?;
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                config,
                listeners: Mutex::new(ListenerTable::default()),
                session: tokio::sync::Mutex::new(None),
            }),
        })
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerTable> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        let url = format!(
            "{}{}",
            self.inner.config.server_url.trim_end_matches('/'),
            path
        );
        self.inner
            .config
            .headers
            .iter()
            .fold(self.inner.http.post(url), |request, (name, value)| {
                request.header(name.as_str(), value.as_str())
            })
    }

    async fn post_json<B: Serialize, R: DeserializeOwned>(&self, path: &str, body: &B) -> Result<R> {
        let response = self.post(path).json(body).send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Network {
            message: format!("unexpected response from {} (HTTP {}): {}", path, status, e),
            source: None,
        })
    }

    /// Call a procedure and return the wire response untouched.
    pub async fn call_raw(&self, procedure: &str, inputs: Value) -> Result<ProcedureResponse> {
        self.post_json("/rpc", &ProcedureRequest::new(procedure, inputs))
            .await
    }

    async fn call_value<O: DeserializeOwned>(&self, procedure: &str, inputs: Value) -> Result<Output<O>> {
        decode(self.call_raw(procedure, inputs).await?)
    }

    pub async fn query<I, O>(&self, procedure: &str, input: &I) -> Result<Output<O>>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        self.call_value(procedure, serde_json::to_value(input)?)
            .await
    }

    /// Call a mutation, then refresh every local listener its resources hit.
    /// Resolves after those refreshes finish.
    pub async fn mutate<I, O>(&self, procedure: &str, input: &I) -> Result<Output<O>>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let response = self
            .call_raw(procedure, serde_json::to_value(input)?)
            .await?;
        if let ProcedureResponse::Ok { resources, .. } = &response {
            self.invalidate(resources).await;
        }
        decode(response)
    }

    /// Refresh every listener holding a tag matched by one of `patterns`.
    pub async fn invalidate(&self, patterns: &[String]) {
        if patterns.is_empty() {
            return;
        }
        let refreshes = self.listeners().matching(patterns);
        if refreshes.is_empty() {
            return;
        }
        debug!("Refreshing {} listener(s)", refreshes.len());
        join_all(refreshes.iter().map(|refresh| refresh())).await;
    }

    /// Call `procedure` now and again whenever its resources are invalidated
    /// locally. `callback` receives the first result before this returns.
    pub async fn listen<I, O, F>(&self, procedure: &str, input: &I, callback: F) -> Result<ListenHandle>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
        F: Fn(Result<O>) + Send + Sync + 'static,
    {
        let (handle, _) = self.register(procedure, input, callback, false).await?;
        Ok(handle)
    }

    /// Like [`listen`](Self::listen), and also asks the relay for updates
    /// published by other clients' mutations.
    pub async fn remote_listen<I, O, F>(
        &self,
        procedure: &str,
        input: &I,
        callback: F,
    ) -> Result<ListenHandle>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
        F: Fn(Result<O>) + Send + Sync + 'static,
    {
        let session = self.session().await?;
        let (handle, tags) = self.register(procedure, input, callback, true).await?;
        if !tags.is_empty() {
            if let Err(e) = session.send(RelayInbound::Listen { resources: tags }) {
                handle.unsubscribe().await;
                return Err(e);
            }
        }
        Ok(handle)
    }

    async fn register<I, O, F>(
        &self,
        procedure: &str,
        input: &I,
        callback: F,
        remote: bool,
    ) -> Result<(ListenHandle, Vec<String>)>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned + Send + 'static,
        F: Fn(Result<O>) + Send + Sync + 'static,
    {
        let inputs = serde_json::to_value(input)?;
        let first: Output<O> = self.call_value(procedure, inputs.clone()).await?;
        let tags = first.resources;
        let callback = Arc::new(callback);

        let refresh: Refresh = {
            let weak = Arc::downgrade(&self.inner);
            let procedure = procedure.to_string();
            let callback = callback.clone();
            Arc::new(move || {
                let weak = weak.clone();
                let procedure = procedure.clone();
                let inputs = inputs.clone();
                let callback = callback.clone();
                async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    let client = KiteClient { inner };
                    let result = client.call_value::<O>(&procedure, inputs).await;
                    callback(result.map(|output| output.data));
                }
                .boxed()
            })
        };

        callback(Ok(first.data));
        let id = self.listeners().register(tags.clone(), remote, refresh);
        let handle = ListenHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        };
        Ok((handle, tags))
    }

    /// Request a channel connection. Rejections come back as
    /// [`ClientError::Channel`].
    pub async fn connect<D>(&self, channel: &str, params: Params, data: &D) -> Result<ChannelConnection>
    where
        D: Serialize + ?Sized,
    {
        let request = ConnectRequest {
            channel: channel.to_string(),
            params,
            data: serde_json::to_value(data)?,
        };
        let response: ConnectResponse = self.post_json("/channel/connect", &request).await?;
        match response.result {
            ConnectResult::Ok { token } => Ok(ChannelConnection {
                client: self.clone(),
                channel: response.channel,
                params: response.params,
                token,
            }),
            ConnectResult::Error { error } => Err(ClientError::Channel(error)),
        }
    }

    /// Current relay session, opening one if needed. A new session re-sends
    /// `listen` for every remote listener's tags.
    async fn session(&self) -> Result<Arc<RelaySession>> {
        let url = self
            .inner
            .config
            .sidekick_url
            .as_deref()
            .ok_or(ClientError::NoRelay)?;

        let mut slot = self.inner.session.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
            warn!("Relay session lost, reconnecting");
        }

        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let session = Arc::new(RelaySession::connect(url, updates_tx).await?);
        self.spawn_update_loop(updates_rx);

        let tags = self.listeners().remote_tags();
        if !tags.is_empty() {
            session.send(RelayInbound::Listen { resources: tags })?;
        }
        *slot = Some(session.clone());
        Ok(session)
    }

    fn spawn_update_loop(&self, mut updates: mpsc::UnboundedReceiver<String>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(resource) = updates.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                debug!("Relay reported update for {}", resource);
                KiteClient { inner }.invalidate(&[resource]).await;
            }
        });
    }

    /// Close the relay session. Channel subscriptions end with it; remote
    /// listeners resume on the next session.
    pub async fn close_relay(&self) {
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close();
        }
    }
}

fn decode<O: DeserializeOwned>(response: ProcedureResponse) -> Result<Output<O>> {
    match response {
        ProcedureResponse::Ok { data, resources } => {
            let data = serde_json::from_value(data).map_err(|e| ClientError::InvalidOutput {
                message: e.to_string(),
            })?;
            Ok(Output { data, resources })
        }
        ProcedureResponse::Err { error } => Err(ClientError::Call {
            message: error.message,
            code: error.code,
        }),
    }
}

/// Returned by [`KiteClient::listen`]; removes exactly that listener.
#[derive(Debug)]
pub struct ListenHandle {
    inner: Weak<Inner>,
    id: ListenerId,
}

impl ListenHandle {
    pub async fn unsubscribe(self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let client = KiteClient { inner };
        let released = client.listeners().remove(self.id);
        let Some(released) = released.filter(|tags| !tags.is_empty()) else {
            return;
        };
        let session = client.inner.session.lock().await.clone();
        if let Some(session) = session {
            if let Err(e) = session.send(RelayInbound::Unlisten {
                resources: released,
            }) {
                debug!("Could not unlisten: {}", e);
            }
        }
    }
}

/// An accepted channel connection holding its one-time token.
#[derive(Clone)]
pub struct ChannelConnection {
    client: KiteClient,
    channel: String,
    params: Params,
    token: String,
}

impl fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("channel", &self.channel)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl ChannelConnection {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Redeem the token at the relay. Calling again with the same connection
    /// does nothing.
    pub async fn subscribe<F>(&self, on_event: F) -> Result<()>
    where
        F: Fn(ChannelEvent) + Send + Sync + 'static,
    {
        let session = self.client.session().await?;
        if !session.subscribe(&self.channel, &self.params, &self.token, Arc::new(on_event))? {
            debug!("Already subscribed to {}", self.channel);
        }
        Ok(())
    }

    /// Send a message to the server's channel handler through the relay.
    /// Handler failures arrive as [`ChannelEvent::Error`].
    pub async fn send<D: Serialize + ?Sized>(&self, data: &D) -> Result<()> {
        let data = serde_json::to_value(data)?;
        let session = self.client.session().await?;
        session.send(RelayInbound::Send {
            token: self.token.clone(),
            channel: self.channel.clone(),
            params: self.params.clone(),
            data,
        })
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        let session = self.client.session().await?;
        session.unsubscribe(&self.channel, &self.params, &self.token)
    }
}
