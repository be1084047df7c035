//! Channel declarations, the connect handshake and forwarded client messages.
//!
//! A connection attempt moves through
//! `Requested → Accepted → Pending(token) → Subscribed → Closed` or
//! `Requested → Rejected → Closed`. The HTTP half (up to `Pending`) lives
//! here; subscription happens inside the relay.

use super::{check_params, guarded, Gateway, HandlerFuture};
use crate::context::{ContextProvider, RequestParts};
use crate::protocol::{
    ChannelBroadcast, ChannelError, ChannelForward, ConnectRequest, ConnectResponse,
    ConnectionPayload, Params,
};
use crate::relay::RelayPublisher;
use crate::validator::{AnyValue, Issue, SharedValidator, Validator};
use crate::{KiteError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Name, parameter names and validators of one channel.
#[derive(Clone)]
pub struct ChannelDeclaration {
    pub name: String,
    /// Parameter names every connection must supply, no more and no fewer.
    pub params: Vec<String>,
    pub client_message: SharedValidator,
    pub server_message: SharedValidator,
    pub connection_request: SharedValidator,
    pub connection_context: SharedValidator,
}

impl ChannelDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            client_message: Arc::new(AnyValue),
            server_message: Arc::new(AnyValue),
            connection_request: Arc::new(AnyValue),
            connection_context: Arc::new(AnyValue),
        }
    }

    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_message(mut self, validator: impl Validator) -> Self {
        self.client_message = Arc::new(validator);
        self
    }

    pub fn server_message(mut self, validator: impl Validator) -> Self {
        self.server_message = Arc::new(validator);
        self
    }

    pub fn connection_request(mut self, validator: impl Validator) -> Self {
        self.connection_request = Arc::new(validator);
        self
    }

    pub fn connection_context(mut self, validator: impl Validator) -> Self {
        self.connection_context = Arc::new(validator);
        self
    }
}

/// Arguments handed to `on_connect`.
pub struct ConnectArgs<C, D> {
    /// Connection request body after validation.
    pub input: Value,
    pub params: Params,
    pub context: Arc<C>,
    pub derived: Arc<D>,
}

/// Arguments handed to `on_message`.
pub struct MessageArgs {
    /// Client message body after validation.
    pub input: Value,
    pub params: Params,
    /// Connection context returned by `on_connect` when the token was issued.
    pub context: Value,
    pub broadcaster: Broadcaster,
}

impl MessageArgs {
    pub fn parse_input<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.input.clone())?)
    }

    pub fn parse_context<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.context.clone())?)
    }
}

pub(crate) type ConnectFn<C, D> =
    Arc<dyn Fn(ConnectArgs<C, D>) -> HandlerFuture<Value> + Send + Sync>;
pub(crate) type MessageFn = Arc<dyn Fn(MessageArgs) -> HandlerFuture<()> + Send + Sync>;

pub(crate) struct ChannelEntry<C, D> {
    pub(crate) declaration: ChannelDeclaration,
    pub(crate) on_connect: ConnectFn<C, D>,
    pub(crate) on_message: MessageFn,
}

/// What a broadcast to one channel must satisfy.
pub(crate) struct OutboundSchema {
    pub(crate) params: Vec<String>,
    pub(crate) validator: SharedValidator,
}

/// Pushes server messages to every subscriber of a `(channel, params)` topic.
#[derive(Clone)]
pub struct Broadcaster {
    relay: Arc<dyn RelayPublisher>,
    schemas: Arc<HashMap<String, OutboundSchema>>,
}

impl Broadcaster {
    pub(crate) fn new(
        relay: Arc<dyn RelayPublisher>,
        schemas: HashMap<String, OutboundSchema>,
    ) -> Self {
        Self {
            relay,
            schemas: Arc::new(schemas),
        }
    }

    /// Broadcast `body` on `channel` with `params`.
    ///
    /// The body must satisfy the channel's server-message validator.
    pub async fn send_message<B: Serialize>(
        &self,
        channel: &str,
        params: &Params,
        body: B,
    ) -> Result<()> {
        let schema = self
            .schemas
            .get(channel)
            .ok_or_else(|| KiteError::ChannelNotFound {
                name: channel.to_string(),
            })?;
        check_params(&schema.params, params)?;

        let data = serde_json::to_value(body)?;
        let data = schema
            .validator
            .validate(&data)
            .map_err(|issues| KiteError::InvalidOutput {
                message: Issue::join(&issues),
            })?;

        debug!("Broadcasting on channel {} {:?}", channel, params);
        self.relay
            .publish_message(&ChannelBroadcast {
                channel: channel.to_string(),
                params: params.clone(),
                data,
            })
            .await
    }
}

impl<P: ContextProvider> Gateway<P> {
    /// HTTP half of the channel handshake. On acceptance the returned token has
    /// already been registered with the relay as a pending connection.
    pub async fn connect(&self, request: &RequestParts, connect: ConnectRequest) -> ConnectResponse {
        let channel = connect.channel.clone();
        let params = connect.params.clone();

        match self.accept(request, connect).await {
            Ok(token) => {
                info!("Accepted connection to channel {} {:?}", channel, params);
                ConnectResponse::accepted(channel, params, token)
            }
            Err(err) => {
                self.log_failure("Channel connect", &channel, &err);
                let message = self.client_message(&err);
                let mut error = err.into_channel_error(&channel, &params);
                error.message = message;
                ConnectResponse::rejected(error)
            }
        }
    }

    async fn accept(&self, request: &RequestParts, connect: ConnectRequest) -> Result<String> {
        let entry = self
            .channels
            .get(&connect.channel)
            .ok_or_else(|| KiteError::ChannelNotFound {
                name: connect.channel.clone(),
            })?;
        let declaration = &entry.declaration;

        check_params(&declaration.params, &connect.params)?;

        let input = declaration
            .connection_request
            .validate(&connect.data)
            .map_err(|issues| KiteError::InvalidInput {
                message: Issue::join(&issues),
            })?;

        let (context, derived) = self.request_context(request).await?;

        let connection_context = guarded((entry.on_connect)(ConnectArgs {
            input,
            params: connect.params.clone(),
            context,
            derived,
        }))
        .await?;

        let connection_context = declaration
            .connection_context
            .validate(&connection_context)
            .map_err(|issues| KiteError::InvalidContext {
                message: Issue::join(&issues),
            })?;

        let token = uuid::Uuid::new_v4().to_string();
        self.relay
            .register_connection(&ConnectionPayload {
                token: token.clone(),
                channel: connect.channel,
                params: connect.params,
                context: connection_context,
            })
            .await?;

        Ok(token)
    }

    /// Handle a client message forwarded by the relay.
    pub async fn handle_message(&self, forward: ChannelForward) -> std::result::Result<(), ChannelError> {
        let channel = forward.channel.clone();
        let params = forward.params.clone();

        self.dispatch_message(forward).await.map_err(|err| {
            self.log_failure("Channel message on", &channel, &err);
            let message = self.client_message(&err);
            let mut error = err.into_channel_error(&channel, &params);
            error.message = message;
            error
        })
    }

    async fn dispatch_message(&self, forward: ChannelForward) -> Result<()> {
        let entry = self
            .channels
            .get(&forward.channel)
            .ok_or_else(|| KiteError::ChannelNotFound {
                name: forward.channel.clone(),
            })?;
        let declaration = &entry.declaration;

        check_params(&declaration.params, &forward.params)?;

        let input = declaration
            .client_message
            .validate(&forward.data)
            .map_err(|issues| KiteError::InvalidInput {
                message: Issue::join(&issues),
            })?;

        // A context that no longer validates was corrupted after issuance.
        let context = declaration
            .connection_context
            .validate(&forward.context)
            .map_err(|issues| KiteError::InvalidContext {
                message: Issue::join(&issues),
            })?;

        guarded((entry.on_message)(MessageArgs {
            input,
            params: forward.params,
            context,
            broadcaster: self.broadcaster.clone(),
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::RecordingRelay;
    use super::super::reject;
    use super::*;
    use crate::context::NoContext;
    use crate::protocol::{ConnectResult, Fault};
    use crate::validator::Schema;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct JoinRequest {
        nickname: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Member {
        nickname: String,
        room: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ChatText {
        text: String,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ChatLine {
        from: String,
        text: String,
    }

    fn params(pairs: &[(&str, &str)]) -> Params {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn chat_gateway(relay: RecordingRelay) -> Gateway<NoContext> {
        Gateway::builder(NoContext, relay)
            .declare_channel(
                ChannelDeclaration::new("chat")
                    .params(["room"])
                    .connection_request(Schema::<JoinRequest>::new())
                    .connection_context(Schema::<Member>::new())
                    .client_message(Schema::<ChatText>::new())
                    .server_message(Schema::<ChatLine>::new()),
            )
            .implement_channel(
                "chat",
                |args| async move {
                    let nickname = args.input["nickname"].as_str().unwrap_or_default().to_string();
                    if nickname == "mallory" {
                        return Err(reject("banned from this room", Fault::Client));
                    }
                    if nickname == "crash" {
                        return Err(reject("member store unavailable", Fault::Server));
                    }
                    Ok(Member {
                        nickname,
                        room: args.params["room"].clone(),
                    })
                },
                |args| async move {
                    let member: Member = args.parse_context()?;
                    let text: ChatText = args.parse_input()?;
                    args.broadcaster
                        .send_message(
                            "chat",
                            &args.params,
                            ChatLine {
                                from: member.nickname,
                                text: text.text,
                            },
                        )
                        .await?;
                    Ok(())
                },
            )
            .build()
            .unwrap()
    }

    fn connect_request(room: &str, nickname: &str) -> ConnectRequest {
        ConnectRequest {
            channel: "chat".into(),
            params: params(&[("room", room)]),
            data: json!({"nickname": nickname}),
        }
    }

    #[tokio::test]
    async fn test_accepted_connection_registers_token_with_context() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        let response = gateway
            .connect(&RequestParts::new(), connect_request("1", "alice"))
            .await;

        let token = match response.result {
            ConnectResult::Ok { token } => token,
            other => panic!("expected token, got {:?}", other),
        };
        assert_eq!(response.params, params(&[("room", "1")]));

        let registered = relay.connections.lock().unwrap();
        assert_eq!(registered.len(), 1);
        assert_eq!(registered[0].token, token);
        assert_eq!(registered[0].channel, "chat");
        assert_eq!(
            registered[0].context,
            json!({"nickname": "alice", "room": "1"})
        );
    }

    #[tokio::test]
    async fn test_tokens_are_unique() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());
        gateway
            .connect(&RequestParts::new(), connect_request("1", "alice"))
            .await;
        gateway
            .connect(&RequestParts::new(), connect_request("1", "alice"))
            .await;
        let registered = relay.connections.lock().unwrap();
        assert_ne!(registered[0].token, registered[1].token);
    }

    #[tokio::test]
    async fn test_rejected_connection_never_issues_token() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        let response = gateway
            .connect(&RequestParts::new(), connect_request("1", "mallory"))
            .await;

        match &response.result {
            ConnectResult::Error { error } => {
                assert_eq!(error.fault, Fault::Client);
                assert_eq!(error.channel, "chat");
                assert_eq!(error.message, "banned from this room");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(response.status_code(), 400);
        assert!(relay.connections.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_server_attributed_rejection() {
        let gateway = chat_gateway(RecordingRelay::default());
        let response = gateway
            .connect(&RequestParts::new(), connect_request("1", "crash"))
            .await;
        assert_eq!(response.status_code(), 500);
    }

    struct BrokenDerive;

    #[async_trait::async_trait]
    impl ContextProvider for BrokenDerive {
        type Context = ();
        type Derived = ();

        async fn create_context(&self, _request: &RequestParts) -> anyhow::Result<()> {
            Ok(())
        }

        fn derive(&self, _context: &()) {
            panic!("guard table missing");
        }
    }

    #[tokio::test]
    async fn test_panicking_provider_rejects_connection_as_server_fault() {
        let relay = RecordingRelay::default();
        let gateway = Gateway::builder(BrokenDerive, relay.clone())
            .declare_channel(ChannelDeclaration::new("lobby"))
            .implement_channel(
                "lobby",
                |_| async { Ok(json!({})) },
                |_| async { Ok(()) },
            )
            .build()
            .unwrap();

        let response = gateway
            .connect(
                &RequestParts::new(),
                ConnectRequest {
                    channel: "lobby".into(),
                    params: Params::new(),
                    data: json!(null),
                },
            )
            .await;

        match &response.result {
            ConnectResult::Error { error } => assert_eq!(error.fault, Fault::Server),
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(response.status_code(), 500);
        assert!(relay.connections.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_params_must_match_exactly() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        let missing = ConnectRequest {
            channel: "chat".into(),
            params: Params::new(),
            data: json!({"nickname": "alice"}),
        };
        let extra = ConnectRequest {
            channel: "chat".into(),
            params: params(&[("room", "1"), ("user", "2")]),
            data: json!({"nickname": "alice"}),
        };

        for request in [missing, extra] {
            let response = gateway.connect(&RequestParts::new(), request).await;
            assert_eq!(response.status_code(), 400);
        }
        assert!(relay.connections.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connect_unknown_channel_and_bad_body() {
        let gateway = chat_gateway(RecordingRelay::default());

        let unknown = gateway
            .connect(
                &RequestParts::new(),
                ConnectRequest {
                    channel: "nope".into(),
                    params: Params::new(),
                    data: Value::Null,
                },
            )
            .await;
        match unknown.result {
            ConnectResult::Error { error } => assert_eq!(error.fault, Fault::Client),
            other => panic!("expected rejection, got {:?}", other),
        }

        let bad_body = gateway
            .connect(
                &RequestParts::new(),
                ConnectRequest {
                    channel: "chat".into(),
                    params: params(&[("room", "1")]),
                    data: json!({"nick": 3}),
                },
            )
            .await;
        assert_eq!(bad_body.status_code(), 400);
    }

    #[tokio::test]
    async fn test_relay_failure_during_connect_is_sidekick_fault() {
        let gateway = chat_gateway(RecordingRelay::failing());
        let response = gateway
            .connect(&RequestParts::new(), connect_request("1", "alice"))
            .await;
        match response.result {
            ConnectResult::Error { error } => assert_eq!(error.fault, Fault::Sidekick),
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    fn forward(room: &str, data: Value, context: Value) -> ChannelForward {
        ChannelForward {
            channel: "chat".into(),
            params: params(&[("room", room)]),
            data,
            context,
        }
    }

    #[tokio::test]
    async fn test_message_broadcasts_to_same_params() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        gateway
            .handle_message(forward(
                "7",
                json!({"text": "hello"}),
                json!({"nickname": "alice", "room": "7"}),
            ))
            .await
            .unwrap();

        let messages = relay.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].channel, "chat");
        assert_eq!(messages[0].params, params(&[("room", "7")]));
        assert_eq!(messages[0].data, json!({"from": "alice", "text": "hello"}));
    }

    #[tokio::test]
    async fn test_invalid_message_body_is_client_fault_without_broadcast() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        let err = gateway
            .handle_message(forward(
                "7",
                json!({"body": 12}),
                json!({"nickname": "alice", "room": "7"}),
            ))
            .await
            .unwrap_err();

        assert_eq!(err.fault, Fault::Client);
        assert_eq!(err.params, params(&[("room", "7")]));
        assert!(relay.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_context_is_server_fault() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());

        let err = gateway
            .handle_message(forward("7", json!({"text": "hi"}), json!({"who": "?"})))
            .await
            .unwrap_err();

        assert_eq!(err.fault, Fault::Server);
        assert!(relay.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_send_message_validates_channel_params_and_body() {
        let relay = RecordingRelay::default();
        let gateway = chat_gateway(relay.clone());
        let broadcaster = gateway.broadcaster();

        let err = broadcaster
            .send_message("lobby", &Params::new(), json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 404);

        let err = broadcaster
            .send_message("chat", &Params::new(), json!({"from": "a", "text": "b"}))
            .await
            .unwrap_err();
        assert_eq!(err.fault(), Fault::Client);

        let err = broadcaster
            .send_message("chat", &params(&[("room", "1")]), json!({"text": 5}))
            .await
            .unwrap_err();
        assert_eq!(err.fault(), Fault::Server);

        broadcaster
            .send_message(
                "chat",
                &params(&[("room", "1")]),
                ChatLine {
                    from: "system".into(),
                    text: "welcome".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(relay.messages.lock().unwrap().len(), 1);
    }
}
