//! Integration tests for the kite-rpc HTTP server.
//!
//! A small todo service runs on an ephemeral port; tests talk to it with
//! reqwest exactly as a browser client would.

use async_trait::async_trait;
use kite_core::{
    fail, reject, ChannelBroadcast, ChannelDeclaration, ConnectionPayload, ContextProvider, Fault,
    Gateway, ProcedureDeclaration, ProtocolConfig, RelayPublisher, RequestParts, ResourceBatch,
};
use kite_rpc::{start_server, ServerOptions};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SECRET: &str = "integration-secret";

#[derive(Clone, Default)]
struct MemoryRelay {
    connections: Arc<Mutex<Vec<ConnectionPayload>>>,
    resources: Arc<Mutex<Vec<ResourceBatch>>>,
    messages: Arc<Mutex<Vec<ChannelBroadcast>>>,
}

#[async_trait]
impl RelayPublisher for MemoryRelay {
    async fn register_connection(&self, payload: &ConnectionPayload) -> kite_core::Result<()> {
        self.connections.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn publish_resources(&self, batch: &ResourceBatch) -> kite_core::Result<()> {
        self.resources.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn publish_message(&self, broadcast: &ChannelBroadcast) -> kite_core::Result<()> {
        self.messages.lock().unwrap().push(broadcast.clone());
        Ok(())
    }
}

/// Signed-in user id from the `x-user-id` header.
struct UserHeader;

struct Viewer {
    user: Option<String>,
}

#[async_trait]
impl ContextProvider for UserHeader {
    type Context = Viewer;
    type Derived = ();

    async fn create_context(&self, request: &RequestParts) -> anyhow::Result<Viewer> {
        Ok(Viewer {
            user: request.header("x-user-id").map(String::from),
        })
    }

    fn derive(&self, _context: &Viewer) {}
}

async fn start(relay: MemoryRelay) -> u16 {
    let gateway = Gateway::builder(UserHeader, relay)
        .declare(ProcedureDeclaration::query("getTodos"))
        .declare(ProcedureDeclaration::mutation("addTodo"))
        .declare_channel(ChannelDeclaration::new("chat").params(["room"]))
        .implement(
            "getTodos",
            |args| async move {
                let user = args.context.user.clone().ok_or_else(|| fail("Sign in first", 401))?;
                Ok(json!([{"id": 1, "owner": user}]))
            },
            |args| {
                vec![format!(
                    "todos/user/{}",
                    args.context.user.as_deref().unwrap_or("anonymous")
                )]
            },
        )
        .implement(
            "addTodo",
            |args| async move { Ok(json!({"id": 2, "title": args.input["title"]})) },
            |args| vec!["todos/user/*".to_string(), format!("todo/{}", args.output["id"])],
        )
        .implement_channel(
            "chat",
            |args| async move {
                match args.context.user.clone() {
                    Some(user) => Ok(json!({"user": user})),
                    None => Err(reject("Sign in to chat", Fault::Client)),
                }
            },
            |args| async move {
                args.broadcaster
                    .send_message("chat", &args.params, args.input.clone())
                    .await?;
                Ok(())
            },
        )
        .build()
        .unwrap();

    let options = ServerOptions {
        sidekick_secret: Some(SECRET.to_string()),
    };
    start_server(Arc::new(gateway), options, "127.0.0.1", 0)
        .await
        .unwrap()
        .port()
}

async fn post(port: u16, path: &str, body: Value, headers: &[(&str, &str)]) -> (u16, Value) {
    let client = reqwest::Client::new();
    let mut request = client
        .post(format!("http://127.0.0.1:{}{}", port, path))
        .json(&body)
        .timeout(Duration::from_secs(10));
    for (name, value) in headers {
        request = request.header(*name, *value);
    }
    let response = request.send().await.unwrap();
    let status = response.status().as_u16();
    let text = response.text().await.unwrap();
    let value = if text.is_empty() {
        Value::Null
    } else {
        serde_json::from_str(&text).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let port = start(MemoryRelay::default()).await;
    let body: Value = reqwest::get(format!("http://127.0.0.1:{}/health", port))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["procedures"], 2);
    assert_eq!(body["channels"], 1);
}

#[tokio::test]
async fn test_query_uses_request_context() {
    let port = start(MemoryRelay::default()).await;

    let (status, body) = post(port, "/rpc", json!({"procedure": "getTodos", "inputs": {}}), &[]).await;
    assert_eq!(status, 401);
    assert_eq!(body["error"]["message"], "Sign in first");

    let (status, body) = post(
        port,
        "/rpc",
        json!({"procedure": "getTodos", "inputs": {}}),
        &[("x-user-id", "7")],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"][0]["owner"], "7");
    assert_eq!(body["resources"], json!(["todos/user/7"]));
}

#[tokio::test]
async fn test_unknown_procedure_is_404() {
    let port = start(MemoryRelay::default()).await;
    let (status, body) = post(port, "/rpc", json!({"procedure": "dropTables"}), &[]).await;
    assert_eq!(status, 404);
    assert_eq!(body["status"], "ERR");
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn test_mutation_pushes_resources_to_relay() {
    let relay = MemoryRelay::default();
    let port = start(relay.clone()).await;

    let (status, body) = post(
        port,
        "/rpc",
        json!({"procedure": "addTodo", "inputs": {"title": "milk"}}),
        &[],
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["resources"], json!(["todos/user/*", "todo/2"]));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while relay.resources.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pushed = relay.resources.lock().unwrap();
    assert_eq!(pushed.len(), 1);
    assert_eq!(pushed[0].resources, vec!["todos/user/*", "todo/2"]);
}

#[tokio::test]
async fn test_channel_connect_and_forwarded_message() {
    let relay = MemoryRelay::default();
    let port = start(relay.clone()).await;

    let (status, body) = post(
        port,
        "/channel/connect",
        json!({"channel": "chat", "params": {"room": "1"}, "data": null}),
        &[],
    )
    .await;
    assert_eq!(status, 400);
    assert_eq!(body["result"]["error"]["message"], "Sign in to chat");
    assert!(relay.connections.lock().unwrap().is_empty());

    let (status, body) = post(
        port,
        "/channel/connect",
        json!({"channel": "chat", "params": {"room": "1"}, "data": null}),
        &[("x-user-id", "3")],
    )
    .await;
    assert_eq!(status, 200);
    let token = body["result"]["token"].as_str().unwrap().to_string();
    {
        let connections = relay.connections.lock().unwrap();
        assert_eq!(connections[0].token, token);
        assert_eq!(connections[0].context, json!({"user": "3"}));
    }

    let forward = json!({
        "channel": "chat",
        "params": {"room": "1"},
        "data": {"text": "hi"},
        "context": {"user": "3"}
    });
    let (status, _) = post(port, "/channel/message", forward.clone(), &[]).await;
    assert_eq!(status, 401);

    let (status, _) = post(
        port,
        "/channel/message",
        forward,
        &[(ProtocolConfig::SECRET_HEADER, SECRET)],
    )
    .await;
    assert_eq!(status, 204);

    let messages = relay.messages.lock().unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].data, json!({"text": "hi"}));
}
