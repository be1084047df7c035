//! Kite Client - typed calls, live queries and channels.
//!
//! ```rust,ignore
//! use kite_client::{ClientConfig, KiteClient};
//!
//! let client = KiteClient::new(
//!     ClientConfig::new("http://127.0.0.1:8080").with_sidekick("ws://127.0.0.1:7890/ws"),
//! )?;
//! let todos = client
//!     .remote_listen("getTodos", &json!({}), |todos: kite_client::Result<Vec<Todo>>| {
//!         println!("{:?}", todos);
//!     })
//!     .await?;
//! client.mutate::<_, Todo>("addTodo", &json!({"title": "milk"})).await?;
//! ```

mod client;
mod error;
mod listeners;
mod session;

pub use client::{ChannelConnection, ClientConfig, KiteClient, ListenHandle, Output};
pub use error::{ClientError, Result};
pub use session::ChannelEvent;
