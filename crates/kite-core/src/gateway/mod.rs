//! Procedure registry/dispatcher and channel registry/state machine.
//!
//! A [`Gateway`] is assembled once at startup through [`GatewayBuilder`]:
//! procedures and channels are *declared* (name, kind, validators) and then
//! *implemented* (handlers). [`GatewayBuilder::build`] refuses to produce a
//! gateway while any declaration lacks an implementation, any name is
//! registered twice, or an implementation has no declaration, so
//! misconfiguration is reported before serving any traffic.
//!
//! Handlers return `anyhow::Result`. Structured errors are raised with
//! [`fail`] (procedures) and [`reject`] (channels); every other error, and
//! any panic, is normalized to a 500 server fault at the gateway boundary.

mod channel;
mod procedure;

pub use channel::{Broadcaster, ChannelDeclaration, ConnectArgs, MessageArgs};
pub use procedure::{ProcedureArgs, ProcedureDeclaration, ProcedureKind, ResourceArgs};

use crate::config::ProtocolConfig;
use crate::context::{ContextProvider, RequestParts};
use crate::protocol::{Fault, Params};
use crate::relay::RelayPublisher;
use crate::{KiteError, Result};
use channel::{ChannelEntry, ConnectFn, MessageFn, OutboundSchema};
use futures::future::BoxFuture;
use futures::FutureExt;
use procedure::{ProcedureEntry, ProcedureFn, ResourceFn};
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

pub(crate) type Ctx<P> = <P as ContextProvider>::Context;
pub(crate) type Der<P> = <P as ContextProvider>::Derived;

/// Boxed handler future.
pub type HandlerFuture<T> = BoxFuture<'static, anyhow::Result<T>>;

// ============================================================================
// Handler-raised errors
// ============================================================================

/// Structured procedure failure with a caller-chosen status code.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Failure {
    pub message: String,
    pub code: u16,
}

/// Abort a procedure (or context generation) with `code`.
///
/// ```rust,ignore
/// if !derived.is_admin() {
///     return Err(fail("Admins only", 403));
/// }
/// ```
pub fn fail(message: impl Into<String>, code: u16) -> anyhow::Error {
    anyhow::Error::new(Failure {
        message: message.into(),
        code,
    })
}

/// Channel connection rejection or message error with an explicit fault.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct Rejection {
    pub message: String,
    pub fault: Fault,
}

/// Reject a channel connection, or abort a channel message, blaming `fault`.
pub fn reject(message: impl Into<String>, fault: Fault) -> anyhow::Error {
    anyhow::Error::new(Rejection {
        message: message.into(),
        fault,
    })
}

/// Map a handler error onto the error taxonomy.
pub(crate) fn normalize_error(err: anyhow::Error) -> KiteError {
    let err = match err.downcast::<Failure>() {
        Ok(failure) => {
            return KiteError::Failed {
                message: failure.message,
                code: failure.code,
            }
        }
        Err(err) => err,
    };
    let err = match err.downcast::<Rejection>() {
        Ok(rejection) => {
            return KiteError::Rejected {
                message: rejection.message,
                fault: rejection.fault,
            }
        }
        Err(err) => err,
    };
    match err.downcast::<KiteError>() {
        Ok(kite) => kite,
        Err(other) => KiteError::Internal {
            message: format!("{:#}", other),
        },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn panicked(panic: Box<dyn Any + Send>) -> KiteError {
    KiteError::Internal {
        message: format!("Handler panicked: {}", panic_message(panic.as_ref())),
    }
}

/// Run a handler future, turning errors and panics into [`KiteError`].
pub(crate) async fn guarded<T>(future: HandlerFuture<T>) -> Result<T> {
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(normalize_error(err)),
        Err(panic) => Err(panicked(panic)),
    }
}

/// Run synchronous embedder code (resource functions, `derive`), turning a
/// panic into [`KiteError::Internal`].
pub(crate) fn guarded_sync<T>(f: impl FnOnce() -> T) -> Result<T> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(panicked)
}

/// Declared parameter names must match the supplied ones exactly.
pub(crate) fn check_params(declared: &[String], params: &Params) -> Result<()> {
    let missing: Vec<&str> = declared
        .iter()
        .filter(|name| !params.contains_key(*name))
        .map(String::as_str)
        .collect();
    let unexpected: Vec<&str> = params
        .keys()
        .filter(|key| !declared.contains(key))
        .map(String::as_str)
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }

    let mut problems = Vec::new();
    if !missing.is_empty() {
        problems.push(format!("missing parameter(s): {}", missing.join(", ")));
    }
    if !unexpected.is_empty() {
        problems.push(format!("unexpected parameter(s): {}", unexpected.join(", ")));
    }
    Err(KiteError::InvalidParams {
        message: problems.join("; "),
    })
}

// ============================================================================
// Gateway
// ============================================================================

/// Procedure dispatcher and channel state machine for one service.
pub struct Gateway<P: ContextProvider> {
    provider: P,
    relay: Arc<dyn RelayPublisher>,
    procedures: HashMap<String, ProcedureEntry<Ctx<P>, Der<P>>>,
    channels: HashMap<String, ChannelEntry<Ctx<P>, Der<P>>>,
    broadcaster: Broadcaster,
    mask_internal_errors: bool,
}

impl<P: ContextProvider> Gateway<P> {
    pub fn builder<R: RelayPublisher>(provider: P, relay: R) -> GatewayBuilder<P> {
        GatewayBuilder::new(provider, Arc::new(relay))
    }

    /// Broadcast primitive for code running outside channel handlers.
    pub fn broadcaster(&self) -> Broadcaster {
        self.broadcaster.clone()
    }

    pub fn procedure_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.procedures.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn channel_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Message safe to hand to a client for `err`.
    fn client_message(&self, err: &KiteError) -> String {
        if self.mask_internal_errors && err.is_internal() {
            ProtocolConfig::GENERIC_SERVER_ERROR.to_string()
        } else {
            err.to_string()
        }
    }

    /// Context generation then derivation, with errors and panics from
    /// either normalized like handler failures.
    pub(crate) async fn request_context(
        &self,
        request: &RequestParts,
    ) -> Result<(Arc<Ctx<P>>, Arc<Der<P>>)> {
        let context = match AssertUnwindSafe(self.provider.create_context(request))
            .catch_unwind()
            .await
        {
            Ok(result) => result.map_err(normalize_error)?,
            Err(panic) => return Err(panicked(panic)),
        };
        let derived = guarded_sync(|| self.provider.derive(&context))?;
        Ok((Arc::new(context), Arc::new(derived)))
    }

    fn log_failure(&self, what: &str, name: &str, err: &KiteError) {
        if err.status_code() >= 500 {
            error!("{} {} failed ({} fault): {}", what, name, err.fault(), err);
        } else {
            warn!("{} {} failed ({} fault): {}", what, name, err.fault(), err);
        }
    }
}

/// Startup-time registry for procedures and channels.
pub struct GatewayBuilder<P: ContextProvider> {
    provider: P,
    relay: Arc<dyn RelayPublisher>,
    procedure_decls: Vec<ProcedureDeclaration>,
    procedure_impls: HashMap<String, (ProcedureFn<Ctx<P>, Der<P>>, ResourceFn<Ctx<P>>)>,
    channel_decls: Vec<ChannelDeclaration>,
    channel_impls: HashMap<String, (ConnectFn<Ctx<P>, Der<P>>, MessageFn)>,
    errors: Vec<String>,
    mask_internal_errors: bool,
}

impl<P: ContextProvider> GatewayBuilder<P> {
    fn new(provider: P, relay: Arc<dyn RelayPublisher>) -> Self {
        Self {
            provider,
            relay,
            procedure_decls: Vec::new(),
            procedure_impls: HashMap::new(),
            channel_decls: Vec::new(),
            channel_impls: HashMap::new(),
            errors: Vec::new(),
            mask_internal_errors: false,
        }
    }

    /// Replace 500-class error messages with a generic text for clients.
    /// The original message is still logged.
    pub fn mask_internal_errors(mut self, mask: bool) -> Self {
        self.mask_internal_errors = mask;
        self
    }

    /// Declare a procedure.
    pub fn declare(mut self, declaration: ProcedureDeclaration) -> Self {
        if self
            .procedure_decls
            .iter()
            .any(|d| d.name == declaration.name)
        {
            self.errors
                .push(format!("Procedure declared twice: {}", declaration.name));
        } else {
            self.procedure_decls.push(declaration);
        }
        self
    }

    /// Register the handler and resource function for a declared procedure.
    pub fn implement<F, Fut, O, R>(mut self, name: &str, handler: F, resources: R) -> Self
    where
        F: Fn(ProcedureArgs<Ctx<P>, Der<P>>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Serialize + Send + 'static,
        R: Fn(&ResourceArgs<'_, Ctx<P>>) -> Vec<String> + Send + Sync + 'static,
    {
        if self.procedure_impls.contains_key(name) {
            self.errors
                .push(format!("Procedure implemented twice: {}", name));
            return self;
        }

        let handler: ProcedureFn<Ctx<P>, Der<P>> =
            Arc::new(move |args: ProcedureArgs<Ctx<P>, Der<P>>| {
                let future = handler(args);
                Box::pin(async move {
                    let output = future.await?;
                    Ok(serde_json::to_value(output)?)
                }) as HandlerFuture<Value>
            });
        let resources: ResourceFn<Ctx<P>> = Arc::new(resources);

        self.procedure_impls
            .insert(name.to_string(), (handler, resources));
        self
    }

    /// Declare a channel.
    pub fn declare_channel(mut self, declaration: ChannelDeclaration) -> Self {
        if self.channel_decls.iter().any(|d| d.name == declaration.name) {
            self.errors
                .push(format!("Channel declared twice: {}", declaration.name));
        } else {
            self.channel_decls.push(declaration);
        }
        self
    }

    /// Register the connect guard and message handler for a declared channel.
    ///
    /// The value returned by `on_connect` becomes the connection context that
    /// accompanies every later message on that connection.
    pub fn implement_channel<C, CFut, O, M, MFut>(
        mut self,
        name: &str,
        on_connect: C,
        on_message: M,
    ) -> Self
    where
        C: Fn(ConnectArgs<Ctx<P>, Der<P>>) -> CFut + Send + Sync + 'static,
        CFut: Future<Output = anyhow::Result<O>> + Send + 'static,
        O: Serialize + Send + 'static,
        M: Fn(MessageArgs) -> MFut + Send + Sync + 'static,
        MFut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.channel_impls.contains_key(name) {
            self.errors.push(format!("Channel implemented twice: {}", name));
            return self;
        }

        let on_connect: ConnectFn<Ctx<P>, Der<P>> =
            Arc::new(move |args: ConnectArgs<Ctx<P>, Der<P>>| {
                let future = on_connect(args);
                Box::pin(async move {
                    let context = future.await?;
                    Ok(serde_json::to_value(context)?)
                }) as HandlerFuture<Value>
            });
        let on_message: MessageFn =
            Arc::new(move |args: MessageArgs| Box::pin(on_message(args)) as HandlerFuture<()>);

        self.channel_impls
            .insert(name.to_string(), (on_connect, on_message));
        self
    }

    /// Check completeness and produce the gateway.
    pub fn build(mut self) -> Result<Gateway<P>> {
        let mut procedures = HashMap::new();
        for declaration in self.procedure_decls {
            match self.procedure_impls.remove(&declaration.name) {
                Some((handler, resources)) => {
                    procedures.insert(
                        declaration.name.clone(),
                        ProcedureEntry {
                            declaration,
                            handler,
                            resources,
                        },
                    );
                }
                None => self.errors.push(format!(
                    "Procedure declared but not implemented: {}",
                    declaration.name
                )),
            }
        }
        for name in self.procedure_impls.keys() {
            self.errors
                .push(format!("Procedure implemented but not declared: {}", name));
        }

        let mut channels = HashMap::new();
        let mut schemas = HashMap::new();
        for declaration in self.channel_decls {
            match self.channel_impls.remove(&declaration.name) {
                Some((on_connect, on_message)) => {
                    schemas.insert(
                        declaration.name.clone(),
                        OutboundSchema {
                            params: declaration.params.clone(),
                            validator: declaration.server_message.clone(),
                        },
                    );
                    channels.insert(
                        declaration.name.clone(),
                        ChannelEntry {
                            declaration,
                            on_connect,
                            on_message,
                        },
                    );
                }
                None => self.errors.push(format!(
                    "Channel declared but not implemented: {}",
                    declaration.name
                )),
            }
        }
        for name in self.channel_impls.keys() {
            self.errors
                .push(format!("Channel implemented but not declared: {}", name));
        }

        if !self.errors.is_empty() {
            self.errors.sort();
            return Err(KiteError::Config {
                message: self.errors.join("; "),
            });
        }

        info!(
            "Gateway ready: {} procedures, {} channels",
            procedures.len(),
            channels.len()
        );

        let broadcaster = Broadcaster::new(self.relay.clone(), schemas);
        Ok(Gateway {
            provider: self.provider,
            relay: self.relay,
            procedures,
            channels,
            broadcaster,
            mask_internal_errors: self.mask_internal_errors,
        })
    }
}
