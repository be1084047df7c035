//! Procedure declarations and the call pipeline.
//!
//! validate input → create context → derive → handler → validate output →
//! resource function → (mutations only) fire-and-forget push to the relay.

use super::{guarded, guarded_sync, Gateway, HandlerFuture};
use crate::context::{ContextProvider, RequestParts};
use crate::protocol::{ProcedureRequest, ProcedureResponse, ResourceBatch};
use crate::validator::{AnyValue, Issue, SharedValidator, Validator};
use crate::{KiteError, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcedureKind {
    Query,
    Mutation,
}

/// Name, kind and validators of one procedure.
#[derive(Clone)]
pub struct ProcedureDeclaration {
    pub name: String,
    pub kind: ProcedureKind,
    pub input: SharedValidator,
    pub output: SharedValidator,
}

impl ProcedureDeclaration {
    fn new(name: impl Into<String>, kind: ProcedureKind) -> Self {
        Self {
            name: name.into(),
            kind,
            input: Arc::new(AnyValue),
            output: Arc::new(AnyValue),
        }
    }

    pub fn query(name: impl Into<String>) -> Self {
        Self::new(name, ProcedureKind::Query)
    }

    pub fn mutation(name: impl Into<String>) -> Self {
        Self::new(name, ProcedureKind::Mutation)
    }

    pub fn input(mut self, validator: impl Validator) -> Self {
        self.input = Arc::new(validator);
        self
    }

    pub fn output(mut self, validator: impl Validator) -> Self {
        self.output = Arc::new(validator);
        self
    }
}

/// Arguments handed to a procedure handler.
pub struct ProcedureArgs<C, D> {
    /// Input after validation.
    pub input: Value,
    pub context: Arc<C>,
    pub derived: Arc<D>,
}

impl<C, D> ProcedureArgs<C, D> {
    /// Deserialize the validated input into a concrete type.
    pub fn parse<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(serde_json::from_value(self.input.clone())?)
    }
}

/// Arguments handed to a resource function after a successful call.
pub struct ResourceArgs<'a, C> {
    pub input: &'a Value,
    pub context: &'a C,
    pub output: &'a Value,
}

pub(crate) type ProcedureFn<C, D> =
    Arc<dyn Fn(ProcedureArgs<C, D>) -> HandlerFuture<Value> + Send + Sync>;
pub(crate) type ResourceFn<C> = Arc<dyn Fn(&ResourceArgs<'_, C>) -> Vec<String> + Send + Sync>;

pub(crate) struct ProcedureEntry<C, D> {
    pub(crate) declaration: ProcedureDeclaration,
    pub(crate) handler: ProcedureFn<C, D>,
    pub(crate) resources: ResourceFn<C>,
}

impl<P: ContextProvider> Gateway<P> {
    /// Run one procedure call. Never fails: errors are carried in the response.
    pub async fn call(&self, request: &RequestParts, call: ProcedureRequest) -> ProcedureResponse {
        let name = call.procedure.clone();
        debug!("Procedure call: {}({})", name, call.inputs);

        match self.execute(request, call).await {
            Ok((data, resources)) => ProcedureResponse::success(data, resources),
            Err(err) => {
                self.log_failure("Procedure", &name, &err);
                ProcedureResponse::error(err.status_code(), self.client_message(&err))
            }
        }
    }

    async fn execute(
        &self,
        request: &RequestParts,
        call: ProcedureRequest,
    ) -> Result<(Value, Vec<String>)> {
        let entry = self
            .procedures
            .get(&call.procedure)
            .ok_or_else(|| KiteError::ProcedureNotFound {
                name: call.procedure.clone(),
            })?;
        let declaration = &entry.declaration;

        let input = declaration
            .input
            .validate(&call.inputs)
            .map_err(|issues| KiteError::InvalidInput {
                message: Issue::join(&issues),
            })?;

        let (context, derived) = self.request_context(request).await?;

        let output = guarded((entry.handler)(ProcedureArgs {
            input: input.clone(),
            context: context.clone(),
            derived,
        }))
        .await?;

        let output = declaration
            .output
            .validate(&output)
            .map_err(|issues| KiteError::InvalidOutput {
                message: Issue::join(&issues),
            })?;

        let resources = guarded_sync(|| {
            (entry.resources)(&ResourceArgs {
                input: &input,
                context: context.as_ref(),
                output: &output,
            })
        })?;

        if declaration.kind == ProcedureKind::Mutation && !resources.is_empty() {
            self.push_resources(&declaration.name, resources.clone());
        }

        Ok((output, resources))
    }

    /// Forward mutated resources to the relay without blocking the response.
    fn push_resources(&self, procedure: &str, resources: Vec<String>) {
        let relay = self.relay.clone();
        let procedure = procedure.to_string();
        tokio::spawn(async move {
            let batch = ResourceBatch { resources };
            if let Err(e) = relay.publish_resources(&batch).await {
                error!(
                    "Failed to push {} resource update(s) from {} to sidekick: {}",
                    batch.resources.len(),
                    procedure,
                    e
                );
            }
        });
    }
}
