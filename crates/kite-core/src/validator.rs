//! Validator contract for procedure and channel payloads.
//!
//! Any schema library can sit behind [`Validator`]: it receives an untyped
//! JSON value and returns either the (possibly normalized) valid value or a
//! list of issues. Two adapters ship with the crate: [`AnyValue`] accepts
//! everything, and [`Schema`] validates by round-tripping through a serde type.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// One validation problem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    /// Location inside the value, empty for the root.
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Join issues into the text carried by client-facing errors.
    pub fn join(issues: &[Issue]) -> String {
        issues
            .iter()
            .map(Issue::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.path, self.message)
        }
    }
}

/// Validate an untyped value.
pub trait Validator: Send + Sync + 'static {
    fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>>;
}

pub type SharedValidator = Arc<dyn Validator>;

/// Accepts any value unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyValue;

impl Validator for AnyValue {
    fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>> {
        Ok(value.clone())
    }
}

/// Validates by deserializing into `T` and serializing back.
///
/// The returned value is the normalized form, so defaults declared on `T`
/// are filled in and unknown fields are dropped unless `T` keeps them.
pub struct Schema<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Schema<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Schema<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Validator for Schema<T>
where
    T: DeserializeOwned + Serialize + 'static,
{
    fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>> {
        let typed: T =
            serde_json::from_value(value.clone()).map_err(|e| vec![Issue::new("", e.to_string())])?;
        serde_json::to_value(typed).map_err(|e| vec![Issue::new("", e.to_string())])
    }
}

/// Validator backed by a closure.
pub struct FnValidator<F> {
    f: F,
}

impl<F> Validator for FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync + 'static,
{
    fn validate(&self, value: &Value) -> Result<Value, Vec<Issue>> {
        (self.f)(value)
    }
}

/// Wrap a closure as a validator.
pub fn validator_fn<F>(f: F) -> FnValidator<F>
where
    F: Fn(&Value) -> Result<Value, Vec<Issue>> + Send + Sync + 'static,
{
    FnValidator { f }
}
