//! Method registry.
//!
//! Method resolution is an exact-name lookup in a table built once, before
//! the server starts. There is no runtime attribute lookup: every callable
//! name is registered explicitly through [`HandlerBuilder`], either one
//! closure at a time or by a [`Service`] that registers its whole capability
//! set.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use protocol::{ErrorKind, ErrorPayload, Value};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::FromParams;

// ---------------------------------------------------------------------------
// Invocation errors
// ---------------------------------------------------------------------------

/// A handler-side failure, reported to the caller as a structured error.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct InvocationError {
    kind: String,
    message: String,
    data: Option<Value>,
}

impl InvocationError {
    /// A generic handler failure (`InvocationError` kind).
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::Invocation.as_str(), message)
    }

    /// Wrong argument count or an argument of the wrong type.
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_kind(ErrorKind::InvalidParams.as_str(), message)
    }

    /// A failure with an application-defined kind name (e.g. `"ValueError"`).
    pub fn with_kind(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attaches a detail value that is forwarded to the caller verbatim.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The error kind name.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The attached detail value, if any.
    pub fn data(&self) -> Option<&Value> {
        self.data.as_ref()
    }

    /// Converts the error into the payload written on the wire.
    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind,
            message: self.message,
            data: self.data,
        }
    }
}

impl From<InvocationError> for ErrorPayload {
    fn from(value: InvocationError) -> Self {
        value.into_payload()
    }
}

// ---------------------------------------------------------------------------
// Method
// ---------------------------------------------------------------------------

/// A callable bound to a name in a [`Handler`].
#[async_trait]
pub trait Method: Send + Sync {
    /// Invokes the method with positional arguments.
    async fn invoke(&self, params: Vec<Value>) -> Result<Value, InvocationError>;
}

fn encode_result<R: Serialize>(result: R) -> Result<Value, InvocationError> {
    rmpv::ext::to_value(result)
        .map_err(|e| InvocationError::new(format!("failed to encode result: {e}")))
}

/// Async closure over typed arguments.
struct TypedFn<F, A> {
    f: F,
    _args: PhantomData<fn(A)>,
}

#[async_trait]
impl<F, A, Fut, R> Method for TypedFn<F, A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    A: FromParams + 'static,
    Fut: Future<Output = Result<R, InvocationError>> + Send + 'static,
    R: Serialize + 'static,
{
    async fn invoke(&self, params: Vec<Value>) -> Result<Value, InvocationError> {
        let args = A::from_params(params)?;
        let result = (self.f)(args).await?;
        encode_result(result)
    }
}

/// Async closure over the raw argument list.
struct RawFn<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Method for RawFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
{
    async fn invoke(&self, params: Vec<Value>) -> Result<Value, InvocationError> {
        (self.f)(params).await
    }
}

/// Synchronous closure run on the blocking thread pool.
struct BlockingFn<F, A> {
    f: Arc<F>,
    _args: PhantomData<fn(A)>,
}

#[async_trait]
impl<F, A, R> Method for BlockingFn<F, A>
where
    F: Fn(A) -> Result<R, InvocationError> + Send + Sync + 'static,
    A: FromParams + Send + 'static,
    R: Serialize + Send + 'static,
{
    async fn invoke(&self, params: Vec<Value>) -> Result<Value, InvocationError> {
        let args = A::from_params(params)?;
        let f = Arc::clone(&self.f);
        let result = tokio::task::spawn_blocking(move || (*f)(args))
            .await
            .map_err(|e| InvocationError::new(format!("blocking handler failed: {e}")))??;
        encode_result(result)
    }
}

// ---------------------------------------------------------------------------
// Handler and builder
// ---------------------------------------------------------------------------

/// A handler object that registers its own methods.
///
/// Implementations typically clone `self` into each registered closure so the
/// methods share the object's state.
pub trait Service: Send + Sync + 'static {
    /// Adds this service's methods to `builder`.
    fn register(self: Arc<Self>, builder: HandlerBuilder) -> HandlerBuilder;
}

/// Collects method registrations; finish with [`HandlerBuilder::build`].
#[derive(Default)]
pub struct HandlerBuilder {
    methods: HashMap<String, Arc<dyn Method>>,
}

impl HandlerBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a [`Method`] implementation. A later registration under the
    /// same name replaces the earlier one.
    pub fn method(mut self, name: impl Into<String>, method: impl Method + 'static) -> Self {
        let name = name.into();
        if self.methods.contains_key(&name) {
            warn!(method = %name, "replacing previously registered method");
        }
        self.methods.insert(name, Arc::new(method));
        self
    }

    /// Registers an async closure taking a tuple of deserialisable arguments.
    ///
    /// ```ignore
    /// builder.function("sum", |(x, y): (i64, i64)| async move { Ok(x + y) })
    /// ```
    pub fn function<F, A, Fut, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        A: FromParams + 'static,
        Fut: Future<Output = Result<R, InvocationError>> + Send + 'static,
        R: Serialize + 'static,
    {
        self.method(
            name,
            TypedFn {
                f,
                _args: PhantomData,
            },
        )
    }

    /// Registers an async closure that receives the raw argument list.
    pub fn raw<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, InvocationError>> + Send + 'static,
    {
        self.method(name, RawFn { f })
    }

    /// Registers a synchronous closure. It runs on tokio's blocking pool so a
    /// slow call never stalls other connections.
    pub fn blocking<F, A, R>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(A) -> Result<R, InvocationError> + Send + Sync + 'static,
        A: FromParams + Send + 'static,
        R: Serialize + Send + 'static,
    {
        self.method(
            name,
            BlockingFn {
                f: Arc::new(f),
                _args: PhantomData,
            },
        )
    }

    /// Lets `service` register its methods.
    pub fn service<S: Service>(self, service: Arc<S>) -> Self {
        service.register(self)
    }

    /// Freezes the registrations into a [`Handler`].
    pub fn build(self) -> Handler {
        Handler {
            methods: Arc::new(self.methods),
        }
    }
}

/// An immutable name → method table. Cheap to clone.
#[derive(Clone, Default)]
pub struct Handler {
    methods: Arc<HashMap<String, Arc<dyn Method>>>,
}

impl Handler {
    /// Starts a new registration.
    pub fn builder() -> HandlerBuilder {
        HandlerBuilder::new()
    }

    /// Builds a handler from a single service.
    pub fn from_service<S: Service>(service: Arc<S>) -> Self {
        HandlerBuilder::new().service(service).build()
    }

    /// Looks up a method by exact name.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Method>> {
        self.methods.get(name).cloned()
    }

    /// Registered method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Returns `true` if no methods are registered.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("methods", &self.method_names())
            .finish()
    }
}
