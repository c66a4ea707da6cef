// Copyright 2026 Highway RPC Developers

//! Server-side dispatch: turning a decoded request into a result body.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::{self, BoxFuture};
use futures::FutureExt;
use thiserror::Error;

use crate::message::Request;

/// A business-logic failure. The message is sent back verbatim as the
/// response reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DispatchError(pub String);

impl From<&str> for DispatchError {
    fn from(msg: &str) -> DispatchError {
        DispatchError(String::from(msg))
    }
}

impl From<String> for DispatchError {
    fn from(msg: String) -> DispatchError {
        DispatchError(msg)
    }
}

pub type DispatchResult = Result<Bytes, DispatchError>;

/// Resolves the target operation of a request, runs it, and returns the
/// serialized result.
pub trait Dispatcher: Send + Sync + 'static {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, DispatchResult>;
}

impl<F, Fut> Dispatcher for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    fn dispatch(&self, request: Request) -> BoxFuture<'static, DispatchResult> {
        self(request).boxed()
    }
}

type Handler = Arc<dyn Fn(Request) -> BoxFuture<'static, DispatchResult> + Send + Sync>;

/// Handlers keyed by `(schema_id, operation)`, filled in when services are
/// registered and looked up per request.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<(String, String), Handler>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    pub fn register<F, Fut>(mut self, schema_id: &str, operation: &str, handler: F) -> Router
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult> + Send + 'static,
    {
        self.add(schema_id, operation, handler);
        self
    }

    /// Installs `handler`, replacing any earlier one for the same operation.
    pub fn add<F, Fut>(&mut self, schema_id: &str, operation: &str, handler: F)
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DispatchResult> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |req| handler(req).boxed());
        self.handlers
            .insert((schema_id.to_string(), operation.to_string()), handler);
    }

    pub fn contains(&self, schema_id: &str, operation: &str) -> bool {
        self.handlers
            .contains_key(&(schema_id.to_string(), operation.to_string()))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Dispatcher for Router {
    fn dispatch(&self, request: Request) -> BoxFuture<'static, DispatchResult> {
        let key = (request.schema_id.clone(), request.operation.clone());
        match self.handlers.get(&key) {
            Some(handler) => handler(request),
            None => future::ready(Err(DispatchError(format!(
                "operation {} of schema {} not found",
                key.1, key.0
            ))))
            .boxed(),
        }
    }
}
