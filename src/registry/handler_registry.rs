//! # Message Handler Registry
//!
//! Explicit mapping from a `message_type` key to a typed decoder plus handler.
//!
//! ## Architecture
//!
//! ```text
//! message_type ──▶ RegisteredHandler { decode: &str -> M, handle: M -> anyhow::Result<()> }
//! ```
//!
//! The registry is built once at startup and handed to the dispatch engine by
//! construction. Each entry knows the concrete message type it decodes, so the
//! engine never inspects types at runtime: it passes the raw payload to the entry
//! and receives either success or a [`DispatchFailure`].
//!
//! ## Usage
//!
//! ```rust
//! use outbox_dispatcher::registry::{handler_fn, HandlerRegistry};
//! use serde::Deserialize;
//!
//! #[derive(Deserialize)]
//! struct OrderPlaced {
//!     order_id: u64,
//! }
//!
//! # fn example() -> outbox_dispatcher::Result<()> {
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "OrderPlaced",
//!     handler_fn(|event: OrderPlaced| async move {
//!         println!("shipping order {}", event.order_id);
//!         Ok(())
//!     }),
//! )?;
//! assert!(registry.resolve("OrderPlaced").is_some());
//! # Ok(())
//! # }
//! ```
//!
//! ## Idempotency
//!
//! Delivery is at-least-once and a claim lease is not a kill signal: a slow
//! handler can still be running when its envelope is reclaimed by another worker.
//! Handlers must tolerate seeing the same message more than once.

use crate::error::{DispatchFailure, OutboxError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Handles one decoded message type
#[async_trait]
pub trait MessageHandler<M>: Send + Sync + 'static {
    async fn handle(&self, message: M) -> anyhow::Result<()>;
}

/// Adapter turning an async closure into a [`MessageHandler`]
pub struct FnHandler<F> {
    f: F,
}

/// Wrap `f` as a message handler
pub fn handler_fn<M, F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<M, F, Fut> MessageHandler<M> for FnHandler<F>
where
    M: Send + 'static,
    F: Fn(M) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: M) -> anyhow::Result<()> {
        (self.f)(message).await
    }
}

/// Decoder from the stored payload into a message
pub type Decoder<M> = Box<dyn Fn(&str) -> std::result::Result<M, String> + Send + Sync>;

/// Type-erased decode-and-handle entry
trait ErasedHandler: Send + Sync {
    fn dispatch<'a>(
        &'a self,
        message_type: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), DispatchFailure>>;
}

struct TypedEntry<M, H> {
    decode: Decoder<M>,
    handler: H,
    _message: PhantomData<fn() -> M>,
}

impl<M, H> ErasedHandler for TypedEntry<M, H>
where
    M: Send + 'static,
    H: MessageHandler<M>,
{
    fn dispatch<'a>(
        &'a self,
        message_type: &'a str,
        payload: &'a str,
    ) -> BoxFuture<'a, std::result::Result<(), DispatchFailure>> {
        Box::pin(async move {
            let message = (self.decode)(payload).map_err(|message| DispatchFailure::Decode {
                message_type: message_type.to_string(),
                message,
            })?;
            self.handler
                .handle(message)
                .await
                .map_err(|e| DispatchFailure::Handler {
                    message: format!("{e:#}"),
                })
        })
    }
}

/// A resolved registry entry
#[derive(Clone)]
pub struct RegisteredHandler {
    message_type: String,
    entry: Arc<dyn ErasedHandler>,
}

impl RegisteredHandler {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Decode `payload` and run the handler on it
    pub async fn dispatch(&self, payload: &str) -> std::result::Result<(), DispatchFailure> {
        self.entry.dispatch(&self.message_type, payload).await
    }
}

impl std::fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// Registry statistics
#[derive(Debug, Clone)]
pub struct RegistryStats {
    pub total_handlers: usize,
    pub message_types: Vec<String>,
}

/// Explicit message type to handler mapping
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, decoding payloads as JSON
    pub fn register<M, H>(&mut self, message_type: impl Into<String>, handler: H) -> Result<()>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        self.register_with_decoder(
            message_type,
            Box::new(|payload: &str| serde_json::from_str::<M>(payload).map_err(|e| e.to_string())),
            handler,
        )
    }

    /// Register `handler` under the message's own type name
    pub fn register_default<M, H>(&mut self, handler: H) -> Result<()>
    where
        M: DeserializeOwned + Send + 'static,
        H: MessageHandler<M>,
    {
        self.register::<M, H>(message_type_of::<M>(), handler)
    }

    /// Register `handler` for `message_type` with a custom payload decoder
    pub fn register_with_decoder<M, H>(
        &mut self,
        message_type: impl Into<String>,
        decode: Decoder<M>,
        handler: H,
    ) -> Result<()>
    where
        M: Send + 'static,
        H: MessageHandler<M>,
    {
        let message_type = message_type.into();
        if message_type.trim().is_empty() {
            return Err(OutboxError::configuration(
                "handler_registry",
                "message type must not be empty",
            ));
        }
        if self.handlers.contains_key(&message_type) {
            return Err(OutboxError::configuration(
                "handler_registry",
                format!("a handler is already registered for '{message_type}'"),
            ));
        }

        let entry = TypedEntry {
            decode,
            handler,
            _message: PhantomData,
        };
        self.handlers.insert(
            message_type.clone(),
            RegisteredHandler {
                message_type: message_type.clone(),
                entry: Arc::new(entry),
            },
        );

        info!(message_type = %message_type, "Registered outbox message handler");
        Ok(())
    }

    /// Look up the handler for `message_type`
    pub fn resolve(&self, message_type: &str) -> Option<RegisteredHandler> {
        let handler = self.handlers.get(message_type).cloned();
        if handler.is_none() {
            debug!(message_type = %message_type, "No handler registered");
        }
        handler
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers.contains_key(message_type)
    }

    pub fn stats(&self) -> RegistryStats {
        let mut message_types: Vec<String> = self.handlers.keys().cloned().collect();
        message_types.sort();
        RegistryStats {
            total_handlers: message_types.len(),
            message_types,
        }
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("message_types", &self.stats().message_types)
            .finish()
    }
}

/// Default message type tag: the type's own name without its module path
///
/// Generic arguments are kept as written, e.g. `Batch<OrderPlaced>`.
pub fn message_type_of<M: ?Sized>() -> String {
    let full = std::any::type_name::<M>();
    let (base, generics) = match full.find('<') {
        Some(idx) => full.split_at(idx),
        None => (full, ""),
    };
    let short = base.rsplit("::").next().unwrap_or(base);
    let generics = strip_paths(generics);
    format!("{short}{generics}")
}

fn strip_paths(generics: &str) -> String {
    let mut out = String::with_capacity(generics.len());
    let mut segment = String::new();
    for c in generics.chars() {
        if c.is_alphanumeric() || c == '_' || c == ':' {
            segment.push(c);
        } else {
            out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
            segment.clear();
            out.push(c);
        }
    }
    out.push_str(segment.rsplit("::").next().unwrap_or(&segment));
    out
}
