//! # Handler Registry
//!
//! Per-message-type handlers supplied by the embedding application.
//!
//! ## Architecture
//!
//! ```text
//! HandlerRegistry
//! ├── register / register_default / register_with_decoder   (startup wiring)
//! └── resolve(message_type) -> RegisteredHandler            (dispatch time)
//! ```

pub mod handler_registry;

pub use handler_registry::{
    handler_fn, message_type_of, Decoder, FnHandler, HandlerRegistry, MessageHandler,
    RegisteredHandler, RegistryStats,
};
