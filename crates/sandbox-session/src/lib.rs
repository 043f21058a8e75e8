//! Session lifecycle for remote sandboxes.
//!
//! Provides:
//! - `SessionRegistry` - One sandbox per (conversation, runtime), idle eviction
//! - `ReconnectionResolver` - Find a conversation's sandbox locally or by remote id

pub mod registry;
pub mod resolver;

pub use registry::{RegistryConfig, Session, SessionKey, SessionRegistry};
pub use resolver::ReconnectionResolver;
