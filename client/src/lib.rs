//! Client library for the marketplace backend.
//!
//! [`HttpApi`] talks to the service; [`Session`] keeps the signed-in user and
//! a short-lived profile cache; [`Messenger`] sends chat messages
//! optimistically and falls back to the persisted [`Outbox`] when the network
//! is unavailable; [`PropertyCatalog`] caches listing queries.

pub mod api;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod error;
pub mod messenger;
pub mod models;
pub mod outbox;
pub mod session;

pub use api::{HttpApi, MarketplaceApi};
pub use catalog::PropertyCatalog;
pub use config::ClientConfig;
pub use conversation::{ChatMessage, Conversation, DeliveryStatus};
pub use error::ClientError;
pub use messenger::Messenger;
pub use outbox::{Outbox, OutboxEntry, SyncLoop, SyncReport};
pub use session::{ProfileCache, Session};

#[cfg(test)]
pub(crate) mod testing;
