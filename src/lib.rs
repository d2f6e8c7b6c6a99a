//! OrbitPresence - shared presence and pub/sub layer for clustered servers
//!
//! Lets stateless server nodes agree on which rooms exist, who owns them and
//! how many clients are connected, by keeping that state in one shared store
//! and exchanging topic messages through it.
//!
//! ## Architecture
//!
//! ```text
//! Room logic → Presence ─┬─ command connection ───────→ Redis
//!                        └─ Multiplexer → notification connection ←─ Redis
//! ```
//!
//! One notification connection carries every topic this node listens to;
//! the [`Multiplexer`] fans each message out to the callbacks registered for
//! its topic.
//!
//! ## Environment Variables
//!
//! - `PRESENCE_REDIS_URL` - Redis URL (default `redis://127.0.0.1:6379/`)

pub mod config;
pub mod envelope;
pub mod error;
pub mod multiplexer;
pub mod presence;
pub mod store;

pub use config::{Config, ConfigError};
pub use envelope::Envelope;
pub use error::{PresenceError, Result};
pub use multiplexer::{Callback, CallbackError, Multiplexer};
pub use presence::Presence;
pub use store::{Commands, MessageHandler, Subscriber};

#[cfg(feature = "redis")]
pub use store::{RedisCommands, RedisSubscriber};

#[cfg(feature = "memory")]
pub use store::{MemoryCommands, MemoryStore, MemorySubscriber};
