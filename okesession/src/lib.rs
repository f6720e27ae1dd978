//! # okesession - Singer identities and the block list
//!
//! Durable store mapping handshake keys to sessions. A client that drops
//! off a flaky connection rejoins its prior identity, preferences and
//! history by presenting the same opaque key; the store rehydrates it
//! from memory (and from SQLite across restarts).
//!
//! The store also owns the block list: keys refused at handshake, with
//! optional expiry. Expired entries vanish the first time they are read.
//!
//! Display names and avatars for brand-new identities come from two
//! narrow collaborator contracts ([`NameGenerator`], [`AvatarFactory`])
//! so the store stays free of any word-list or rendering concerns.

pub mod error;
pub mod persistence;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use session::{
    AvatarFactory, BlockEntry, BlockedView, NameGenerator, Session, SEARCH_HISTORY_LIMIT,
};
pub use store::{Mutated, SessionStore};
