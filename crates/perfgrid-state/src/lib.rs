//! perfgrid-state — durable storage for worker performance profiles.
//!
//! Backed by [redb](https://docs.rs/redb). Each worker key maps to one
//! JSON-serialized [`ProfileRecord`]; the fleet-wide aggregate lives under
//! its own reserved key in the same table.
//!
//! # Architecture
//!
//! The [`ProfileStore`] trait is the only contract the persistence pipeline
//! depends on (`get` / `put` by key, plus an optional transactional batch
//! put). [`StateStore`] implements it on redb and is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`), so it can be shared across tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{ProfileStore, StateStore};
pub use types::{Bucket, ProfileRecord};
